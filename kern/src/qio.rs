/*
 * SPDX-License-Identifier: MIT
 */

//! Queued page I/O.
//!
//! Asynchronous writes to backing store are described by small queue
//! elements; a privileged thread donates itself to the engine through
//! the `run_qio` syscall and works the queue, finishing each transfer
//! with its completion hook.

use {
    crate::{
        err::{Err, Result},
        kernel::cur_kernel,
        mutex::{Pri, Sema, Spinlock, Spl},
        param::FS_ABSWRITE,
        perm::issys,
        pset::{IoDone, PpFlags, Pset},
        vm_swap::{pageio, swapdev},
    },
    machine::ptob,
    std::{collections::VecDeque, sync::Arc},
};

struct QioReq {
    ps: Arc<Pset>,
    idx: usize,
    off: usize,
    op: u32,
    iodone: IoDone,
}

pub struct Qio {
    q: Spinlock<VecDeque<QioReq>>,
    /// Counts queued requests; the engine thread sleeps here.
    wait: Sema,
}

impl Qio {
    pub fn new() -> Self {
        Self {
            q: Spinlock::new(VecDeque::new()),
            wait: Sema::new(0),
        }
    }

    pub fn backlog(&self) -> usize {
        self.q.lock(Spl::Lo).len()
    }
}

impl Default for Qio {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue an asynchronous push of a slot to its swap block.  The slot
/// stays locked until the completion releases it.
pub fn qio_write(ps: &Arc<Pset>, idx: usize, iodone: IoDone) {
    let k = cur_kernel();
    let req = QioReq {
        ps: Arc::clone(ps),
        idx,
        off: ptob(idx + ps.swapblk()),
        op: FS_ABSWRITE,
        iodone,
    };
    let mut g = k.qio.q.lock(Spl::Hi);
    g.push_back(req);
    k.qio.wait.v();
    drop(g);
}

/// The `run_qio` syscall: the calling thread becomes the paging
/// engine until an event unwinds it.
pub fn run_qio() -> Result<i64> {
    if !issys() {
        return Err(Err::Perm);
    }
    let k = cur_kernel();
    loop {
        if k.qio.wait.p(Pri::Catch) {
            return Err(Err::Intr);
        }
        let req = {
            let mut g = k.qio.q.lock(Spl::Hi);
            g.pop_front().expect("run_qio: wait/queue disagree")
        };
        let Some(dev) = swapdev() else {
            req.ps
                .pp(req.idx, |pp| pp.flags.insert(PpFlags::BAD));
            (req.iodone)(&req.ps, req.idx);
            continue;
        };
        let pfn = req.ps.pp(req.idx, |pp| pp.pfn);
        if pageio(pfn, &dev, req.off, machine::NBPG, req.op).is_err() {
            req.ps
                .pp(req.idx, |pp| pp.flags.insert(PpFlags::BAD));
        }
        (req.iodone)(&req.ps, req.idx);
    }
}
