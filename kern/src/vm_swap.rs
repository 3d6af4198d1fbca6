/*
 * SPDX-License-Identifier: MIT
 */

//! The swap pseudo-device.
//!
//! Until a swap manager registers, allocations run a pending tally and
//! blocks are assumed to start at 1; the first allocation after the
//! manager shows up settles the tally in one batch.  Frees before a
//! manager exists are leaked (and counted).  `swap_wait` parks
//! allocators while the manager is out of space and is kicked loose on
//! every free.

use {
    crate::{
        err::{Err, Result},
        kernel::{cur_kernel, cur_thread},
        msg::{freesegs, kernmsg_send, queue_msg, SysMsg},
        mutex::{Pri, Sema, Spinlock, Spl},
        param::{SWAP_ALLOC, SWAP_FREE},
        perm::isroot,
        port::{PortFlags, Portref, PrState},
        seg::{kern_mem_frame, seg_copyin},
    },
    machine::sync::{CpuCell, NullLock},
    std::sync::Arc,
};

struct Pending {
    /// Pages consumed before the swapper came up.
    pending: usize,
    /// Pages lost before the swapper came up.
    leaked: usize,
}

pub struct Swap {
    dev: NullLock<Option<Arc<Portref>>>,
    /// Parked here when the manager is out of space.
    pub wait: Sema,
    /// Bumped on every free; allocators re-check it before parking so
    /// a free landing between refusal and sleep is not lost.
    freegen: CpuCell<u64>,
    lock: Spinlock<Pending>,
}

impl Swap {
    pub fn new() -> Self {
        Self {
            dev: NullLock::new(None),
            wait: Sema::new(0),
            freegen: CpuCell::new(0),
            lock: Spinlock::new(Pending {
                pending: 0,
                leaked: 0,
            }),
        }
    }

    pub fn leaked(&self) -> usize {
        self.lock.lock(Spl::Lo).leaked
    }
}

impl Default for Swap {
    fn default() -> Self {
        Self::new()
    }
}

/// The registered swap manager, if any.
pub fn swapdev() -> Option<Arc<Portref>> {
    cur_kernel().swap.dev.lock(|d| d.clone())
}

/// System call: steal the caller's portref and make it the swap
/// manager's connection.
pub fn set_swapdev(portid: usize) -> Result<i64> {
    if !isroot() {
        return Err(Err::Perm);
    }
    let k = cur_kernel();
    if k.swap.dev.lock(|d| d.is_some()) {
        return Err(Err::Busy);
    }
    let t = cur_thread();
    let p = Arc::clone(&t.proc);
    if portid >= crate::param::PROCOPENS {
        return Err(Err::BadF);
    }
    let pr = p.opens.lock(|tbl| tbl[portid].take()).ok_or(Err::BadF)?;
    k.swap.dev.lock(|d| *d = Some(pr));
    Ok(0)
}

/// Request a run of swap blocks from the manager, looping in the wait
/// pool while it is out of space.
pub fn alloc_swap(pages: usize) -> usize {
    let k = cur_kernel();

    // Settle any pending tally the moment a manager is reachable.
    let batch = {
        let mut g = k.swap.lock.lock(Spl::Lo);
        if g.pending > 0 && k.swap.dev.lock(|d| d.is_some()) {
            std::mem::take(&mut g.pending)
        } else {
            0
        }
    };
    if batch > 0 {
        // The initial chunk starts at block 1, so the pending pages
        // land exactly where the tally assumed they would.
        assert_eq!(alloc_swap(batch), 1, "alloc_swap: pend != 1");
    }

    // No manager: run the tally.
    if k.swap.dev.lock(|d| d.is_none()) {
        let mut g = k.swap.lock.lock(Spl::Lo);
        let blk = g.pending + 1;
        g.pending += pages;
        return blk;
    }

    loop {
        let gen = k.swap.freegen.get();
        let dev = swapdev().expect("alloc_swap: manager not ready");
        let _ = dev.sema.p(Pri::Hi);
        let mut args = [pages as i64, 0];
        let res = kernmsg_send(&dev, SWAP_ALLOC, &mut args);
        dev.sema.v();
        match res {
            Ok(()) if args[0] > 0 => return args[0] as usize,
            Ok(()) | Err(_) => {
                // Out of space; wait for a free to shake something
                // loose and try again.  A free that already landed
                // since the request means a retry right now.
                if k.swap.freegen.get() == gen {
                    let _ = k.swap.wait.p(Pri::Hi);
                }
            }
        }
    }
}

/// Return swap blocks to the manager, waking anyone parked on space.
pub fn free_swap(block: usize, pages: usize) {
    let k = cur_kernel();
    let Some(dev) = swapdev() else {
        // Bootup teardown with no manager yet: leak it and remember
        // how much.
        k.swap.lock.lock(Spl::Lo).leaked += pages;
        return;
    };
    let _ = dev.sema.p(Pri::Hi);
    let mut args = [block as i64, pages as i64];
    let res = kernmsg_send(&dev, SWAP_FREE, &mut args);
    dev.sema.v();
    debug_assert!(res.is_ok(), "free_swap: send failed");
    k.swap.freegen.update(|g| g + 1);
    if k.swap.wait.blocked() {
        k.swap.wait.vall();
    }
}

/// Synchronous page I/O: move one frame to or from the server behind
/// `pr`.  Rides the ordinary message path with a kernel segment
/// wrapping the frame; swap is the common destination but any server
/// speaking the absolute-I/O ops works.
pub fn pageio(pfn: usize, pr: &Arc<Portref>, off: usize, cnt: usize, op: u32) -> Result<()> {
    debug_assert!(
        op == crate::param::FS_ABSREAD || op == crate::param::FS_ABSWRITE,
        "pageio: illegal op"
    );
    let k = cur_kernel();
    let write = op == crate::param::FS_ABSWRITE;

    let sm = SysMsg::new(op, cnt as i64, off as i64);
    sm.sender.lock(|s| *s = Some(Arc::clone(pr)));
    if write {
        sm.segs.lock(|v| v.push(kern_mem_frame(pfn, cnt)));
    }

    // One transaction at a time through the portref.
    let _ = pr.sema.p(Pri::Hi);
    let g = pr.lock.lock(Spl::Hi);
    let port = match pr.port() {
        Some(port) if !port.flags.get().contains(PortFlags::CLOSING) => port,
        _ => {
            drop(g);
            pr.sema.v();
            freesegs(&sm);
            return Err(Err::Io);
        }
    };
    debug_assert_eq!(pr.iowait.count(), 0, "pageio: p_iowait");
    pr.state.set(PrState::IoWait);
    pr.msg.lock(|m| *m = Some(Arc::clone(&sm)));
    queue_msg(&port, &sm);
    let interrupted = pr.iowait.p_v_lock(Pri::Hi, g);
    debug_assert!(!interrupted, "pageio: interrupted");

    let mut error = false;
    if sm.arg.get() == -1 {
        error = true;
    } else if !write {
        // Copy the returned segments into the frame.
        let rsegs = sm.segs.lock(std::mem::take);
        let vas = Arc::clone(&cur_thread().proc.vas);
        let mut nbyte = cnt.min(machine::NBPG);
        let mut fill = 0;
        let mut buf = vec![0u8; machine::NBPG];
        for s in &rsegs {
            if nbyte == 0 {
                break;
            }
            let n = s.len.min(nbyte);
            if seg_copyin(&vas, s, &mut buf[..n]).is_err() {
                error = true;
                break;
            }
            k.pmem.write(pfn, fill, &buf[..n]);
            fill += n;
            nbyte -= n;
        }
        for s in rsegs {
            crate::seg::detach_seg(&s);
            crate::seg::free_seg(s);
        }
    }

    // Let the server go if it is parked on our consumption.
    if sm.handed.get() {
        sm.handed.set(false);
        pr.svwait.v();
    }
    freesegs(&sm);
    pr.sema.v();
    if error {
        Err(Err::Io)
    } else {
        Ok(())
    }
}
