/*
 * SPDX-License-Identifier: MIT
 */

//! Threads: the unit of scheduling.

use {
    crate::{err::Err, mutex::Sema, param::RUN_TICKS, proc::Process, sched::SchedNode},
    bitflags::bitflags,
    machine::{
        cpu::CtxId,
        sync::{CpuCell, NullLock},
    },
    std::{collections::VecDeque, sync::Arc},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TState {
    /// Queued, wants the CPU.
    Run,
    /// Currently dispatched.
    OnProc,
    /// Waiting on a semaphore.
    Sleep,
    /// Exited; never dispatched again.
    Dead,
}

bitflags! {
    pub struct TFlags: u32 {
        /// Real-time class.
        const RT = 0x01;
        /// Background class.
        const BG = 0x02;
        /// Ephemeral: does not hold the process alive.
        const EPHEM = 0x04;
    }
}

pub struct Thread {
    pub tid: u64,
    pub ctx: CtxId,
    pub proc: Arc<Process>,
    pub state: CpuCell<TState>,
    pub flags: CpuCell<TFlags>,
    /// Semaphore this thread is queued on, if sleeping.
    pub wchan: NullLock<Option<Sema>>,
    /// Set when an event unwound a sleep; observed by `p`.
    pub intr: CpuCell<bool>,
    /// Sleeping uninterruptibly.
    pub nointr: CpuCell<bool>,
    /// Ticks left in the current quantum.
    pub runticks: CpuCell<u32>,
    /// CPU-hog score; positive bars the cheated queue.
    pub oink: CpuCell<i32>,
    /// Last error, for `strerror`.
    pub err: NullLock<Option<Err>>,
    /// Pending asynchronous events.
    pub events: NullLock<VecDeque<String>>,
    /// This thread's leaf in the scheduling tree.
    pub runq: NullLock<Option<Arc<SchedNode>>>,
    /// Parked here by the user-mutex assist.
    pub park: Sema,
}

impl Thread {
    pub fn new(tid: u64, ctx: CtxId, proc: Arc<Process>) -> Arc<Thread> {
        Arc::new(Thread {
            tid,
            ctx,
            proc,
            state: CpuCell::new(TState::Run),
            flags: CpuCell::new(TFlags::empty()),
            wchan: NullLock::new(None),
            intr: CpuCell::new(false),
            nointr: CpuCell::new(false),
            runticks: CpuCell::new(RUN_TICKS),
            oink: CpuCell::new(0),
            err: NullLock::new(None),
            events: NullLock::new(VecDeque::new()),
            runq: NullLock::new(None),
            park: Sema::new(0),
        })
    }

    /// Record a failure for `strerror` and pass it through.
    pub fn set_err(&self, e: Err) -> Err {
        self.err.lock(|slot| *slot = Some(e.clone()));
        e
    }

    pub fn last_err(&self) -> Option<Err> {
        self.err.lock(|slot| slot.clone())
    }

    /// True if an event is waiting for delivery.
    pub fn event_pending(&self) -> bool {
        self.events.lock(|q| !q.is_empty())
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("state", &self.state.get())
            .finish()
    }
}
