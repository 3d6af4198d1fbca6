/*
 * SPDX-License-Identifier: MIT
 */

//! One processor.
//!
//! Kernel threads are host threads, but only one of them executes at a
//! time: a baton (mutex + condvar) names the running context, and
//! [`Processor::switch_to`] hands it over and blocks the caller until
//! it is handed back.  Context 0 is the idle context — the moral
//! equivalent of the idle stack — and owns the baton whenever no thread
//! does.
//!
//! The interrupt side is the only machinery callable from outside the
//! baton: lines are posted to a queue and the doorbell rung; the idle
//! loop (or the running thread, at its next check point) takes them
//! from inside.

use {
    crate::sync::CpuCell,
    std::{
        collections::VecDeque,
        sync::{Condvar, Mutex},
    },
};

/// Identifies one kernel execution context.
pub type CtxId = usize;

/// The idle context; never a thread's.
pub const IDLE_CTX: CtxId = 0;

/// Per-CPU record.
///
/// `locks` counts held spinlocks and must be zero at every reschedule
/// point.  `pri` is the dispatch priority of the running thread.
/// `do_preempt` is the posted nudge; `nopreempt` nests critical regions
/// that defer it.
pub struct Percpu {
    pub locks: CpuCell<usize>,
    pub pri: CpuCell<u32>,
    pub do_preempt: CpuCell<bool>,
    pub nopreempt: CpuCell<usize>,
    pub on_idle: CpuCell<bool>,
}

impl Percpu {
    const fn new() -> Self {
        Self {
            locks: CpuCell::new(0),
            pri: CpuCell::new(0),
            do_preempt: CpuCell::new(false),
            nopreempt: CpuCell::new(0),
            on_idle: CpuCell::new(true),
        }
    }
}

struct Baton {
    running: CtxId,
    next_id: CtxId,
}

pub struct Processor {
    baton: Mutex<Baton>,
    baton_cv: Condvar,
    /// Doorbell event count, advanced by [`Processor::kick`].
    bell: Mutex<u64>,
    bell_cv: Condvar,
    irqs: Mutex<VecDeque<u32>>,
    pub cpu: Percpu,
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor {
    pub fn new() -> Self {
        Self {
            baton: Mutex::new(Baton {
                running: IDLE_CTX,
                next_id: IDLE_CTX + 1,
            }),
            baton_cv: Condvar::new(),
            bell: Mutex::new(0),
            bell_cv: Condvar::new(),
            irqs: Mutex::new(VecDeque::new()),
            cpu: Percpu::new(),
        }
    }

    /// Mint a context id for a new kernel thread.
    pub fn new_ctx(&self) -> CtxId {
        let mut b = self.baton.lock().unwrap();
        let id = b.next_id;
        b.next_id += 1;
        id
    }

    /// Block until this context is dispatched for the first time.
    pub fn run_first(&self, me: CtxId) {
        let mut b = self.baton.lock().unwrap();
        while b.running != me {
            b = self.baton_cv.wait(b).unwrap();
        }
    }

    /// Hand the baton to `next` and wait to receive it back.
    pub fn switch_to(&self, me: CtxId, next: CtxId) {
        let mut b = self.baton.lock().unwrap();
        debug_assert_eq!(b.running, me, "switch_to: not running");
        b.running = next;
        self.baton_cv.notify_all();
        while b.running != me {
            b = self.baton_cv.wait(b).unwrap();
        }
    }

    /// Hand the baton to `next` without waiting; the caller's context
    /// is gone (thread exit) or was never a context (bootstrap).
    pub fn handoff(&self, next: CtxId) {
        let mut b = self.baton.lock().unwrap();
        b.running = next;
        self.baton_cv.notify_all();
    }

    /// The context currently holding the baton.
    pub fn running(&self) -> CtxId {
        self.baton.lock().unwrap().running
    }

    /// Ring the doorbell: wake the idle loop if it is waiting in
    /// [`Processor::idle_wait`].  Safe from any host thread.
    pub fn kick(&self) {
        let mut n = self.bell.lock().unwrap();
        *n += 1;
        self.bell_cv.notify_all();
    }

    /// Current doorbell count, for use with [`Processor::idle_wait`].
    pub fn bell_count(&self) -> u64 {
        *self.bell.lock().unwrap()
    }

    /// Sleep until the doorbell advances past `seen`.
    /// The idle loop reads the count, re-checks its work sources, and
    /// only then waits — so a kick between check and wait is not lost.
    pub fn idle_wait(&self, seen: u64) {
        let mut n = self.bell.lock().unwrap();
        while *n == seen {
            n = self.bell_cv.wait(n).unwrap();
        }
    }

    /// Post a hardware interrupt line.  Safe from any host thread.
    pub fn post_irq(&self, irq: u32) {
        self.irqs.lock().unwrap().push_back(irq);
        self.kick();
    }

    /// Take the next pending interrupt, if any.  Called from inside the
    /// baton at interrupt-delivery points.
    pub fn take_irq(&self) -> Option<u32> {
        self.irqs.lock().unwrap().pop_front()
    }

    pub fn irq_pending(&self) -> bool {
        !self.irqs.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::sync::Arc, std::thread};

    #[test]
    fn baton_round_trip() {
        let p = Arc::new(Processor::new());
        let a = p.new_ctx();
        let b = p.new_ctx();
        let p2 = Arc::clone(&p);
        let h = thread::spawn(move || {
            p2.run_first(b);
            // We hold the baton; give it back, then exit for good.
            p2.switch_to(b, a);
            p2.handoff(a);
        });
        // Bootstrap: hand to a's "thread" (this thread).
        p.handoff(a);
        p.run_first(a);
        p.switch_to(a, b); // b runs, returns the baton
        p.switch_to(a, b); // b exits, handing it straight back
        assert_eq!(p.running(), a);
        h.join().unwrap();
    }

    #[test]
    fn doorbell_and_irqs() {
        let p = Arc::new(Processor::new());
        assert!(p.take_irq().is_none());
        let seen = p.bell_count();
        let p2 = Arc::clone(&p);
        let h = thread::spawn(move || p2.post_irq(7));
        p.idle_wait(seen);
        h.join().unwrap();
        assert!(p.irq_pending());
        assert_eq!(p.take_irq(), Some(7));
        assert!(p.take_irq().is_none());
    }
}
