/*
 * SPDX-License-Identifier: MIT
 */

//! Mutual exclusion: spinlocks and counting semaphores.
//!
//! Not very hard on a uniprocessor, eh?  The spinlock never spins — any
//! contended acquire on one CPU is a deadlock and asserts — but the full
//! discipline is kept (interrupt-mask pairing, per-CPU held count, no
//! blocking while held) so the code stays honest for a multiprocessor
//! port.
//!
//! Semaphores sleep FIFO.  The waker does the count bookkeeping on
//! behalf of the thread it wakes, so a sleeper returning from `p` never
//! touches the count itself.

use {
    crate::{
        kernel::{cur_kernel, cur_thread},
        sched,
        thread::{TState, Thread},
    },
    core::cell::UnsafeCell,
    machine::sync::CpuCell,
    std::{collections::VecDeque, sync::Arc},
};

/// Interrupt level paired with a spinlock acquire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Spl {
    /// Leave interrupt delivery enabled while held.
    Lo,
    /// Mask interrupt delivery while held.
    Hi,
}

/// Sleep disposition for a semaphore wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Pri {
    /// Interruptible: an event unwinds the wait.
    Catch,
    /// Uninterruptible.
    Hi,
    /// Interruptible, low urgency.
    Lo,
}

pub struct Spinlock<T> {
    held: CpuCell<bool>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub fn new(data: T) -> Self {
        Self {
            held: CpuCell::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Take the lock.  On one CPU a held lock here means deadlock.
    pub fn lock(&self, spl: Spl) -> SpinGuard<'_, T> {
        assert!(!self.held.get(), "spinlock: deadlock");
        let k = cur_kernel();
        let prior = k.spl_hi.get();
        if spl == Spl::Hi {
            k.spl_hi.set(true);
        }
        k.processor.cpu.locks.update(|n| n + 1);
        self.held.set(true);
        SpinGuard { lock: self, prior }
    }

    /// Conditional acquire.
    pub fn try_lock(&self, spl: Spl) -> Option<SpinGuard<'_, T>> {
        if self.held.get() {
            return None;
        }
        Some(self.lock(spl))
    }

    pub fn is_held(&self) -> bool {
        self.held.get()
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a Spinlock<T>,
    prior: bool,
}

impl<T> core::ops::Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> core::ops::DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        debug_assert!(self.lock.held.get(), "spinlock: release not held");
        let k = cur_kernel();
        self.lock.held.set(false);
        k.spl_hi.set(self.prior);
        let left = k.processor.cpu.locks.update(|n| n - 1);
        let _ = left;
    }
}

struct SemaQ {
    count: isize,
    sleepq: VecDeque<Arc<Thread>>,
}

struct SemaInner {
    lock: Spinlock<SemaQ>,
}

/// Counting semaphore.  Handles are cheap clones of one shared state;
/// a sleeping thread records its handle as the wake channel.
#[derive(Clone)]
pub struct Sema {
    inner: Arc<SemaInner>,
}

impl Sema {
    /// A semaphore with the given initial count (the usual mutex-style
    /// semaphore starts at 1; pure event counts start at 0).
    pub fn new(count: isize) -> Self {
        Self {
            inner: Arc::new(SemaInner {
                lock: Spinlock::new(SemaQ {
                    count,
                    sleepq: VecDeque::new(),
                }),
            }),
        }
    }

    /// Identity comparison: do two handles name one semaphore?
    pub fn same(&self, other: &Sema) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn count(&self) -> isize {
        self.inner.lock.lock(Spl::Hi).count
    }

    /// Anyone asleep here?
    pub fn blocked(&self) -> bool {
        self.count() < 0
    }

    /// Manually set the count.  Strand a sleeper and the system will
    /// start to act funny.
    pub fn set_count(&self, count: isize) {
        self.inner.lock.lock(Spl::Hi).count = count;
    }

    /// Manually adjust the count.
    pub fn adj_count(&self, delta: isize) {
        self.inner.lock.lock(Spl::Hi).count += delta;
    }

    /// Take the semaphore; sleep if it is not available.  Returns true
    /// if the wait was unwound by an event rather than a `v`.
    pub fn p(&self, pri: Pri) -> bool {
        let k = cur_kernel();
        debug_assert_eq!(k.processor.cpu.locks.get(), 0, "p: locks held");
        let mut g = self.inner.lock.lock(Spl::Hi);
        g.count -= 1;
        if g.count >= 0 {
            return false;
        }
        self.sleep(pri, g, ())
    }

    /// Conditional `p`: take it only if that needs no sleep.
    pub fn cp(&self) -> bool {
        let mut g = self.inner.lock.lock(Spl::Hi);
        if g.count > 0 {
            g.count -= 1;
            true
        } else {
            false
        }
    }

    /// Atomically trade a held spinlock for a wait on this semaphore:
    /// the lock is released whether or not the caller sleeps.
    pub fn p_v_lock<T>(&self, pri: Pri, held: SpinGuard<'_, T>) -> bool {
        let k = cur_kernel();
        debug_assert_eq!(k.processor.cpu.locks.get(), 1, "p_v_lock: lock count");
        let mut g = self.inner.lock.lock(Spl::Hi);
        g.count -= 1;
        if g.count >= 0 {
            drop(held);
            return false;
        }
        self.sleep(pri, g, held)
    }

    /// Common blocking path.  `g` is the held semaphore queue; any
    /// extra guard is dropped only after the queue insertion, keeping
    /// the trade atomic with respect to wakers.
    fn sleep<E>(&self, pri: Pri, mut g: SpinGuard<'_, SemaQ>, extra: E) -> bool {
        let k = cur_kernel();
        let t = cur_thread();
        t.wchan.lock(|w| *w = Some(self.clone()));
        t.nointr.set(pri == Pri::Hi);
        // Cleared under the queue lock, so a racing notify either sees
        // us before the clear (and we resignal below) or lands after
        // and finds us on the queue.
        t.intr.set(false);
        g.sleepq.push_back(Arc::clone(&t));
        let rq = k.runq.lock(Spl::Hi);
        drop(g);
        drop(extra);
        t.state.set(TState::Sleep);
        k.num_run.update(|n| n - 1);
        sched::swtch(rq);
        // Back on the CPU.
        t.nointr.set(false);
        if t.intr.get() {
            debug_assert!(
                t.wchan.lock(|w| w.is_none()),
                "p: interrupted with wchan set"
            );
            t.intr.set(false);
            return true;
        }
        false
    }

    /// Release: wake the head sleeper, or bump the count.
    pub fn v(&self) {
        let mut g = self.inner.lock.lock(Spl::Hi);
        if let Some(t) = g.sleepq.pop_front() {
            debug_assert!(g.count < 0, "v: sleeper with high count");
            g.count += 1;
            debug_assert!(
                t.wchan.lock(|w| w.as_ref().map(|s| s.same(self)) == Some(true)),
                "v: wchan mismatch"
            );
            t.wchan.lock(|w| *w = None);
            let k = cur_kernel();
            let mut rq = k.runq.lock(Spl::Hi);
            sched::lsetrun(&mut rq, &t);
            drop(rq);
        } else {
            g.count += 1;
        }
    }

    /// Kick everyone loose.  A v-loop is fine on one CPU; a
    /// multiprocessor port must turn this into a real broadcast.
    pub fn vall(&self) {
        while self.blocked() {
            self.v();
        }
    }

    /// Forcibly remove a thread from this semaphore's sleep queue,
    /// flagging the interruption.  Returns false on a busy queue lock.
    /// The caller makes the thread runnable afterwards.
    pub fn cunsleep(t: &Arc<Thread>) -> bool {
        let Some(s) = t.wchan.lock(|w| w.clone()) else {
            return false;
        };
        let Some(mut g) = s.inner.lock.try_lock(Spl::Hi) else {
            return false;
        };
        let Some(pos) = g.sleepq.iter().position(|q| Arc::ptr_eq(q, t)) else {
            // Raced with a waker; nothing to unwind.
            return false;
        };
        g.sleepq.remove(pos);
        // The count update a waker would have done on our behalf.
        g.count += 1;
        t.wchan.lock(|w| *w = None);
        t.intr.set(true);
        true
    }
}
