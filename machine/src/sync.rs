/*
 * SPDX-License-Identifier: MIT
 */

//! Raw single-processor cells.
//!
//! The machine guarantees (see [`crate::cpu`]) that at most one kernel
//! thread executes at any instant; the baton hand-off in `switch_to`
//! forms a happens-before edge between consecutive holders.  These cells
//! lean on that: they hand out access with no atomic traffic at all.
//! They are the foundation the kernel's own spinlock and semaphore
//! layers are built on, and must never be used from a host thread that
//! is outside the baton discipline.

use core::cell::UnsafeCell;

/// Interior-mutable cell, `Sync` by the single-CPU argument above.
pub struct NullLock<T> {
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for NullLock<T> {}
unsafe impl<T: Send> Sync for NullLock<T> {}

impl<T> NullLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            data: UnsafeCell::new(data),
        }
    }

    /// Grant the closure access to the wrapped data.
    ///
    /// Nothing here prevents re-entry; the caller's locking discipline
    /// (or the fact that only one thread runs) is what makes this sound.
    #[allow(clippy::mut_from_ref)]
    pub fn lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(unsafe { &mut *self.data.get() })
    }
}

/// Copy-value cell for counters and flags on the per-CPU record.
pub struct CpuCell<T: Copy> {
    data: UnsafeCell<T>,
}

unsafe impl<T: Copy + Send> Send for CpuCell<T> {}
unsafe impl<T: Copy + Send> Sync for CpuCell<T> {}

impl<T: Copy> CpuCell<T> {
    pub const fn new(v: T) -> Self {
        Self {
            data: UnsafeCell::new(v),
        }
    }

    #[inline]
    pub fn get(&self) -> T {
        unsafe { *self.data.get() }
    }

    #[inline]
    pub fn set(&self, v: T) {
        unsafe { *self.data.get() = v }
    }

    #[inline]
    pub fn update(&self, f: impl FnOnce(T) -> T) -> T {
        let v = f(self.get());
        self.set(v);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_lock_round_trip() {
        let l = NullLock::new(41);
        l.lock(|v| *v += 1);
        assert_eq!(l.lock(|v| *v), 42);
    }

    #[test]
    fn cpu_cell_update() {
        let c = CpuCell::new(7usize);
        assert_eq!(c.update(|v| v + 1), 8);
        assert_eq!(c.get(), 8);
    }
}
