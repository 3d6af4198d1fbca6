/*
 * SPDX-License-Identifier: MIT
 */

//! The system clock.
//!
//! A logical tick counter driven by the timer interrupt line.  Each
//! tick debits the running thread's quantum and wakes any sleeps that
//! have come due.

use {
    crate::{
        err::{Err, Result},
        kernel::{cur_kernel, try_cur_thread},
        mutex::{Pri, Sema, Spinlock, Spl},
        perm::isroot,
    },
    machine::sync::CpuCell,
};

pub struct Clock {
    ticks: CpuCell<u64>,
    /// Offset applied by `time_set`.
    base: CpuCell<i64>,
    sleepers: Spinlock<Vec<(u64, Sema)>>,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            ticks: CpuCell::new(0),
            base: CpuCell::new(0),
            sleepers: Spinlock::new(Vec::new()),
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.get()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// The timer interrupt: advance time, pay out due sleeps, and debit
/// whoever holds the CPU.
pub fn hardclock() {
    let k = cur_kernel();
    let now = k.clock.ticks.update(|t| t + 1);

    let due: Vec<Sema> = {
        let mut g = k.clock.sleepers.lock(Spl::Hi);
        let mut due = Vec::new();
        g.retain(|(deadline, sema)| {
            if *deadline <= now {
                due.push(sema.clone());
                false
            } else {
                true
            }
        });
        due
    };
    for s in due {
        s.v();
    }

    // The running thread pays a tick; at zero it is preempted through
    // the usual path.
    if let Some(t) = try_cur_thread() {
        let left = t.runticks.get().saturating_sub(1);
        t.runticks.set(left);
        if left == 0 {
            t.oink.update(|o| o + 1);
            k.processor.cpu.do_preempt.set(true);
        }
    }
}

/// Current time in ticks, as adjusted by `time_set`.
pub fn time_get() -> Result<i64> {
    let k = cur_kernel();
    Ok(k.clock.ticks.get() as i64 + k.clock.base.get())
}

/// Slide the clock; a privileged operation.
pub fn time_set(val: i64) -> Result<i64> {
    if !isroot() {
        return Err(Err::Perm);
    }
    let k = cur_kernel();
    k.clock.base.set(val - k.clock.ticks.get() as i64);
    Ok(0)
}

/// Sleep for `ticks` timer interrupts.
pub fn time_sleep(ticks: u64) -> Result<i64> {
    if ticks == 0 {
        return Ok(0);
    }
    let k = cur_kernel();
    let sema = Sema::new(0);
    let deadline = k.clock.ticks.get() + ticks;
    k.clock
        .sleepers
        .lock(Spl::Hi)
        .push((deadline, sema.clone()));
    if sema.p(Pri::Catch) {
        // Unwound early; retire our entry if the tick has not.
        let mut g = k.clock.sleepers.lock(Spl::Hi);
        g.retain(|(_, s)| !s.same(&sema));
        return Err(Err::Intr);
    }
    Ok(0)
}
