/*
 * SPDX-License-Identifier: MIT
 */

//! Trap and interrupt plumbing.
//!
//! The hosted equivalents of the entry points hardware would vector
//! into: hardware interrupts (from the injection queue), page faults
//! (from user-memory access), and the common exit path every kernel
//! entry funnels through before returning to user code.

use {
    crate::{
        clock, event,
        kernel::{cur_kernel, cur_thread},
        param::{IRQ_TIMER, MAX_IRQ},
        sched,
        uaccess::{copyin, copyout},
        vm_fault::vas_fault,
    },
    std::sync::Arc,
};

/// Hardware interrupt entry.
pub fn interrupt(irq: u32) {
    if irq == IRQ_TIMER {
        clock::hardclock();
        return;
    }
    if (irq as usize) < MAX_IRQ {
        cur_kernel().isr.deliver_isr(irq);
    } else {
        log::warn!("interrupt: bogus line {irq}");
    }
}

/// Page-fault entry on behalf of a user-mode access.  Unresolvable
/// faults shoot the process via the event machinery.
pub fn page_fault(vaddr: usize, write: bool) -> bool {
    let t = cur_thread();
    let vas = Arc::clone(&t.proc.vas);
    let resolved = vas_fault(&vas, vaddr, write).is_ok();
    if !resolved {
        event::selfsig(crate::err::Err::Fault);
    }
    trap_exit();
    resolved
}

/// Emulated user-mode store: translate or fault, then write.
pub fn user_store(vaddr: usize, data: &[u8]) -> bool {
    let t = cur_thread();
    let vas = Arc::clone(&t.proc.vas);
    let ok = copyout(&vas, vaddr, data).is_ok();
    if !ok {
        event::selfsig(crate::err::Err::Fault);
    }
    trap_exit();
    ok
}

/// Emulated user-mode load.
pub fn user_load(vaddr: usize, buf: &mut [u8]) -> bool {
    let t = cur_thread();
    let vas = Arc::clone(&t.proc.vas);
    let ok = copyin(&vas, vaddr, buf).is_ok();
    if !ok {
        event::selfsig(crate::err::Err::Fault);
    }
    trap_exit();
    ok
}

/// Common exit path: no spinlocks may be held, pending interrupts are
/// taken, a posted preemption is honoured, and events are delivered.
pub fn trap_exit() {
    let k = cur_kernel();
    debug_assert_eq!(k.processor.cpu.locks.get(), 0, "trap: locks held");
    if !k.spl_hi.get() {
        while let Some(irq) = k.processor.take_irq() {
            interrupt(irq);
        }
    }
    sched::check_preempt();
    event::check_events();
}
