/*
 * SPDX-License-Identifier: MIT
 */

//! Connecting interrupts to the messaging interface.
//!
//! Each interrupt line has one preallocated message.  Delivery queues
//! it on the registered port; if it is still languishing there from an
//! earlier interrupt, only its missed-count is bumped so no storm can
//! exhaust kernel memory.

use {
    crate::{
        err::{Err, Result},
        kernel::cur_thread,
        msg::{queue_msg, SysMsg},
        param::{MAX_IRQ, M_ISR},
        perm::issys,
        port::{find_port_ref, Port, PortFlags},
    },
    machine::sync::{CpuCell, NullLock},
    std::sync::Arc,
};

struct IsrSlot {
    port: Arc<Port>,
    sm: Arc<SysMsg>,
}

pub struct IsrTable {
    handler: [NullLock<Option<IsrSlot>>; MAX_IRQ],
    pub stray: CpuCell<u64>,
    pub dup: CpuCell<u64>,
}

impl IsrTable {
    pub fn new() -> Self {
        Self {
            handler: [const { NullLock::new(None) }; MAX_IRQ],
            stray: CpuCell::new(0),
            dup: CpuCell::new(0),
        }
    }

    /// Route an interrupt line to one of the caller's ports.
    pub fn enable_isr(&self, portid: usize, irq: u32) -> Result<i64> {
        if !issys() {
            return Err(Err::Perm);
        }
        let t = cur_thread();
        let port = find_port_ref(&t.proc, portid)?;
        if irq as usize >= MAX_IRQ {
            return Err(Err::Inval);
        }
        let slot = &self.handler[irq as usize];
        if slot.lock(|s| s.is_some()) {
            return Err(Err::Busy);
        }
        port.flags.update(|f| f | PortFlags::ISR);
        slot.lock(|s| {
            *s = Some(IsrSlot {
                port,
                sm: SysMsg::new(0, 0, 0),
            })
        });
        Ok(0)
    }

    /// Disconnect every line reporting to `port`.
    pub fn disable_isr(&self, port: &Arc<Port>) {
        for slot in &self.handler {
            slot.lock(|s| {
                if let Some(h) = s {
                    if Arc::ptr_eq(&h.port, port) {
                        *s = None;
                    }
                }
            });
        }
    }

    /// Deliver a hardware interrupt; true if someone had it vectored.
    pub fn deliver_isr(&self, irq: u32) -> bool {
        debug_assert!((irq as usize) < MAX_IRQ, "deliver_isr: bad isr");
        let queued = self.handler[irq as usize].lock(|s| {
            s.as_ref().map(|h| {
                if h.sm.op.get() == 0 {
                    // Idle message: arm and queue it.
                    h.sm.op.set(M_ISR);
                    h.sm.arg.set(irq as i64);
                    h.sm.arg1.set(1);
                    Some((Arc::clone(&h.port), Arc::clone(&h.sm)))
                } else {
                    // Still unconsumed; record the miss.
                    h.sm.arg1.update(|n| n + 1);
                    None
                }
            })
        });
        match queued {
            None => {
                self.stray.update(|s| s + 1);
                false
            }
            Some(None) => {
                self.dup.update(|d| d + 1);
                true
            }
            Some(Some((port, sm))) => {
                queue_msg(&port, &sm);
                true
            }
        }
    }
}

impl Default for IsrTable {
    fn default() -> Self {
        Self::new()
    }
}
