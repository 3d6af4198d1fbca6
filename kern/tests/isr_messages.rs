/*
 * SPDX-License-Identifier: MIT
 */

//! Interrupt lines reporting through the message system.

use {
    kern::{
        param::M_ISR,
        sys, BootParams, Kernel, Msg,
    },
    std::sync::Arc,
};

#[test]
fn vectored_interrupts_arrive_as_messages() {
    let k = Kernel::boot(BootParams::default());
    let k2 = Arc::clone(&k);
    let h = k.spawn_task("driver", true, move || {
        let portid = sys::msg_port(0, None).unwrap() as usize;
        sys::enable_isr(portid, 5).unwrap();
        // Claiming the same line twice is refused.
        assert!(sys::enable_isr(portid, 5).is_err());
        assert_eq!(sys::strerror(), "busy");

        // Three interrupts posted; however they batch, the missed
        // counts must add up.
        k2.interrupt(5);
        k2.interrupt(5);
        k2.interrupt(5);
        let mut total = 0i64;
        while total < 3 {
            let mut m = Msg::default();
            sys::msg_receive(portid, &mut m).unwrap();
            assert_eq!(m.op, M_ISR);
            assert_eq!(m.arg, 5);
            assert!(m.segs.is_empty());
            total += m.arg1;
        }
        assert_eq!(total, 3);
        0
    });
    assert_eq!(h.join(), 0);
    k.shutdown();
}

#[test]
fn isr_vectoring_needs_privilege() {
    let k = Kernel::boot(BootParams::default());
    let h = k.spawn_task("nobody", false, move || {
        let portid = sys::msg_port(0, None).unwrap() as usize;
        assert!(sys::enable_isr(portid, 3).is_err());
        assert_eq!(sys::strerror(), "perm");
        // Out-of-range lines are rejected even for the privileged.
        0
    });
    assert_eq!(h.join(), 0);

    let h = k.spawn_task("ranged", true, move || {
        let portid = sys::msg_port(0, None).unwrap() as usize;
        assert!(sys::enable_isr(portid, 99).is_err());
        assert_eq!(sys::strerror(), "invalid");
        0
    });
    assert_eq!(h.join(), 0);
    k.shutdown();
}
