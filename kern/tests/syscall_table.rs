/*
 * SPDX-License-Identifier: MIT
 */

//! The numeric syscall surface: register and stack argument passing,
//! user-memory marshalling, and the carry-flag error convention.

use {
    kern::{
        mmap::{PROT_READ, PROT_WRITE},
        syscall::{syscall, Frame},
        sys, BootParams, Kernel, MapFlags,
    },
    machine::NBPG,
};

#[test]
fn register_calls_and_carry_flag() {
    let k = Kernel::boot(BootParams::default());
    let h = k.spawn_task("caller", false, move || {
        let pid = sys::getid(0).unwrap();

        // getid rides in registers.
        let mut f = Frame::call(31, [0, 0, 0]);
        syscall(&mut f);
        assert!(!f.carry);
        assert_eq!(f.result, pid);

        // A bogus call number sets carry and leaves the string.
        let mut f = Frame::call(999, [0, 0, 0]);
        syscall(&mut f);
        assert!(f.carry);
        assert_eq!(f.result, -1);

        // strerror writes the message into user memory.
        let buf = sys::mmap(0, NBPG, PROT_READ | PROT_WRITE, MapFlags::ANON, 0, 0).unwrap();
        let mut f = Frame::call(15, [buf as i64, 0, 0]);
        syscall(&mut f);
        assert!(!f.carry);
        let mut back = [0u8; 8];
        assert!(sys::peek(buf, &mut back));
        assert_eq!(&back[..7], b"invalid");
        0
    });
    assert_eq!(h.join(), 0);
    k.shutdown();
}

#[test]
fn stack_arguments_reach_six_arg_calls() {
    let k = Kernel::boot(BootParams::default());
    let h = k.spawn_task("stacker", false, move || {
        // A scratch page plays the user stack.
        let sp = sys::mmap(0, NBPG, PROT_READ | PROT_WRITE, MapFlags::ANON, 0, 0).unwrap();
        // mmap(0, NBPG, RW, ANON, 0, 0), all six args above the
        // return slot.
        let args: [i64; 6] = [
            0,
            NBPG as i64,
            (PROT_READ | PROT_WRITE) as i64,
            MapFlags::ANON.bits() as i64,
            0,
            0,
        ];
        let mut raw = Vec::new();
        for a in args {
            raw.extend_from_slice(&a.to_le_bytes());
        }
        assert!(sys::poke(sp + 8, &raw));

        let mut f = Frame::call(13, [0, 0, 0]);
        f.usp = sp;
        syscall(&mut f);
        assert!(!f.carry, "mmap via table failed: {}", sys::strerror());
        let va = f.result as usize;
        assert!(sys::poke(va, &[9]));

        // munmap through the table too.
        let mut f = Frame::call(14, [va as i64, NBPG as i64, 0]);
        syscall(&mut f);
        assert!(!f.carry);
        0
    });
    assert_eq!(h.join(), 0);
    k.shutdown();
}
