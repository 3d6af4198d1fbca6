/*
 * SPDX-License-Identifier: MIT
 */

//! Anonymous memory end to end: map, fault, unmap, full accounting.

use {
    kern::{
        mmap::{PROT_READ, PROT_WRITE},
        pset::{PpFlags, PsetKind},
        sys,
        vas::find_pview,
        BootParams, Kernel, MapFlags,
    },
    machine::NBPG,
    std::sync::Arc,
};

#[test]
fn anonymous_map_faults_zero_and_unmaps_clean() {
    let k = Kernel::boot(BootParams::default());
    let frames0 = k.pmem.frames_free();
    let h = k.spawn_task("anon", true, move || {
        // Faults must not be fatal in this task.
        sys::notify_handler(Some(Arc::new(|_ev| {}))).unwrap();

        let va = sys::mmap(0, 3 * NBPG, PROT_READ | PROT_WRITE, MapFlags::ANON, 0, 0).unwrap();

        // Fresh view: a three-page ZFOD set, one reference, swap
        // behind it, nothing resident yet.
        {
            let p = sys::cur_proc();
            let pv = find_pview(&p.vas, va).unwrap();
            let ps = &pv.set;
            assert_eq!(ps.kind(), PsetKind::Zfod);
            assert_eq!(ps.len(), 3);
            assert_eq!(ps.refs(), 1);
            assert_ne!(ps.swapblk(), 0);
            assert_eq!(ps.valid_slots(), 0);
        }

        // Touch page 2: zero-filled with our bytes on top.
        assert!(sys::poke(va + 2 * NBPG + 1, &[0xA5]));
        let mut buf = [0u8; 3];
        assert!(sys::peek(va + 2 * NBPG, &mut buf));
        assert_eq!(buf, [0, 0xA5, 0]);
        {
            let p = sys::cur_proc();
            let pv = find_pview(&p.vas, va).unwrap();
            let ps = &pv.set;
            assert_eq!(ps.valid_slots(), 1);
            assert_eq!(ps.pp(2, |pp| pp.refs), 1);
            assert!(ps.pp(2, |pp| pp.flags.contains(PpFlags::V)));
        }

        sys::munmap(va, 3 * NBPG).unwrap();
        let p = sys::cur_proc();
        assert!(find_pview(&p.vas, va).is_none());

        // The view is gone; the address no longer resolves.
        assert!(!sys::peek(va, &mut buf));
        0
    });
    assert_eq!(h.join(), 0);
    // Every frame the task faulted in came back.
    assert_eq!(k.pmem.frames_free(), frames0);
    k.shutdown();
}

#[test]
fn mmap_argument_screening() {
    let k = Kernel::boot(BootParams::default());
    let h = k.spawn_task("screen", false, move || {
        // Read-only ZFOD??? No.
        assert!(sys::mmap(0, NBPG, PROT_READ, MapFlags::ANON, 0, 0).is_err());
        assert_eq!(sys::strerror(), "invalid");
        // Unmapping something that is not an mmap view.
        assert!(sys::munmap(0x1000, NBPG).is_err());
        // Physical mapping needs privilege this task lacks.
        assert!(sys::mmap(0, NBPG, PROT_READ | PROT_WRITE, MapFlags::PHYS, 0, 0).is_err());
        assert_eq!(sys::strerror(), "perm");
        0
    });
    assert_eq!(h.join(), 0);
    k.shutdown();
}
