/*
 * SPDX-License-Identifier: MIT
 */

//! Fork and copy-on-write between real processes.

use {
    kern::{
        mmap::{PROT_READ, PROT_WRITE},
        pset::PsetKind,
        sys,
        vas::find_pview,
        BootParams, Kernel, MapFlags,
    },
    machine::NBPG,
    std::sync::Arc,
};

#[test]
fn child_shadows_parent_and_breaks_on_write() {
    let k = Kernel::boot(BootParams::default());
    let h = k.spawn_task("parent", true, move || {
        let va = sys::mmap(0, NBPG, PROT_READ | PROT_WRITE, MapFlags::ANON, 0, 0).unwrap();
        assert!(sys::poke(va, &[0xA5]));

        let parent_set = {
            let p = sys::cur_proc();
            Arc::clone(&find_pview(&p.vas, va).unwrap().set)
        };
        let parent_set2 = Arc::clone(&parent_set);

        let pid = sys::fork(move || {
            // Same addresses, but a shadow set over the parent's.
            let p = sys::cur_proc();
            let pv = find_pview(&p.vas, va).unwrap();
            let shadow = Arc::clone(&pv.set);
            assert_eq!(shadow.kind(), PsetKind::Cow);
            assert!(Arc::ptr_eq(
                shadow.ops().cow_parent().unwrap(),
                &parent_set2
            ));
            assert_eq!(shadow.valid_slots(), 0);

            // Read: the parent's byte, through the shared frame.
            let mut b = [0u8; 1];
            assert!(sys::peek(va, &mut b));
            assert_eq!(b, [0xA5]);
            let shared_pfn = shadow.pp(0, |pp| pp.pfn);
            assert_eq!(shared_pfn, parent_set2.pp(0, |pp| pp.pfn));

            // Write: sharing breaks, the content came along.
            assert!(sys::poke(va, &[0x5A]));
            assert_ne!(shadow.pp(0, |pp| pp.pfn), shared_pfn);
            assert!(sys::peek(va, &mut b));
            assert_eq!(b, [0x5A]);
            0
        })
        .unwrap();

        let st = sys::waits().unwrap();
        assert_eq!(st.pid, pid);
        assert_eq!(st.status, 0);

        // The parent's page never moved.
        let mut b = [0u8; 1];
        assert!(sys::peek(va, &mut b));
        assert_eq!(b, [0xA5]);
        // And writing it now touches nobody else.
        assert!(sys::poke(va, &[0x77]));
        assert!(sys::peek(va, &mut b));
        assert_eq!(b, [0x77]);
        assert_eq!(parent_set.pp(0, |pp| pp.refs), 1);
        0
    });
    assert_eq!(h.join(), 0);
    k.shutdown();
}

#[test]
fn shared_views_stay_shared_across_fork() {
    let k = Kernel::boot(BootParams::default());
    let h = k.spawn_task("sharer", true, move || {
        let va = sys::mmap(
            0,
            NBPG,
            PROT_READ | PROT_WRITE,
            MapFlags::ANON | MapFlags::SHARED,
            0,
            0,
        )
        .unwrap();
        assert!(sys::poke(va, &[1]));
        let parent_set = {
            let p = sys::cur_proc();
            Arc::clone(&find_pview(&p.vas, va).unwrap().set)
        };

        let pid = sys::fork(move || {
            // Same pset identity: writes cross the fork.
            let p = sys::cur_proc();
            let pv = find_pview(&p.vas, va).unwrap();
            assert!(Arc::ptr_eq(&pv.set, &parent_set));
            assert!(sys::poke(va, &[2]));
            0
        })
        .unwrap();
        let st = sys::waits().unwrap();
        assert_eq!((st.pid, st.status), (pid, 0));

        let mut b = [0u8; 1];
        assert!(sys::peek(va, &mut b));
        assert_eq!(b, [2]);
        0
    });
    assert_eq!(h.join(), 0);
    k.shutdown();
}
