/*
 * SPDX-License-Identifier: MIT
 */

//! The rest of the syscall surface: identity, naming, events, sleep,
//! user-mutex assist, wiring, and exec.

use {
    kern::{
        mmap::{PROT_READ, PROT_WRITE},
        param::{M_CONNECT, M_DISCONNECT, M_DUP},
        perm::Perm,
        sys, BootParams, Kernel, MapFlags, Msg,
    },
    machine::NBPG,
    std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

#[test]
fn identity_and_names() {
    let k = Kernel::boot(BootParams::default());
    let h = k.spawn_task("ident", false, move || {
        let pid = sys::getid(0).unwrap();
        let tid = sys::getid(1).unwrap();
        assert!(pid > 0 && tid > 0);
        // Boot tasks answer to init.
        assert_eq!(sys::getid(2).unwrap(), 1);
        assert!(sys::getid(9).is_err());

        sys::set_cmd("identd").unwrap();
        assert_eq!(sys::cur_proc().cmd.lock(|c| c.clone()), "identd");

        assert_eq!(sys::setsid().unwrap(), pid);

        let mut name = 0u64;
        let portid = sys::msg_port(0, Some(&mut name)).unwrap();
        assert!(name != 0);
        assert_eq!(sys::msg_portname(portid as usize).unwrap(), name as i64);
        0
    });
    assert_eq!(h.join(), 0);
    k.shutdown();
}

#[test]
fn unhandled_event_is_fatal() {
    let k = Kernel::boot(BootParams::default());
    let h = k.spawn_task("doomed", false, move || {
        sys::notify(0, 0, "boom").unwrap();
        // Never reached: delivery on the way out of notify kills us.
        7
    });
    assert_eq!(h.join(), -1);
    k.shutdown();
}

#[test]
fn handled_event_is_survivable() {
    let k = Kernel::boot(BootParams::default());
    let h = k.spawn_task("hardy", false, move || {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        sys::notify_handler(Some(Arc::new(move |ev: &str| {
            assert_eq!(ev, "ping");
            seen2.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
        sys::notify(0, 0, "ping").unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        0
    });
    assert_eq!(h.join(), 0);
    k.shutdown();
}

#[test]
fn time_sleep_wakes_on_ticks() {
    let k = Kernel::boot(BootParams::default());
    let kt = Arc::clone(&k);
    let done = Arc::new(AtomicUsize::new(0));
    let done2 = Arc::clone(&done);
    let ticker = std::thread::spawn(move || {
        while done2.load(Ordering::SeqCst) == 0 {
            kt.tick(1);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    });

    let h = k.spawn_task("sleepy", false, move || {
        let t0 = sys::time_get().unwrap();
        sys::time_sleep(3).unwrap();
        let t1 = sys::time_get().unwrap();
        assert!(t1 >= t0 + 3, "woke early: {t0} -> {t1}");
        0
    });
    assert_eq!(h.join(), 0);
    done.store(1, Ordering::SeqCst);
    ticker.join().unwrap();
    k.shutdown();
}

#[test]
fn mutex_thread_parks_and_wakes() {
    let k = Kernel::boot(BootParams::default());
    let h = k.spawn_task("mutexy", false, move || {
        let parked = Arc::new(AtomicUsize::new(0));
        let parked2 = Arc::clone(&parked);
        let tid = sys::fork_thread(move || {
            parked2.store(1, Ordering::SeqCst);
            sys::mutex_thread(0).unwrap();
            parked2.store(2, Ordering::SeqCst);
            0
        })
        .unwrap();
        while parked.load(Ordering::SeqCst) < 1 {
            sys::sched_yield().unwrap();
        }
        // Give the sibling room to actually park, then wake it.
        for _ in 0..10 {
            sys::sched_yield().unwrap();
        }
        sys::mutex_thread(tid).unwrap();
        while parked.load(Ordering::SeqCst) < 2 {
            sys::sched_yield().unwrap();
        }
        0
    });
    assert_eq!(h.join(), 0);
    k.shutdown();
}

#[test]
fn perm_ctl_dominance() {
    let k = Kernel::boot(BootParams::default());
    let h = k.spawn_task("perms", true, move || {
        // Root dominates anything; install a weaker label.
        let newp = Perm::new(&[1, 1, 5], 0);
        sys::perm_ctl(1, Some(newp)).unwrap();
        let got = sys::perm_ctl(1, None).unwrap();
        assert_eq!(got.len, 3);
        assert!(sys::perm_ctl(99, None).is_err());
        0
    });
    assert_eq!(h.join(), 0);

    let h = k.spawn_task("weak", false, move || {
        // A plain label cannot grant itself the system chain.
        assert!(sys::perm_ctl(1, Some(Perm::root())).is_err());
        assert_eq!(sys::strerror(), "perm");
        0
    });
    assert_eq!(h.join(), 0);
    k.shutdown();
}

#[test]
fn page_wire_pins_a_frame() {
    let k = Kernel::boot(BootParams::default());
    let h = k.spawn_task("wiry", true, move || {
        let va = sys::mmap(0, NBPG, PROT_READ | PROT_WRITE, MapFlags::ANON, 0, 0).unwrap();
        let (handle, pfn) = sys::page_wire(va).unwrap();
        // The frame holds an extra reference now.
        {
            let p = sys::cur_proc();
            let pv = kern::vas::find_pview(&p.vas, va).unwrap();
            assert_eq!(pv.set.pp(0, |pp| pp.refs), 2);
            assert_eq!(pv.set.pp(0, |pp| pp.pfn), pfn);
        }
        sys::page_release(handle).unwrap();
        assert!(sys::page_release(handle).is_err());
        sys::munmap(va, NBPG).unwrap();
        0
    });
    assert_eq!(h.join(), 0);
    k.shutdown();
}

#[test]
fn exec_replaces_the_image_but_keeps_connections() {
    let k = Kernel::boot(BootParams::default());
    let served = Arc::new(AtomicUsize::new(0));
    let served2 = Arc::clone(&served);

    let server = k.spawn_task("echo-srv", true, move || {
        let portid = sys::msg_port(0xEC0, None).unwrap() as usize;
        loop {
            let mut m = Msg::default();
            sys::msg_receive(portid, &mut m).unwrap();
            match m.op {
                M_CONNECT => sys::msg_accept(m.sender).map(|_| ()).unwrap(),
                M_DUP => {
                    sys::msg_reply(m.sender, &Msg::default()).unwrap();
                }
                M_DISCONNECT => break,
                _ => {
                    served2.fetch_add(1, Ordering::SeqCst);
                    let r = Msg {
                        arg: m.arg + 1,
                        ..Default::default()
                    };
                    sys::msg_reply(m.sender, &r).unwrap();
                }
            }
        }
        0
    });

    let client = k.spawn_task("execer", false, move || {
        let port = loop {
            match sys::msg_connect(0xEC0) {
                Ok(id) => break id as usize,
                Err(_) => {
                    sys::sched_yield().unwrap();
                }
            }
        };
        let va = sys::mmap(0, NBPG, PROT_READ | PROT_WRITE, MapFlags::ANON, 0, 0).unwrap();
        assert!(sys::poke(va, &[1]));

        sys::exec(move || {
            // The old image's memory is gone...
            sys::notify_handler(Some(Arc::new(|_| {}))).unwrap();
            let mut b = [0u8; 1];
            assert!(!sys::peek(va, &mut b));
            // ...but the connection still answers.
            let mut m = Msg {
                op: kern::param::FS_WRITE,
                arg: 41,
                ..Default::default()
            };
            assert_eq!(sys::msg_send(port, &mut m).unwrap(), 42);
            sys::msg_disconnect(port).unwrap();
            5
        });
    });

    assert_eq!(client.join(), 5);
    assert_eq!(server.join(), 0);
    assert_eq!(served.load(Ordering::SeqCst), 1);
    k.shutdown();
}
