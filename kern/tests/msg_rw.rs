/*
 * SPDX-License-Identifier: MIT
 */

//! Synchronous send/receive/reply with memory-sharing segments.

use {
    kern::{
        mmap::{PROT_READ, PROT_WRITE},
        param::{FS_READ, FS_WRITE, MSGSEGS, M_CONNECT, M_DISCONNECT},
        sys, BootParams, Kernel, MapFlags, Msg, UserSeg,
    },
    machine::NBPG,
    std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

const PORT_NAME: u64 = 0x5e41;

fn connect_with_retry(name: u64) -> usize {
    loop {
        match sys::msg_connect(name) {
            Ok(id) => return id as usize,
            Err(_) => {
                sys::sched_yield().unwrap();
            }
        }
    }
}

#[test]
fn segments_cross_both_ways() {
    let k = Kernel::boot(BootParams::default());
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_srv = Arc::clone(&seen);

    let server = k.spawn_task("fs", true, move || {
        let portid = sys::msg_port(PORT_NAME, None).unwrap() as usize;
        // A buffer of our own to reply out of.
        let buf = sys::mmap(0, NBPG, PROT_READ | PROT_WRITE, MapFlags::ANON, 0, 0).unwrap();
        let reply_data: Vec<u8> = (0..20u8).map(|i| 0xE0 ^ i).collect();
        assert!(sys::poke(buf, &reply_data));

        loop {
            let mut m = Msg::default();
            sys::msg_receive(portid, &mut m).unwrap();
            match m.op {
                M_CONNECT => {
                    sys::msg_accept(m.sender).unwrap();
                }
                M_DISCONNECT => break,
                FS_WRITE => {
                    // The client's buffer arrives mapped into our
                    // space, mirroring its content.
                    assert_eq!(m.segs.len(), 1);
                    assert_eq!(m.segs[0].len, 20);
                    let mut got = [0u8; 20];
                    assert!(sys::peek(m.segs[0].buf, &mut got));
                    assert!(got.iter().enumerate().all(|(i, &b)| b == i as u8));
                    seen_srv.fetch_add(1, Ordering::SeqCst);
                    let r = Msg {
                        op: 0,
                        arg: 20,
                        arg1: 0,
                        sender: 0,
                        segs: vec![],
                    };
                    sys::msg_reply(m.sender, &r).unwrap();
                }
                FS_READ => {
                    // Fill the caller's buffer through a segment of
                    // our own.
                    let r = Msg {
                        op: 0,
                        arg: 20,
                        arg1: 0,
                        sender: 0,
                        segs: vec![UserSeg { buf, len: 20 }],
                    };
                    sys::msg_reply(m.sender, &r).unwrap();
                }
                op => panic!("fs: unexpected op {op}"),
            }
        }
        0
    });

    let client = k.spawn_task("client", false, move || {
        let port = connect_with_retry(PORT_NAME);
        let va = sys::mmap(0, NBPG, PROT_READ | PROT_WRITE, MapFlags::ANON, 0, 0).unwrap();
        let out: Vec<u8> = (0..20u8).collect();
        assert!(sys::poke(va, &out));

        // Write: our bytes visible over there.
        let mut m = Msg {
            op: FS_WRITE,
            arg: 20,
            arg1: 0,
            sender: 0,
            segs: vec![UserSeg { buf: va, len: 20 }],
        };
        let n = sys::msg_send(port, &mut m).unwrap();
        assert_eq!(n, 20);

        // Read: the reply's segment lands in our buffer.
        let mut m = Msg {
            op: FS_READ,
            arg: 20,
            arg1: 0,
            sender: 0,
            segs: vec![UserSeg { buf: va, len: 20 }],
        };
        let n = sys::msg_send(port, &mut m).unwrap();
        assert_eq!(n, 20);
        let mut got = [0u8; 20];
        assert!(sys::peek(va, &mut got));
        assert!(got.iter().enumerate().all(|(i, &b)| b == 0xE0 ^ i as u8));

        sys::msg_disconnect(port).unwrap();
        0
    });

    assert_eq!(client.join(), 0);
    assert_eq!(server.join(), 0);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    k.shutdown();
}

#[test]
fn send_boundary_conditions() {
    let k = Kernel::boot(BootParams::default());
    let closed = Arc::new(AtomicUsize::new(0));
    let closed_srv = Arc::clone(&closed);

    let server = k.spawn_task("srv", true, move || {
        let portid = sys::msg_port(PORT_NAME, None).unwrap() as usize;
        let mut m = Msg::default();
        // One connect, then the port goes away.
        loop {
            sys::msg_receive(portid, &mut m).unwrap();
            if m.op == M_CONNECT {
                sys::msg_accept(m.sender).unwrap();
                break;
            }
        }
        sys::msg_disconnect(portid).unwrap();
        closed_srv.store(1, Ordering::SeqCst);
        0
    });

    let client = k.spawn_task("cli", false, move || {
        let port = connect_with_retry(PORT_NAME);
        let va = sys::mmap(0, NBPG, PROT_READ | PROT_WRITE, MapFlags::ANON, 0, 0).unwrap();

        // Reserved opcodes are not for user code.
        let mut m = Msg {
            op: M_CONNECT,
            ..Default::default()
        };
        assert!(sys::msg_send(port, &mut m).is_err());
        assert_eq!(sys::strerror(), "invalid");

        // Segment count over the limit.
        let mut m = Msg {
            op: FS_WRITE,
            segs: (0..MSGSEGS + 1).map(|_| UserSeg { buf: va, len: 8 }).collect(),
            ..Default::default()
        };
        assert!(sys::msg_send(port, &mut m).is_err());
        assert_eq!(sys::strerror(), "invalid");

        // Segment over unmapped memory.
        let mut m = Msg {
            op: FS_WRITE,
            segs: vec![UserSeg {
                buf: 0x7000_0000,
                len: 16,
            }],
            ..Default::default()
        };
        assert!(sys::msg_send(port, &mut m).is_err());
        assert_eq!(sys::strerror(), "fault");

        // Wait out the server's shutdown, then hit the closed port.
        while closed.load(Ordering::SeqCst) == 0 {
            sys::sched_yield().unwrap();
        }
        let mut m = Msg {
            op: FS_WRITE,
            arg: 1,
            segs: vec![UserSeg { buf: va, len: 1 }],
            ..Default::default()
        };
        let e = sys::msg_send(port, &mut m).unwrap_err();
        assert_eq!(e.to_string(), "io err");
        0
    });

    assert_eq!(client.join(), 0);
    assert_eq!(server.join(), 0);
    k.shutdown();
}
