/*
 * SPDX-License-Identifier: MIT
 */

//! Interrupted sends: pulling a message back out of a queue, and the
//! abort handshake once the server has already picked it up.

use {
    kern::{
        param::{FS_WRITE, M_ABORT, M_CONNECT, M_DISCONNECT},
        sys, BootParams, Kernel, Msg,
    },
    std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

const PORT_NAME: u64 = 0x1417;

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

// The message never left the queue: the interrupted sender pulls it
// out and the server never sees it.
#[test]
fn interrupted_send_is_withdrawn() {
    let k = Kernel::boot(BootParams::default());
    // 1 = connected, 2 = client about to send, 3 = client done.
    let stage = Arc::new(AtomicUsize::new(0));
    let st_srv = Arc::clone(&stage);
    let st_cli = Arc::clone(&stage);

    let server = k.spawn_task("lazy-srv", true, move || {
        let portid = sys::msg_port(PORT_NAME, None).unwrap() as usize;
        let mut m = Msg::default();
        sys::msg_receive(portid, &mut m).unwrap();
        assert_eq!(m.op, M_CONNECT);
        sys::msg_accept(m.sender).unwrap();
        st_srv.store(1, Ordering::SeqCst);

        // Not receiving while the client sends; wait out the drama.
        while st_srv.load(Ordering::SeqCst) < 3 {
            sys::sched_yield().unwrap();
        }
        // The only thing left for us is the goodbye.
        sys::msg_receive(portid, &mut m).unwrap();
        assert_eq!(m.op, M_DISCONNECT);
        0
    });

    let client = k.spawn_task("client", false, move || {
        sys::notify_handler(Some(Arc::new(|_ev| {}))).unwrap();
        let port = connect_with_retry(PORT_NAME);
        let tid = sys::getid(1).unwrap() as u64;

        let st_sib = Arc::clone(&st_cli);
        sys::fork_thread(move || {
            // Keep poking the sender until it reports back in.
            while st_sib.load(Ordering::SeqCst) < 3 {
                let _ = sys::notify(0, tid, "wake");
                sys::sched_yield().unwrap();
            }
            0
        })
        .unwrap();

        st_cli.store(2, Ordering::SeqCst);
        let mut m = Msg {
            op: FS_WRITE,
            arg: 7,
            ..Default::default()
        };
        let e = sys::msg_send(port, &mut m).unwrap_err();
        assert_eq!(e.to_string(), "intr");
        st_cli.store(3, Ordering::SeqCst);

        sys::msg_disconnect(port).unwrap();
        0
    });

    assert_eq!(client.join(), 0);
    assert_eq!(server.join(), 0);
    k.shutdown();
}

// The server already dequeued the message: the client must run the
// abort protocol, and the server acknowledges it.
#[test]
fn abort_handshake_after_server_pickup() {
    let k = Kernel::boot(BootParams::default());
    // 1 = connected, 2 = server holds the message, 3 = client done.
    let stage = Arc::new(AtomicUsize::new(0));
    let st_srv = Arc::clone(&stage);
    let st_cli = Arc::clone(&stage);

    let server = k.spawn_task("slow-srv", true, move || {
        let portid = sys::msg_port(PORT_NAME, None).unwrap() as usize;
        let mut m = Msg::default();
        sys::msg_receive(portid, &mut m).unwrap();
        assert_eq!(m.op, M_CONNECT);
        sys::msg_accept(m.sender).unwrap();
        st_srv.store(1, Ordering::SeqCst);

        // Take the client's message and sit on it.
        sys::msg_receive(portid, &mut m).unwrap();
        assert_eq!(m.op, FS_WRITE);
        let who = m.sender;
        st_srv.store(2, Ordering::SeqCst);

        // The next thing through the queue is the abort; answer it.
        sys::msg_receive(portid, &mut m).unwrap();
        assert_eq!(m.op, M_ABORT);
        assert_eq!(m.sender, who);
        let ack = Msg {
            op: M_ABORT,
            ..Default::default()
        };
        sys::msg_reply(who, &ack).unwrap();

        sys::msg_receive(portid, &mut m).unwrap();
        assert_eq!(m.op, M_DISCONNECT);
        0
    });

    let client = k.spawn_task("client", false, move || {
        sys::notify_handler(Some(Arc::new(|_ev| {}))).unwrap();
        let port = connect_with_retry(PORT_NAME);
        let tid = sys::getid(1).unwrap() as u64;

        let st_sib = Arc::clone(&st_cli);
        sys::fork_thread(move || {
            // Interrupt only once the server holds the message, so
            // the withdraw path cannot win the race instead.
            while st_sib.load(Ordering::SeqCst) < 2 {
                sys::sched_yield().unwrap();
            }
            while st_sib.load(Ordering::SeqCst) < 3 {
                let _ = sys::notify(0, tid, "wake");
                sys::sched_yield().unwrap();
            }
            0
        })
        .unwrap();

        let mut m = Msg {
            op: FS_WRITE,
            arg: 9,
            ..Default::default()
        };
        let e = sys::msg_send(port, &mut m).unwrap_err();
        assert_eq!(e.to_string(), "intr");
        st_cli.store(3, Ordering::SeqCst);

        sys::msg_disconnect(port).unwrap();
        0
    });

    assert_eq!(client.join(), 0);
    assert_eq!(server.join(), 0);
    k.shutdown();
}
