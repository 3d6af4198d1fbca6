/*
 * SPDX-License-Identifier: MIT
 */

//! The swap manager protocol: pending tally hand-off, allocation, and
//! blocking in the wait pool when space runs out.

use {
    kern::{
        mmap::{PROT_READ, PROT_WRITE},
        param::{FS_WSTAT, M_CONNECT, M_DISCONNECT, SWAP_ALLOC, SWAP_FREE},
        sys, BootParams, Kernel, MapFlags, Msg,
    },
    machine::NBPG,
    std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

const PORT_NAME: u64 = 0x5a5a;

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
fn pending_tally_hands_off_and_exhaustion_blocks() {
    let k = Kernel::boot(BootParams::default());
    // Observable swap-server state.
    let allocs = Arc::new(AtomicUsize::new(0));
    let frees = Arc::new(AtomicUsize::new(0));
    let refusals = Arc::new(AtomicUsize::new(0));
    let (al, fr, rf) = (
        Arc::clone(&allocs),
        Arc::clone(&frees),
        Arc::clone(&refusals),
    );

    let server = k.spawn_task("swapd", true, move || {
        let portid = sys::msg_port(PORT_NAME, None).unwrap() as usize;
        let mut next_blk: i64 = 1;
        let mut full = false;
        loop {
            let mut m = Msg::default();
            sys::msg_receive(portid, &mut m).unwrap();
            match m.op {
                M_CONNECT => {
                    sys::msg_accept(m.sender).unwrap();
                }
                M_DISCONNECT => break,
                // Test control: flip the out-of-space state.
                FS_WSTAT => {
                    full = m.arg != 0;
                    let r = Msg::default();
                    sys::msg_reply(m.sender, &r).unwrap();
                }
                SWAP_ALLOC => {
                    let r = if full {
                        rf.fetch_add(1, Ordering::SeqCst);
                        Msg {
                            arg: 0,
                            ..Default::default()
                        }
                    } else {
                        let blk = next_blk;
                        next_blk += m.arg;
                        al.fetch_add(1, Ordering::SeqCst);
                        Msg {
                            arg: blk,
                            ..Default::default()
                        }
                    };
                    sys::msg_reply(m.sender, &r).unwrap();
                }
                SWAP_FREE => {
                    full = false;
                    fr.fetch_add(1, Ordering::SeqCst);
                    let r = Msg::default();
                    sys::msg_reply(m.sender, &r).unwrap();
                }
                op => panic!("swapd: unexpected op {op}"),
            }
        }
        0
    });

    // 1 = manager registered, 2 = helper blocked-and-finished.
    let stage = Arc::new(AtomicUsize::new(0));
    let st = Arc::clone(&stage);
    let refusals_cli = Arc::clone(&refusals);
    let allocs_cli = Arc::clone(&allocs);

    let client = k.spawn_task("init", true, move || {
        // Consume some swap before any manager exists: pure tally.
        let early = sys::mmap(0, 2 * NBPG, PROT_READ | PROT_WRITE, MapFlags::ANON, 0, 0).unwrap();

        let ctl = connect_with_retry(PORT_NAME);
        let swap_conn = connect_with_retry(PORT_NAME);
        sys::set_swapdev(swap_conn).unwrap();
        st.store(1, Ordering::SeqCst);

        // The first allocation settles the pending tally in a batch,
        // then takes its own blocks.
        let before = allocs_cli.load(Ordering::SeqCst);
        let va = sys::mmap(0, NBPG, PROT_READ | PROT_WRITE, MapFlags::ANON, 0, 0).unwrap();
        assert_eq!(allocs_cli.load(Ordering::SeqCst), before + 2);

        // Declare the manager full, then watch a sibling block in the
        // wait pool until our unmap frees space.
        let mut m = Msg {
            op: FS_WSTAT,
            arg: 1,
            ..Default::default()
        };
        sys::msg_send(ctl, &mut m).unwrap();

        let st2 = Arc::clone(&st);
        let rf2 = Arc::clone(&refusals_cli);
        sys::fork_thread(move || {
            let va2 = sys::mmap(0, NBPG, PROT_READ | PROT_WRITE, MapFlags::ANON, 0, 0).unwrap();
            // We only got here because somebody freed space after at
            // least one refusal.
            assert!(rf2.load(Ordering::SeqCst) >= 1);
            sys::munmap(va2, NBPG).unwrap();
            st2.store(2, Ordering::SeqCst);
            0
        })
        .unwrap();

        // Wait for the sibling to hit the refusal, then free.
        while refusals_cli.load(Ordering::SeqCst) == 0 {
            sys::sched_yield().unwrap();
        }
        sys::munmap(early, 2 * NBPG).unwrap();

        while st.load(Ordering::SeqCst) < 2 {
            sys::sched_yield().unwrap();
        }
        sys::munmap(va, NBPG).unwrap();
        sys::msg_disconnect(ctl).unwrap();
        0
    });

    assert_eq!(client.join(), 0);
    assert_eq!(server.join(), 0);
    assert!(frees.load(Ordering::SeqCst) >= 1);
    k.shutdown();
}
