/*
 * SPDX-License-Identifier: MIT
 */

//! Mapped files: the identity handshake, demand paging through a
//! server, and cache coalescing between independent mappers.

use {
    kern::{
        mmap::{PROT_READ, PROT_WRITE},
        param::{FS_ABSREAD, FS_FID, M_CONNECT, M_DISCONNECT, M_DUP},
        pset::PsetKind,
        sys,
        vas::find_pview,
        BootParams, Kernel, MapFlags, Msg, UserSeg,
    },
    machine::NBPG,
    std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

const PORT_NAME: u64 = 0xF11E;
const FILE_ID: i64 = 0xBEEF;
const FILE_PAGES: i64 = 10;

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

fn pattern(off: usize, i: usize) -> u8 {
    (off / NBPG) as u8 ^ (i as u8).wrapping_mul(3)
}

/// A one-file server: stable identity, page reads served from its own
/// anonymous buffer.
fn file_server(reads: Arc<AtomicUsize>, done: Arc<AtomicUsize>) -> i64 {
    let portid = sys::msg_port(PORT_NAME, None).unwrap() as usize;
    let buf = sys::mmap(0, NBPG, PROT_READ | PROT_WRITE, MapFlags::ANON, 0, 0).unwrap();
    let mut clients = 0u32;
    loop {
        let mut m = Msg::default();
        sys::msg_receive(portid, &mut m).unwrap();
        match m.op {
            M_CONNECT => {
                clients += 1;
                sys::msg_accept(m.sender).unwrap();
            }
            M_DUP => {
                // The kernel duplicating a connection for its cache.
                let r = Msg::default();
                sys::msg_reply(m.sender, &r).unwrap();
            }
            M_DISCONNECT => {
                clients = clients.saturating_sub(1);
                if clients == 0 && done.load(Ordering::SeqCst) != 0 {
                    break;
                }
            }
            FS_FID => {
                let r = Msg {
                    arg: FILE_ID,
                    arg1: FILE_PAGES,
                    ..Default::default()
                };
                sys::msg_reply(m.sender, &r).unwrap();
            }
            FS_ABSREAD => {
                let off = m.arg1 as usize;
                let data: Vec<u8> = (0..NBPG).map(|i| pattern(off, i)).collect();
                assert!(sys::poke(buf, &data));
                reads.fetch_add(1, Ordering::SeqCst);
                let r = Msg {
                    arg: NBPG as i64,
                    segs: vec![UserSeg { buf, len: NBPG }],
                    ..Default::default()
                };
                sys::msg_reply(m.sender, &r).unwrap();
            }
            op => panic!("file server: unexpected op {op}"),
        }
    }
    0
}

#[test]
fn mapping_coalesces_on_file_identity() {
    let k = Kernel::boot(BootParams::default());
    let reads = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let (r2, d2) = (Arc::clone(&reads), Arc::clone(&done));
    let server = k.spawn_task("file-srv", true, move || file_server(r2, d2));

    // 1 = first mapper read its page, 2 = second mapper finished.
    let stage = Arc::new(AtomicUsize::new(0));

    let st_a = Arc::clone(&stage);
    let reads_a = Arc::clone(&reads);
    let a = k.spawn_task("mapper-a", false, move || {
        let port = connect_with_retry(PORT_NAME);
        let va = sys::mmap(0, 6 * NBPG, PROT_READ, MapFlags::FILE, port, 0).unwrap();
        {
            let p = sys::cur_proc();
            let pv = find_pview(&p.vas, va).unwrap();
            assert_eq!(pv.set.kind(), PsetKind::File);
            assert_eq!(pv.set.len(), FILE_PAGES as usize);
        }
        // Fault page 4: one paging read to the server.
        let mut b = [0u8; 2];
        assert!(sys::peek(va + 4 * NBPG, &mut b));
        assert_eq!(b[0], pattern(4 * NBPG, 0));
        assert_eq!(b[1], pattern(4 * NBPG, 1));
        assert_eq!(reads_a.load(Ordering::SeqCst), 1);
        st_a.store(1, Ordering::SeqCst);

        // Hold the mapping until the second mapper is through.
        while st_a.load(Ordering::SeqCst) < 2 {
            sys::sched_yield().unwrap();
        }
        sys::munmap(va, 6 * NBPG).unwrap();
        sys::msg_disconnect(port).unwrap();
        0
    });

    let st_b = Arc::clone(&stage);
    let reads_b = Arc::clone(&reads);
    let b = k.spawn_task("mapper-b", false, move || {
        while st_b.load(Ordering::SeqCst) < 1 {
            sys::sched_yield().unwrap();
        }
        let port = connect_with_retry(PORT_NAME);
        let va = sys::mmap(0, 6 * NBPG, PROT_READ, MapFlags::FILE, port, 0).unwrap();
        // Page 4 is already resident in the shared cache: no new
        // server traffic.
        let mut buf = [0u8; 1];
        assert!(sys::peek(va + 4 * NBPG, &mut buf));
        assert_eq!(buf[0], pattern(4 * NBPG, 0));
        assert_eq!(reads_b.load(Ordering::SeqCst), 1);

        sys::munmap(va, 6 * NBPG).unwrap();
        sys::msg_disconnect(port).unwrap();
        st_b.store(2, Ordering::SeqCst);
        0
    });

    assert_eq!(a.join(), 0);
    assert_eq!(b.join(), 0);
    done.store(1, Ordering::SeqCst);
    // A last client in and out lets the server notice the flag.
    let fin = k.spawn_task("fin", false, move || {
        let port = connect_with_retry(PORT_NAME);
        sys::msg_disconnect(port).unwrap();
        0
    });
    assert_eq!(fin.join(), 0);
    assert_eq!(server.join(), 0);
    assert_eq!(reads.load(Ordering::SeqCst), 1);
    k.shutdown();
}

#[test]
fn writable_file_map_is_copy_on_write() {
    let k = Kernel::boot(BootParams::default());
    let reads = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let (r2, d2) = (Arc::clone(&reads), Arc::clone(&done));
    let server = k.spawn_task("file-srv", true, move || file_server(r2, d2));

    let done_cli = Arc::clone(&done);
    let cli = k.spawn_task("cow-mapper", false, move || {
        let port = connect_with_retry(PORT_NAME);
        // Writable demands MAP_PRIVATE.
        assert!(sys::mmap(0, NBPG, PROT_WRITE, MapFlags::FILE, port, 0).is_err());
        let va = sys::mmap(
            0,
            2 * NBPG,
            PROT_READ | PROT_WRITE,
            MapFlags::FILE | MapFlags::PRIVATE,
            port,
            0,
        )
        .unwrap();
        {
            let p = sys::cur_proc();
            let pv = find_pview(&p.vas, va).unwrap();
            assert_eq!(pv.set.kind(), PsetKind::Cow);
            assert_eq!(
                pv.set.ops().cow_parent().unwrap().kind(),
                PsetKind::File
            );
        }
        // Read pulls the file page; write keeps a private copy.
        let mut b = [0u8; 1];
        assert!(sys::peek(va, &mut b));
        assert_eq!(b[0], pattern(0, 0));
        assert!(sys::poke(va, &[0x42]));
        assert!(sys::peek(va, &mut b));
        assert_eq!(b[0], 0x42);

        sys::munmap(va, 2 * NBPG).unwrap();
        done_cli.store(1, Ordering::SeqCst);
        sys::msg_disconnect(port).unwrap();
        0
    });

    assert_eq!(cli.join(), 0);
    assert_eq!(server.join(), 0);
    k.shutdown();
}
