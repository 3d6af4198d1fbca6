/*
 * SPDX-License-Identifier: MIT
 */

//! The numeric system-call table.
//!
//! One row per opcode: handler and argument count.  Arguments one to
//! three ride in registers; longer lists are copied in from the user
//! stack.  Results land in the frame with a carry-style error flag,
//! and the error string stays on the thread for `strerror`.

use {
    crate::{
        clock,
        err::{Err, Result},
        event,
        kernel::cur_thread,
        misc, mmap,
        mmap::MapFlags,
        msg::{self, Msg, UserSeg},
        param::MSGSEGS,
        perm::{self, Perm},
        port, proc, qio, sched, trap,
        uaccess::{copyin, copyout},
        vas::Vas,
        vm_swap,
    },
    std::sync::Arc,
};

/// Saved user registers at the syscall gate.
pub struct Frame {
    pub callnum: u32,
    /// Arguments 1..=3.
    pub regs: [i64; 3],
    /// User stack pointer; arguments 4..N sit above the return slot.
    pub usp: usize,
    pub result: i64,
    /// The error flag user code tests.
    pub carry: bool,
}

impl Frame {
    pub fn call(callnum: u32, regs: [i64; 3]) -> Frame {
        Frame {
            callnum,
            regs,
            usp: 0,
            result: 0,
            carry: false,
        }
    }
}

type Handler = fn(&[i64]) -> Result<i64>;

struct SysEnt {
    fun: Handler,
    narg: usize,
}

macro_rules! ent {
    ($f:expr, $n:expr) => {
        SysEnt { fun: $f, narg: $n }
    };
}

static SYSCALLS: &[SysEnt] = &[
    ent!(do_msg_port, 2),      //  0
    ent!(do_msg_connect, 2),   //  1
    ent!(do_msg_accept, 1),    //  2
    ent!(do_msg_send, 2),      //  3
    ent!(do_msg_receive, 2),   //  4
    ent!(do_msg_reply, 2),     //  5
    ent!(do_msg_disconnect, 1), // 6
    ent!(do_msg_err, 3),       //  7
    ent!(do_exit, 1),          //  8
    ent!(do_notsup, 0),        //  9 fork: takes an entry body; kernel API only
    ent!(do_notsup, 2),        // 10 fork_thread: likewise
    ent!(do_enable_io, 2),     // 11
    ent!(do_enable_isr, 2),    // 12
    ent!(do_mmap, 6),          // 13
    ent!(do_munmap, 2),        // 14
    ent!(do_strerror, 1),      // 15
    ent!(do_notify, 4),        // 16
    ent!(do_clone, 1),         // 17
    ent!(do_page_wire, 2),     // 18
    ent!(do_page_release, 1),  // 19
    ent!(do_enable_dma, 0),    // 20
    ent!(do_time_get, 1),      // 21
    ent!(do_time_sleep, 1),    // 22
    ent!(do_debug_enter, 0),   // 23
    ent!(do_notsup, 3),        // 24 exec: takes an entry body
    ent!(do_waits, 2),         // 25
    ent!(do_perm_ctl, 3),      // 26
    ent!(do_set_swapdev, 1),   // 27
    ent!(do_run_qio, 0),       // 28
    ent!(do_set_cmd, 1),       // 29
    ent!(do_pageout, 0),       // 30
    ent!(do_getid, 1),         // 31
    ent!(do_unhash, 2),        // 32
    ent!(do_time_set, 1),      // 33
    ent!(do_nop, 1),           // 34
    ent!(do_msg_portname, 1),  // 35
    ent!(do_nop, 1),           // 36
    ent!(do_notsup, 1),        // 37 notify_handler: registers an entry body
    ent!(do_sched_op, 2),      // 38
    ent!(do_setsid, 0),        // 39
    ent!(do_mutex_thread, 1),  // 40
];

/// Dispatch a trap for system services.
pub fn syscall(f: &mut Frame) {
    let t = cur_thread();
    f.carry = false;
    let res = (|| -> Result<i64> {
        let ent = SYSCALLS
            .get(f.callnum as usize)
            .ok_or(Err::Inval)?;
        let mut args = [0i64; 8];
        if ent.narg <= 3 {
            args[..3].copy_from_slice(&f.regs);
        } else {
            let vas = Arc::clone(&t.proc.vas);
            let mut raw = vec![0u8; ent.narg * 8];
            copyin(&vas, f.usp + 8, &mut raw)?;
            for (i, c) in raw.chunks_exact(8).enumerate() {
                args[i] = i64::from_le_bytes(c.try_into().unwrap());
            }
        }
        (ent.fun)(&args)
    })();
    match res {
        Ok(v) => f.result = v,
        Err(e) => {
            t.set_err(e);
            f.result = -1;
            f.carry = true;
        }
    }
    trap::trap_exit();
}

fn uvas() -> Arc<Vas> {
    Arc::clone(&cur_thread().proc.vas)
}

// The wire layout of a user message: header words then MSGSEGS
// (buffer, length) pairs.
const UMSG_SEGS_OFF: usize = 40;
const UMSG_SIZE: usize = UMSG_SEGS_OFF + MSGSEGS * 16;

fn read_umsg(addr: usize) -> Result<Msg> {
    let vas = uvas();
    let mut raw = [0u8; UMSG_SIZE];
    copyin(&vas, addr, &mut raw)?;
    let word = |off: usize| i64::from_le_bytes(raw[off..off + 8].try_into().unwrap());
    let nseg = u32::from_le_bytes(raw[32..36].try_into().unwrap()) as usize;
    if nseg > MSGSEGS {
        return Err(Err::Inval);
    }
    let mut segs = Vec::with_capacity(nseg);
    for i in 0..nseg {
        let off = UMSG_SEGS_OFF + i * 16;
        segs.push(UserSeg {
            buf: word(off) as usize,
            len: word(off + 8) as usize,
        });
    }
    Ok(Msg {
        op: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
        arg: word(8),
        arg1: word(16),
        sender: word(24) as u64,
        segs,
    })
}

fn write_umsg(addr: usize, m: &Msg) -> Result<()> {
    let vas = uvas();
    let mut raw = [0u8; UMSG_SIZE];
    raw[0..4].copy_from_slice(&m.op.to_le_bytes());
    raw[8..16].copy_from_slice(&m.arg.to_le_bytes());
    raw[16..24].copy_from_slice(&m.arg1.to_le_bytes());
    raw[24..32].copy_from_slice(&m.sender.to_le_bytes());
    raw[32..36].copy_from_slice(&(m.segs.len() as u32).to_le_bytes());
    for (i, s) in m.segs.iter().enumerate() {
        let off = UMSG_SEGS_OFF + i * 16;
        raw[off..off + 8].copy_from_slice(&(s.buf as u64).to_le_bytes());
        raw[off + 8..off + 16].copy_from_slice(&(s.len as u64).to_le_bytes());
    }
    copyout(&vas, addr, &raw)
}

fn do_msg_port(a: &[i64]) -> Result<i64> {
    let mut name = a[0] as u64;
    let id = port::msg_port(name, Some(&mut name))?;
    if a[1] != 0 {
        copyout(&uvas(), a[1] as usize, &name.to_le_bytes())?;
    }
    Ok(id)
}

fn do_msg_connect(a: &[i64]) -> Result<i64> {
    port::msg_connect(a[0] as u64)
}

fn do_msg_accept(a: &[i64]) -> Result<i64> {
    port::msg_accept(a[0] as u64)
}

fn do_msg_send(a: &[i64]) -> Result<i64> {
    let mut m = read_umsg(a[1] as usize)?;
    let r = msg::msg_send(a[0] as usize, &mut m)?;
    write_umsg(a[1] as usize, &m)?;
    Ok(r)
}

fn do_msg_receive(a: &[i64]) -> Result<i64> {
    let mut m = Msg::default();
    let r = msg::msg_receive(a[0] as usize, &mut m)?;
    write_umsg(a[1] as usize, &m)?;
    Ok(r)
}

fn do_msg_reply(a: &[i64]) -> Result<i64> {
    let m = read_umsg(a[1] as usize)?;
    msg::msg_reply(a[0] as u64, &m)
}

fn do_msg_disconnect(a: &[i64]) -> Result<i64> {
    port::msg_disconnect(a[0] as usize)
}

fn do_msg_err(a: &[i64]) -> Result<i64> {
    let s = misc::get_ustr(&uvas(), a[1] as usize, a[2] as usize, 64)?;
    msg::msg_err(a[0] as u64, &s)
}

fn do_exit(a: &[i64]) -> Result<i64> {
    proc::exit(a[0]);
}

fn do_notsup(_a: &[i64]) -> Result<i64> {
    // Needs an entry body; only reachable through the in-kernel API.
    Err(Err::Inval)
}

fn do_nop(_a: &[i64]) -> Result<i64> {
    Err(Err::Inval)
}

fn do_enable_io(_a: &[i64]) -> Result<i64> {
    misc::enable_io()
}

fn do_enable_isr(a: &[i64]) -> Result<i64> {
    crate::kernel::cur_kernel()
        .isr
        .enable_isr(a[0] as usize, a[1] as u32)
}

fn do_mmap(a: &[i64]) -> Result<i64> {
    let flags = MapFlags::from_bits(a[3] as u32).ok_or(Err::Inval)?;
    mmap::mmap(
        a[0] as usize,
        a[1] as usize,
        a[2] as u32,
        flags,
        a[4] as usize,
        a[5] as usize,
    )
    .map(|va| va as i64)
}

fn do_munmap(a: &[i64]) -> Result<i64> {
    mmap::munmap(a[0] as usize, a[1] as usize)
}

fn do_strerror(a: &[i64]) -> Result<i64> {
    let mut s = misc::strerror().into_bytes();
    s.push(0);
    copyout(&uvas(), a[0] as usize, &s)?;
    Ok(0)
}

fn do_notify(a: &[i64]) -> Result<i64> {
    let ev = misc::get_ustr(&uvas(), a[2] as usize, a[3] as usize, event::EVLEN + 1)?;
    event::notify(a[0] as u64, a[1] as u64, &ev)
}

fn do_clone(a: &[i64]) -> Result<i64> {
    port::clone_portref(a[0] as usize)
}

fn do_page_wire(a: &[i64]) -> Result<i64> {
    let (handle, pfn) = misc::page_wire(a[0] as usize)?;
    if a[1] != 0 {
        copyout(&uvas(), a[1] as usize, &(pfn as u64).to_le_bytes())?;
    }
    Ok(handle as i64)
}

fn do_page_release(a: &[i64]) -> Result<i64> {
    misc::page_release(a[0] as usize)
}

fn do_enable_dma(_a: &[i64]) -> Result<i64> {
    misc::enable_dma()
}

fn do_time_get(a: &[i64]) -> Result<i64> {
    let t = clock::time_get()?;
    copyout(&uvas(), a[0] as usize, &t.to_le_bytes())?;
    Ok(0)
}

fn do_time_sleep(a: &[i64]) -> Result<i64> {
    clock::time_sleep(a[0] as u64)
}

fn do_debug_enter(_a: &[i64]) -> Result<i64> {
    misc::debug_enter()
}

fn do_waits(a: &[i64]) -> Result<i64> {
    let st = proc::waits()?;
    if a[0] != 0 {
        copyout(&uvas(), a[0] as usize, &st.status.to_le_bytes())?;
    }
    Ok(st.pid as i64)
}

// Wire form of a permission: length word, id chain, uid.
fn do_perm_ctl(a: &[i64]) -> Result<i64> {
    let vas = uvas();
    let set = if a[1] != 0 {
        let mut raw = [0u8; 4 + crate::param::PERMLEN * 2 + 4];
        copyin(&vas, a[1] as usize, &mut raw)?;
        let len = u32::from_le_bytes(raw[0..4].try_into().unwrap()) as usize;
        if len > crate::param::PERMLEN {
            return Err(Err::Inval);
        }
        let mut chain = [0u16; crate::param::PERMLEN];
        for (i, c) in chain.iter_mut().enumerate().take(len) {
            let off = 4 + i * 2;
            *c = u16::from_le_bytes(raw[off..off + 2].try_into().unwrap());
        }
        let uid_off = 4 + crate::param::PERMLEN * 2;
        let uid = u32::from_le_bytes(raw[uid_off..uid_off + 4].try_into().unwrap());
        Some(Perm::new(&chain[..len], uid))
    } else {
        None
    };
    let out = perm::perm_ctl(a[0] as usize, set)?;
    if a[2] != 0 {
        let mut raw = [0u8; 4 + crate::param::PERMLEN * 2 + 4];
        raw[0..4].copy_from_slice(&(out.len as u32).to_le_bytes());
        for i in 0..out.len {
            let off = 4 + i * 2;
            raw[off..off + 2].copy_from_slice(&out.id[i].to_le_bytes());
        }
        let uid_off = 4 + crate::param::PERMLEN * 2;
        raw[uid_off..uid_off + 4].copy_from_slice(&out.uid.to_le_bytes());
        copyout(&vas, a[2] as usize, &raw)?;
    }
    Ok(0)
}

fn do_set_swapdev(a: &[i64]) -> Result<i64> {
    vm_swap::set_swapdev(a[0] as usize)
}

fn do_run_qio(_a: &[i64]) -> Result<i64> {
    qio::run_qio()
}

fn do_set_cmd(a: &[i64]) -> Result<i64> {
    let s = misc::get_ustr(&uvas(), a[0] as usize, 32, 40)?;
    proc::set_cmd(&s)
}

fn do_pageout(_a: &[i64]) -> Result<i64> {
    crate::pageout::pageout()
}

fn do_getid(a: &[i64]) -> Result<i64> {
    proc::getid(a[0] as u32)
}

fn do_unhash(a: &[i64]) -> Result<i64> {
    mmap::unhash(a[0] as usize, a[1] as u64)
}

fn do_time_set(a: &[i64]) -> Result<i64> {
    clock::time_set(a[0])
}

fn do_msg_portname(a: &[i64]) -> Result<i64> {
    port::msg_portname(a[0] as usize)
}

fn do_sched_op(a: &[i64]) -> Result<i64> {
    sched::sched_op(a[0] as u32, a[1] as u32)
}

fn do_setsid(_a: &[i64]) -> Result<i64> {
    proc::setsid()
}

fn do_mutex_thread(a: &[i64]) -> Result<i64> {
    proc::mutex_thread(a[0] as u64)
}
