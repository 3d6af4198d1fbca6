/*
 * SPDX-License-Identifier: MIT
 */

//! The system-call surface as seen by in-kernel task bodies.
//!
//! Each function is one gate crossing: it runs the operation, records
//! any failure for `strerror`, and walks the common trap-exit path
//! (pending interrupts, preemption, event delivery) before returning.

use {
    crate::{
        clock,
        err::Result,
        event, kernel::cur_thread,
        misc, mmap,
        mmap::MapFlags,
        msg::{self, Msg},
        pageout, perm,
        perm::Perm,
        port, proc,
        proc::{EventHandler, ExitStatus},
        qio, sched, trap, vm_swap,
    },
    std::sync::Arc,
};

fn gate<T>(r: Result<T>) -> Result<T> {
    if let Err(e) = &r {
        cur_thread().set_err(e.clone());
    }
    trap::trap_exit();
    r
}

// Ports and messages.

pub fn msg_port(name: u64, out_name: Option<&mut u64>) -> Result<i64> {
    gate(port::msg_port(name, out_name))
}

pub fn msg_connect(name: u64) -> Result<i64> {
    gate(port::msg_connect(name))
}

pub fn msg_accept(tag: u64) -> Result<i64> {
    gate(port::msg_accept(tag))
}

pub fn msg_send(portid: usize, m: &mut Msg) -> Result<i64> {
    gate(msg::msg_send(portid, m))
}

pub fn msg_receive(portid: usize, m: &mut Msg) -> Result<i64> {
    gate(msg::msg_receive(portid, m))
}

pub fn msg_reply(tag: u64, m: &Msg) -> Result<i64> {
    gate(msg::msg_reply(tag, m))
}

pub fn msg_err(tag: u64, errstr: &str) -> Result<i64> {
    gate(msg::msg_err(tag, errstr))
}

pub fn msg_disconnect(portid: usize) -> Result<i64> {
    gate(port::msg_disconnect(portid))
}

pub fn msg_portname(portid: usize) -> Result<i64> {
    gate(port::msg_portname(portid))
}

pub fn clone(portid: usize) -> Result<i64> {
    gate(port::clone_portref(portid))
}

// Memory.

pub fn mmap(
    addr: usize,
    len: usize,
    prot: u32,
    flags: MapFlags,
    portid: usize,
    offset: usize,
) -> Result<usize> {
    gate(mmap::mmap(addr, len, prot, flags, portid, offset))
}

pub fn munmap(addr: usize, len: usize) -> Result<i64> {
    gate(mmap::munmap(addr, len))
}

pub fn unhash(portid: usize, fid: u64) -> Result<i64> {
    gate(mmap::unhash(portid, fid))
}

pub fn page_wire(vaddr: usize) -> Result<(usize, usize)> {
    gate(misc::page_wire(vaddr))
}

pub fn page_release(handle: usize) -> Result<i64> {
    gate(misc::page_release(handle))
}

/// Emulated user-mode store, faulting as needed.
pub fn poke(vaddr: usize, data: &[u8]) -> bool {
    trap::user_store(vaddr, data)
}

/// Emulated user-mode load.
pub fn peek(vaddr: usize, buf: &mut [u8]) -> bool {
    trap::user_load(vaddr, buf)
}

// Process lifecycle.

pub fn fork(child: impl FnOnce() -> i64 + Send + 'static) -> Result<u64> {
    gate(proc::fork(child))
}

pub fn fork_thread(body: impl FnOnce() -> i64 + Send + 'static) -> Result<u64> {
    gate(proc::fork_thread(body))
}

pub fn exit(status: i64) -> ! {
    proc::exit(status)
}

pub fn exec(body: impl FnOnce() -> i64 + Send + 'static) -> ! {
    proc::exec(body)
}

pub fn waits() -> Result<ExitStatus> {
    gate(proc::waits())
}

pub fn getid(which: u32) -> Result<i64> {
    gate(proc::getid(which))
}

pub fn set_cmd(cmd: &str) -> Result<i64> {
    gate(proc::set_cmd(cmd))
}

pub fn setsid() -> Result<i64> {
    gate(proc::setsid())
}

pub fn mutex_thread(arg: u64) -> Result<i64> {
    gate(proc::mutex_thread(arg))
}

// Events.

pub fn notify(pid: u64, tid: u64, event: &str) -> Result<i64> {
    gate(event::notify(pid, tid, event))
}

pub fn notify_handler(handler: Option<EventHandler>) -> Result<i64> {
    gate(event::notify_handler(handler))
}

// Scheduling.

pub fn sched_op(op: u32, arg: u32) -> Result<i64> {
    gate(sched::sched_op(op, arg))
}

pub fn sched_yield() -> Result<i64> {
    gate(sched::sched_op(sched::SCHEDOP_YIELD, 0))
}

// Time.

pub fn time_get() -> Result<i64> {
    gate(clock::time_get())
}

pub fn time_set(val: i64) -> Result<i64> {
    gate(clock::time_set(val))
}

pub fn time_sleep(ticks: u64) -> Result<i64> {
    gate(clock::time_sleep(ticks))
}

// Privileged machinery.

pub fn set_swapdev(portid: usize) -> Result<i64> {
    gate(vm_swap::set_swapdev(portid))
}

pub fn run_qio() -> Result<i64> {
    gate(qio::run_qio())
}

pub fn pageout() -> Result<i64> {
    gate(pageout::pageout())
}

pub fn enable_isr(portid: usize, irq: u32) -> Result<i64> {
    let r = {
        let k = crate::kernel::cur_kernel();
        k.isr.enable_isr(portid, irq)
    };
    gate(r)
}

pub fn enable_io() -> Result<i64> {
    gate(misc::enable_io())
}

pub fn enable_dma() -> Result<i64> {
    gate(misc::enable_dma())
}

pub fn debug_enter() -> Result<i64> {
    gate(misc::debug_enter())
}

pub fn perm_ctl(idx: usize, set: Option<Perm>) -> Result<Perm> {
    gate(perm::perm_ctl(idx, set))
}

/// The last error string, as user code would read it back.
pub fn strerror() -> String {
    misc::strerror()
}

/// The caller's process handle, for assertions from inside a task.
pub fn cur_proc() -> Arc<proc::Process> {
    Arc::clone(&cur_thread().proc)
}
