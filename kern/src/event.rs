/*
 * SPDX-License-Identifier: MIT
 */

//! Asynchronous events.
//!
//! Events are short named strings delivered to a thread.  Delivery
//! happens at trap exit: a registered process handler gets the name,
//! and an unhandled event takes the process down.  A thread blocked
//! interruptibly is unwound from its sleep so the delivery point comes
//! around promptly.

use {
    crate::{
        err::{Err, Result},
        kernel::{cur_kernel, cur_thread, try_cur_thread},
        mutex::Sema,
        perm::isroot,
        proc::{self, EventHandler},
        sched,
        thread::{TState, Thread},
    },
    std::sync::Arc,
};

/// Longest event name.
pub const EVLEN: usize = 16;

/// Post `event` onto a thread and kick it loose from any
/// interruptible sleep.
fn post(t: &Arc<Thread>, event: &str) {
    t.events.lock(|q| q.push_back(event.to_string()));
    // A running thread checks its queue on the way out; a sleeper has
    // to be pulled loose first.
    if t.state.get() == TState::Sleep && !t.nointr.get() && Sema::cunsleep(t) {
        sched::setrun(t);
    }
}

/// The `notify` syscall: deliver an event to (pid, tid).  A tid of
/// zero means the first thread of the process.  Zero/zero notifies
/// the caller's own process.
pub fn notify(pid: u64, tid: u64, event: &str) -> Result<i64> {
    if event.is_empty() || event.len() > EVLEN {
        return Err(Err::Inval);
    }
    let t = cur_thread();
    let k = cur_kernel();
    let p = if pid == 0 {
        Arc::clone(&t.proc)
    } else {
        k.procs
            .lock(crate::mutex::Spl::Lo)
            .map
            .get(&pid)
            .cloned()
            .ok_or(Err::NoEnt)?
    };
    // Crossing a process boundary takes real authority.
    if p.pid != t.proc.pid && !isroot() {
        return Err(Err::Perm);
    }
    let target = p.threads.lock(|v| {
        if tid == 0 {
            v.first().cloned()
        } else {
            v.iter().find(|x| x.tid == tid).cloned()
        }
    });
    let Some(target) = target else {
        return Err(Err::NoEnt);
    };
    post(&target, event);
    Ok(0)
}

/// Register the process event handler.
pub fn notify_handler(handler: Option<EventHandler>) -> Result<i64> {
    let t = cur_thread();
    t.proc.handler.lock(|h| *h = handler);
    Ok(0)
}

/// Kernel-generated event against the current thread (bad address,
/// math trap).
pub fn selfsig(e: Err) {
    let t = cur_thread();
    post(&t, &e.to_string());
}

/// Deliver anything pending on the current thread.  Called on every
/// trap exit; must be last, after preemption checks.
pub fn check_events() {
    let Some(t) = try_cur_thread() else { return };
    loop {
        let Some(ev) = t.events.lock(|q| q.pop_front()) else {
            return;
        };
        let handler = t.proc.handler.lock(|h| h.clone());
        match handler {
            Some(h) => h(&ev),
            None => {
                // Unhandled events are fatal to the whole process.
                kill_proc(&ev);
            }
        }
    }
}

/// Take the process down on an unhandled event: every sibling gets
/// the same death sentence, and we go first.
fn kill_proc(ev: &str) -> ! {
    let t = cur_thread();
    let siblings = t
        .proc
        .threads
        .lock(|v| v.iter().filter(|x| !Arc::ptr_eq(x, &t)).cloned().collect::<Vec<_>>());
    for s in siblings {
        s.events.lock(|q| q.push_back(ev.to_string()));
        if s.state.get() == TState::Sleep && !s.nointr.get() && Sema::cunsleep(&s) {
            sched::setrun(&s);
        }
    }
    proc::exit(-1);
}
