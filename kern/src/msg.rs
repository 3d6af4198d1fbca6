/*
 * SPDX-License-Identifier: MIT
 */

//! Message passing.
//!
//! The primary user system service.  Message payloads travel as
//! memory-sharing segments: each segment in a user message becomes a
//! kernel view of the sender's pages, mapped into the receiver on
//! receive and torn down on reply, so process-to-process copies happen
//! without an intermediate kernel copy.

use {
    crate::{
        err::{Err, Result},
        kernel::cur_thread,
        mutex::{Pri, SpinGuard, Spl},
        param::*,
        port::{
            del_client, deref_port, find_port, find_portref, new_client, ref_port, Port,
            PortFlags, Portref, PrState,
        },
        proc::Process,
        seg::{attach_seg, detach_seg, free_seg, make_seg, Seg},
        uaccess,
    },
    machine::sync::{CpuCell, NullLock},
    std::sync::Arc,
};

/// One scatter/gather element of a user message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UserSeg {
    pub buf: usize,
    pub len: usize,
}

/// The user-visible message header.
#[derive(Clone, Debug, Default)]
pub struct Msg {
    pub op: u32,
    pub arg: i64,
    pub arg1: i64,
    /// Sender identity, filled in by receive; opaque to non-peers.
    pub sender: u64,
    pub segs: Vec<UserSeg>,
}

/// In-kernel representation of an in-flight message.
pub struct SysMsg {
    pub op: CpuCell<u32>,
    pub arg: CpuCell<i64>,
    pub arg1: CpuCell<i64>,
    pub err: NullLock<Option<String>>,
    pub sender: NullLock<Option<Arc<Portref>>>,
    pub segs: NullLock<Vec<Seg>>,
    /// The sender's original segment list; reply data lands there.
    pub usegs: NullLock<Vec<UserSeg>>,
    /// Reply handed segments over; the consumer must release the
    /// server from its handoff wait.
    pub handed: CpuCell<bool>,
    /// A receiver consumed this message; the sender's unwind paths
    /// use this to tell a withdrawn message from an acknowledged one.
    pub seen: CpuCell<bool>,
    /// New portref riding an `M_DUP` transaction.
    pub dup_pr: NullLock<Option<Arc<Portref>>>,
}

impl SysMsg {
    pub fn new(op: u32, arg: i64, arg1: i64) -> Arc<SysMsg> {
        Arc::new(SysMsg {
            op: CpuCell::new(op),
            arg: CpuCell::new(arg),
            arg1: CpuCell::new(arg1),
            err: NullLock::new(None),
            sender: NullLock::new(None),
            segs: NullLock::new(Vec::new()),
            usegs: NullLock::new(Vec::new()),
            handed: CpuCell::new(false),
            seen: CpuCell::new(false),
            dup_pr: NullLock::new(None),
        })
    }
}

/// Queue a message on a port and count it for the receivers.
pub fn queue_msg(port: &Port, sm: &Arc<SysMsg>) {
    let mut q = port.queue.lock(Spl::Hi);
    q.push_back(Arc::clone(sm));
    port.wait.v();
    drop(q);
}

/// Release all segment references a sysmsg still holds.
pub fn freesegs(sm: &Arc<SysMsg>) {
    let segs = sm.segs.lock(std::mem::take);
    for s in segs {
        detach_seg(&s);
        free_seg(s);
    }
}

/// Convert user segments to kernel form under a sysmsg.
///
/// For a read-style op only the header travels; the user buffers will
/// be filled from the answer.  On failure every partially built
/// segment is unwound.
pub fn m_to_sm(p: &Arc<Process>, sm: &Arc<SysMsg>, msg: &Msg) -> Result<()> {
    if msg.segs.len() > MSGSEGS {
        return Err(Err::Inval);
    }
    sm.usegs.lock(|u| *u = msg.segs.clone());
    if sm.op.get() & M_READ == 0 {
        for us in &msg.segs {
            match make_seg(&p.vas, us.buf, us.len) {
                Ok(seg) => sm.segs.lock(|v| v.push(seg)),
                Err(_) => {
                    freesegs(sm);
                    return Err(Err::Fault);
                }
            }
        }
    }
    Ok(())
}

/// Map a message's segments into a process, recording them on the
/// receiving portref.  Returns the mapped data addresses.
fn mapsegs(p: &Arc<Process>, segs: &[Seg]) -> Result<Vec<usize>> {
    let mut addrs = Vec::with_capacity(segs.len());
    for (i, s) in segs.iter().enumerate() {
        match attach_seg(&p.vas, s) {
            Ok(va) => addrs.push(va),
            Err(e) => {
                for s in &segs[..i] {
                    detach_seg(s);
                }
                return Err(e);
            }
        }
    }
    Ok(addrs)
}

/// Block until the server completes our queued message, handling the
/// three-way race with interruption.  `Ok` means the transaction
/// completed (the server may still have declared an error in the
/// message); `Err(Intr)` means it was pulled out from under the
/// server.  Enter with the portref lock held and the message queued.
pub fn wait_send_completion(
    pr: &Arc<Portref>,
    sm: &Arc<SysMsg>,
    guard: SpinGuard<'_, ()>,
) -> Result<()> {
    if !pr.iowait.p_v_lock(Pri::Catch, guard) {
        return Ok(());
    }

    // Interrupted.  Grapple with the server for ownership of the
    // in-progress message; the port pointer may have been poisoned
    // from under us.
    let g = pr.lock.lock(Spl::Hi);
    match pr.state.get() {
        PrState::IoWait => {
            let Some(port) = pr.port() else {
                pr.state.set(PrState::IoDone);
                pr.msg.lock(|m| *m = None);
                drop(g);
                return Err(Err::Intr);
            };
            let mut q = port.queue.lock(Spl::Hi);
            let pos = q.iter().position(|m| Arc::ptr_eq(m, sm));
            match pos {
                Some(i) => {
                    // Still queued, unseen: pull it out and adjust the
                    // receiver count it was holding up.
                    q.remove(i);
                    drop(q);
                    debug_assert!(port.wait.count() > 0, "msg_send: qcnt < 1");
                    port.wait.adj_count(-1);
                    pr.state.set(PrState::IoDone);
                    pr.msg.lock(|m| *m = None);
                    drop(g);
                }
                None => {
                    // The server is working on it.  Post an abort and
                    // wait out the acknowledgement, ignoring further
                    // interrupts.
                    drop(q);
                    let ab = SysMsg::new(M_ABORT, 0, 0);
                    ab.sender.lock(|s| *s = Some(Arc::clone(pr)));
                    pr.state.set(PrState::AbWait);
                    queue_msg(&port, &ab);
                    pr.iowait.p_v_lock(Pri::Hi, g);
                    pr.msg.lock(|m| *m = None);
                }
            }
        }
        PrState::IoDone => {
            // Raced with completion; the transaction finished but we
            // still report the interruption.  The server already
            // signalled our iowait, so clear it for next time.
            pr.iowait.set_count(0);
            pr.msg.lock(|m| *m = None);
            drop(g);
        }
        s => panic!("msg_send: illegal state {s:?}"),
    }
    Err(Err::Intr)
}

/// Send a message through an open portref and wait for the reply.
pub fn msg_send(portid: usize, msg: &mut Msg) -> Result<i64> {
    let t = cur_thread();
    let p = Arc::clone(&t.proc);

    // Keep reserved opcodes to ourselves; the user-space timekeeper
    // is the one sanctioned exception.
    let op = msg.op & M_OPMASK;
    if op < M_RESVD && op != M_TIME {
        return Err(Err::Inval);
    }

    let sm = SysMsg::new(msg.op, msg.arg, msg.arg1);
    m_to_sm(&p, &sm, msg)?;

    let pr = match find_portref(&p, portid) {
        Ok(pr) => pr,
        Err(e) => {
            freesegs(&sm);
            return Err(e);
        }
    };

    let result = send_transaction(&p, &pr, &sm, msg);

    // If the reply handed segments across, the server is parked until
    // we have consumed them.
    if sm.handed.get() {
        sm.handed.set(false);
        pr.svwait.v();
    }
    pr.sema.v();
    if result.is_err() {
        freesegs(&sm);
    }
    result
}

fn send_transaction(
    p: &Arc<Process>,
    pr: &Arc<Portref>,
    sm: &Arc<SysMsg>,
    msg: &mut Msg,
) -> Result<i64> {
    let g = pr.lock.lock(Spl::Hi);
    let port = match pr.port() {
        Some(port) if !port.flags.get().contains(PortFlags::CLOSING) => port,
        _ => {
            drop(g);
            return Err(Err::Io);
        }
    };
    sm.sender.lock(|s| *s = Some(Arc::clone(pr)));
    debug_assert_eq!(pr.iowait.count(), 0, "msg_send: iowait");
    pr.state.set(PrState::IoWait);
    pr.msg.lock(|m| *m = Some(Arc::clone(sm)));
    queue_msg(&port, sm);
    wait_send_completion(pr, sm, g)?;

    if sm.arg.get() == -1 {
        let e = sm.err.lock(|e| e.clone());
        return Err(e.map(Err::server).unwrap_or(Err::Io));
    }

    // Pull any reply segments into the caller's buffers, then let
    // them go.
    let rsegs = sm.segs.lock(std::mem::take);
    if !rsegs.is_empty() {
        let addrs = match mapsegs(p, &rsegs) {
            Ok(a) => a,
            Err(e) => {
                for s in rsegs {
                    free_seg(s);
                }
                return Err(e);
            }
        };
        let copied = copyoutsegs(p, &rsegs, &addrs, &sm.usegs.lock(|u| u.clone()));
        for s in &rsegs {
            detach_seg(s);
        }
        for s in rsegs {
            free_seg(s);
        }
        copied?;
    }

    msg.arg = sm.arg.get();
    msg.arg1 = sm.arg1.get();
    Ok(sm.arg.get())
}

/// Stream the reply segments (mapped at `addrs`) into the user's
/// original buffers.
fn copyoutsegs(
    p: &Arc<Process>,
    rsegs: &[Seg],
    addrs: &[usize],
    usegs: &[UserSeg],
) -> Result<()> {
    let mut dst = usegs.iter().copied();
    let mut cur = dst.next();
    let mut cur_off = 0;
    for (s, &va) in rsegs.iter().zip(addrs) {
        let mut src_off = 0;
        while src_off < s.len {
            let Some(d) = cur else { return Ok(()) };
            if cur_off == d.len {
                cur = dst.next();
                cur_off = 0;
                continue;
            }
            let n = (s.len - src_off).min(d.len - cur_off);
            uaccess::copy_within(&p.vas, va + src_off, d.buf + cur_off, n)?;
            src_off += n;
            cur_off += n;
        }
    }
    Ok(())
}

/// Receive the next message from one of our server ports.
pub fn msg_receive(portid: usize, msg: &mut Msg) -> Result<i64> {
    let t = cur_thread();
    let p = Arc::clone(&t.proc);
    let port = find_port(&p, portid)?;
    let res = receive_body(&p, &port, msg);
    port.sema.v();
    res
}

fn receive_body(p: &Arc<Process>, port: &Arc<Port>, msg: &mut Msg) -> Result<i64> {
    let g = port.queue.lock(Spl::Hi);
    if port.wait.p_v_lock(Pri::Catch, g) {
        return Err(Err::Intr);
    }
    let mut g = port.queue.lock(Spl::Hi);
    let Some(sm) = g.pop_front() else {
        // Woken empty-handed: the port is going down.
        debug_assert!(
            port.flags.get().contains(PortFlags::CLOSING),
            "msg_receive: p_wait/p_hd disagree"
        );
        return Err(Err::Io);
    };

    let op = sm.op.get();

    // Interrupt notifications ride preallocated messages we must not
    // hold onto; decode and release while still under the lock.
    if op == M_ISR {
        let (isr, nintr) = (sm.arg.get(), sm.arg1.get());
        sm.op.set(0);
        drop(g);
        *msg = Msg {
            op: M_ISR,
            arg: isr,
            arg1: nintr,
            sender: 0,
            segs: Vec::new(),
        };
        return Ok(0);
    }

    sm.seen.set(true);
    let pr = sm
        .sender
        .lock(|s| s.clone())
        .expect("msg_receive: no sender");

    // A stale abort for a transaction that already unwound must not
    // disturb whatever the portref is doing now.
    let record = op != M_ABORT || pr.state.get() == PrState::AbWait;
    if record {
        pr.msg.lock(|m| *m = Some(Arc::clone(&sm)));
    }

    if op == M_CONNECT {
        // The new portref joins our client hash; the buffer mapped
        // below carries the connector's permissions.
        ref_port(port, &pr);
        drop(g);
        new_client(&pr);
    } else if op == M_DISCONNECT {
        deref_port(port, &pr);
        drop(g);
        pr.msg.lock(|m| *m = None);
        del_client(p, &pr);
        *msg = Msg {
            op: M_DISCONNECT,
            arg: 0,
            arg1: 0,
            sender: pr.tag,
            segs: Vec::new(),
        };
        return Ok(0);
    } else {
        drop(g);
    }

    // Map the payload into our space, clearing mappings of any
    // earlier message from this client first.
    let segs = sm.segs.lock(std::mem::take);
    let mut out = Vec::with_capacity(segs.len());
    if !segs.is_empty() {
        let old = pr.segs.lock(std::mem::take);
        for s in old {
            detach_seg(&s);
            free_seg(s);
        }
        let addrs = match mapsegs(p, &segs) {
            Ok(a) => a,
            Err(e) => {
                for s in segs {
                    free_seg(s);
                }
                // The message is off the queue; the sender must not
                // be left waiting on a transaction nobody holds.
                crate::port::fail_sender(&sm);
                return Err(e);
            }
        };
        for (s, va) in segs.iter().zip(&addrs) {
            out.push(UserSeg { buf: *va, len: s.len });
        }
        pr.segs.lock(|v| *v = segs);
    }

    *msg = Msg {
        op: sm.op.get() & !M_READ,
        arg: sm.arg.get(),
        arg1: sm.arg1.get(),
        sender: pr.tag,
        segs: out,
    };
    Ok(0)
}

/// Reply to a message received through [`msg_receive`].
pub fn msg_reply(tag: u64, msg: &Msg) -> Result<i64> {
    let t = cur_thread();
    let p = Arc::clone(&t.proc);

    let rsm = SysMsg::new(msg.op, msg.arg, msg.arg1);
    m_to_sm(&p, &rsm, msg)?;

    // `tag` cannot be trusted until it resolves through our own hash.
    let _ = p.sema.p(Pri::Hi);
    let pr = p.prefs.lock(|h| h.get(&tag).cloned());
    p.sema.v();
    let Some(pr) = pr else {
        freesegs(&rsm);
        return Err(Err::Inval);
    };

    // Our mappings of his request are done with.
    let old = pr.segs.lock(std::mem::take);
    for s in old {
        detach_seg(&s);
        free_seg(s);
    }

    let g = pr.lock.lock(Spl::Hi);
    match pr.state.get() {
        // The usual case: hand the reply over and wake him.  If we
        // pass segments, wait for him to consume them before our
        // buffers are ours again.
        PrState::IoWait => {
            let om = pr.msg.lock(|m| m.clone());
            let Some(om) = om else {
                drop(g);
                freesegs(&rsm);
                return Err(Err::Inval);
            };
            if msg.op & M_OPMASK == M_ABORT && om.op.get() != M_ABORT {
                // Acknowledging an abort the client already gave up
                // on; leave the new transaction alone.
                drop(g);
                freesegs(&rsm);
                return Err(Err::Inval);
            }
            if om.op.get() == M_DUP {
                let port = pr.port();
                pr.msg.lock(|m| *m = None);
                pr.state.set(PrState::IoDone);
                om.arg.set(msg.arg);
                let newpr = om.dup_pr.lock(std::mem::take);
                drop(g);
                pr.iowait.v();
                if msg.arg != -1 {
                    let newpr = newpr.expect("msg_reply: dup without portref");
                    if let Some(port) = port {
                        ref_port(&port, &newpr);
                    }
                    new_client(&newpr);
                }
                freesegs(&rsm);
                return Ok(0);
            }
            om.arg.set(msg.arg);
            om.arg1.set(msg.arg1);
            let rsegs = rsm.segs.lock(std::mem::take);
            let nseg = rsegs.len();
            om.segs.lock(|v| *v = rsegs);
            pr.msg.lock(|m| *m = None);
            pr.state.set(PrState::IoDone);
            if nseg > 0 {
                pr.svwait.set_count(0);
                om.handed.set(true);
                pr.iowait.v();
                pr.svwait.p_v_lock(Pri::Hi, g);
            } else {
                pr.iowait.v();
                drop(g);
            }
            Ok(0)
        }

        // He wants out.  Any reply completes the abort: either the
        // acknowledgement proper, or a normal completion that raced
        // it — he returns interrupted regardless.
        PrState::AbWait => {
            pr.state.set(PrState::AbDone);
            pr.msg.lock(|m| *m = None);
            drop(g);
            pr.iowait.v();
            freesegs(&rsm);
            Ok(0)
        }

        // Replying to a client who already finished.
        _ => {
            drop(g);
            freesegs(&rsm);
            Err(Err::Inval)
        }
    }
}

/// Declare an error back to a sender instead of a reply.
pub fn msg_err(tag: u64, errstr: &str) -> Result<i64> {
    if errstr.is_empty() || errstr.len() > 64 {
        return Err(Err::Inval);
    }
    let t = cur_thread();
    let p = Arc::clone(&t.proc);
    let _ = p.sema.p(Pri::Hi);
    let pr = p.prefs.lock(|h| h.get(&tag).cloned());
    p.sema.v();
    let Some(pr) = pr else {
        return Err(Err::Inval);
    };

    let old = pr.segs.lock(std::mem::take);
    for s in old {
        detach_seg(&s);
        free_seg(s);
    }

    let g = pr.lock.lock(Spl::Hi);
    match pr.state.get() {
        PrState::IoWait => {
            let om = pr.msg.lock(|m| m.clone());
            let Some(om) = om else {
                drop(g);
                return Err(Err::Inval);
            };
            om.arg.set(-1);
            om.arg1.set(-1);
            om.err.lock(|e| *e = Some(errstr.to_string()));
            pr.msg.lock(|m| *m = None);
            pr.state.set(PrState::IoDone);
            drop(g);
            pr.iowait.v();
            Ok(0)
        }
        PrState::AbWait => {
            pr.state.set(PrState::AbDone);
            pr.msg.lock(|m| *m = None);
            drop(g);
            pr.iowait.v();
            Ok(0)
        }
        _ => {
            drop(g);
            Err(Err::Inval)
        }
    }
}

/// Kernel-originated argument-only transaction on a portref: the file
/// identity handshake and the swap protocol ride this.  The caller
/// serializes on the portref.
pub fn kernmsg_send(pr: &Arc<Portref>, op: u32, args: &mut [i64; 2]) -> Result<()> {
    let sm = SysMsg::new(op, args[0], args[1]);
    sm.sender.lock(|s| *s = Some(Arc::clone(pr)));
    let g = pr.lock.lock(Spl::Hi);
    let port = match pr.port() {
        Some(port) if !port.flags.get().contains(PortFlags::CLOSING) => port,
        _ => {
            drop(g);
            return Err(Err::Io);
        }
    };
    pr.state.set(PrState::IoWait);
    pr.msg.lock(|m| *m = Some(Arc::clone(&sm)));
    queue_msg(&port, &sm);
    let interrupted = pr.iowait.p_v_lock(Pri::Hi, g);
    debug_assert!(!interrupted, "kernmsg_send: interrupted");
    if sm.handed.get() {
        // No kernel consumer for reply segments; drop and release.
        sm.handed.set(false);
        freesegs(&sm);
        pr.svwait.v();
    }
    if sm.arg.get() == -1 {
        return Err(Err::Io);
    }
    args[0] = sm.arg.get();
    args[1] = sm.arg1.get();
    Ok(())
}
