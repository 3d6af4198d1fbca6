/*
 * SPDX-License-Identifier: MIT
 */

//! Ports and port references.
//!
//! A port is a server endpoint: a FIFO of system messages, a counting
//! semaphore tracking them, and a serialization semaphore for
//! receivers.  A portref is one client's handle on a port and the
//! object send and reply synchronize on.

use {
    crate::{
        err::{Err, Result},
        kernel::{cur_kernel, cur_thread},
        mmap::mmap_cleanup,
        msg::{freesegs, queue_msg, wait_send_completion, SysMsg},
        mutex::{Pri, Sema, Spinlock, Spl},
        param::*,
        perm::encode_perms,
        proc::Process,
        pset::Pset,
        seg::{detach_seg, free_seg, kern_mem_bytes, Seg},
    },
    bitflags::bitflags,
    machine::sync::{CpuCell, NullLock},
    std::{
        collections::{HashMap, VecDeque},
        sync::{Arc, Weak},
    },
};

bitflags! {
    pub struct PortFlags: u32 {
        /// Server is tearing the port down.
        const CLOSING = 0x01;
        /// An interrupt vector reports through this port.
        const ISR = 0x02;
    }
}

/// Client-side transaction state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrState {
    Idle,
    /// Message queued or being served.
    IoWait,
    /// Server replied; client to consume.
    IoDone,
    /// Abort requested; awaiting the server's acknowledgement.
    AbWait,
    /// Abort acknowledged.
    AbDone,
    /// Client going away.
    Closing,
}

/// The mapped-file cache attached to a port.
pub enum MapCache {
    /// No mapping done through this port yet.
    Unused,
    Map(HashMap<u64, Arc<Pset>>),
    /// Port shutting down; no new cache may form.
    Closed,
}

pub struct Port {
    pub name: u64,
    pub queue: Spinlock<VecDeque<Arc<SysMsg>>>,
    /// Counts queued messages; receivers sleep here.
    pub wait: Sema,
    /// Serializes receivers.
    pub sema: Sema,
    /// Serializes the mapped-file cache.
    pub mapsema: Sema,
    pub flags: CpuCell<PortFlags>,
    pub maps: NullLock<MapCache>,
    /// Portrefs attached; count plus non-owning links for shutdown.
    pub refs: CpuCell<usize>,
    clients: NullLock<Vec<Weak<Portref>>>,
}

pub struct Portref {
    /// Identity handed to servers; reply routes by this.
    pub tag: u64,
    pub port: NullLock<Option<Arc<Port>>>,
    pub state: CpuCell<PrState>,
    pub lock: Spinlock<()>,
    /// Client sleeps here for its reply.
    pub iowait: Sema,
    /// Server sleeps here until handed-over segments are consumed.
    pub svwait: Sema,
    /// Serializes client operations on this handle.
    pub sema: Sema,
    /// Outstanding message, if any.
    pub msg: NullLock<Option<Arc<SysMsg>>>,
    /// Server-side mappings from the last receive.
    pub segs: NullLock<Vec<Seg>>,
}

impl Portref {
    pub fn new(port: Option<Arc<Port>>) -> Arc<Portref> {
        let k = cur_kernel();
        Arc::new(Portref {
            tag: k.next_tid(),
            port: NullLock::new(port),
            state: CpuCell::new(PrState::Idle),
            lock: Spinlock::new(()),
            iowait: Sema::new(0),
            svwait: Sema::new(0),
            sema: Sema::new(1),
            msg: NullLock::new(None),
            segs: NullLock::new(Vec::new()),
        })
    }

    pub fn port(&self) -> Option<Arc<Port>> {
        self.port.lock(|p| p.clone())
    }
}

/// Global port name registry.
pub struct PortNames {
    map: HashMap<u64, Arc<Port>>,
    next_anon: u64,
}

impl PortNames {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            next_anon: 1 << 32,
        }
    }
}

impl Default for PortNames {
    fn default() -> Self {
        Self::new()
    }
}

/// Count a portref onto its port and remember it for shutdown.
pub fn ref_port(port: &Port, pr: &Arc<Portref>) {
    port.refs.update(|r| r + 1);
    port.clients.lock(|c| c.push(Arc::downgrade(pr)));
}

pub fn deref_port(port: &Port, pr: &Arc<Portref>) {
    debug_assert!(port.refs.get() > 0, "deref_port: 0 ref");
    port.refs.update(|r| r - 1);
    port.clients.lock(|c| {
        c.retain(|w| w.upgrade().map(|p| !Arc::ptr_eq(&p, pr)).unwrap_or(false))
    });
}

/// Create a port.  `name` of zero asks for a dynamic name.  Returns
/// the user-visible port id.
pub fn msg_port(name: u64, out_name: Option<&mut u64>) -> Result<i64> {
    let t = cur_thread();
    let p = Arc::clone(&t.proc);
    let k = cur_kernel();

    let mut names = k.names.lock(Spl::Lo);
    let name = if name == 0 {
        names.next_anon += 1;
        names.next_anon
    } else {
        if names.map.contains_key(&name) {
            return Err(Err::Exists);
        }
        name
    };
    let port = Arc::new(Port {
        name,
        queue: Spinlock::new(VecDeque::new()),
        wait: Sema::new(0),
        sema: Sema::new(1),
        mapsema: Sema::new(1),
        flags: CpuCell::new(PortFlags::empty()),
        maps: NullLock::new(MapCache::Unused),
        refs: CpuCell::new(0),
        clients: NullLock::new(Vec::new()),
    });
    names.map.insert(name, Arc::clone(&port));
    drop(names);

    if p.sema.p(Pri::Catch) {
        k.names.lock(Spl::Lo).map.remove(&name);
        return Err(Err::Intr);
    }
    let slot = p.ports.lock(|tbl| {
        tbl.iter().position(|s| s.is_none()).map(|i| {
            tbl[i] = Some(Arc::clone(&port));
            i
        })
    });
    p.sema.v();
    match slot {
        Some(i) => {
            if let Some(out) = out_name {
                *out = name;
            }
            Ok((PROCOPENS + i) as i64)
        }
        None => {
            k.names.lock(Spl::Lo).map.remove(&name);
            Err(Err::NoMem)
        }
    }
}

/// The registered name behind one of our server ports.
pub fn msg_portname(portid: usize) -> Result<i64> {
    let t = cur_thread();
    let port = find_port_ref(&t.proc, portid)?;
    Ok(port.name as i64)
}

/// Look up a server port id in a process without serializing on it.
pub(crate) fn find_port_ref(p: &Arc<Process>, portid: usize) -> Result<Arc<Port>> {
    if !(PROCOPENS..PROCOPENS + PROCPORTS).contains(&portid) {
        return Err(Err::BadF);
    }
    p.ports
        .lock(|tbl| tbl[portid - PROCOPENS].clone())
        .ok_or(Err::BadF)
}

/// Look up a server port and become the serialized receiver on it.
pub fn find_port(p: &Arc<Process>, portid: usize) -> Result<Arc<Port>> {
    let port = find_port_ref(p, portid)?;
    if port.sema.p(Pri::Catch) {
        return Err(Err::Intr);
    }
    Ok(port)
}

/// Look up a client portref and serialize on it.  The caller releases
/// `pr.sema` when its transaction is done.
pub fn find_portref(p: &Arc<Process>, portid: usize) -> Result<Arc<Portref>> {
    if portid >= PROCOPENS {
        return Err(Err::BadF);
    }
    let pr = p
        .opens
        .lock(|tbl| tbl[portid].clone())
        .ok_or(Err::BadF)?;
    if pr.sema.p(Pri::Catch) {
        return Err(Err::Intr);
    }
    Ok(pr)
}

/// Open a connection to a named port.  The server sees a connect
/// message carrying our permission labels and accepts or rejects.
pub fn msg_connect(name: u64) -> Result<i64> {
    let t = cur_thread();
    let p = Arc::clone(&t.proc);
    let k = cur_kernel();
    let port = k
        .names
        .lock(Spl::Lo)
        .map
        .get(&name)
        .cloned()
        .ok_or(Err::NoEnt)?;
    if port.flags.get().contains(PortFlags::CLOSING) {
        return Err(Err::Io);
    }

    let pr = Portref::new(Some(Arc::clone(&port)));
    let perms = p.ids.lock(|ids| encode_perms(&ids[..]));
    let seg = kern_mem_bytes(&perms)?;
    let sm = SysMsg::new(M_CONNECT, 0, perms.len() as i64);
    sm.sender.lock(|s| *s = Some(Arc::clone(&pr)));
    sm.segs.lock(|v| v.push(seg));

    let g = pr.lock.lock(Spl::Hi);
    pr.state.set(PrState::IoWait);
    pr.msg.lock(|m| *m = Some(Arc::clone(&sm)));
    queue_msg(&port, &sm);
    let res = wait_send_completion(&pr, &sm, g);
    freesegs(&sm);
    if sm.handed.get() {
        // A server replying to a connect with segments is odd, but it
        // must not stay parked on our consumption.
        sm.handed.set(false);
        pr.svwait.v();
    }

    match res {
        Ok(()) if sm.arg.get() != -1 => {
            let _ = p.sema.p(Pri::Hi);
            let slot = p.opens.lock(|tbl| {
                tbl.iter().position(|s| s.is_none()).map(|i| {
                    tbl[i] = Some(Arc::clone(&pr));
                    i
                })
            });
            p.sema.v();
            match slot {
                Some(i) => Ok(i as i64),
                None => {
                    shut_client(&pr);
                    Err(Err::NoMem)
                }
            }
        }
        Ok(()) => {
            // Server bounced us; make sure it forgets the handle and
            // surface the error it declared.
            let e = sm.err.lock(|e| e.clone());
            shut_client(&pr);
            Err(e.map(Err::server).unwrap_or(Err::Io))
        }
        Err(e) => {
            if sm.seen.get() {
                // The server met us; it has to be told we left.
                shut_client(&pr);
            } else {
                // Withdrawn unseen: nobody to say goodbye to.
                pr.state.set(PrState::Closing);
            }
            Err(e)
        }
    }
}

/// Accept a pending connect from `tag`.
pub fn msg_accept(tag: u64) -> Result<i64> {
    let t = cur_thread();
    let p = Arc::clone(&t.proc);
    let _ = p.sema.p(Pri::Hi);
    let pr = p.prefs.lock(|h| h.get(&tag).cloned());
    p.sema.v();
    let pr = pr.ok_or(Err::Inval)?;

    let g = pr.lock.lock(Spl::Hi);
    let is_connect = pr
        .msg
        .lock(|m| m.as_ref().map(|sm| sm.op.get() == M_CONNECT))
        .unwrap_or(false);
    if pr.state.get() != PrState::IoWait || !is_connect {
        return Err(Err::Inval);
    }
    let sm = pr.msg.lock(|m| m.take()).unwrap();
    sm.arg.set(0);
    pr.state.set(PrState::IoDone);
    drop(g);
    pr.iowait.v();
    Ok(0)
}

/// Client-side disconnect: mark the handle closing and let the server
/// learn about it through its queue.
pub fn shut_client(pr: &Arc<Portref>) {
    let _ = pr.sema.p(Pri::Hi);
    let g = pr.lock.lock(Spl::Hi);
    pr.state.set(PrState::Closing);
    let port = pr.port();
    drop(g);
    match port {
        Some(port) if !port.flags.get().contains(PortFlags::CLOSING) => {
            let sm = SysMsg::new(M_DISCONNECT, 0, 0);
            sm.sender.lock(|s| *s = Some(Arc::clone(pr)));
            queue_msg(&port, &sm);
        }
        _ => {}
    }
    pr.sema.v();
}

/// Disconnect syscall: a client id drops the connection, a server id
/// closes the port.
pub fn msg_disconnect(portid: usize) -> Result<i64> {
    let t = cur_thread();
    let p = Arc::clone(&t.proc);
    if portid < PROCOPENS {
        if p.sema.p(Pri::Catch) {
            return Err(Err::Intr);
        }
        let pr = p.opens.lock(|tbl| tbl[portid].take());
        p.sema.v();
        let pr = pr.ok_or(Err::BadF)?;
        shut_client(&pr);
        Ok(0)
    } else {
        let port = find_port_ref(&p, portid)?;
        if p.sema.p(Pri::Catch) {
            return Err(Err::Intr);
        }
        p.ports.lock(|tbl| tbl[portid - PROCOPENS] = None);
        p.sema.v();
        close_port(&port);
        Ok(0)
    }
}

/// Server-side port shutdown: unregister the name, poison the mmap
/// cache, detach interrupt vectors, error out everything queued, and
/// put every client still mid-transaction into the I/O-error state.
pub fn close_port(port: &Arc<Port>) {
    let k = cur_kernel();
    port.flags.update(|f| f | PortFlags::CLOSING);
    k.names.lock(Spl::Lo).map.remove(&port.name);
    k.isr.disable_isr(port);
    mmap_cleanup(port);

    loop {
        let sm = port.queue.lock(Spl::Hi).pop_front();
        let Some(sm) = sm else { break };
        port.wait.adj_count(-1);
        fail_sender(&sm);
    }
    // Clients whose message the server had already dequeued.
    let clients = port
        .clients
        .lock(|c| c.iter().filter_map(Weak::upgrade).collect::<Vec<_>>());
    for pr in clients {
        let g = pr.lock.lock(Spl::Hi);
        if matches!(pr.state.get(), PrState::IoWait | PrState::AbWait) {
            if let Some(sm) = pr.msg.lock(|m| m.clone()) {
                drop(g);
                fail_sender(&sm);
                continue;
            }
        }
        drop(g);
    }
    // Wake any receiver still blocked; it finds the queue empty and
    // the port closing.
    port.wait.vall();
}

/// Complete a doomed message back to its sender with an I/O error.
pub(crate) fn fail_sender(sm: &Arc<SysMsg>) {
    let Some(pr) = sm.sender.lock(|s| s.clone()) else {
        // Preallocated ISR message; nobody waits on it.
        sm.op.set(0);
        return;
    };
    let g = pr.lock.lock(Spl::Hi);
    match pr.state.get() {
        PrState::IoWait => {
            sm.arg.set(-1);
            sm.err.lock(|e| *e = Some(Err::Io.to_string()));
            pr.msg.lock(|m| *m = None);
            pr.state.set(PrState::IoDone);
            drop(g);
            pr.iowait.v();
        }
        PrState::AbWait => {
            pr.state.set(PrState::AbDone);
            drop(g);
            pr.iowait.v();
        }
        _ => drop(g),
    }
}

/// Duplicate an open connection.  The server hears about the new
/// handle through an `M_DUP` transaction and may refuse it.  Caller
/// holds `pr.sema`.
pub fn dup_port(pr: &Arc<Portref>) -> Result<Arc<Portref>> {
    let port = pr.port().ok_or(Err::Io)?;
    if port.flags.get().contains(PortFlags::CLOSING) {
        return Err(Err::Io);
    }
    let newpr = Portref::new(Some(Arc::clone(&port)));
    let sm = SysMsg::new(M_DUP, newpr.tag as i64, 0);
    sm.sender.lock(|s| *s = Some(Arc::clone(pr)));
    sm.dup_pr.lock(|d| *d = Some(Arc::clone(&newpr)));
    let g = pr.lock.lock(Spl::Hi);
    pr.state.set(PrState::IoWait);
    pr.msg.lock(|m| *m = Some(Arc::clone(&sm)));
    queue_msg(&port, &sm);
    let interrupted = pr.iowait.p_v_lock(Pri::Hi, g);
    debug_assert!(!interrupted, "dup_port: uninterruptible");
    if sm.handed.get() {
        sm.handed.set(false);
        freesegs(&sm);
        pr.svwait.v();
    }
    if sm.arg.get() == -1 {
        Err(Err::Io)
    } else {
        Ok(newpr)
    }
}

/// The `clone` syscall: duplicate one of our open portrefs into a new
/// table slot.
pub fn clone_portref(portid: usize) -> Result<i64> {
    let t = cur_thread();
    let p = Arc::clone(&t.proc);
    let pr = find_portref(&p, portid)?;
    let res = dup_port(&pr);
    pr.sema.v();
    let newpr = res?;
    if p.sema.p(Pri::Catch) {
        shut_client(&newpr);
        return Err(Err::Intr);
    }
    let slot = p.opens.lock(|tbl| {
        tbl.iter().position(|s| s.is_none()).map(|i| {
            tbl[i] = Some(Arc::clone(&newpr));
            i
        })
    });
    p.sema.v();
    match slot {
        Some(i) => Ok(i as i64),
        None => {
            shut_client(&newpr);
            Err(Err::NoMem)
        }
    }
}

/// Record a new client under the serving process.
pub fn new_client(pr: &Arc<Portref>) {
    let p = Arc::clone(&cur_thread().proc);
    let _ = p.sema.p(Pri::Hi);
    p.prefs.lock(|h| {
        debug_assert!(!h.contains_key(&pr.tag), "new_client: already hashed");
        h.insert(pr.tag, Arc::clone(pr));
    });
    p.sema.v();
}

/// Forget a client: unhash, drop its leftover mappings.
pub fn del_client(p: &Arc<Process>, pr: &Arc<Portref>) {
    let _ = p.sema.p(Pri::Hi);
    p.prefs.lock(|h| {
        debug_assert!(h.contains_key(&pr.tag), "del_client: can't find");
        h.remove(&pr.tag);
    });
    p.sema.v();
    let segs = pr.segs.lock(std::mem::take);
    for s in segs {
        detach_seg(&s);
        free_seg(s);
    }
}
