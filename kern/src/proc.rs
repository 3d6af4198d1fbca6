/*
 * SPDX-License-Identifier: MIT
 */

//! Processes: tables, birth, and death.

use {
    crate::{
        err::{Err, Result},
        kernel::{clear_current, cur_kernel, cur_thread, set_current, Kernel},
        mutex::{Pri, Sema, Spl},
        param::{PROCOPENS, PROCPERMS, PROCPORTS},
        perm::Perm,
        port::{close_port, dup_port, shut_client, Port, Portref},
        pset::Pset,
        sched::{self, SchedNode},
        seg::{detach_seg, free_seg},
        thread::{TFlags, TState, Thread},
        vas::{fork_vas, free_vas, Vas},
    },
    machine::sync::{CpuCell, NullLock},
    std::{
        collections::{HashMap, VecDeque},
        panic::{self, AssertUnwindSafe},
        sync::{mpsc, Arc, Weak},
    },
};

/// Reaped by `waits`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitStatus {
    pub pid: u64,
    pub status: i64,
}

/// A page held down for device I/O.
pub struct WiredPage {
    pub ps: Arc<Pset>,
    pub idx: usize,
    pub vaddr: usize,
}

pub type EventHandler = Arc<dyn Fn(&str) + Send + Sync>;

pub struct Process {
    pub pid: u64,
    pub vas: Arc<Vas>,
    /// Guards the tables and permissions.
    pub sema: Sema,
    pub ports: NullLock<[Option<Arc<Port>>; PROCPORTS]>,
    pub opens: NullLock<[Option<Arc<Portref>>; PROCOPENS]>,
    /// Clients served by our ports, by sender tag.
    pub prefs: NullLock<HashMap<u64, Arc<Portref>>>,
    pub ids: NullLock<[Perm; PROCPERMS]>,
    /// Advisory command name; not trusted in any way.
    pub cmd: NullLock<String>,
    /// Non-ephemeral threads.
    pub nthread: CpuCell<usize>,
    pub threads: NullLock<Vec<Arc<Thread>>>,
    pub parent: NullLock<Option<Weak<Process>>>,
    /// Live children not yet reaped.
    pub nchild: CpuCell<usize>,
    pub zombies: NullLock<VecDeque<ExitStatus>>,
    /// Parent sleeps here in `waits`.
    pub child_wait: Sema,
    pub pgrp: CpuCell<u64>,
    pub sid: CpuCell<u64>,
    pub handler: NullLock<Option<EventHandler>>,
    /// This process's interior node in the scheduling tree.
    pub sched: NullLock<Option<Arc<SchedNode>>>,
    pub wired: NullLock<Vec<Option<WiredPage>>>,
    /// Exit notification for the embedding, boot tasks only.
    pub exit_tx: NullLock<Option<mpsc::Sender<i64>>>,
    /// Torn down; only stray ephemeral threads remain.
    dead: CpuCell<bool>,
}

impl Process {
    fn empty(pid: u64, vas: Arc<Vas>) -> Arc<Process> {
        Arc::new(Process {
            pid,
            vas,
            sema: Sema::new(1),
            ports: NullLock::new([const { None }; PROCPORTS]),
            opens: NullLock::new([const { None }; PROCOPENS]),
            prefs: NullLock::new(HashMap::new()),
            ids: NullLock::new([Perm::disabled(); PROCPERMS]),
            cmd: NullLock::new(String::new()),
            nthread: CpuCell::new(0),
            threads: NullLock::new(Vec::new()),
            parent: NullLock::new(None),
            nchild: CpuCell::new(0),
            zombies: NullLock::new(VecDeque::new()),
            child_wait: Sema::new(0),
            pgrp: CpuCell::new(pid),
            sid: CpuCell::new(pid),
            handler: NullLock::new(None),
            sched: NullLock::new(None),
            wired: NullLock::new(Vec::new()),
            exit_tx: NullLock::new(None),
            dead: CpuCell::new(false),
        })
    }

    /// A minimal process for data-structure unit tests.
    pub fn stub(pid: u64) -> Process {
        match Arc::try_unwrap(Self::empty(pid, Vas::new())) {
            Ok(p) => p,
            Err(_) => unreachable!(),
        }
    }
}

pub struct ProcTable {
    pub map: HashMap<u64, Arc<Process>>,
    next_pid: u64,
}

impl ProcTable {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            next_pid: 1,
        }
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

/// What a boot task looks like before it becomes a process.
pub struct TaskSpec {
    pub name: String,
    pub root: bool,
    pub body: Box<dyn FnOnce() -> i64 + Send>,
    pub exit_tx: mpsc::Sender<i64>,
}

/// Panic payload: orderly thread exit with a status.
pub struct ThreadExit(pub i64);

/// Panic payload: replace the process image.
pub struct ExecImage(pub Box<dyn FnOnce() -> i64 + Send>);

static HOOK: once_cell::sync::OnceCell<()> = once_cell::sync::OnceCell::new();

/// Silence the panic machinery for our control-flow payloads; real
/// panics still print.
pub fn install_panic_hook() {
    HOOK.get_or_init(|| {
        let prev = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().is::<ThreadExit>() || info.payload().is::<ExecImage>() {
                return;
            }
            prev(info);
        }));
    });
}

fn new_pid() -> u64 {
    let k = cur_kernel();
    let mut g = k.procs.lock(Spl::Lo);
    let pid = g.next_pid;
    g.next_pid += 1;
    pid
}

fn register(p: &Arc<Process>) {
    let k = cur_kernel();
    k.procs.lock(Spl::Lo).map.insert(p.pid, Arc::clone(p));
}

/// Create the scheduling group node for a process and a leaf for its
/// first thread, then put the thread on its feet.
fn start_thread(p: &Arc<Process>, body: Box<dyn FnOnce() -> i64 + Send>, ephemeral: bool) -> Arc<Thread> {
    let k = cur_kernel();
    let ctx = k.processor.new_ctx();
    let t = Thread::new(k.next_tid(), ctx, Arc::clone(p));
    if ephemeral {
        t.flags.update(|f| f | TFlags::EPHEM);
    }
    {
        let mut rq = k.runq.lock(Spl::Hi);
        let group = p.sched.lock(|s| s.clone());
        let group = match group {
            Some(g) => g,
            None => {
                let root = Arc::clone(&rq.root);
                let g = sched::sched_node(&mut rq, &root);
                p.sched.lock(|s| *s = Some(Arc::clone(&g)));
                g
            }
        };
        let leaf = sched::sched_thread(&mut rq, &group, &t);
        t.runq.lock(|r| *r = Some(leaf));
    }
    p.threads.lock(|v| v.push(Arc::clone(&t)));
    if !ephemeral {
        p.nthread.update(|n| n + 1);
    }
    spawn_host(Arc::clone(&k), Arc::clone(&t), body);
    sched::setrun(&t);
    t
}

/// Back a kernel thread with a host thread.  The body runs once the
/// scheduler first dispatches the context; exec replaces it in place.
fn spawn_host(k: Arc<Kernel>, t: Arc<Thread>, body: Box<dyn FnOnce() -> i64 + Send>) {
    let name = format!("task-{}", t.tid);
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            set_current(Arc::clone(&k), Some(Arc::clone(&t)));
            k.processor.run_first(t.ctx);
            let mut body = Some(body);
            let status = loop {
                let b = body.take().unwrap();
                match panic::catch_unwind(AssertUnwindSafe(b)) {
                    Ok(status) => break status,
                    Err(payload) => {
                        if let Some(x) = payload.downcast_ref::<ThreadExit>() {
                            break x.0;
                        }
                        match payload.downcast::<ExecImage>() {
                            Ok(img) => {
                                exec_reset();
                                body = Some(img.0);
                            }
                            Err(other) => {
                                let what = other
                                    .downcast_ref::<&str>()
                                    .map(|s| s.to_string())
                                    .or_else(|| other.downcast_ref::<String>().cloned())
                                    .unwrap_or_else(|| "???".into());
                                eprintln!("kernel thread {} died: {what}", t.tid);
                                break -1;
                            }
                        }
                    }
                }
            };
            exit_thread(status);
            clear_current();
        })
        .expect("spawn kernel thread");
}

/// Build and start a boot task.  Runs on the idle context.
pub fn launch_task(spec: TaskSpec) {
    let pid = new_pid();
    let p = Process::empty(pid, Vas::new());
    p.cmd.lock(|c| *c = spec.name.clone());
    p.ids.lock(|ids| {
        ids[0] = if spec.root {
            Perm::root()
        } else {
            Perm::new(&[2, pid as u16], pid as u32)
        };
    });
    p.exit_tx.lock(|tx| *tx = Some(spec.exit_tx));
    register(&p);
    start_thread(&p, spec.body, false);
}

/// Fork: duplicate the address space (sharing read-only and shared
/// views, shadowing writable ones) and every open connection; the
/// child runs `child` as its first thread.
pub fn fork(child: impl FnOnce() -> i64 + Send + 'static) -> Result<u64> {
    let t = cur_thread();
    let p = Arc::clone(&t.proc);

    let child_vas = Vas::new();
    fork_vas(&p.vas, &child_vas);

    let pid = new_pid();
    let cp = Process::empty(pid, child_vas);
    cp.cmd.lock(|c| *c = p.cmd.lock(|pc| pc.clone()));
    cp.ids.lock(|ids| *ids = p.ids.lock(|pi| *pi));
    cp.pgrp.set(p.pgrp.get());
    cp.sid.set(p.sid.get());
    cp.parent.lock(|pa| *pa = Some(Arc::downgrade(&p)));
    cp.handler.lock(|h| *h = p.handler.lock(|ph| ph.clone()));

    // Each open connection is re-negotiated with its server.
    for i in 0..PROCOPENS {
        let pr = p.opens.lock(|tbl| tbl[i].clone());
        let Some(pr) = pr else { continue };
        let _ = pr.sema.p(Pri::Hi);
        let dup = dup_port(&pr);
        pr.sema.v();
        if let Ok(npr) = dup {
            cp.opens.lock(|tbl| tbl[i] = Some(npr));
        }
    }

    p.nchild.update(|n| n + 1);
    register(&cp);
    start_thread(&cp, Box::new(child), false);
    Ok(pid)
}

/// Add a thread to the calling process.
pub fn fork_thread(body: impl FnOnce() -> i64 + Send + 'static) -> Result<u64> {
    let t = cur_thread();
    let p = Arc::clone(&t.proc);
    let nt = start_thread(&p, Box::new(body), false);
    Ok(nt.tid)
}

/// Leave the current thread, with the process torn down when its last
/// thread goes.
pub fn exit(status: i64) -> ! {
    panic::panic_any(ThreadExit(status));
}

/// Replace the process image: the address space is dumped, open
/// connections and permissions stay, and `body` becomes the program.
pub fn exec(body: impl FnOnce() -> i64 + Send + 'static) -> ! {
    panic::panic_any(ExecImage(Box::new(body)));
}

/// The vas half of exec, run before the new image starts.
fn exec_reset() {
    let t = cur_thread();
    free_vas(&t.proc.vas);
}

/// Wait for a child to exit.
pub fn waits() -> Result<ExitStatus> {
    let t = cur_thread();
    let p = Arc::clone(&t.proc);
    if p.zombies.lock(|z| z.is_empty()) && p.nchild.get() == 0 {
        return Err(Err::NoEnt);
    }
    if p.child_wait.p(Pri::Catch) {
        return Err(Err::Intr);
    }
    let st = p
        .zombies
        .lock(|z| z.pop_front())
        .expect("waits: wait/zombie disagree");
    Ok(st)
}

/// Final thread accounting.  The process dies with its last
/// non-ephemeral thread; ephemeral stragglers are condemned and only
/// tidy up after themselves.
pub(crate) fn exit_thread(status: i64) {
    let k = cur_kernel();
    let t = cur_thread();
    let p = Arc::clone(&t.proc);

    let ephem = t.flags.get().contains(TFlags::EPHEM);
    let _ = p.sema.p(Pri::Hi);
    p.threads.lock(|v| v.retain(|x| !Arc::ptr_eq(x, &t)));
    if !ephem {
        p.nthread.update(|n| n.saturating_sub(1));
    }
    let dying = !ephem && p.nthread.get() == 0 && !p.dead.get();
    p.sema.v();

    if dying {
        p.dead.set(true);
        // Ephemeral survivors do not get to linger.
        let survivors = p.threads.lock(|v| v.clone());
        if !survivors.is_empty() {
            p.handler.lock(|h| *h = None);
            for s in survivors {
                s.events.lock(|q| q.push_back("kill".to_string()));
                if s.state.get() == TState::Sleep
                    && !s.nointr.get()
                    && crate::mutex::Sema::cunsleep(&s)
                {
                    sched::setrun(&s);
                }
            }
        }
        proc_teardown(&p, status);
    }

    // Retire our scheduling leaf, and the group node with the last
    // thread out.
    let empty = p.threads.lock(|v| v.is_empty());
    if let Some(leaf) = t.runq.lock(std::mem::take) {
        let mut rq = k.runq.lock(Spl::Hi);
        sched::free_sched_node(&mut rq, &leaf);
        if empty {
            if let Some(group) = p.sched.lock(std::mem::take) {
                sched::free_sched_node(&mut rq, &group);
            }
        }
    }

    t.state.set(TState::Dead);
    k.num_run.update(|n| n - 1);
    sched::exit_switch();
    // The baton is gone; nothing kernel-side may happen past here.
}

/// Release everything a process owns.
fn proc_teardown(p: &Arc<Process>, status: i64) {
    let k = cur_kernel();

    // Server ports go first so clients learn promptly.
    for i in 0..PROCPORTS {
        if let Some(port) = p.ports.lock(|tbl| tbl[i].take()) {
            close_port(&port);
        }
    }
    for i in 0..PROCOPENS {
        if let Some(pr) = p.opens.lock(|tbl| tbl[i].take()) {
            shut_client(&pr);
        }
    }
    // Anything still hashed from clients of our dead ports.
    let stale = p.prefs.lock(std::mem::take);
    for (_, pr) in stale {
        let segs = pr.segs.lock(std::mem::take);
        for s in segs {
            detach_seg(&s);
            free_seg(s);
        }
    }
    // Wired pages pin their slots; let go.
    let wired = p.wired.lock(std::mem::take);
    for w in wired.into_iter().flatten() {
        let g = w.ps.lock.lock(Spl::Lo);
        w.ps.lock_slot(g, w.idx);
        w.ps.deref_slot(w.idx);
        w.ps.unlock_slot(w.idx);
    }

    free_vas(&p.vas);

    k.procs.lock(Spl::Lo).map.remove(&p.pid);
    let parent = p.parent.lock(|pa| pa.as_ref().and_then(Weak::upgrade));
    if let Some(parent) = parent {
        parent.nchild.update(|n| n.saturating_sub(1));
        parent.zombies.lock(|z| {
            z.push_back(ExitStatus {
                pid: p.pid,
                status,
            })
        });
        parent.child_wait.v();
    }
    if let Some(tx) = p.exit_tx.lock(std::mem::take) {
        let _ = tx.send(status);
    }
}

/// PID, TID, or parent PID of the caller.
pub fn getid(which: u32) -> Result<i64> {
    let t = cur_thread();
    match which {
        0 => Ok(t.proc.pid as i64),
        1 => Ok(t.tid as i64),
        2 => {
            let ppid = t
                .proc
                .parent
                .lock(|p| p.as_ref().and_then(Weak::upgrade))
                .map(|p| p.pid)
                .unwrap_or(1);
            Ok(ppid as i64)
        }
        _ => Err(Err::Inval),
    }
}

/// Set the advisory command name.
pub fn set_cmd(cmd: &str) -> Result<i64> {
    let t = cur_thread();
    let mut name = cmd.to_string();
    name.truncate(32);
    t.proc.cmd.lock(|c| *c = name);
    Ok(0)
}

/// Become a session (and process-group) leader.
pub fn setsid() -> Result<i64> {
    let t = cur_thread();
    let p = &t.proc;
    p.sid.set(p.pid);
    p.pgrp.set(p.pid);
    Ok(p.pid as i64)
}

/// User-mutex assist: 0 parks the calling thread; a thread id wakes
/// that thread of this process.
pub fn mutex_thread(arg: u64) -> Result<i64> {
    let t = cur_thread();
    if arg == 0 {
        if t.park.p(Pri::Catch) {
            return Err(Err::Intr);
        }
        return Ok(0);
    }
    let target = t
        .proc
        .threads
        .lock(|v| v.iter().find(|x| x.tid == arg).cloned())
        .ok_or(Err::NoEnt)?;
    target.park.v();
    Ok(0)
}
