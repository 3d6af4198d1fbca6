/*
 * SPDX-License-Identifier: MIT
 */

//! Scheduling.
//!
//! Who runs next is decided by a tree: sibling nodes compete for their
//! parent's share of the CPU in proportion to their weights, and a
//! winning internal node recursively holds the same lottery among its
//! children.  Around the tree sit three FIFO pools consulted in fixed
//! order: real-time ahead of everything, "cheated" threads that used
//! little of their last quantum ahead of the tree, and background
//! behind it all.

use {
    crate::{
        err::{Err, Result},
        kernel::{cur_kernel, cur_thread, try_cur_kernel, try_cur_thread},
        mutex::{Pri, SpinGuard, Spl},
        param::*,
        perm,
        thread::{TFlags, TState, Thread},
    },
    machine::{
        cpu::IDLE_CTX,
        sync::{CpuCell, NullLock},
    },
    rand::{rngs::SmallRng, Rng, SeedableRng},
    std::{
        collections::VecDeque,
        sync::{Arc, Weak},
    },
};

/// A node in the scheduling tree.  Internal nodes stay linked under
/// their parent for their whole life; leaves are linked only while
/// runnable.  All fields are guarded by the runq lock.
pub struct SchedNode {
    parent: NullLock<Option<Arc<SchedNode>>>,
    children: NullLock<Vec<Arc<SchedNode>>>,
    nrun: CpuCell<usize>,
    prio: CpuCell<u32>,
    refs: CpuCell<usize>,
    leaf: bool,
    thread: NullLock<Option<Weak<Thread>>>,
}

impl SchedNode {
    fn internal() -> Arc<SchedNode> {
        Arc::new(SchedNode {
            parent: NullLock::new(None),
            children: NullLock::new(Vec::new()),
            nrun: CpuCell::new(0),
            prio: CpuCell::new(PRIO_DEFAULT),
            refs: CpuCell::new(1),
            leaf: false,
            thread: NullLock::new(None),
        })
    }

    pub fn nrun(&self) -> usize {
        self.nrun.get()
    }

    pub fn set_prio(&self, prio: u32) {
        self.prio.set(prio);
    }

    fn thread(&self) -> Arc<Thread> {
        self.thread
            .lock(|t| t.as_ref().and_then(Weak::upgrade))
            .expect("sched: leaf without thread")
    }
}

/// The four runnable pools plus the lottery's dice.
pub struct RunQueues {
    rt: VecDeque<Arc<SchedNode>>,
    cheated: VecDeque<Arc<SchedNode>>,
    bg: VecDeque<Arc<SchedNode>>,
    pub root: Arc<SchedNode>,
    rng: SmallRng,
}

impl RunQueues {
    pub fn new(seed: u64) -> Self {
        Self {
            rt: VecDeque::new(),
            cheated: VecDeque::new(),
            bg: VecDeque::new(),
            root: SchedNode::internal(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

/// Add a new internal node under `parent`.
pub fn sched_node(rq: &mut RunQueues, parent: &Arc<SchedNode>) -> Arc<SchedNode> {
    let _ = rq; // mutation is covered by the held runq lock
    let s = SchedNode::internal();
    s.parent.lock(|p| *p = Some(Arc::clone(parent)));
    parent.children.lock(|c| c.push(Arc::clone(&s)));
    parent.refs.update(|r| r + 1);
    s
}

/// Create the scheduling leaf for a thread.  Not queued until the
/// thread is set runnable.
pub fn sched_thread(rq: &mut RunQueues, parent: &Arc<SchedNode>, t: &Arc<Thread>) -> Arc<SchedNode> {
    let _ = rq;
    let s = Arc::new(SchedNode {
        parent: NullLock::new(Some(Arc::clone(parent))),
        children: NullLock::new(Vec::new()),
        nrun: CpuCell::new(0),
        prio: CpuCell::new(PRIO_DEFAULT),
        refs: CpuCell::new(0),
        leaf: true,
        thread: NullLock::new(Some(Arc::downgrade(t))),
    });
    parent.refs.update(|r| r + 1);
    s
}

/// Drop a node, updating the parent's reference count and, for
/// internal nodes, unlinking from the parent's ring.
pub fn free_sched_node(rq: &mut RunQueues, s: &Arc<SchedNode>) {
    let _ = rq;
    let parent = s.parent.lock(|p| p.clone());
    if let Some(up) = parent {
        up.refs.update(|r| r - 1);
        if !s.leaf {
            up.children
                .lock(|c| c.retain(|n| !Arc::ptr_eq(n, s)));
        }
    }
}

fn queue_leaf(s: &Arc<SchedNode>) {
    let up = s.parent.lock(|p| p.clone()).expect("sched: orphan leaf");
    up.children.lock(|c| {
        debug_assert!(!c.iter().any(|n| Arc::ptr_eq(n, s)), "sched: double queue");
        c.push(Arc::clone(s))
    });
    // Flag another runnable descendant up the spine.
    s.nrun.update(|n| n + 1);
    let mut node = Some(up);
    while let Some(n) = node {
        n.nrun.update(|v| v + 1);
        node = n.parent.lock(|p| p.clone());
    }
}

fn dequeue_leaf(s: &Arc<SchedNode>) {
    let up = s.parent.lock(|p| p.clone()).expect("sched: orphan leaf");
    up.children.lock(|c| {
        let pos = c
            .iter()
            .position(|n| Arc::ptr_eq(n, s))
            .expect("sched: leaf not queued");
        c.remove(pos);
    });
    s.nrun.update(|n| n - 1);
    let mut node = Some(up);
    while let Some(n) = node {
        n.nrun.update(|v| v - 1);
        node = n.parent.lock(|p| p.clone());
    }
}

/// Walk the tree, holding a weighted lottery among runnable children
/// at each level, and pull the winning leaf off its ring.
///
/// Runq lock held by the caller.
fn pick_run(rq: &mut RunQueues) -> Arc<SchedNode> {
    let mut s = Arc::clone(&rq.root);
    let winner = loop {
        let runnable: Vec<Arc<SchedNode>> = s.children.lock(|c| {
            c.iter()
                .filter(|n| n.nrun.get() > 0)
                .cloned()
                .collect()
        });
        debug_assert!(!runnable.is_empty(), "pick_run: no runnable child");
        let mut pick = Arc::clone(runnable.last().unwrap());
        if runnable.len() > 1 {
            let total: u32 = runnable.iter().map(|n| n.prio.get()).sum();
            let mut roll = rq.rng.gen_range(0..total);
            for n in &runnable {
                pick = Arc::clone(n);
                if n.prio.get() >= roll {
                    break;
                }
                roll -= n.prio.get();
            }
        }
        if pick.leaf {
            break pick;
        }
        s = pick;
    };
    dequeue_leaf(&winner);
    winner
}

fn pick_next(rq: &mut RunQueues) -> Option<(Arc<SchedNode>, u32)> {
    if let Some(s) = rq.rt.pop_front() {
        debug_assert!(s.leaf, "pick: rt not leaf");
        return Some((s, PRI_RT));
    }
    if let Some(s) = rq.cheated.pop_front() {
        return Some((s, PRI_CHEATED));
    }
    if rq.root.nrun.get() > 0 {
        return Some((pick_run(rq), PRI_TIMESHARE));
    }
    if let Some(s) = rq.bg.pop_front() {
        debug_assert!(s.leaf, "pick: bg not leaf");
        return Some((s, PRI_BG));
    }
    None
}

/// Bind the chosen thread to the CPU.  Quanta are not replenished for
/// threads running on a cheated preference.
fn dispatch(next: &Arc<Thread>, pri: u32) {
    let k = cur_kernel();
    k.processor.cpu.pri.set(pri);
    k.processor.cpu.on_idle.set(false);
    if pri != PRI_CHEATED {
        next.runticks.set(RUN_TICKS);
    }
    next.state.set(TState::OnProc);
}

/// Relinquish the CPU.  Called with the runq lock held, by a thread
/// that has either queued itself somewhere (sleep, timeslice) or is
/// yielding; returns when the thread is next dispatched.
pub fn swtch(mut rq: SpinGuard<'_, RunQueues>) {
    let k = cur_kernel();
    let t = cur_thread();
    debug_assert_eq!(
        k.processor.cpu.nopreempt.get(),
        0,
        "swtch: slept in no-preempt region"
    );
    k.processor.cpu.do_preempt.set(false);
    // A voluntary sleep works off one point of CPU-hoggishness.
    if t.state.get() == TState::Sleep && t.oink.get() > 0 {
        t.oink.update(|o| o - 1);
    }
    match pick_next(&mut rq) {
        Some((node, pri)) => {
            let next = node.thread();
            dispatch(&next, pri);
            drop(rq);
            if !Arc::ptr_eq(&next, &t) {
                k.processor.switch_to(t.ctx, next.ctx);
            }
        }
        None => {
            // Nothing runnable anywhere: idle context takes the CPU.
            k.processor.cpu.on_idle.set(true);
            k.processor.cpu.pri.set(PRI_IDLE);
            drop(rq);
            k.processor.kick();
            k.processor.switch_to(t.ctx, IDLE_CTX);
        }
    }
}

/// Like [`swtch`], for a context that will never be dispatched again.
/// The baton is handed off without waiting; the caller must do no
/// further kernel work before its host thread ends.
pub fn exit_switch() {
    let k = cur_kernel();
    let mut rq = k.runq.lock(Spl::Hi);
    let next = pick_next(&mut rq);
    match next {
        Some((node, pri)) => {
            let next = node.thread();
            dispatch(&next, pri);
            drop(rq);
            k.processor.handoff(next.ctx);
        }
        None => {
            k.processor.cpu.on_idle.set(true);
            k.processor.cpu.pri.set(PRI_IDLE);
            drop(rq);
            k.processor.kick();
            k.processor.handoff(IDLE_CTX);
        }
    }
}

/// Idle-context dispatch: run one thread if there is one, returning
/// when the baton comes back.  False when there was nothing to run.
pub fn dispatch_from_idle() -> bool {
    let k = cur_kernel();
    let mut rq = k.runq.lock(Spl::Hi);
    let Some((node, pri)) = pick_next(&mut rq) else {
        return false;
    };
    let next = node.thread();
    dispatch(&next, pri);
    drop(rq);
    k.processor.switch_to(IDLE_CTX, next.ctx);
    true
}

/// Post a preemption request; honoured at the next safe point.
fn preempt() {
    cur_kernel().processor.cpu.do_preempt.set(true);
}

/// Make a thread runnable; runq lock held by caller.
pub fn lsetrun(rq: &mut RunQueues, t: &Arc<Thread>) {
    let k = cur_kernel();
    debug_assert!(t.wchan.lock(|w| w.is_none()), "lsetrun: wchan set");
    t.state.set(TState::Run);
    k.num_run.update(|n| n + 1);
    let node = t
        .runq
        .lock(|n| n.clone())
        .expect("lsetrun: no sched node");
    let flags = t.flags.get();
    if flags.contains(TFlags::RT) {
        rq.rt.push_back(node);
        preempt();
    } else if flags.contains(TFlags::BG) {
        rq.bg.push_back(node);
    } else if t.runticks.get() > CHEAT_TICKS && t.oink.get() == 0 {
        // Used little of its last quantum and not a chronic hog:
        // queue preferentially.
        rq.cheated.push_back(node);
        if k.processor.cpu.pri.get() < PRI_CHEATED {
            preempt();
        }
    } else {
        debug_assert!(node.leaf, "lsetrun: not leaf");
        queue_leaf(&node);
    }
    // If the CPU is idling, this is what it is waiting for.
    k.processor.kick();
}

/// Make a thread runnable, handling the locking.
pub fn setrun(t: &Arc<Thread>) {
    let k = cur_kernel();
    let mut rq = k.runq.lock(Spl::Hi);
    lsetrun(&mut rq, t);
}

/// Give up the CPU but stay runnable.
pub fn timeslice() {
    let k = cur_kernel();
    let t = cur_thread();
    let mut rq = k.runq.lock(Spl::Hi);
    k.num_run.update(|n| n - 1);
    lsetrun(&mut rq, &t);
    swtch(rq);
}

/// Preempt the current thread if a nudge is pending and this is a safe
/// point: a thread is running, no spinlocks held, preemption not
/// nested off, and not on the idle context.
pub fn check_preempt() {
    let Some(k) = try_cur_kernel() else { return };
    if !k.processor.cpu.do_preempt.get() {
        return;
    }
    if try_cur_thread().is_some()
        && k.processor.cpu.locks.get() == 0
        && k.processor.cpu.nopreempt.get() == 0
        && !k.processor.cpu.on_idle.get()
    {
        timeslice();
    }
}

/// Change the scheduling class of the current thread.
fn sched_prichg(new_pri: u32) -> Result<i64> {
    let t = cur_thread();
    if new_pri == PRI_RT && !perm::isroot() {
        return Err(Err::Perm);
    }
    let k = cur_kernel();
    let rq = k.runq.lock(Spl::Hi);
    let mut f = t.flags.get();
    f.remove(TFlags::RT | TFlags::BG);
    if new_pri == PRI_BG {
        f.insert(TFlags::BG);
    }
    if new_pri == PRI_RT {
        f.insert(TFlags::RT);
    }
    t.flags.set(f);
    if k.processor.cpu.pri.get() > new_pri {
        // Dropped in priority; let someone else contend.
        preempt();
    }
    k.processor.cpu.pri.set(new_pri);
    drop(rq);
    Ok(0)
}

/// Scheduling operations requested by user code.
pub const SCHEDOP_SETPRIO: u32 = 0;
pub const SCHEDOP_GETPRIO: u32 = 1;
pub const SCHEDOP_YIELD: u32 = 2;
pub const SCHEDOP_EPHEM: u32 = 3;

pub fn sched_op(op: u32, arg: u32) -> Result<i64> {
    match op {
        SCHEDOP_SETPRIO => match arg {
            PRI_BG | PRI_RT | PRI_TIMESHARE => sched_prichg(arg),
            _ => Err(Err::Inval),
        },
        SCHEDOP_GETPRIO => {
            let f = cur_thread().flags.get();
            Ok(if f.contains(TFlags::BG) {
                PRI_BG as i64
            } else if f.contains(TFlags::RT) {
                PRI_RT as i64
            } else {
                PRI_TIMESHARE as i64
            })
        }
        SCHEDOP_YIELD => {
            timeslice();
            Ok(0)
        }
        SCHEDOP_EPHEM => {
            let t = cur_thread();
            let p = Arc::clone(&t.proc);
            if p.nthread.get() == 1 {
                // Last non-ephemeral thread; the process must exit.
                return Err(Err::Inval);
            }
            if p.sema.p(Pri::Catch) {
                return Err(Err::Intr);
            }
            t.flags.update(|f| f | TFlags::EPHEM);
            p.nthread.update(|n| n - 1);
            p.sema.v();
            Ok(0)
        }
        _ => Err(Err::Inval),
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::kernel::Kernel};

    // The lottery selector alone, driven without any live threads:
    // leaves are queued by hand and the pick ratio checked.
    #[test]
    fn lottery_ratio_tracks_weights() {
        let k = Kernel::boot_quiet();
        let _enter = k.enter_for_test();
        let kc = cur_kernel();
        let mut rq = kc.runq.lock(Spl::Lo);
        let root = Arc::clone(&rq.root);
        let pa = Arc::new(crate::proc::Process::stub(1));
        let ta = Thread::new(1, 100, Arc::clone(&pa));
        let tb = Thread::new(2, 101, Arc::clone(&pa));
        let a = sched_thread(&mut rq, &root, &ta);
        let b = sched_thread(&mut rq, &root, &tb);
        a.set_prio(2);
        b.set_prio(1);
        let (mut na, mut nb) = (0u32, 0u32);
        for _ in 0..3000 {
            queue_leaf(&a);
            queue_leaf(&b);
            let w1 = pick_run(&mut rq);
            let w2 = pick_run(&mut rq);
            assert_eq!(rq.root.nrun(), 0);
            for w in [w1, w2] {
                if Arc::ptr_eq(&w, &a) {
                    na += 1;
                } else {
                    nb += 1;
                }
            }
        }
        // Every round picks both; the *first* pick is the weighted one,
        // so compare first-pick counts instead via a fresh tally.
        let (mut fa, mut fb) = (0u32, 0u32);
        for _ in 0..3000 {
            queue_leaf(&a);
            queue_leaf(&b);
            let w = pick_run(&mut rq);
            if Arc::ptr_eq(&w, &a) {
                fa += 1;
            } else {
                fb += 1;
            }
            // Drain the other.
            let _ = pick_run(&mut rq);
        }
        assert_eq!(na + nb, 12000);
        let ratio = fa as f64 / fb as f64;
        assert!(
            (1.4..2.8).contains(&ratio),
            "ratio {ratio} not near 2 (fa={fa} fb={fb})"
        );
    }

    #[test]
    fn nrun_sums_up_the_spine() {
        let k = Kernel::boot_quiet();
        let _enter = k.enter_for_test();
        let kc = cur_kernel();
        let mut rq = kc.runq.lock(Spl::Lo);
        let root = Arc::clone(&rq.root);
        let grp = sched_node(&mut rq, &root);
        let p = Arc::new(crate::proc::Process::stub(1));
        let t1 = Thread::new(1, 100, Arc::clone(&p));
        let t2 = Thread::new(2, 101, Arc::clone(&p));
        let l1 = sched_thread(&mut rq, &grp, &t1);
        let l2 = sched_thread(&mut rq, &grp, &t2);
        queue_leaf(&l1);
        queue_leaf(&l2);
        assert_eq!(grp.nrun(), 2);
        assert_eq!(root.nrun(), 2);
        dequeue_leaf(&l1);
        assert_eq!(grp.nrun(), 1);
        assert_eq!(root.nrun(), 1);
        dequeue_leaf(&l2);
        assert_eq!(root.nrun(), 0);
    }
}
