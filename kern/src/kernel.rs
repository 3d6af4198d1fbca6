/*
 * SPDX-License-Identifier: MIT
 */

//! Kernel instance and bootstrap.
//!
//! All the process-wide singletons of the system — frame pool, run
//! queues, swap state, port namespace, clock, interrupt table — live in
//! one `Kernel`, built once at boot.  Kernel threads find it (and
//! themselves) through a thread-local set when their host thread is
//! born; that is the moral equivalent of the per-CPU `curthread`.
//!
//! The embedding (tests, a harness playing the boot loader) interacts
//! only through edges that are safe from outside the baton: queueing
//! boot tasks, posting interrupts, and joining on exit status.

use {
    crate::{
        clock::Clock,
        coremap::CoreMap,
        isr::IsrTable,
        mutex::{Sema, Spinlock},
        port::PortNames,
        proc::{self, ProcTable, TaskSpec},
        qio::Qio,
        sched::RunQueues,
        thread::Thread,
        trap,
        vm_swap::Swap,
    },
    machine::{
        cpu::{Processor, IDLE_CTX},
        pmem::Pmem,
        sync::CpuCell,
    },
    std::{
        cell::RefCell,
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc, Arc, Mutex,
        },
    },
};

/// Boot-time parameters.
pub struct BootParams {
    /// Page frames in the pool.
    pub frames: usize,
    /// Seed for the scheduler's lottery.
    pub sched_seed: u64,
}

impl Default for BootParams {
    fn default() -> Self {
        Self {
            frames: 512,
            sched_seed: 0x5eed,
        }
    }
}

pub struct Kernel {
    pub processor: Processor,
    pub pmem: Pmem,
    pub coremap: CoreMap,
    pub runq: Spinlock<RunQueues>,
    /// Threads runnable or running.
    pub num_run: CpuCell<usize>,
    /// Virtual interrupt mask; raised while an `Spl::Hi` lock is held.
    pub spl_hi: CpuCell<bool>,
    pub swap: Swap,
    pub qio: Qio,
    /// Kicked to request a pageout sweep.
    pub pageout_wait: Sema,
    pub names: Spinlock<PortNames>,
    pub procs: Spinlock<ProcTable>,
    pub clock: Clock,
    pub isr: IsrTable,
    next_tid: CpuCell<u64>,
    boot_q: Mutex<Vec<TaskSpec>>,
    shutdown: AtomicBool,
}

struct CurrentCtx {
    kernel: Arc<Kernel>,
    thread: Option<Arc<Thread>>,
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentCtx>> = const { RefCell::new(None) };
}

/// Install the current kernel (and thread) for this host thread.
pub(crate) fn set_current(kernel: Arc<Kernel>, thread: Option<Arc<Thread>>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(CurrentCtx { kernel, thread }));
}

pub(crate) fn clear_current() {
    CURRENT.with(|c| *c.borrow_mut() = None);
}

pub fn try_cur_kernel() -> Option<Arc<Kernel>> {
    CURRENT.with(|c| c.borrow().as_ref().map(|x| Arc::clone(&x.kernel)))
}

pub fn cur_kernel() -> Arc<Kernel> {
    try_cur_kernel().expect("no kernel on this host thread")
}

pub fn try_cur_thread() -> Option<Arc<Thread>> {
    CURRENT.with(|c| c.borrow().as_ref().and_then(|x| x.thread.clone()))
}

pub fn cur_thread() -> Arc<Thread> {
    try_cur_thread().expect("no current thread")
}

/// Handle for joining a spawned task.
pub struct TaskHandle {
    rx: mpsc::Receiver<i64>,
}

impl TaskHandle {
    /// Wait for the task's process to exit and return its status.
    pub fn join(self) -> i64 {
        self.rx.recv().expect("task vanished without exit status")
    }
}

impl Kernel {
    /// Bring the system up: build the singletons and start the idle
    /// context.  Boot tasks are fed in afterwards via
    /// [`Kernel::spawn_task`].
    pub fn boot(params: BootParams) -> Arc<Kernel> {
        let k = Self::build(params);
        let ki = Arc::clone(&k);
        std::thread::Builder::new()
            .name("idle".into())
            .spawn(move || idle_main(ki))
            .expect("spawn idle");
        k
    }

    /// A kernel with no idle context running; unit tests drive the
    /// data structures directly.
    pub fn boot_quiet() -> Arc<Kernel> {
        Self::build(BootParams::default())
    }

    fn build(params: BootParams) -> Arc<Kernel> {
        proc::install_panic_hook();
        Arc::new(Kernel {
            processor: Processor::new(),
            pmem: Pmem::new(params.frames),
            coremap: CoreMap::new(params.frames),
            runq: Spinlock::new(RunQueues::new(params.sched_seed)),
            num_run: CpuCell::new(0),
            spl_hi: CpuCell::new(false),
            swap: Swap::new(),
            qio: Qio::new(),
            pageout_wait: Sema::new(0),
            names: Spinlock::new(PortNames::new()),
            procs: Spinlock::new(ProcTable::new()),
            clock: Clock::new(),
            isr: IsrTable::new(),
            next_tid: CpuCell::new(1),
            boot_q: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    pub(crate) fn next_tid(&self) -> u64 {
        self.next_tid.update(|t| t + 1)
    }

    /// Queue a boot task: a process whose first thread runs `body`
    /// with the named permission level.
    pub fn spawn_task(
        self: &Arc<Kernel>,
        name: &str,
        root: bool,
        body: impl FnOnce() -> i64 + Send + 'static,
    ) -> TaskHandle {
        let (tx, rx) = mpsc::channel();
        let spec = TaskSpec {
            name: name.into(),
            root,
            body: Box::new(body),
            exit_tx: tx,
        };
        self.boot_q.lock().unwrap().push(spec);
        self.processor.kick();
        TaskHandle { rx }
    }

    /// Post a hardware interrupt line; delivered at the next safe
    /// point (idle, or a trap exit).
    pub fn interrupt(self: &Arc<Kernel>, irq: u32) {
        self.processor.post_irq(irq);
    }

    /// Advance the clock: `n` timer interrupts.
    pub fn tick(self: &Arc<Kernel>, n: u32) {
        for _ in 0..n {
            self.interrupt(crate::param::IRQ_TIMER);
        }
    }

    /// Ask the idle loop to wind down once nothing is runnable.
    pub fn shutdown(self: &Arc<Kernel>) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.processor.kick();
    }

    /// Install this kernel as the host thread's current kernel for the
    /// duration of the returned guard.  Unit-test plumbing.
    pub fn enter_for_test(self: &Arc<Kernel>) -> TestEnter {
        set_current(Arc::clone(self), None);
        TestEnter
    }
}

pub struct TestEnter;

impl Drop for TestEnter {
    fn drop(&mut self) {
        clear_current();
    }
}

/// The idle context: deliver pending interrupts, launch queued boot
/// tasks, dispatch a thread when one is runnable, otherwise halt until
/// the doorbell rings.
fn idle_main(k: Arc<Kernel>) {
    set_current(Arc::clone(&k), None);
    k.processor.run_first(IDLE_CTX);
    loop {
        let seen = k.processor.bell_count();
        while let Some(irq) = k.processor.take_irq() {
            trap::interrupt(irq);
        }
        let specs: Vec<TaskSpec> = std::mem::take(&mut *k.boot_q.lock().unwrap());
        for spec in specs {
            proc::launch_task(spec);
        }
        if crate::sched::dispatch_from_idle() {
            continue;
        }
        if k.shutdown.load(Ordering::SeqCst) && k.num_run.get() == 0 {
            break;
        }
        if !k.processor.irq_pending() && k.boot_q.lock().unwrap().is_empty() {
            k.processor.idle_wait(seen);
        }
    }
    clear_current();
}
