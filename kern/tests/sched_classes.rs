/*
 * SPDX-License-Identifier: MIT
 */

//! Scheduler behaviour visible from user code: classes, yield,
//! tick-driven preemption, and ephemeral threads.

use {
    kern::{
        param::{PRI_BG, PRI_RT, PRI_TIMESHARE},
        sched::{SCHEDOP_EPHEM, SCHEDOP_GETPRIO, SCHEDOP_SETPRIO},
        sys, BootParams, Kernel,
    },
    std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

#[test]
fn priority_class_knobs() {
    let k = Kernel::boot(BootParams::default());
    let root_task = k.spawn_task("rooty", true, move || {
        assert_eq!(
            sys::sched_op(SCHEDOP_GETPRIO, 0).unwrap(),
            PRI_TIMESHARE as i64
        );
        sys::sched_op(SCHEDOP_SETPRIO, PRI_RT).unwrap();
        assert_eq!(sys::sched_op(SCHEDOP_GETPRIO, 0).unwrap(), PRI_RT as i64);
        sys::sched_op(SCHEDOP_SETPRIO, PRI_BG).unwrap();
        assert_eq!(sys::sched_op(SCHEDOP_GETPRIO, 0).unwrap(), PRI_BG as i64);
        sys::sched_op(SCHEDOP_SETPRIO, PRI_TIMESHARE).unwrap();
        // The last non-ephemeral thread may not turn ephemeral.
        assert!(sys::sched_op(SCHEDOP_EPHEM, 0).is_err());
        0
    });
    assert_eq!(root_task.join(), 0);

    let plain = k.spawn_task("plain", false, move || {
        // Real-time is for the privileged.
        assert!(sys::sched_op(SCHEDOP_SETPRIO, PRI_RT).is_err());
        assert_eq!(sys::strerror(), "perm");
        sys::sched_yield().unwrap();
        0
    });
    assert_eq!(plain.join(), 0);
    k.shutdown();
}

#[test]
fn timer_ticks_preempt_a_cpu_hog() {
    let k = Kernel::boot(BootParams::default());
    let other_ran = Arc::new(AtomicUsize::new(0));
    let hog_started = Arc::new(AtomicUsize::new(0));

    let flag = Arc::clone(&other_ran);
    let started = Arc::clone(&hog_started);
    let quiet = k.spawn_task("quiet", false, move || {
        // Wait until the hog owns the CPU; from then on, only a
        // preemption can get us scheduled again.
        while started.load(Ordering::SeqCst) == 0 {
            sys::sched_yield().unwrap();
        }
        flag.store(1, Ordering::SeqCst);
        0
    });

    let flag2 = Arc::clone(&other_ran);
    let started2 = Arc::clone(&hog_started);
    let hog = k.spawn_task("hog", false, move || {
        started2.store(1, Ordering::SeqCst);
        // Burn quanta in syscalls without ever blocking.
        let mut spins = 0u64;
        while flag2.load(Ordering::SeqCst) == 0 {
            let _ = sys::time_get().unwrap();
            spins += 1;
            assert!(spins < 5_000_000, "hog was never preempted");
        }
        0
    });

    // Feed the clock until the dust settles.
    let kt = Arc::clone(&k);
    let done = Arc::new(AtomicUsize::new(0));
    let done2 = Arc::clone(&done);
    let ticker = std::thread::spawn(move || {
        while done2.load(Ordering::SeqCst) == 0 {
            kt.tick(1);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    });

    assert_eq!(hog.join(), 0);
    assert_eq!(quiet.join(), 0);
    done.store(1, Ordering::SeqCst);
    ticker.join().unwrap();
    k.shutdown();
}

#[test]
fn ephemeral_thread_does_not_hold_the_process() {
    let k = Kernel::boot(BootParams::default());
    let h = k.spawn_task("ephem", false, move || {
        sys::fork_thread(move || {
            sys::sched_op(SCHEDOP_EPHEM, 0).unwrap();
            // Spin forever; our exit must not be required.
            loop {
                sys::sched_yield().unwrap();
            }
        })
        .unwrap();
        sys::sched_yield().unwrap();
        7
    });
    // The main thread's status is the process's fate.
    assert_eq!(h.join(), 7);
    k.shutdown();
}
