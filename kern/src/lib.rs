/*
 * SPDX-License-Identifier: MIT
 */

//! The microkernel core.
//!
//! Everything a process ever asks of the system funnels through here:
//! page sets and views backing its memory, synchronous message passing
//! over ports, a lottery scheduler arbitrating the CPU, and the trap
//! surface stitching them together.  The hardware below is the
//! `machine` crate's hosted model, so the whole kernel runs — and is
//! tested — as an ordinary process.

#![allow(clippy::upper_case_acronyms)]
#![allow(clippy::new_without_default)]

pub mod atl;
pub mod clock;
pub mod coremap;
pub mod err;
pub mod event;
pub mod isr;
pub mod kernel;
pub mod misc;
pub mod mmap;
pub mod msg;
pub mod mutex;
pub mod pageout;
pub mod param;
pub mod perm;
pub mod port;
pub mod proc;
pub mod pset;
pub mod pset_cow;
pub mod pset_fod;
pub mod pset_mem;
pub mod pset_zfod;
pub mod pview;
pub mod qio;
pub mod sched;
pub mod seg;
pub mod sys;
pub mod syscall;
pub mod thread;
pub mod trap;
pub mod uaccess;
pub mod vas;
pub mod vm_fault;
pub mod vm_swap;

pub use {
    err::{Err, Result},
    kernel::{BootParams, Kernel, TaskHandle},
    mmap::MapFlags,
    msg::{Msg, UserSeg},
};

use static_assertions::const_assert;

// The dynamic-placement window must hold at least one maximal message.
const_assert!(machine::VMAP_SIZE >= param::MSGSEGS * machine::NBPG);
