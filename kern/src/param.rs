/*
 * SPDX-License-Identifier: MIT
 */

//! System-wide tunables and message opcode assignments.

/// Max scatter/gather segments in one message.
pub const MSGSEGS: usize = 8;

/// Client portref slots per process.
pub const PROCOPENS: usize = 32;

/// Server port slots per process.  Server ports are numbered
/// `PROCOPENS..PROCOPENS + PROCPORTS` so the two tables share one
/// user-visible id space.
pub const PROCPORTS: usize = 16;

/// Permission label slots per process.
pub const PROCPERMS: usize = 8;

/// Elements in one permission id chain.
pub const PERMLEN: usize = 8;

/// Clock ticks handed to a thread per dispatch.
pub const RUN_TICKS: u32 = 10;

/// A thread that still holds more than this many ticks at sleep time
/// used "little" of its quantum and may queue preferentially.
pub const CHEAT_TICKS: u32 = RUN_TICKS / 2;

/// Default weight of a scheduling node.
pub const PRIO_DEFAULT: u32 = 10;

/// Interrupt lines understood by the hosted interrupt controller.
pub const MAX_IRQ: usize = 16;

/// The clock interrupt line.
pub const IRQ_TIMER: u32 = 0;

/// Dispatch-priority classes, ascending.
pub const PRI_IDLE: u32 = 0;
pub const PRI_BG: u32 = 1;
pub const PRI_TIMESHARE: u32 = 2;
pub const PRI_CHEATED: u32 = 3;
pub const PRI_RT: u32 = 4;

// Message opcodes reserved to the kernel.  User sends below M_RESVD are
// refused, except M_TIME which a user-space timekeeper generates.
pub const M_CONNECT: u32 = 1;
pub const M_DISCONNECT: u32 = 2;
pub const M_DUP: u32 = 3;
pub const M_ABORT: u32 = 4;
pub const M_ISR: u32 = 5;
pub const M_TIME: u32 = 6;
pub const M_RESVD: u32 = 100;

/// Modifier bit: the segments of this message name buffers to be
/// filled by the reply rather than data being sent.
pub const M_READ: u32 = 0x1000;

/// Mask stripping modifier bits off an opcode.
pub const M_OPMASK: u32 = 0xFFF;

// Conventional filesystem protocol opcodes, from M_RESVD up.
pub const FS_OPEN: u32 = 100;
pub const FS_READ: u32 = 101;
pub const FS_SEEK: u32 = 102;
pub const FS_WRITE: u32 = 103;
pub const FS_STAT: u32 = 104;
pub const FS_WSTAT: u32 = 105;
pub const FS_ABSREAD: u32 = 106;
pub const FS_ABSWRITE: u32 = 107;
/// Stable file identity + size, the handshake behind mmap of a file.
pub const FS_FID: u32 = 108;

// Swap-manager protocol.
pub const SWAP_ALLOC: u32 = 120;
pub const SWAP_FREE: u32 = 121;
