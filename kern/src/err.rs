/*
 * SPDX-License-Identifier: MIT
 */

//! Kernel error taxonomy.
//!
//! A syscall that fails leaves one of these on the calling thread; the
//! trap layer flags the error return and `strerror` hands the rendered
//! string back to user code.

use snafu::Snafu;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum Err {
    /// Malformed argument.
    #[snafu(display("invalid"))]
    Inval,
    /// Caller lacks the needed permission label.
    #[snafu(display("perm"))]
    Perm,
    /// Named object does not exist.
    #[snafu(display("no entry"))]
    NoEnt,
    /// Out of pages, swap, or table slots.
    #[snafu(display("no mem"))]
    NoMem,
    /// A user buffer crossed unmapped or protected memory.
    #[snafu(display("fault"))]
    Fault,
    /// A blocked operation was unwound by an event.
    #[snafu(display("intr"))]
    Intr,
    /// Peer gone or backing I/O failed.
    #[snafu(display("io err"))]
    Io,
    /// Resource is held by someone else.
    #[snafu(display("busy"))]
    Busy,
    /// Object already exists.
    #[snafu(display("exists"))]
    Exists,
    /// Port or portref id out of range or empty.
    #[snafu(display("bad file"))]
    BadF,
    /// Arithmetic trap.
    #[snafu(display("math err"))]
    Math,
    /// Killed by an unhandled event.
    #[snafu(display("kill"))]
    Kill,
    /// Error string declared by a server via `msg_err`.
    #[snafu(display("{msg}"))]
    Server { msg: String },
}

impl Err {
    /// Server-declared error with the given string.
    pub fn server(msg: impl Into<String>) -> Self {
        Err::Server { msg: msg.into() }
    }
}

pub type Result<T> = core::result::Result<T, Err>;
