/*
 * SPDX-License-Identifier: MIT
 */

//! Permission labels.
//!
//! A process carries an array of hierarchical id chains; an object
//! carries a protection label granting ability bits at each matched
//! chain depth.  A permission whose chain is a prefix of the label's
//! chain is granted the union of the bits up to its length, plus the
//! label's default.

use {
    crate::{
        err::{Err, Result},
        kernel::cur_thread,
        mutex::Pri,
        param::{PERMLEN, PROCPERMS},
    },
    std::sync::Arc,
};

pub const ACC_READ: u8 = 0x1;
pub const ACC_WRITE: u8 = 0x2;
pub const ACC_CHMOD: u8 = 0x4;

/// I/O ability bits, granted by [`IO_PROT`].
pub const IOPRIV_ISR: u8 = 0x1;
pub const IOPRIV_IO: u8 = 0x2;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Perm {
    pub valid: bool,
    pub len: usize,
    pub id: [u16; PERMLEN],
    pub uid: u32,
}

impl Perm {
    pub fn disabled() -> Perm {
        Perm::default()
    }

    /// A permission holding the given id chain.
    pub fn new(chain: &[u16], uid: u32) -> Perm {
        assert!(chain.len() <= PERMLEN, "perm chain too long");
        let mut id = [0u16; PERMLEN];
        id[..chain.len()].copy_from_slice(chain);
        Perm {
            valid: true,
            len: chain.len(),
            id,
            uid,
        }
    }

    /// The all-powerful system label.
    pub fn root() -> Perm {
        Perm::new(&[1, 1], 0)
    }

    /// The weaker system label.
    pub fn sys() -> Perm {
        Perm::new(&[1], 0)
    }

    fn chain(&self) -> &[u16] {
        &self.id[..self.len]
    }
}

/// Does `a` dominate `b` — is `a`'s chain a prefix of `b`'s?
pub fn perm_dominates(a: &Perm, b: &Perm) -> bool {
    a.valid && b.valid && a.len <= b.len && a.chain() == &b.id[..a.len]
}

#[derive(Copy, Clone, Debug)]
pub struct Prot {
    pub len: usize,
    pub default: u8,
    pub id: [u16; PERMLEN],
    pub bits: [u8; PERMLEN],
}

impl Prot {
    pub fn new(chain: &[u16], default: u8, bits: &[u8]) -> Prot {
        assert!(chain.len() <= PERMLEN && bits.len() == chain.len());
        let mut id = [0u16; PERMLEN];
        id[..chain.len()].copy_from_slice(chain);
        let mut b = [0u8; PERMLEN];
        b[..bits.len()].copy_from_slice(bits);
        Prot {
            len: chain.len(),
            default,
            id,
            bits: b,
        }
    }
}

/// Ability bits granted to `perms` against label `prot`.
pub fn perm_calc(perms: &[Perm], prot: &Prot) -> u8 {
    let mut grant = prot.default;
    for p in perms.iter().filter(|p| p.valid) {
        if p.len > prot.len {
            continue;
        }
        if p.chain() != &prot.id[..p.len] {
            continue;
        }
        for d in 0..p.len {
            grant |= prot.bits[d];
        }
    }
    grant
}

/// Label guarding root/sys capability checks: matching `<1>` grants
/// read (sys), the full `<1,1>` adds write (root).
fn root_prot() -> Prot {
    Prot::new(&[1, 1], 0, &[ACC_READ, ACC_WRITE])
}

/// Label guarding ISR vectoring and I/O instructions.
fn io_prot() -> Prot {
    Prot::new(&[1, 1], 0, &[IOPRIV_ISR, IOPRIV_ISR | IOPRIV_IO])
}

fn canget(bit: u8) -> bool {
    let t = cur_thread();
    let ids = t.proc.ids.lock(|ids| *ids);
    perm_calc(&ids, &root_prot()) & bit != 0
}

/// Is the current thread a big shot?
pub fn isroot() -> bool {
    canget(ACC_WRITE)
}

/// Like root, but little shots OK too.
pub fn issys() -> bool {
    canget(ACC_READ)
}

/// Abilities of the current thread against the I/O label.
pub fn io_priv() -> u8 {
    let t = cur_thread();
    let ids = t.proc.ids.lock(|ids| *ids);
    perm_calc(&ids, &io_prot())
}

/// Set a permission slot (when some held permission dominates the new
/// value) and/or read a slot back.
pub fn perm_ctl(idx: usize, set: Option<Perm>) -> Result<Perm> {
    let t = cur_thread();
    let p = Arc::clone(&t.proc);
    if idx >= PROCPERMS {
        return Err(Err::Inval);
    }
    if let Some(mut new) = set {
        if p.sema.p(Pri::Lo) {
            return Err(Err::Intr);
        }
        let granted = p.ids.lock(|ids| {
            match ids.iter().position(|have| perm_dominates(have, &new)) {
                Some(by) => {
                    // Keep the uid that made this possible.
                    if ids[by].uid != 0 {
                        new.uid = ids[by].uid;
                    }
                    ids[idx] = new;
                    true
                }
                None => false,
            }
        });
        p.sema.v();
        if !granted {
            return Err(Err::Perm);
        }
    }
    Ok(p.ids.lock(|ids| ids[idx]))
}

/// Flatten a permission array for the connect-time handshake buffer.
pub fn encode_perms(perms: &[Perm]) -> Vec<u8> {
    let mut out = Vec::with_capacity(perms.len() * (2 + PERMLEN * 2 + 4));
    for p in perms.iter().filter(|p| p.valid) {
        out.push(1u8);
        out.push(p.len as u8);
        for id in p.chain() {
            out.extend_from_slice(&id.to_le_bytes());
        }
        out.extend_from_slice(&p.uid.to_le_bytes());
    }
    out
}
