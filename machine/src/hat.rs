/*
 * SPDX-License-Identifier: MIT
 */

//! Hardware address translation, hosted flavour.
//!
//! One `Hat` per address space.  Translations are a sorted map from
//! virtual page number to a soft PTE carrying the frame number, a
//! write-protect bit, and referenced/modified bits.  The kernel core
//! only ever uses the operations below, so the representation is free
//! to change (real page tables, inverted tables, ...).
//!
//! User-memory access is routed through [`Hat::translate`], which sets
//! the referenced bit (and modified, for writes) exactly as an MMU
//! would, and reports misses and protection violations for the fault
//! resolver to handle.

use {
    crate::{btop, pgdown, ptob, rmap::Rmap, sync::NullLock, KERN_BASE, NBPG, VMAP_BASE, VMAP_SIZE},
    bitflags::bitflags,
    snafu::Snafu,
    std::collections::BTreeMap,
};

bitflags! {
    /// View protection bits.  Only `RO` affects translations; `MMAP`
    /// and `FORK` are policy bits the VM layer stores alongside and the
    /// HAT consults during attach.
    pub struct Prot: u32 {
        /// Write-protected.
        const RO = 0x01;
        /// View was created by user mmap (may be unmapped by user).
        const MMAP = 0x02;
        /// Address-space duplication in progress; fixed addresses are
        /// honoured even inside the dynamic window.
        const FORK = 0x04;
    }
}

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum HatError {
    /// The requested virtual address cannot be reserved.
    #[snafu(display("bad virtual address"))]
    BadAddress,
    /// No room left in the dynamic-placement window.
    #[snafu(display("out of virtual address space"))]
    NoSpace,
}

/// Why a translation attempt did not produce a frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransFault {
    /// No translation at this address.
    Miss,
    /// Translation exists but is write-protected.
    WriteProt,
}

#[derive(Copy, Clone, Debug)]
struct Pte {
    pfn: usize,
    ro: bool,
    referenced: bool,
    modified: bool,
}

struct HatInner {
    pte: BTreeMap<usize, Pte>,
    amap: Rmap,
}

/// Per-vas translation state.
pub struct Hat {
    inner: NullLock<HatInner>,
}

impl Default for Hat {
    fn default() -> Self {
        Self::new()
    }
}

impl Hat {
    /// Fresh per-vas state.  The dynamic window starts fully free.
    /// (The kernel half of a real root table would be copied from the
    /// canonical kernel root here; the hosted model has no kernel
    /// mappings to copy.)
    pub fn new() -> Self {
        let mut amap = Rmap::new();
        amap.free(btop(VMAP_BASE), btop(VMAP_SIZE));
        Self {
            inner: NullLock::new(HatInner {
                pte: BTreeMap::new(),
                amap,
            }),
        }
    }

    /// Reserve virtual space for a view.  `None` asks the HAT to choose
    /// from the dynamic window; `Some(va)` must be honoured or refused.
    /// Fixed addresses in the kernel half always fail, and fixed
    /// addresses inside the dynamic window fail unless the view is
    /// flagged `FORK` (duplication of an existing space, with the map
    /// state following via [`Hat::fork_from`]).
    pub fn attach(
        &self,
        vaddr: Option<usize>,
        pages: usize,
        prot: Prot,
    ) -> Result<usize, HatError> {
        match vaddr {
            Some(va) => {
                if va % NBPG != 0 || pages == 0 {
                    return Err(HatError::BadAddress);
                }
                let end = va.checked_add(ptob(pages)).ok_or(HatError::BadAddress)?;
                if end > KERN_BASE {
                    return Err(HatError::BadAddress);
                }
                if prot.contains(Prot::FORK) {
                    return Ok(va);
                }
                let win_end = VMAP_BASE + VMAP_SIZE;
                if va < win_end && end > VMAP_BASE {
                    return Err(HatError::BadAddress);
                }
                Ok(va)
            }
            None => self
                .inner
                .lock(|h| h.amap.alloc(pages))
                .map(ptob)
                .ok_or(HatError::NoSpace),
        }
    }

    /// Release a reservation made by [`Hat::attach`].  Translations are
    /// torn down separately, one by one, by the view teardown path.
    pub fn detach(&self, vaddr: usize, pages: usize) {
        if (VMAP_BASE..VMAP_BASE + VMAP_SIZE).contains(&vaddr) {
            self.inner.lock(|h| h.amap.free(btop(vaddr), pages));
        }
    }

    /// Install a translation.
    pub fn add_trans(&self, vaddr: usize, pfn: usize, prot: Prot) {
        let vpn = btop(pgdown(vaddr));
        self.inner.lock(|h| {
            h.pte.insert(
                vpn,
                Pte {
                    pfn,
                    ro: prot.contains(Prot::RO),
                    referenced: false,
                    modified: false,
                },
            )
        });
    }

    /// Remove a translation.  Harmless when none exists.
    pub fn delete_trans(&self, vaddr: usize, pfn: usize) {
        let vpn = btop(pgdown(vaddr));
        self.inner.lock(|h| {
            if let Some(pte) = h.pte.get(&vpn) {
                debug_assert_eq!(pte.pfn, pfn, "delete_trans: pfn mismatch");
                h.pte.remove(&vpn);
            }
        });
    }

    /// Atomically read and clear the referenced/modified bits.
    /// Returns `(referenced, modified)`.
    pub fn get_bits(&self, vaddr: usize) -> (bool, bool) {
        let vpn = btop(pgdown(vaddr));
        self.inner.lock(|h| match h.pte.get_mut(&vpn) {
            Some(pte) => {
                let out = (pte.referenced, pte.modified);
                pte.referenced = false;
                pte.modified = false;
                out
            }
            None => (false, false),
        })
    }

    /// MMU lookup: resolve `vaddr` for a read or write access, updating
    /// the hardware bits on success.
    pub fn translate(&self, vaddr: usize, write: bool) -> Result<usize, TransFault> {
        let vpn = btop(pgdown(vaddr));
        self.inner.lock(|h| match h.pte.get_mut(&vpn) {
            None => Err(TransFault::Miss),
            Some(pte) if write && pte.ro => Err(TransFault::WriteProt),
            Some(pte) => {
                pte.referenced = true;
                if write {
                    pte.modified = true;
                }
                Ok(pte.pfn)
            }
        })
    }

    /// Copy allocation-map state from the space being duplicated.
    /// Called after both spaces exist; the new space's views were
    /// attached with `FORK` and now adopt the old window layout.
    pub fn fork_from(&self, old: &Hat) {
        let amap = old.inner.lock(|h| h.amap.clone());
        self.inner.lock(|h| h.amap = amap);
    }

    /// Count of live translations; used by teardown assertions.
    pub fn trans_count(&self) -> usize {
        self.inner.lock(|h| h.pte.len())
    }
}
