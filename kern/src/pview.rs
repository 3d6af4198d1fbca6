/*
 * SPDX-License-Identifier: MIT
 */

//! Page views: a range of a pset bound into an address space.

use {
    crate::{
        atl::add_atl,
        pset::{copy_pset, deref_pset, ref_pset, PpFlags, Pset},
        vas::Vas,
    },
    machine::{
        hat::Prot,
        ptob,
        sync::{CpuCell, NullLock},
    },
    std::sync::{Arc, Weak},
};

pub struct Pview {
    pub set: Arc<Pset>,
    pub vaddr: CpuCell<usize>,
    /// Length in pages.
    pub len: CpuCell<usize>,
    /// First pset slot covered.
    pub off: CpuCell<usize>,
    pub prot: CpuCell<Prot>,
    pub vas: NullLock<Option<Weak<Vas>>>,
}

impl Pview {
    /// Does this view cover `vaddr`?
    pub fn contains(&self, vaddr: usize) -> bool {
        let base = self.vaddr.get();
        vaddr >= base && vaddr < base + ptob(self.len.get())
    }

    /// The vas this view is attached to.
    pub fn vas(&self) -> Option<Arc<Vas>> {
        self.vas.lock(|v| v.as_ref().and_then(Weak::upgrade))
    }
}

/// Create a view of the whole of `ps`.
pub fn alloc_pview(ps: &Arc<Pset>) -> Arc<Pview> {
    ref_pset(ps);
    Arc::new(Pview {
        set: Arc::clone(ps),
        vaddr: CpuCell::new(0),
        len: CpuCell::new(ps.len()),
        off: CpuCell::new(0),
        prot: CpuCell::new(Prot::empty()),
        vas: NullLock::new(None),
    })
}

/// Delete a view, dropping its reference on the pset.
pub fn free_pview(pv: &Arc<Pview>) {
    deref_pset(&pv.set);
}

/// Duplicate a view over the same pset.
pub fn dup_pview(opv: &Pview) -> Arc<Pview> {
    ref_pset(&opv.set);
    Arc::new(Pview {
        set: Arc::clone(&opv.set),
        vaddr: CpuCell::new(opv.vaddr.get()),
        len: CpuCell::new(opv.len.get()),
        off: CpuCell::new(opv.off.get()),
        prot: CpuCell::new(opv.prot.get()),
        vas: NullLock::new(None),
    })
}

/// Duplicate a view over a *copy* of its pset; used at fork when the
/// source is itself a shadow that cannot be shadowed again.
pub fn copy_pview(opv: &Pview) -> Arc<Pview> {
    let ps = copy_pset(&opv.set);
    ref_pset(&ps);
    Arc::new(Pview {
        set: ps,
        vaddr: CpuCell::new(opv.vaddr.get()),
        len: CpuCell::new(opv.len.get()),
        off: CpuCell::new(opv.off.get()),
        prot: CpuCell::new(opv.prot.get()),
        vas: NullLock::new(None),
    })
}

/// A view over a fresh copy-on-write shadow of the source's pset;
/// what a writable private view becomes in a forked child.
pub fn cow_pview(opv: &Pview) -> Arc<Pview> {
    let ps = crate::pset_cow::alloc_pset_cow(&opv.set, opv.off.get(), opv.len.get());
    ref_pset(&ps);
    Arc::new(Pview {
        set: ps,
        vaddr: CpuCell::new(opv.vaddr.get()),
        len: CpuCell::new(opv.len.get()),
        off: CpuCell::new(0),
        prot: CpuCell::new(opv.prot.get()),
        vas: NullLock::new(None),
    })
}

/// Walk the view and wire up every already-valid slot: attach-list
/// entry, translation (read-only while a slot still shares COW), and a
/// slot reference.  Used at fork to pre-populate the child.
pub fn attach_valid_slots(pv: &Arc<Pview>) {
    let ps = &pv.set;
    let vas = pv.vas().expect("attach_valid_slots: detached view");
    for x in 0..pv.len.get() {
        let idx = pv.off.get() + x;
        let wire = ps.pp(idx, |pp| {
            pp.flags
                .contains(PpFlags::V)
                .then_some((pp.pfn, pp.flags.contains(PpFlags::COW)))
        });
        if let Some((pfn, cow)) = wire {
            add_atl(ps, idx, pv, x);
            let mut prot = pv.prot.get();
            if cow {
                prot |= Prot::RO;
            }
            vas.hat.add_trans(pv.vaddr.get() + ptob(x), pfn, prot);
            ps.ref_slot(idx);
        }
    }
}
