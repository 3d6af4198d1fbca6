/*
 * SPDX-License-Identifier: MIT
 */

//! Copy-on-write psets.
//!
//! A COW set shadows a range of a master set.  Slots initially share
//! the master's pages read-only; the first write through a view copies
//! the page privately and drops the master reference.  The master
//! keeps a list of its shadows so teardown can find them; the links
//! are non-owning — each shadow holds one real reference on its
//! master.

use {
    crate::{
        err::{Err, Result},
        kernel::cur_kernel,
        param::FS_ABSREAD,
        pset::{
            alloc_slot_page, deref_pset, free_page, pset_writeslot, IoDone, PpFlags, Pset,
            PsetKind, PsetOps,
        },
        vm_swap,
    },
    machine::ptob,
    std::sync::Arc,
};

#[derive(Clone)]
pub struct CowOps {
    parent: Arc<Pset>,
}

impl PsetOps for CowOps {
    fn kind(&self) -> PsetKind {
        PsetKind::Cow
    }

    /// Fill from swap if this slot was pushed there, otherwise take a
    /// shared reference to the master's page.  Sharing is always the
    /// first step; the write path breaks it if ever needed.
    fn fill_slot(&self, ps: &Arc<Pset>, idx: usize) -> Result<()> {
        debug_assert!(
            !ps.pp(idx, |pp| pp.flags.intersects(PpFlags::V | PpFlags::BAD)),
            "cow fill: valid"
        );
        let pg;
        if ps.pp(idx, |pp| pp.flags.contains(PpFlags::SWAPPED)) {
            pg = alloc_slot_page(ps, idx)?;
            let Some(dev) = vm_swap::swapdev() else {
                free_page(pg);
                return Err(Err::Io);
            };
            if vm_swap::pageio(
                pg,
                &dev,
                ptob(idx + ps.swapblk()),
                machine::NBPG,
                FS_ABSREAD,
            )
            .is_err()
            {
                free_page(pg);
                return Err(Err::Io);
            }
        } else {
            let cow = &self.parent;
            let idx2 = ps.off() + idx;
            let g = cow.lock.lock(crate::mutex::Spl::Lo);
            cow.lock_slot(g, idx2);
            if !cow.pp(idx2, |pp| pp.flags.contains(PpFlags::V)) {
                if let Err(e) = cow.ops().fill_slot(cow, idx2) {
                    cow.unlock_slot(idx2);
                    return Err(e);
                }
                debug_assert!(
                    cow.pp(idx2, |pp| pp.flags.contains(PpFlags::V)),
                    "cow fill: master fill !v"
                );
            } else {
                cow.pp(idx2, |pp| pp.refs += 1);
            }
            pg = cow.pp(idx2, |pp| pp.pfn);
            ps.pp(idx, |pp| pp.flags.insert(PpFlags::COW));
            cow.unlock_slot(idx2);
        }
        ps.pp(idx, |pp| {
            pp.refs = 1;
            pp.flags.insert(PpFlags::V);
            pp.flags.remove(PpFlags::M | PpFlags::R);
            pp.pfn = pg;
        });
        Ok(())
    }

    fn write_slot(&self, ps: &Arc<Pset>, idx: usize, iodone: Option<IoDone>) -> Result<()> {
        pset_writeslot(ps, idx, iodone)
    }

    /// A copy of a COW set is one more shadow of the same master.
    fn dup(&self, _old: &Arc<Pset>, new: &Arc<Pset>) {
        self.parent.add_cowset(new);
    }

    fn free(&self, ps: &Pset) {
        debug_assert_eq!(ps.valid_slots(), 0, "cow free: still refs");
        self.parent.remove_cowset(ps);
        deref_pset(&self.parent);
    }

    /// Last reference gone: un-share from the master, or free the
    /// private page if sharing was already broken.
    fn last_ref(&self, ps: &Arc<Pset>, idx: usize) {
        if ps.pp(idx, |pp| pp.flags.contains(PpFlags::COW)) {
            let master = &self.parent;
            let idx2 = ps.off() + idx;
            let g = master.lock.lock(crate::mutex::Spl::Lo);
            master.lock_slot(g, idx2);
            master.deref_slot(idx2);
            master.unlock_slot(idx2);
        } else {
            let pfn = ps.pp(idx, |pp| pp.pfn);
            free_page(pfn);
        }
        ps.pp(idx, |pp| pp.flags.remove(PpFlags::COW | PpFlags::V));
    }

    fn cow_parent(&self) -> Option<&Arc<Pset>> {
        Some(&self.parent)
    }

    fn clone_ops(&self) -> Box<dyn PsetOps> {
        Box::new(self.clone())
    }
}

/// Break the sharing on a write: copy the master's page, switch the
/// slot to the private copy, release the master reference.
///
/// Called from the fault path with the slot locked.
pub fn cow_write(ps: &Arc<Pset>, idx: usize) -> Result<()> {
    let master = ps
        .ops()
        .cow_parent()
        .cloned()
        .expect("cow_write: not a cow set");
    let idx2 = ps.off() + idx;
    let pg = alloc_slot_page(ps, idx)?;
    assert!(
        master.pp(idx2, |pp| pp.flags.contains(PpFlags::V)),
        "cow_write: !v"
    );
    let src = master.pp(idx2, |pp| pp.pfn);
    cur_kernel().pmem.copy(src, pg);
    master.deref_slot(idx2);
    ps.pp(idx, |pp| {
        pp.pfn = pg;
        pp.flags.remove(PpFlags::COW);
    });
    Ok(())
}

/// Allocate a COW pset shadowing `[off, off + len)` of `master`.
pub fn alloc_pset_cow(master: &Arc<Pset>, off: usize, len: usize) -> Arc<Pset> {
    debug_assert!(master.kind() != PsetKind::Cow, "pset_cow: cow of cow");
    let swapblk = vm_swap::alloc_swap(len);
    let ps = Pset::alloc(len, off, Box::new(CowOps {
        parent: Arc::clone(master),
    }));
    ps.set_swapblk(swapblk);
    master.add_cowset(&ps);
    ps
}
