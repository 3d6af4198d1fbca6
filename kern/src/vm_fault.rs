/*
 * SPDX-License-Identifier: MIT
 */

//! Resolving VM faults.
//!
//! A fault lands in an address space; the matching view is found, the
//! affected slot of the view's pset is locked and filled, and the
//! resulting page is wired in through the HAT with an attach-list
//! entry tabulating the mapping.  COW slots stay read-only until a
//! write fault copies them private.

use {
    crate::{
        atl::{add_atl, delete_atl},
        err::{Err, Result},
        mutex::Spl,
        pset::PpFlags,
        pset_cow::cow_write,
        vas::{find_pview, Vas},
    },
    machine::{btop, hat::Prot},
    std::sync::Arc,
};

/// Process a fault at `vaddr`.  `Ok` when resolved; an error means the
/// faulting thread gets an event.
pub fn vas_fault(vas: &Arc<Vas>, vaddr: usize, write: bool) -> Result<()> {
    // Easiest: no view matches the address.
    let Some(pv) = find_pview(vas, vaddr) else {
        return Err(Err::Fault);
    };
    let ps = Arc::clone(&pv.set);
    let pg = ps.lock.lock(Spl::Lo);

    // Next easiest: writing a read-only view.
    if write && pv.prot.get().contains(Prot::RO) {
        return Err(Err::Fault);
    }

    // Transfer from the pset lock to the slot lock.
    let pvidx = btop(vaddr - pv.vaddr.get());
    let idx = pvidx + pv.off.get();
    ps.lock_slot(pg, idx);

    let finish = (|| {
        if ps.pp(idx, |pp| pp.flags.contains(PpFlags::BAD)) {
            return Err(Err::Fault);
        }

        // Fill an invalid slot; just reference a valid one, dropping
        // any wiring an earlier fault left for this same view page so
        // the books stay balanced when the translation is re-made.
        if !ps.pp(idx, |pp| pp.flags.contains(PpFlags::V)) {
            ps.ops().fill_slot(&ps, idx)?;
            assert!(
                ps.pp(idx, |pp| pp.flags.contains(PpFlags::V)),
                "vas_fault: lost the page"
            );
        } else {
            // Take our reference before dropping the stale one so the
            // count cannot bottom out and free the page under us.
            ps.ref_slot(idx);
            if delete_atl(&ps, idx, &pv, pvidx) {
                ps.deref_slot(idx);
            }
        }

        // Break the COW association when writing through it.
        if write && ps.pp(idx, |pp| pp.flags.contains(PpFlags::COW)) {
            cow_write(&ps, idx)?;
            assert!(
                ps.pp(idx, |pp| pp.flags.contains(PpFlags::V)),
                "vas_fault: lost the page 2"
            );
        }

        // Wire it up: attach-list entry plus HAT translation, with the
        // effective protection read-only while sharing persists.
        add_atl(&ps, idx, &pv, pvidx);
        let mut prot = pv.prot.get();
        if ps.pp(idx, |pp| pp.flags.contains(PpFlags::COW)) {
            prot |= Prot::RO;
        }
        let pfn = ps.pp(idx, |pp| pp.pfn);
        vas.hat.add_trans(pv.vaddr.get() + machine::ptob(pvidx), pfn, prot);
        Ok(())
    })();

    ps.unlock_slot(idx);
    finish
}
