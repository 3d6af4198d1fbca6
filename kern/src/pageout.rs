/*
 * SPDX-License-Identifier: MIT
 */

//! The pageout daemon.
//!
//! A privileged thread donates itself through the `pageout` syscall
//! and sweeps physical memory whenever kicked: referenced pages are
//! aged, dirty swap-backed pages are pushed out asynchronously, and
//! clean reclaimable pages are stolen back for the free pool.

use {
    crate::{
        atl,
        err::{Err, Result},
        kernel::cur_kernel,
        mutex::{Pri, Spl},
        perm::issys,
        pset::{free_page, iodone_unlock, pset_writeslot, PpFlags, Pset, PsetKind},
        pview::Pview,
    },
    machine::ptob,
    std::sync::Arc,
};

/// Ask the daemon for a sweep.
pub fn kick_pageout() {
    cur_kernel().pageout_wait.v();
}

/// The `pageout` syscall: become the pageout daemon until unwound by
/// an event.
pub fn pageout() -> Result<i64> {
    if !issys() {
        return Err(Err::Perm);
    }
    let k = cur_kernel();
    loop {
        if k.pageout_wait.p(Pri::Catch) {
            return Err(Err::Intr);
        }
        scan_once();
    }
}

/// Live attachments of a slot, as (view, view-page-index) pairs.
fn snapshot_atl(ps: &Arc<Pset>, idx: usize) -> Vec<(Arc<Pview>, usize)> {
    ps.pp(idx, |pp| {
        pp.atl
            .iter()
            .filter_map(|e| e.view.upgrade().map(|v| (v, e.idx)))
            .collect()
    })
}

/// One pass over physical memory.
pub fn scan_once() {
    let k = cur_kernel();
    for pfn in 0..k.coremap.len() {
        let Some((ps, idx)) = k.coremap.lookup(pfn) else {
            continue;
        };
        if ps.kind() == PsetKind::Mem {
            continue;
        }
        let g = ps.lock.lock(Spl::Lo);
        if ps.clock_slot(g, idx).is_err() {
            // Busy slot; somebody else is already working on it.
            continue;
        }

        let (valid, cur_pfn) = ps.pp(idx, |pp| (pp.flags.contains(PpFlags::V), pp.pfn));
        if !valid || cur_pfn != pfn {
            ps.unlock_slot(idx);
            continue;
        }

        // Harvest hardware bits from every mapping.
        let views = snapshot_atl(&ps, idx);
        let mut referenced = false;
        let mut modified = false;
        for (pv, vidx) in &views {
            if let Some(vas) = pv.vas() {
                let (r, m) = vas.hat.get_bits(pv.vaddr.get() + ptob(*vidx));
                referenced |= r;
                modified |= m;
            }
        }
        if modified {
            ps.pp(idx, |pp| pp.flags.insert(PpFlags::M));
        }

        if referenced {
            // Recently used: age it and move on.
            ps.pp(idx, |pp| pp.flags.insert(PpFlags::R));
            ps.unlock_slot(idx);
            continue;
        }

        let flags = ps.pp(idx, |pp| pp.flags);
        if flags.contains(PpFlags::M) && ps.swapblk() != 0 {
            // Dirty: push to swap; the completion drops the slot lock.
            if pset_writeslot(&ps, idx, Some(iodone_unlock)).is_err() {
                ps.unlock_slot(idx);
            }
            continue;
        }

        // Clean.  A page is stealable when its content is recoverable
        // (on swap, regenerable zero fill, a COW share of its master,
        // or a file cache page) and nothing beyond the mappings at
        // hand holds it: extra references mean wired pages or shares
        // handed to shadow sets.
        let refs = ps.pp(idx, |pp| pp.refs);
        let stealable = refs == views.len()
            && match ps.kind() {
                PsetKind::File => true,
                PsetKind::Zfod | PsetKind::Cow => !flags.contains(PpFlags::M),
                PsetKind::Mem => false,
            };
        if !stealable {
            ps.unlock_slot(idx);
            continue;
        }

        for (pv, vidx) in &views {
            if let Some(vas) = pv.vas() {
                vas.hat.delete_trans(pv.vaddr.get() + ptob(*vidx), pfn);
            }
            if atl::delete_atl(&ps, idx, pv, *vidx) {
                ps.deref_slot(idx);
            }
        }
        // File-cache pages have no owner once unmapped; retire them
        // by hand.
        if ps.kind() == PsetKind::File
            && ps.pp(idx, |pp| pp.refs == 0 && pp.flags.contains(PpFlags::V))
        {
            ps.pp(idx, |pp| pp.flags.remove(PpFlags::V));
            free_page(pfn);
        }
        ps.unlock_slot(idx);
    }
}
