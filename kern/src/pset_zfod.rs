/*
 * SPDX-License-Identifier: MIT
 */

//! Zero-fill-on-demand psets: anonymous memory.

use {
    crate::{
        err::{Err, Result},
        kernel::cur_kernel,
        param::FS_ABSREAD,
        pset::{alloc_slot_page, free_page, pset_writeslot, IoDone, PpFlags, Pset, PsetKind, PsetOps},
        vm_swap,
    },
    machine::ptob,
    std::sync::Arc,
};

#[derive(Clone)]
pub struct ZfodOps;

impl PsetOps for ZfodOps {
    fn kind(&self) -> PsetKind {
        PsetKind::Zfod
    }

    fn fill_slot(&self, ps: &Arc<Pset>, idx: usize) -> Result<()> {
        debug_assert!(
            !ps.pp(idx, |pp| pp.flags.intersects(PpFlags::V | PpFlags::BAD)),
            "zfod fill: valid"
        );
        let pfn = alloc_slot_page(ps, idx)?;
        if ps.pp(idx, |pp| pp.flags.contains(PpFlags::SWAPPED)) {
            // Evicted earlier; the content lives on our swap.
            let Some(dev) = vm_swap::swapdev() else {
                free_page(pfn);
                return Err(Err::Io);
            };
            if vm_swap::pageio(
                pfn,
                &dev,
                ptob(idx + ps.swapblk()),
                machine::NBPG,
                FS_ABSREAD,
            )
            .is_err()
            {
                free_page(pfn);
                return Err(Err::Io);
            }
        } else {
            cur_kernel().pmem.zero(pfn);
        }
        ps.pp(idx, |pp| {
            pp.flags.insert(PpFlags::V);
            pp.flags.remove(PpFlags::M | PpFlags::R);
            pp.refs = 1;
            pp.pfn = pfn;
        });
        Ok(())
    }

    fn write_slot(&self, ps: &Arc<Pset>, idx: usize, iodone: Option<IoDone>) -> Result<()> {
        pset_writeslot(ps, idx, iodone)
    }

    fn free(&self, ps: &Pset) {
        // Copied sets can be torn down with valid, unreferenced slots
        // still holding pages.
        for idx in 0..ps.len() {
            let pfn = ps.pp(idx, |pp| {
                debug_assert_eq!(pp.refs, 0, "zfod free: still refs");
                pp.flags.contains(PpFlags::V).then_some(pp.pfn)
            });
            if let Some(pfn) = pfn {
                free_page(pfn);
            }
        }
    }

    fn last_ref(&self, ps: &Arc<Pset>, idx: usize) {
        // Nobody views the slot; drop the resident page.  A swap copy,
        // if one was pushed, survives for a refill.
        let pfn = ps.pp(idx, |pp| {
            pp.flags.remove(PpFlags::V);
            pp.pfn
        });
        free_page(pfn);
    }

    fn clone_ops(&self) -> Box<dyn PsetOps> {
        Box::new(self.clone())
    }
}

/// Allocate a ZFOD pset with all-invalid pages and swap behind it.
pub fn alloc_pset_zfod(pages: usize) -> Arc<Pset> {
    let ps = Pset::alloc(pages, 0, Box::new(ZfodOps));
    ps.set_swapblk(vm_swap::alloc_swap(pages));
    ps
}
