/*
 * SPDX-License-Identifier: MIT
 */

//! Fill-on-demand psets: read-only views of a file behind a port.

use {
    crate::{
        err::{Err, Result},
        param::FS_ABSREAD,
        port::{shut_client, Portref},
        pset::{alloc_slot_page, free_page, IoDone, PpFlags, Pset, PsetKind, PsetOps},
        vm_swap::pageio,
    },
    machine::ptob,
    std::sync::Arc,
};

#[derive(Clone)]
pub struct FodOps {
    pr: Arc<Portref>,
}

impl PsetOps for FodOps {
    fn kind(&self) -> PsetKind {
        PsetKind::File
    }

    fn fill_slot(&self, ps: &Arc<Pset>, idx: usize) -> Result<()> {
        debug_assert!(
            !ps.pp(idx, |pp| pp.flags.intersects(PpFlags::V | PpFlags::BAD)),
            "fod fill: valid"
        );
        let pfn = alloc_slot_page(ps, idx)?;
        if pageio(
            pfn,
            &self.pr,
            ptob(idx + ps.off()),
            machine::NBPG,
            FS_ABSREAD,
        )
        .is_err()
        {
            free_page(pfn);
            return Err(Err::Io);
        }
        ps.pp(idx, |pp| {
            pp.flags.insert(PpFlags::V);
            pp.flags.remove(PpFlags::M | PpFlags::R);
            pp.refs = 1;
            pp.pfn = pfn;
        });
        Ok(())
    }

    /// We have no coherent mapped files, so a dirty file page cannot
    /// happen; writes ride a COW overlay instead.
    fn write_slot(&self, ps: &Arc<Pset>, idx: usize, _iodone: Option<IoDone>) -> Result<()> {
        debug_assert!(
            ps.pp(idx, |pp| pp.flags.contains(PpFlags::V)),
            "fod write: invalid"
        );
        assert!(
            !ps.pp(idx, |pp| pp.flags.contains(PpFlags::M)),
            "fod write: dirty file"
        );
        Ok(())
    }

    fn free(&self, ps: &Pset) {
        // Drop every cached page, then the file connection.
        for idx in 0..ps.len() {
            let pfn = ps.pp(idx, |pp| {
                debug_assert_eq!(pp.refs, 0, "fod free: still refs");
                debug_assert!(!pp.flags.contains(PpFlags::M), "fod free: dirty");
                pp.flags.contains(PpFlags::V).then_some(pp.pfn)
            });
            if let Some(pfn) = pfn {
                free_page(pfn);
            }
        }
        shut_client(&self.pr);
    }

    /// File pages stay cached after the last view lets go; the next
    /// fault finds them still valid.
    fn last_ref(&self, _ps: &Arc<Pset>, _idx: usize) {}

    fn clone_ops(&self) -> Box<dyn PsetOps> {
        Box::new(self.clone())
    }
}

/// A fill-on-demand pset over an open file connection, all pages
/// initially invalid.
pub fn alloc_pset_fod(pr: Arc<Portref>, pages: usize) -> Arc<Pset> {
    Pset::alloc(pages, 0, Box::new(FodOps { pr }))
}
