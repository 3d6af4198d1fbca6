/*
 * SPDX-License-Identifier: MIT
 */

//! Physical-memory psets: fixed frames, used for memory-mapped
//! devices and for wrapping kernel pages into message segments.

use {
    crate::{
        err::Result,
        pset::{IoDone, PpFlags, Pset, PsetKind, PsetOps},
    },
    std::sync::Arc,
};

#[derive(Clone)]
pub struct MemOps;

impl PsetOps for MemOps {
    fn kind(&self) -> PsetKind {
        PsetKind::Mem
    }

    fn fill_slot(&self, ps: &Arc<Pset>, idx: usize) -> Result<()> {
        assert!(
            ps.pp(idx, |pp| pp.flags.contains(PpFlags::V)),
            "mem fill: not valid"
        );
        Ok(())
    }

    fn write_slot(&self, ps: &Arc<Pset>, idx: usize, _iodone: Option<IoDone>) -> Result<()> {
        debug_assert!(
            ps.pp(idx, |pp| pp.flags.contains(PpFlags::V)),
            "mem write: invalid"
        );
        ps.pp(idx, |pp| pp.flags.remove(PpFlags::M));
        Ok(())
    }

    fn free(&self, _ps: &Pset) {
        // The frames are not ours.
    }

    fn last_ref(&self, _ps: &Arc<Pset>, _idx: usize) {}

    fn clone_ops(&self) -> Box<dyn PsetOps> {
        Box::new(self.clone())
    }
}

/// A pset holding a fixed run of physical frames, all valid from the
/// start.
pub fn physmem_pset(pfn: usize, npfn: usize) -> Arc<Pset> {
    let ps = Pset::alloc(npfn, 0, Box::new(MemOps));
    for x in 0..npfn {
        ps.pp(x, |pp| {
            pp.pfn = pfn + x;
            pp.flags = PpFlags::V;
            pp.refs = 0;
        });
    }
    ps
}
