/*
 * SPDX-License-Identifier: MIT
 */

//! Attach lists: which views hold translations to a slot.
//!
//! Each valid slot records `(view, page-index-within-view)` pairs; the
//! list is walked to tear translations down when a slot is evicted or
//! a view detached.  Entries hold non-owning view links.

use {
    crate::{
        pset::{AtlEntry, Pset},
        pview::Pview,
    },
    std::sync::Arc,
};

/// Record that `pv` maps slot `idx` of `ps` at view page `pvidx`.
pub fn add_atl(ps: &Pset, idx: usize, pv: &Arc<Pview>, pvidx: usize) {
    ps.pp(idx, |pp| {
        debug_assert!(
            !pp.atl
                .iter()
                .any(|e| e.idx == pvidx && e.view.upgrade().is_some_and(|v| Arc::ptr_eq(&v, pv))),
            "add_atl: duplicate"
        );
        pp.atl.push(AtlEntry {
            view: Arc::downgrade(pv),
            idx: pvidx,
        })
    });
}

/// Remove the attachment of `(pv, pvidx)` to slot `idx`; true if an
/// entry was there.
pub fn delete_atl(ps: &Pset, idx: usize, pv: &Arc<Pview>, pvidx: usize) -> bool {
    ps.pp(idx, |pp| {
        let pos = pp.atl.iter().position(|e| {
            e.idx == pvidx && e.view.upgrade().is_some_and(|v| Arc::ptr_eq(&v, pv))
        });
        match pos {
            Some(i) => {
                pp.atl.swap_remove(i);
                true
            }
            None => false,
        }
    })
}

/// Attachments currently recorded on a slot.
pub fn atl_count(ps: &Pset, idx: usize) -> usize {
    ps.pp(idx, |pp| pp.atl.len())
}
