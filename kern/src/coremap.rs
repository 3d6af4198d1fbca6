/*
 * SPDX-License-Identifier: MIT
 */

//! Reverse map from page frame to owner.
//!
//! Each allocated frame records the pset and slot index it backs, so
//! the pageout scanner can walk physical memory and find the metadata
//! for each page it considers.

use {
    crate::pset::Pset,
    machine::sync::NullLock,
    std::sync::{Arc, Weak},
};

#[derive(Clone)]
pub struct CoreEntry {
    pub pset: Weak<Pset>,
    pub idx: usize,
}

pub struct CoreMap {
    slots: Box<[NullLock<Option<CoreEntry>>]>,
}

impl CoreMap {
    pub fn new(nframes: usize) -> Self {
        Self {
            slots: (0..nframes)
                .map(|_| NullLock::new(None))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    /// Tag a frame with its owner.  Done right after allocation, while
    /// the owning slot is locked.
    pub fn set_core(&self, pfn: usize, ps: &Arc<Pset>, idx: usize) {
        self.slots[pfn].lock(|s| {
            *s = Some(CoreEntry {
                pset: Arc::downgrade(ps),
                idx,
            })
        });
    }

    pub fn clear_core(&self, pfn: usize) {
        self.slots[pfn].lock(|s| *s = None);
    }

    pub fn lookup(&self, pfn: usize) -> Option<(Arc<Pset>, usize)> {
        self.slots[pfn].lock(|s| {
            s.as_ref()
                .and_then(|e| e.pset.upgrade().map(|ps| (ps, e.idx)))
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
