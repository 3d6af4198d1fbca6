/*
 * SPDX-License-Identifier: MIT
 */

//! Address spaces: changing and searching the view list.

use {
    crate::{
        atl::delete_atl,
        err::{Err, Result},
        mutex::{Spinlock, Spl},
        pset::{deref_pset, ref_pset, PpFlags, PsetFlags, PsetKind},
        pset_zfod::alloc_pset_zfod,
        pview::{alloc_pview, attach_valid_slots, copy_pview, cow_pview, dup_pview, free_pview, Pview},
    },
    machine::{hat::Hat, hat::Prot, ptob},
    std::sync::Arc,
};

pub struct Vas {
    /// Views, kept sorted by virtual address.
    pub views: Spinlock<Vec<Arc<Pview>>>,
    pub hat: Hat,
}

impl Vas {
    pub fn new() -> Arc<Vas> {
        Arc::new(Vas {
            views: Spinlock::new(Vec::new()),
            hat: Hat::new(),
        })
    }
}

/// Find the view containing `vaddr`.
///
/// The caller takes the pset lock next; nothing intervenes on a single
/// CPU between the lookup and that acquire.
pub fn find_pview(vas: &Arc<Vas>, vaddr: usize) -> Option<Arc<Pview>> {
    let g = vas.views.lock(Spl::Lo);
    g.iter().find(|pv| pv.contains(vaddr)).cloned()
}

/// Any view overlapping `[vaddr, vaddr + len pages)`?
pub fn overlapping_pview(vas: &Arc<Vas>, vaddr: usize, pages: usize) -> bool {
    let end = vaddr + ptob(pages);
    let g = vas.views.lock(Spl::Lo);
    g.iter().any(|pv| {
        let base = pv.vaddr.get();
        base < end && vaddr < base + ptob(pv.len.get())
    })
}

/// Attach a view to a vas.  The prot, len, and any requested vaddr are
/// already set up; the HAT may choose the address.
pub fn attach_pview(vas: &Arc<Vas>, pv: &Arc<Pview>) -> Result<usize> {
    pv.vas.lock(|v| *v = Some(Arc::downgrade(vas)));
    let want = match pv.vaddr.get() {
        0 => None,
        va => Some(va),
    };
    let vaddr = match vas.hat.attach(want, pv.len.get(), pv.prot.get()) {
        Ok(va) => va,
        Err(_) => {
            pv.vas.lock(|v| *v = None);
            return Err(Err::NoMem);
        }
    };
    pv.vaddr.set(vaddr);
    let mut g = vas.views.lock(Spl::Lo);
    let pos = g
        .iter()
        .position(|v| v.vaddr.get() > vaddr)
        .unwrap_or(g.len());
    g.insert(pos, Arc::clone(pv));
    Ok(vaddr)
}

/// Unlink the view containing `vaddr` and tear down every translation
/// and slot reference it holds.  The pset keeps the reference the view
/// itself owns; the caller decides that one's fate.
pub fn detach_pview(vas: &Arc<Vas>, vaddr: usize) -> Arc<Pview> {
    let mut g = vas.views.lock(Spl::Lo);
    let pos = g
        .iter()
        .position(|pv| pv.contains(vaddr))
        .expect("detach_pview: lost a pview");
    let pv = g.remove(pos);
    drop(g);

    let ps = &pv.set;
    let mut pg = Some(ps.lock.lock(Spl::Lo));
    for x in 0..pv.len.get() {
        let idx = pv.off.get() + x;
        let valid = ps.pp(idx, |pp| pp.flags.contains(PpFlags::V).then_some(pp.pfn));
        let Some(pfn) = valid else { continue };
        // Lock the slot, remove our attachment, fold in the final
        // ref/mod bits, and drop our reference.
        ps.lock_slot(pg.take().unwrap(), idx);
        if delete_atl(ps, idx, &pv, x) {
            let va = pv.vaddr.get() + ptob(x);
            vas.hat.delete_trans(va, pfn);
            let (r, m) = vas.hat.get_bits(va);
            ps.pp(idx, |pp| {
                if r {
                    pp.flags.insert(PpFlags::R);
                }
                if m {
                    pp.flags.insert(PpFlags::M);
                }
            });
            ps.deref_slot(idx);
        }
        ps.unlock_slot(idx);
        pg = Some(ps.lock.lock(Spl::Lo));
    }
    drop(pg);

    vas.hat.detach(pv.vaddr.get(), pv.len.get());
    pv.vas.lock(|v| *v = None);
    pv
}

/// Detach the view at `vaddr` and free it.
pub fn remove_pview(vas: &Arc<Vas>, vaddr: usize) {
    let pv = detach_pview(vas, vaddr);
    free_pview(&pv);
}

/// Dump every view.  Serialization comes with the exit scenario.
pub fn free_vas(vas: &Arc<Vas>) {
    loop {
        let first = vas.views.lock(Spl::Lo).first().cloned();
        match first {
            Some(pv) => remove_pview(vas, pv.vaddr.get()),
            None => break,
        }
    }
}

/// Create a demand-zero view and attach it wherever the HAT likes.
pub fn alloc_zfod(vas: &Arc<Vas>, pages: usize) -> Result<usize> {
    let ps = alloc_pset_zfod(pages);
    let pv = alloc_pview(&ps);
    match attach_pview(vas, &pv) {
        Ok(va) => Ok(va),
        Err(e) => {
            // Frees the pset too; ours was the only reference.
            free_pview(&pv);
            Err(e)
        }
    }
}

/// Like [`alloc_zfod`], at a caller-chosen address.
pub fn alloc_zfod_vaddr(vas: &Arc<Vas>, pages: usize, vaddr: usize) -> Result<usize> {
    let ps = alloc_pset_zfod(pages);
    let pv = alloc_pview(&ps);
    pv.vaddr.set(vaddr);
    match attach_pview(vas, &pv) {
        Ok(va) => Ok(va),
        Err(e) => {
            free_pview(&pv);
            Err(e)
        }
    }
}

/// Duplicate `ovas` into the fresh `vas`: read-only and shared views
/// are duplicated, writable private views get a copy-on-write shadow.
pub fn fork_vas(ovas: &Arc<Vas>, vas: &Arc<Vas>) {
    // Walk in address order so progress survives releasing the list
    // lock while each view is worked on.
    let mut last = 0usize;
    loop {
        let closest = {
            let g = ovas.views.lock(Spl::Lo);
            g.iter()
                .filter(|pv| pv.vaddr.get() > last || (last == 0 && pv.vaddr.get() == 0))
                .min_by_key(|pv| pv.vaddr.get())
                .cloned()
        };
        let Some(opv) = closest else { break };
        let next_addr = opv.vaddr.get();
        let ps = Arc::clone(&opv.set);
        // Hold the pset while the view is duplicated out from under
        // the (released) list lock.
        ref_pset(&ps);

        let pv = if opv.prot.get().contains(Prot::RO)
            || ps.pset_flags().contains(PsetFlags::SHARED)
        {
            dup_pview(&opv)
        } else if ps.kind() == PsetKind::Cow {
            // A shadow cannot be shadowed; take a real copy.
            copy_pview(&opv)
        } else {
            // Writable private memory forks as a copy-on-write shadow.
            cow_pview(&opv)
        };
        pv.prot.update(|p| p | Prot::FORK);
        attach_pview(vas, &pv).expect("fork_vas: attach refused");
        pv.prot.update(|p| p - Prot::FORK);
        attach_valid_slots(&pv);
        deref_pset(&ps);

        last = next_addr.max(1);
    }
    vas.hat.fork_from(&ovas.hat);
}
