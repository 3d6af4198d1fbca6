/*
 * SPDX-License-Identifier: MIT
 */

//! Page sets: creating, searching, and filling.
//!
//! A pset is a logical array of page slots with a filling strategy.
//! Slot metadata lives in per-slot `PerPage` records guarded by the
//! slot-lock discipline: the pset spinlock covers searching and the
//! lock bits themselves; a slot's contents may only change under its
//! LOCK bit (or, before it first becomes valid, under the pset lock).

use {
    crate::{
        err::{Err, Result},
        kernel::cur_kernel,
        mutex::{Pri, Sema, SpinGuard, Spinlock, Spl},
        pview::Pview,
        vm_swap,
    },
    bitflags::bitflags,
    machine::{
        ptob,
        sync::{CpuCell, NullLock},
    },
    std::sync::{Arc, Weak},
};

bitflags! {
    pub struct PpFlags: u16 {
        /// Slot holds a valid resident page.
        const V = 0x01;
        /// Modified since last write-back.
        const M = 0x02;
        /// Referenced.
        const R = 0x04;
        /// A copy exists on swap.
        const SWAPPED = 0x08;
        /// Still sharing the underlying master copy.
        const COW = 0x10;
        /// Backing I/O failed; faults on this slot fail promptly.
        const BAD = 0x20;
        /// Slot being filled or evicted.
        const LOCK = 0x40;
        /// Someone is waiting for the lock.
        const WANT = 0x80;
    }
}

bitflags! {
    pub struct PsetFlags: u16 {
        /// Views of this set fork by sharing, not copying.
        const SHARED = 0x01;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PsetKind {
    Zfod,
    File,
    Cow,
    Mem,
}

/// One attachment: a view holding a translation to this slot.
pub struct AtlEntry {
    pub view: Weak<Pview>,
    /// Page index within the view.
    pub idx: usize,
}

/// Per-slot metadata.
pub struct PerPage {
    pub pfn: usize,
    pub flags: PpFlags,
    pub refs: usize,
    pub atl: Vec<AtlEntry>,
}

impl PerPage {
    fn new() -> Self {
        Self {
            pfn: 0,
            flags: PpFlags::empty(),
            refs: 0,
            atl: Vec::new(),
        }
    }
}

/// Completion hook for asynchronous slot writes.
pub type IoDone = fn(&Arc<Pset>, usize);

/// The filling strategy of a pset.
pub trait PsetOps: Send + Sync {
    fn kind(&self) -> PsetKind;

    /// Make the slot valid.  Called with the slot locked and invalid.
    fn fill_slot(&self, ps: &Arc<Pset>, idx: usize) -> Result<()>;

    /// Push the slot to backing store.  Slot locked and valid; with a
    /// completion the I/O is asynchronous and the completion releases
    /// the slot.
    fn write_slot(&self, ps: &Arc<Pset>, idx: usize, iodone: Option<IoDone>) -> Result<()>;

    /// Type-specific setup after the generic allocation.
    fn init(&self, _ps: &Arc<Pset>) -> Result<()> {
        Ok(())
    }

    /// Fix up type-specific state when `old` is being copied to `new`.
    fn dup(&self, _old: &Arc<Pset>, _new: &Arc<Pset>) {}

    /// Type-specific teardown at final dereference.
    fn free(&self, ps: &Pset);

    /// The slot's reference count hit zero.
    fn last_ref(&self, ps: &Arc<Pset>, idx: usize);

    /// For COW sets, the master this set shadows.
    fn cow_parent(&self) -> Option<&Arc<Pset>> {
        None
    }

    /// A fresh ops value of the same type, for [`copy_pset`].
    fn clone_ops(&self) -> Box<dyn PsetOps>;
}

pub struct Pset {
    len: usize,
    /// Offset into the master set, for COW members.
    off: usize,
    flags: CpuCell<PsetFlags>,
    refs: CpuCell<usize>,
    /// Guards slot search and the lock bits.
    pub lock: Spinlock<()>,
    /// Held slot locks, for sanity checks.
    nlocks: CpuCell<usize>,
    /// Slept on by contended slot lockers.
    lockwait: Sema,
    /// First swap block backing this set, or zero.
    swapblk: CpuCell<usize>,
    perpage: Box<[NullLock<PerPage>]>,
    ops: Box<dyn PsetOps>,
    /// COW sets shadowing this one; non-owning backlinks.
    cowsets: NullLock<Vec<Weak<Pset>>>,
    dead: CpuCell<bool>,
}

impl Pset {
    /// Common allocation.  The caller supplies ops and any swap.
    pub(crate) fn alloc(pages: usize, off: usize, ops: Box<dyn PsetOps>) -> Arc<Pset> {
        assert!(pages > 0, "alloc_pset: empty");
        let ps = Arc::new(Pset {
            len: pages,
            off,
            flags: CpuCell::new(PsetFlags::empty()),
            refs: CpuCell::new(0),
            lock: Spinlock::new(()),
            nlocks: CpuCell::new(0),
            lockwait: Sema::new(0),
            swapblk: CpuCell::new(0),
            perpage: (0..pages)
                .map(|_| NullLock::new(PerPage::new()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            ops,
            cowsets: NullLock::new(Vec::new()),
            dead: CpuCell::new(false),
        });
        ps.ops().init(&ps).expect("pset init");
        ps
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn off(&self) -> usize {
        self.off
    }

    pub fn kind(&self) -> PsetKind {
        self.ops.kind()
    }

    pub fn refs(&self) -> usize {
        self.refs.get()
    }

    pub fn swapblk(&self) -> usize {
        self.swapblk.get()
    }

    pub(crate) fn set_swapblk(&self, blk: usize) {
        self.swapblk.set(blk);
    }

    pub fn pset_flags(&self) -> PsetFlags {
        self.flags.get()
    }

    pub fn set_shared(&self) {
        self.flags.update(|f| f | PsetFlags::SHARED);
    }

    /// The type-specific operations behind this set.
    pub fn ops(&self) -> &dyn PsetOps {
        &*self.ops
    }

    /// Access the slot metadata.  Caller observes the mutation rules.
    pub fn pp<R>(&self, idx: usize, f: impl FnOnce(&mut PerPage) -> R) -> R {
        debug_assert!(idx < self.len, "find_pp: bad index");
        self.perpage[idx].lock(f)
    }

    /// Lock a slot.  Caller holds the pset lock and passes it in; it
    /// is released either way, and on return the slot is locked.
    pub fn lock_slot(&self, guard: SpinGuard<'_, ()>, idx: usize) {
        let mut g = guard;
        self.nlocks.update(|n| n + 1);
        loop {
            let got = self.pp(idx, |pp| {
                if pp.flags.contains(PpFlags::LOCK) {
                    pp.flags.insert(PpFlags::WANT);
                    false
                } else {
                    pp.flags.insert(PpFlags::LOCK);
                    true
                }
            });
            if got {
                drop(g);
                return;
            }
            // Collided with a parallel operation; wait it out.
            assert!(self.nlocks.get() > 1, "lock_slot: stray lock");
            self.lockwait.p_v_lock(Pri::Hi, g);
            g = self.lock.lock(Spl::Lo);
        }
    }

    /// Like [`Pset::lock_slot`] but never blocks: on a busy slot the
    /// pset lock is handed back.
    pub fn clock_slot<'a>(
        &'a self,
        guard: SpinGuard<'a, ()>,
        idx: usize,
    ) -> core::result::Result<(), SpinGuard<'a, ()>> {
        let busy = self.pp(idx, |pp| {
            if pp.flags.contains(PpFlags::LOCK) {
                true
            } else {
                pp.flags.insert(PpFlags::LOCK);
                false
            }
        });
        if busy {
            Err(guard)
        } else {
            self.nlocks.update(|n| n + 1);
            drop(guard);
            Ok(())
        }
    }

    /// Release a held slot, waking anyone who wanted it.
    pub fn unlock_slot(&self, idx: usize) {
        let g = self.lock.lock(Spl::Lo);
        self.nlocks.update(|n| n - 1);
        let wanted = self.pp(idx, |pp| {
            debug_assert!(pp.flags.contains(PpFlags::LOCK), "unlock_slot: not locked");
            let w = pp.flags.contains(PpFlags::WANT);
            pp.flags.remove(PpFlags::LOCK | PpFlags::WANT);
            w
        });
        if wanted && self.lockwait.blocked() {
            self.lockwait.vall();
        }
        drop(g);
    }

    /// Add a reference to a slot.  Slot locked by caller.
    pub fn ref_slot(&self, idx: usize) {
        self.pp(idx, |pp| {
            pp.refs += 1;
        });
    }

    /// Drop a reference; at zero the type hears about it.
    pub fn deref_slot(self: &Arc<Self>, idx: usize) {
        let zero = self.pp(idx, |pp| {
            debug_assert!(pp.refs > 0, "deref_slot: zero");
            pp.refs -= 1;
            pp.refs == 0
        });
        if zero {
            debug_assert!(
                self.pp(idx, |pp| pp.flags.contains(PpFlags::V)),
                "deref_slot: ref !v"
            );
            self.ops.last_ref(self, idx);
        }
    }

    /// Count of valid slots; teardown sanity.
    pub fn valid_slots(&self) -> usize {
        (0..self.len)
            .filter(|&i| self.pp(i, |pp| pp.flags.contains(PpFlags::V)))
            .count()
    }

    pub(crate) fn add_cowset(self: &Arc<Self>, child: &Arc<Pset>) {
        ref_pset(self);
        let g = self.lock.lock(Spl::Lo);
        self.cowsets.lock(|c| c.push(Arc::downgrade(child)));
        drop(g);
    }

    pub(crate) fn remove_cowset(self: &Arc<Self>, child: &Pset) {
        let g = self.lock.lock(Spl::Lo);
        self.cowsets.lock(|c| {
            let before = c.len();
            c.retain(|w| match w.upgrade() {
                Some(p) => !core::ptr::eq(&*p as *const Pset, child as *const Pset),
                None => false,
            });
            assert!(c.len() < before, "cow free: lost cow");
        });
        drop(g);
    }

    pub fn cow_children(&self) -> Vec<Arc<Pset>> {
        self.cowsets
            .lock(|c| c.iter().filter_map(Weak::upgrade).collect())
    }
}

impl core::fmt::Debug for Pset {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pset")
            .field("kind", &self.kind())
            .field("len", &self.len)
            .field("refs", &self.refs.get())
            .finish()
    }
}

/// Add a reference to a pset.
pub fn ref_pset(ps: &Arc<Pset>) {
    debug_assert!(!ps.dead.get(), "ref_pset: dead");
    ps.refs.update(|r| r + 1);
}

/// Drop a reference; the final one tears the set down and releases
/// its swap.
pub fn deref_pset(ps: &Arc<Pset>) {
    debug_assert!(ps.refs.get() > 0, "deref_pset: 0 ref");
    let g = ps.lock.lock(Spl::Lo);
    let refs = ps.refs.update(|r| r - 1);
    drop(g);
    if refs == 0 {
        ps.dead.set(true);
        ps.ops.free(ps);
        let blk = ps.swapblk.get();
        if blk != 0 {
            vm_swap::free_swap(blk, ps.len);
        }
    }
}

/// Generic code for flushing a slot to its swap block.  Shared by the
/// COW and ZFOD types.  For async I/O the slot stays locked until the
/// completion runs; for sync it is still held on return.
pub fn pset_writeslot(ps: &Arc<Pset>, idx: usize, iodone: Option<IoDone>) -> Result<()> {
    debug_assert!(
        ps.pp(idx, |pp| pp.flags.contains(PpFlags::V)),
        "writeslot: invalid"
    );
    let pfn = ps.pp(idx, |pp| {
        pp.flags.remove(PpFlags::M);
        pp.flags.insert(PpFlags::SWAPPED);
        pp.pfn
    });
    match iodone {
        None => {
            let dev = vm_swap::swapdev().ok_or(Err::Io)?;
            let off = ptob(idx + ps.swapblk.get());
            if vm_swap::pageio(pfn, &dev, off, machine::NBPG, crate::param::FS_ABSWRITE).is_err() {
                ps.pp(idx, |pp| pp.flags.insert(PpFlags::BAD));
                return Err(Err::Io);
            }
            Ok(())
        }
        Some(done) => {
            crate::qio::qio_write(ps, idx, done);
            Ok(())
        }
    }
}

/// Completion that simply releases the slot.
pub fn iodone_unlock(ps: &Arc<Pset>, idx: usize) {
    ps.pp(idx, |pp| pp.flags.remove(PpFlags::R | PpFlags::M));
    ps.unlock_slot(idx);
}

/// Allocate a physical page for slot `idx` of `ps`, tagging the core
/// map.  Blocks in the swap-wait pool when memory is tight only at the
/// callers that can; here exhaustion is an error.
pub(crate) fn alloc_slot_page(ps: &Arc<Pset>, idx: usize) -> Result<usize> {
    let k = cur_kernel();
    let pfn = k.pmem.alloc_page().map_err(|_| Err::NoMem)?;
    k.coremap.set_core(pfn, ps, idx);
    Ok(pfn)
}

/// Return a page to the pool.
pub(crate) fn free_page(pfn: usize) {
    let k = cur_kernel();
    k.coremap.clear_core(pfn);
    k.pmem.free_page(pfn);
}

/// Copy one slot's content into a new page under a new pset: memory to
/// memory when resident, otherwise back in from the old set's swap.
fn copy_page(idx: usize, old: &Arc<Pset>, new: &Arc<Pset>) {
    let k = cur_kernel();
    let Ok(pfn) = alloc_slot_page(new, idx) else {
        new.pp(idx, |pp| pp.flags.insert(PpFlags::BAD));
        return;
    };
    let valid = old.pp(idx, |pp| pp.flags.contains(PpFlags::V));
    if valid {
        let opfn = old.pp(idx, |pp| pp.pfn);
        k.pmem.copy(opfn, pfn);
    } else {
        debug_assert!(
            old.pp(idx, |pp| pp.flags.contains(PpFlags::SWAPPED)),
            "copy_page: !v !swap"
        );
        let dev = vm_swap::swapdev();
        let read_ok = dev
            .map(|d| {
                vm_swap::pageio(
                    pfn,
                    &d,
                    ptob(idx + old.swapblk.get()),
                    machine::NBPG,
                    crate::param::FS_ABSREAD,
                )
                .is_ok()
            })
            .unwrap_or(false);
        if !read_ok {
            // The I/O failed; the new set is in for a rough ride.
            new.pp(idx, |pp| pp.flags.insert(PpFlags::BAD));
            free_page(pfn);
            return;
        }
    }
    new.pp(idx, |pp| {
        pp.flags.insert(PpFlags::V);
        pp.pfn = pfn;
    });
}

/// Duplicate slot contents from `old` into `new`.
///
/// COW-shared valid slots are skipped: the copy can refill them from
/// the master on demand.  Anything else valid or swapped is copied,
/// and the state is re-checked after the slot lock is taken since we
/// may have slept on it.
fn dup_slots(old: &Arc<Pset>, new: &Arc<Pset>) {
    let mut guard = Some(old.lock.lock(Spl::Lo));
    for idx in 0..new.len {
        let g = guard.take().unwrap_or_else(|| old.lock.lock(Spl::Lo));
        let interesting = old.pp(idx, |pp| {
            pp.flags.intersects(PpFlags::V | PpFlags::SWAPPED)
        });
        if !interesting {
            guard = Some(g);
            continue;
        }
        old.lock_slot(g, idx);
        let cow_shared = old.pp(idx, |pp| {
            pp.flags.contains(PpFlags::V | PpFlags::COW)
        });
        if !cow_shared {
            copy_page(idx, old, new);
        }
        old.unlock_slot(idx);
    }
    drop(guard);
}

/// Copy one pset into another of the same type.
pub fn copy_pset(old: &Arc<Pset>) -> Arc<Pset> {
    let new = Pset::alloc(old.len, old.off, old.ops.clone_ops());
    new.flags.set(old.flags.get());
    old.ops.dup(old, &new);
    if old.swapblk.get() != 0 {
        new.swapblk.set(vm_swap::alloc_swap(new.len));
    }
    dup_slots(old, &new);
    new
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            kernel::Kernel,
            pset_mem::physmem_pset,
            pset_zfod::alloc_pset_zfod,
        },
    };

    #[test]
    fn slot_lock_uncontended() {
        let k = Kernel::boot_quiet();
        let _e = k.enter_for_test();
        let ps = alloc_pset_zfod(2);
        let g = ps.lock.lock(Spl::Lo);
        ps.lock_slot(g, 0);
        assert!(ps.pp(0, |pp| pp.flags.contains(PpFlags::LOCK)));
        // The conditional flavour bounces off a held slot.
        let g = ps.lock.lock(Spl::Lo);
        assert!(ps.clock_slot(g, 0).is_err());
        ps.unlock_slot(0);
        assert!(!ps.pp(0, |pp| pp.flags.contains(PpFlags::LOCK)));
        let g = ps.lock.lock(Spl::Lo);
        assert!(ps.clock_slot(g, 0).is_ok());
        ps.unlock_slot(0);
    }

    #[test]
    fn fill_ref_deref_cycle() {
        let k = Kernel::boot_quiet();
        let _e = k.enter_for_test();
        let free0 = k.pmem.frames_free();
        let ps = alloc_pset_zfod(1);
        ref_pset(&ps);

        let g = ps.lock.lock(Spl::Lo);
        ps.lock_slot(g, 0);
        ps.ops().fill_slot(&ps, 0).unwrap();
        assert!(ps.pp(0, |pp| pp.flags.contains(PpFlags::V)));
        assert_eq!(ps.pp(0, |pp| pp.refs), 1);
        ps.ref_slot(0);
        ps.deref_slot(0);
        assert!(ps.pp(0, |pp| pp.flags.contains(PpFlags::V)));
        // Last reference frees the page and invalidates the slot.
        ps.deref_slot(0);
        assert!(!ps.pp(0, |pp| pp.flags.contains(PpFlags::V)));
        ps.unlock_slot(0);
        assert_eq!(k.pmem.frames_free(), free0);

        deref_pset(&ps);
        assert_eq!(ps.refs(), 0);
    }

    #[test]
    fn copy_pset_duplicates_resident_slots() {
        let k = Kernel::boot_quiet();
        let _e = k.enter_for_test();
        let ps = alloc_pset_zfod(2);
        ref_pset(&ps);
        let g = ps.lock.lock(Spl::Lo);
        ps.lock_slot(g, 1);
        ps.ops().fill_slot(&ps, 1).unwrap();
        let pfn = ps.pp(1, |pp| pp.pfn);
        cur_kernel().pmem.write(pfn, 0, &[7, 7, 7]);
        ps.unlock_slot(1);

        let copy = copy_pset(&ps);
        assert_eq!(copy.kind(), PsetKind::Zfod);
        assert_eq!(copy.len(), 2);
        // Slot 0 was never filled and stays invalid in the copy.
        assert!(!copy.pp(0, |pp| pp.flags.contains(PpFlags::V)));
        let cpfn = copy.pp(1, |pp| (pp.flags.contains(PpFlags::V)).then_some(pp.pfn));
        let cpfn = cpfn.expect("slot 1 not copied");
        assert_ne!(cpfn, pfn);
        let mut b = [0u8; 3];
        cur_kernel().pmem.read(cpfn, 0, &mut b);
        assert_eq!(b, [7, 7, 7]);
    }

    #[test]
    fn physmem_slots_are_preloaded() {
        let k = Kernel::boot_quiet();
        let _e = k.enter_for_test();
        let ps = physmem_pset(5, 3);
        assert_eq!(ps.kind(), PsetKind::Mem);
        for i in 0..3 {
            assert!(ps.pp(i, |pp| pp.flags.contains(PpFlags::V)));
            assert_eq!(ps.pp(i, |pp| pp.pfn), 5 + i);
        }
        // Write-back is just a modify-bit clear.
        ps.pp(0, |pp| pp.flags.insert(PpFlags::M));
        ps.ops().write_slot(&ps, 0, None).unwrap();
        assert!(!ps.pp(0, |pp| pp.flags.contains(PpFlags::M)));
    }
}
