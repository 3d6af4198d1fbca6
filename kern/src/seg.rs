/*
 * SPDX-License-Identifier: MIT
 */

//! Message segments.
//!
//! A segment is a kernel view sharing the pages under a stretch of
//! some address space — no bytes are copied to build one.  Mapping a
//! segment into a receiver attaches that view; the pages then fault in
//! through the shared pset exactly as they would for their owner.

use {
    crate::{
        err::{Err, Result},
        kernel::cur_kernel,
        pset::free_page,
        pset_mem::physmem_pset,
        pview::{alloc_pview, dup_pview, free_pview, Pview},
        uaccess,
        vas::{attach_pview, detach_pview, find_pview, Vas},
    },
    machine::{btop, btorp, hat::Prot, pgoff, sync::CpuCell, NBPG},
    std::sync::Arc,
};

pub struct Seg {
    pub view: Arc<Pview>,
    /// Byte offset of the data within the view.
    pub off: usize,
    /// Byte length of the data.
    pub len: usize,
    /// Frame to give back when a kernel-built segment dies.
    owned_frame: Option<usize>,
    attached: CpuCell<bool>,
}

impl Seg {
    /// Data address once attached.
    pub fn vaddr(&self) -> usize {
        debug_assert!(self.attached.get(), "seg vaddr: not attached");
        self.view.vaddr.get() + self.off
    }
}

/// Build a segment over `[buf, buf + len)` of `vas`.  The range must
/// lie within one view.
pub fn make_seg(vas: &Arc<Vas>, buf: usize, len: usize) -> Result<Seg> {
    if len == 0 {
        return Err(Err::Inval);
    }
    let pv = find_pview(vas, buf).ok_or(Err::Fault)?;
    if !pv.contains(buf + len - 1) {
        return Err(Err::Fault);
    }
    let view = dup_pview(&pv);
    let skip = btop(buf - pv.vaddr.get());
    view.off.update(|o| o + skip);
    view.len.set(btorp(pgoff(buf) + len));
    view.vaddr.set(0);
    view.prot.update(|p| p - (Prot::MMAP | Prot::FORK));
    Ok(Seg {
        view,
        off: pgoff(buf),
        len,
        owned_frame: None,
        attached: CpuCell::new(false),
    })
}

/// Wrap kernel-generated bytes into a segment the receiver can map.
pub fn kern_mem_bytes(data: &[u8]) -> Result<Seg> {
    assert!(data.len() <= NBPG, "kern seg too large");
    let k = cur_kernel();
    let pfn = k.pmem.alloc_page().map_err(|_| Err::NoMem)?;
    k.pmem.zero(pfn);
    k.pmem.write(pfn, 0, data);
    let ps = physmem_pset(pfn, 1);
    let view = alloc_pview(&ps);
    view.prot.set(Prot::RO);
    Ok(Seg {
        view,
        off: 0,
        len: data.len(),
        owned_frame: Some(pfn),
        attached: CpuCell::new(false),
    })
}

/// Wrap an existing frame (a page being paged in or out) so the
/// transfer rides the ordinary message path.
pub fn kern_mem_frame(pfn: usize, len: usize) -> Seg {
    assert!(len <= NBPG, "kern seg too large");
    let ps = physmem_pset(pfn, 1);
    let view = alloc_pview(&ps);
    Seg {
        view,
        off: 0,
        len,
        owned_frame: None,
        attached: CpuCell::new(false),
    }
}

/// Map a segment into `vas`; returns the data address there.
pub fn attach_seg(vas: &Arc<Vas>, seg: &Seg) -> Result<usize> {
    debug_assert!(!seg.attached.get(), "attach_seg: attached");
    seg.view.vaddr.set(0);
    attach_pview(vas, &seg.view)?;
    seg.attached.set(true);
    Ok(seg.vaddr())
}

/// Unmap a segment, releasing translations and slot references.
pub fn detach_seg(seg: &Seg) {
    if !seg.attached.get() {
        return;
    }
    let vas = seg.view.vas().expect("detach_seg: no vas");
    let pv = detach_pview(&vas, seg.view.vaddr.get());
    debug_assert!(Arc::ptr_eq(&pv, &seg.view), "detach_seg: wrong view");
    seg.attached.set(false);
}

/// Release the references a segment holds.
pub fn free_seg(seg: Seg) {
    debug_assert!(!seg.attached.get(), "free_seg: still attached");
    free_pview(&seg.view);
    if let Some(pfn) = seg.owned_frame {
        free_page(pfn);
    }
}

/// Read a segment's bytes by briefly mapping it into the current
/// address space.
pub fn seg_copyin(vas: &Arc<Vas>, seg: &Seg, buf: &mut [u8]) -> Result<()> {
    debug_assert!(buf.len() <= seg.len, "seg_copyin: over-read");
    let was = seg.attached.get();
    let addr = if was {
        seg.vaddr()
    } else {
        attach_seg(vas, seg)?
    };
    let res = uaccess::copyin(vas, addr, buf);
    if !was {
        detach_seg(seg);
    }
    res
}

/// Total data bytes across segments.
pub fn segs_len(segs: &[Seg]) -> usize {
    segs.iter().map(|s| s.len).sum()
}
