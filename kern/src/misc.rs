/*
 * SPDX-License-Identifier: MIT
 */

//! Miscellaneous support: error reporting, counted user strings, and
//! the small privileged odds and ends of the syscall surface.

use {
    crate::{
        err::{Err, Result},
        kernel::cur_thread,
        mutex::Spl,
        perm::{io_priv, issys, IOPRIV_IO},
        proc::WiredPage,
        uaccess::copyin,
        vas::{find_pview, Vas},
        vm_fault::vas_fault,
    },
    machine::btop,
    std::sync::Arc,
};

/// The current thread's last error string, for the `strerror`
/// syscall.
pub fn strerror() -> String {
    cur_thread()
        .last_err()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "ok".to_string())
}

/// Fetch a counted user string, enforcing sanity.
pub fn get_ustr(vas: &Arc<Vas>, uaddr: usize, ulen: usize, max: usize) -> Result<String> {
    if ulen + 1 > max {
        return Err(Err::Inval);
    }
    let mut buf = vec![0u8; ulen];
    copyin(vas, uaddr, &mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    buf.truncate(end);
    if buf.is_empty() {
        return Err(Err::Inval);
    }
    String::from_utf8(buf).map_err(|_| Err::Inval)
}

/// Let a sufficiently privileged thread at I/O instructions.  The
/// hosted machine has no I/O ports, so this is the permission check
/// and nothing else.
pub fn enable_io() -> Result<i64> {
    if io_priv() & IOPRIV_IO == 0 {
        return Err(Err::Perm);
    }
    Ok(0)
}

/// DMA enable: the same story.
pub fn enable_dma() -> Result<i64> {
    if !issys() {
        return Err(Err::Perm);
    }
    Ok(0)
}

/// Pin the page under `vaddr` for device I/O and report its frame.
/// Returns `(handle, pfn)`.
pub fn page_wire(vaddr: usize) -> Result<(usize, usize)> {
    if !issys() {
        return Err(Err::Perm);
    }
    let t = cur_thread();
    let p = Arc::clone(&t.proc);
    let vas = Arc::clone(&p.vas);
    vas_fault(&vas, vaddr, true)?;

    let pv = find_pview(&vas, vaddr).ok_or(Err::Fault)?;
    let ps = Arc::clone(&pv.set);
    let idx = btop(vaddr - pv.vaddr.get()) + pv.off.get();
    let g = ps.lock.lock(Spl::Lo);
    ps.lock_slot(g, idx);
    ps.ref_slot(idx);
    let pfn = ps.pp(idx, |pp| pp.pfn);
    ps.unlock_slot(idx);

    let handle = p.wired.lock(|w| {
        w.push(Some(WiredPage {
            ps: Arc::clone(&ps),
            idx,
            vaddr,
        }));
        w.len() - 1
    });
    Ok((handle, pfn))
}

/// Release a wired page.
pub fn page_release(handle: usize) -> Result<i64> {
    let t = cur_thread();
    let p = Arc::clone(&t.proc);
    let w = p
        .wired
        .lock(|w| w.get_mut(handle).and_then(Option::take))
        .ok_or(Err::Inval)?;
    let g = w.ps.lock.lock(Spl::Lo);
    w.ps.lock_slot(g, w.idx);
    w.ps.deref_slot(w.idx);
    w.ps.unlock_slot(w.idx);
    Ok(0)
}

/// Drop into the kernel debugger, on builds that carry one.
pub fn debug_enter() -> Result<i64> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "kdb")] {
            log::warn!("debug_enter: no debugger attached");
            Ok(0)
        } else {
            Err(Err::Inval)
        }
    }
}
