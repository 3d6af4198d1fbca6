/*
 * SPDX-License-Identifier: MIT
 */

//! The user interface to the VM system, and the mapped-file cache.

use {
    crate::{
        err::{Err, Result},
        kernel::cur_thread,
        msg::kernmsg_send,
        mutex::Pri,
        param::FS_FID,
        perm::issys,
        port::{dup_port, find_portref, MapCache, Port, PortFlags, Portref},
        pset::{deref_pset, ref_pset, Pset},
        pset_cow::alloc_pset_cow,
        pset_fod::alloc_pset_fod,
        pset_mem::physmem_pset,
        pset_zfod::alloc_pset_zfod,
        pview::{alloc_pview, free_pview, Pview},
        vas::{attach_pview, find_pview, overlapping_pview, remove_pview, Vas},
    },
    bitflags::bitflags,
    machine::{btop, btorp, hat::Prot, pgoff},
    std::sync::Arc,
};

bitflags! {
    pub struct MapFlags: u32 {
        const ANON = 0x01;
        const FILE = 0x02;
        const FIXED = 0x04;
        const PHYS = 0x08;
        const PRIVATE = 0x10;
        const SHARED = 0x20;
    }
}

pub const PROT_READ: u32 = 0x1;
pub const PROT_WRITE: u32 = 0x2;

/// Map something into the calling process.  Many combinations of
/// options are not allowed.
pub fn mmap(
    addr: usize,
    len: usize,
    prot: u32,
    flags: MapFlags,
    portid: usize,
    offset: usize,
) -> Result<usize> {
    let t = cur_thread();
    let p = Arc::clone(&t.proc);
    let vas = Arc::clone(&p.vas);
    if len == 0 {
        return Err(Err::Inval);
    }

    // Anonymous memory.  Keep it simple: read-only ZFOD???
    if flags.contains(MapFlags::ANON) {
        if flags.intersects(MapFlags::FILE | MapFlags::FIXED | MapFlags::PHYS)
            || prot & PROT_WRITE == 0
        {
            return Err(Err::Inval);
        }
        let ps = alloc_pset_zfod(btorp(len));
        if flags.contains(MapFlags::SHARED) {
            ps.set_shared();
        }
        let pv = alloc_pview(&ps);
        // Flagged as from mmap() so munmap() can tell user views from
        // ones the kernel built internally.
        pv.prot.update(|pr| pr | Prot::MMAP);
        pv.vaddr.set(addr);
        match attach_pview(&vas, &pv) {
            Ok(va) => return Ok(va),
            Err(e) => {
                free_pview(&pv);
                return Err(e);
            }
        }
    }

    // Physical mapping, for device servers.
    if flags.contains(MapFlags::PHYS) {
        if flags.intersects(MapFlags::FILE | MapFlags::FIXED) {
            return Err(Err::Inval);
        }
        if !issys() {
            return Err(Err::Perm);
        }
        let ps = physmem_pset(btop(addr), btorp(len));
        ps.set_shared();
        let pv = alloc_pview(&ps);
        pv.prot.set(Prot::MMAP);
        pv.vaddr.set(0);
        match attach_pview(&vas, &pv) {
            Ok(va) => return Ok(va),
            Err(e) => {
                free_pview(&pv);
                return Err(e);
            }
        }
    }

    // A read-only or copy-on-write view of a file.
    if flags.contains(MapFlags::FILE) {
        // Writing back to a server via mmap() is nasty to do; insist
        // on copy-on-write for writable maps.
        if prot & PROT_WRITE != 0 && !flags.contains(MapFlags::PRIVATE) {
            return Err(Err::Inval);
        }
        let pr = find_portref(&p, portid)?;
        let view_prot = if prot & PROT_WRITE != 0 {
            Prot::MMAP
        } else {
            Prot::RO | Prot::MMAP
        };
        let res = add_map(
            &vas,
            &pr,
            addr,
            btorp(len + pgoff(offset)),
            btop(offset),
            view_prot,
        );
        pr.sema.v();
        return res.map(|pv| pv.vaddr.get());
    }

    Err(Err::Inval)
}

/// Unmap the user-created view containing `vaddr`.
pub fn munmap(vaddr: usize, _len: usize) -> Result<i64> {
    let t = cur_thread();
    let vas = Arc::clone(&t.proc.vas);
    let pv = find_pview(&vas, vaddr).ok_or(Err::Inval)?;
    // Only views made by mmap() may go; clearing the bit here also
    // keeps a second thread from racing into the teardown.
    if !pv.prot.get().contains(Prot::MMAP) {
        return Err(Err::Busy);
    }
    pv.prot.update(|p| p - Prot::MMAP);
    remove_pview(&vas, vaddr);
    Ok(0)
}

/// Get the pset caching the file behind `pr`, coalescing concurrent
/// mappings of one file identity.  Caller holds `pr.sema`; the pset
/// comes back carrying an extra reference the caller must drop.
fn get_map_pset(pr: &Arc<Portref>) -> Result<Arc<Pset>> {
    let port = match pr.port() {
        Some(port) if !port.flags.get().contains(PortFlags::CLOSING) => port,
        _ => return Err(Err::Io),
    };
    let _ = port.mapsema.p(Pri::Hi);

    // Ask the server who this file is and how big.
    let mut args = [0i64; 2];
    if kernmsg_send(pr, FS_FID, &mut args).is_err() {
        port.mapsema.v();
        return Err(Err::Inval);
    }
    let fid = args[0] as u64;
    let size = args[1] as usize;
    if size == 0 {
        port.mapsema.v();
        return Err(Err::Inval);
    }

    let cached = port.maps.lock(|m| match m {
        MapCache::Closed => None,
        MapCache::Unused => {
            *m = MapCache::Map(Default::default());
            Some(None)
        }
        MapCache::Map(h) => Some(h.get(&fid).cloned()),
    });
    let Some(cached) = cached else {
        port.mapsema.v();
        return Err(Err::Io);
    };

    // A size change means the cached image is stale.
    let cached = match cached {
        Some(ps) if ps.len() != size => {
            port.maps.lock(|m| {
                if let MapCache::Map(h) = m {
                    h.remove(&fid);
                }
            });
            deref_pset(&ps);
            None
        }
        other => other,
    };

    let ps = match cached {
        Some(ps) => ps,
        None => {
            // Build the cache entry over its own connection; the
            // entry in the hash counts as a reference.
            let newpr = match dup_port(pr) {
                Ok(npr) => npr,
                Err(e) => {
                    port.mapsema.v();
                    return Err(e);
                }
            };
            let ps = alloc_pset_fod(newpr, size);
            ref_pset(&ps);
            port.maps.lock(|m| {
                if let MapCache::Map(h) = m {
                    h.insert(fid, Arc::clone(&ps));
                }
            });
            ps
        }
    };

    // The placeholder ref, so the set survives while views attach.
    ref_pset(&ps);
    port.mapsema.v();
    Ok(ps)
}

/// Add an mmap view of the file behind `pr`.  Lengths and offsets are
/// in pages.  Caller holds `pr.sema`.
pub fn add_map(
    vas: &Arc<Vas>,
    pr: &Arc<Portref>,
    vaddr: usize,
    len: usize,
    off: usize,
    prot: Prot,
) -> Result<Arc<Pview>> {
    // Landing on an existing mapping would be Not Acceptable.
    if vaddr != 0 && overlapping_pview(vas, vaddr, len) {
        return Err(Err::Exists);
    }

    let ps = get_map_pset(pr)?;

    let pv = if prot.contains(Prot::RO) {
        // Read-only: a simple view into the cached set.
        let pv = alloc_pview(&ps);
        if pv.len.get() > off {
            pv.off.set(off);
            pv.len.update(|l| l - off);
        }
        pv
    } else {
        // Read-write: interpose a copy-on-write set over the cache.
        // The shadow cannot run past the file it shadows.
        let within = ps.len().saturating_sub(off);
        if within == 0 {
            deref_pset(&ps);
            return Err(Err::Inval);
        }
        let ps2 = alloc_pset_cow(&ps, off, len.min(within));
        let pv = alloc_pview(&ps2);
        pv.off.set(0);
        pv
    };
    if len < pv.len.get() {
        pv.len.set(len);
    }
    pv.vaddr.set(vaddr);
    pv.prot.set(prot);

    let res = attach_pview(vas, &pv);
    // Drop the placeholder ref from get_map_pset().
    deref_pset(&ps);
    match res {
        Ok(_) => Ok(pv),
        Err(_) => {
            free_pview(&pv);
            Err(Err::Inval)
        }
    }
}

/// Tear down a port's mapped-file cache and poison it against reuse.
pub fn mmap_cleanup(port: &Port) {
    let _ = port.mapsema.p(Pri::Hi);
    let old = port.maps.lock(|m| std::mem::replace(m, MapCache::Closed));
    if let MapCache::Map(h) = old {
        for (_, ps) in h {
            deref_pset(&ps);
        }
    }
    port.mapsema.v();
}

/// Server-driven eviction: drop any cached pset for `fid` on one of
/// our ports.
pub fn unhash(portid: usize, fid: u64) -> Result<i64> {
    let t = cur_thread();
    let p = Arc::clone(&t.proc);
    let port = crate::port::find_port_ref(&p, portid)?;
    let _ = port.mapsema.p(Pri::Hi);
    let ps = port.maps.lock(|m| match m {
        MapCache::Map(h) => h.remove(&fid),
        _ => None,
    });
    if let Some(ps) = ps {
        deref_pset(&ps);
    }
    port.mapsema.v();
    Ok(0)
}
