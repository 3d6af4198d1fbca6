/*
 * SPDX-License-Identifier: MIT
 */

//! Physical page frames.
//!
//! A fixed pool of `NBPG`-sized frames with a free list.  Frame bytes
//! are reached through copy helpers rather than borrowed slices so no
//! reference outlives the caller's slot lock.

use {
    crate::{sync::NullLock, NBPG},
    core::cell::UnsafeCell,
    snafu::Snafu,
};

#[derive(Debug, Snafu)]
pub enum PmemError {
    /// The frame pool is exhausted.
    #[snafu(display("out of page frames"))]
    NoFrames,
}

struct Frame {
    bytes: UnsafeCell<[u8; NBPG]>,
}

// Frame contents are guarded by the kernel's slot locks plus the
// single-CPU baton; see machine::sync.
unsafe impl Sync for Frame {}

pub struct Pmem {
    frames: Box<[Frame]>,
    free: NullLock<Vec<usize>>,
}

impl Pmem {
    /// Build a pool of `nframes` zeroed frames, all free.
    pub fn new(nframes: usize) -> Self {
        let frames = (0..nframes)
            .map(|_| Frame {
                bytes: UnsafeCell::new([0u8; NBPG]),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // Hand frames out in ascending order.
        let free = (0..nframes).rev().collect();
        Self {
            frames,
            free: NullLock::new(free),
        }
    }

    pub fn nframes(&self) -> usize {
        self.frames.len()
    }

    pub fn frames_free(&self) -> usize {
        self.free.lock(|f| f.len())
    }

    /// Allocate one frame.  Contents are whatever the previous user
    /// left; fill strategies zero or overwrite as needed.
    pub fn alloc_page(&self) -> Result<usize, PmemError> {
        self.free
            .lock(|f| f.pop())
            .ok_or(PmemError::NoFrames)
    }

    /// Return a frame to the pool.
    pub fn free_page(&self, pfn: usize) {
        assert!(pfn < self.frames.len(), "free_page: bad pfn");
        self.free.lock(|f| {
            debug_assert!(!f.contains(&pfn), "free_page: double free");
            f.push(pfn)
        });
    }

    /// Copy bytes out of a frame.
    pub fn read(&self, pfn: usize, off: usize, buf: &mut [u8]) {
        assert!(off + buf.len() <= NBPG, "pmem read: range");
        let src = unsafe { &*self.frames[pfn].bytes.get() };
        buf.copy_from_slice(&src[off..off + buf.len()]);
    }

    /// Copy bytes into a frame.
    pub fn write(&self, pfn: usize, off: usize, data: &[u8]) {
        assert!(off + data.len() <= NBPG, "pmem write: range");
        let dst = unsafe { &mut *self.frames[pfn].bytes.get() };
        dst[off..off + data.len()].copy_from_slice(data);
    }

    /// Zero-fill a frame.
    pub fn zero(&self, pfn: usize) {
        let dst = unsafe { &mut *self.frames[pfn].bytes.get() };
        dst.fill(0);
    }

    /// Frame-to-frame copy.
    pub fn copy(&self, from: usize, to: usize) {
        assert_ne!(from, to, "pmem copy: aliased frames");
        let src = unsafe { &*self.frames[from].bytes.get() };
        let dst = unsafe { &mut *self.frames[to].bytes.get() };
        dst.copy_from_slice(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_exhaust_free() {
        let pm = Pmem::new(2);
        let a = pm.alloc_page().unwrap();
        let b = pm.alloc_page().unwrap();
        assert_ne!(a, b);
        assert!(pm.alloc_page().is_err());
        pm.free_page(a);
        assert_eq!(pm.alloc_page().unwrap(), a);
    }

    #[test]
    fn frame_bytes_round_trip() {
        let pm = Pmem::new(2);
        let a = pm.alloc_page().unwrap();
        let b = pm.alloc_page().unwrap();
        pm.write(a, 100, &[1, 2, 3]);
        pm.copy(a, b);
        let mut buf = [0u8; 3];
        pm.read(b, 100, &mut buf);
        assert_eq!(buf, [1, 2, 3]);
        pm.zero(b);
        pm.read(b, 100, &mut buf);
        assert_eq!(buf, [0, 0, 0]);
    }
}
