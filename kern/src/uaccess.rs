/*
 * SPDX-License-Identifier: MIT
 */

//! Kernel access to user memory.
//!
//! All copies go through the HAT, faulting pages in as an MMU-driven
//! access would.  A fault the resolver cannot satisfy unwinds to the
//! copy's failure path — the recoverable-probe discipline — rather
//! than taking the thread down.

use {
    crate::{
        err::{Err, Result},
        kernel::cur_kernel,
        vas::Vas,
        vm_fault::vas_fault,
    },
    machine::{pgdown, pgoff, NBPG},
    std::sync::Arc,
};

fn resolve(vas: &Arc<Vas>, va: usize, write: bool) -> Result<usize> {
    for _ in 0..2 {
        match vas.hat.translate(va, write) {
            Ok(pfn) => return Ok(pfn),
            Err(_) => {
                vas_fault(vas, pgdown(va), write).map_err(|_| Err::Fault)?;
            }
        }
    }
    // The fault "succeeded" without installing a usable translation.
    panic!("uaccess: unresolvable after fault");
}

/// Copy user memory into a kernel buffer.
pub fn copyin(vas: &Arc<Vas>, mut uaddr: usize, buf: &mut [u8]) -> Result<()> {
    let k = cur_kernel();
    let mut done = 0;
    while done < buf.len() {
        let pfn = resolve(vas, uaddr, false)?;
        let off = pgoff(uaddr);
        let n = (NBPG - off).min(buf.len() - done);
        k.pmem.read(pfn, off, &mut buf[done..done + n]);
        uaddr += n;
        done += n;
    }
    Ok(())
}

/// Copy a kernel buffer out to user memory.
pub fn copyout(vas: &Arc<Vas>, mut uaddr: usize, data: &[u8]) -> Result<()> {
    let k = cur_kernel();
    let mut done = 0;
    while done < data.len() {
        let pfn = resolve(vas, uaddr, true)?;
        let off = pgoff(uaddr);
        let n = (NBPG - off).min(data.len() - done);
        k.pmem.write(pfn, off, &data[done..done + n]);
        uaddr += n;
        done += n;
    }
    Ok(())
}

/// Copy user-to-user within one vas (reply segments landing in the
/// caller's buffers).
pub fn copy_within(vas: &Arc<Vas>, from: usize, to: usize, len: usize) -> Result<()> {
    let mut buf = vec![0u8; len.min(NBPG)];
    let mut done = 0;
    while done < len {
        let n = buf.len().min(len - done);
        copyin(vas, from + done, &mut buf[..n])?;
        copyout(vas, to + done, &buf[..n])?;
        done += n;
    }
    Ok(())
}
