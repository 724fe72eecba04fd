//! Low-level persistence primitives
//!
//! Everything that makes bytes durable funnels through this module: either
//! cache-line flushes plus a store fence (real pmem), or a page-granular
//! `msync` (fallback). The per-pool dispatch table is a [`MemOps`] trait
//! object selected at open time.

#![allow(unused)]

use std::env;

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::{_mm_clflush, _mm_sfence};

const CACHELINE: usize = 64;
const PAGE: usize = 4096;

/// Tells if the mapped range behaves like persistent memory
///
/// Real detection requires platform support; like the original library, the
/// decision can be forced with `PMEM_IS_PMEM_FORCE=1` in the environment.
/// Anything else falls back to the page-sync dispatch.
pub fn is_pmem(_addr: *const u8, _len: usize) -> bool {
    match env::var_os("PMEM_IS_PMEM_FORCE") {
        Some(v) => v == "1",
        None => false,
    }
}

/// Flushes the cache lines covering `[addr, addr+len)` back to media
#[inline]
pub fn clflush(addr: *const u8, len: usize) {
    #[cfg(all(target_arch = "x86_64", not(feature = "no_persist")))]
    {
        let mut start = (addr as usize) & !(CACHELINE - 1);
        let end = addr as usize + len;
        while start < end {
            unsafe {
                _mm_clflush(start as *const u8);
            }
            start += CACHELINE;
        }
    }
}

/// Store fence; waits for in-flight flushes to drain
#[inline]
pub fn sfence() {
    #[cfg(all(target_arch = "x86_64", not(feature = "no_persist")))]
    unsafe {
        _mm_sfence();
    }
}

/// Synchronously writes the pages covering `[addr, addr+len)` back to media
#[inline]
pub fn msync(addr: *const u8, len: usize) {
    #[cfg(not(feature = "no_persist"))]
    unsafe {
        let off = addr as usize;
        let end = off + len;
        let pg = off & !(PAGE - 1);
        if libc::msync(pg as *mut libc::c_void, end - pg, libc::MS_SYNC) != 0 {
            panic!("msync failed");
        }
    }
}

/// Per-pool persistence dispatch
///
/// The contract: after `persist(addr, len)` returns, the bytes are durable
/// on media. `flush` begins durability, `drain` waits for in-flight flushes
/// to complete. These five entry points are the only way any module of this
/// crate makes data durable.
pub trait MemOps: Send + Sync {
    /// Makes `[addr, addr+len)` durable before returning
    fn persist(&self, addr: *const u8, len: usize);

    /// Begins durability for `[addr, addr+len)`
    fn flush(&self, addr: *const u8, len: usize);

    /// Waits for any in-flight flushes to complete
    fn drain(&self);

    /// Copy followed by `persist` of the destination
    fn memcpy_persist(&self, dst: *mut u8, src: *const u8, len: usize) {
        unsafe {
            std::ptr::copy_nonoverlapping(src, dst, len);
        }
        self.persist(dst, len);
    }

    /// Fill followed by `persist` of the destination
    fn memset_persist(&self, dst: *mut u8, c: u8, len: usize) {
        unsafe {
            std::ptr::write_bytes(dst, c, len);
        }
        self.persist(dst, len);
    }
}

/// Dispatch for mappings backed by real persistent memory
struct PmemOps;

impl MemOps for PmemOps {
    #[inline]
    fn persist(&self, addr: *const u8, len: usize) {
        clflush(addr, len);
        sfence();
    }

    #[inline]
    fn flush(&self, addr: *const u8, len: usize) {
        clflush(addr, len);
    }

    #[inline]
    fn drain(&self) {
        sfence();
    }
}

/// Dispatch for mappings that only support a synchronous page sync
struct MsyncOps;

impl MemOps for MsyncOps {
    #[inline]
    fn persist(&self, addr: *const u8, len: usize) {
        msync(addr, len);
    }

    #[inline]
    fn flush(&self, addr: *const u8, len: usize) {
        msync(addr, len);
    }

    #[inline]
    fn drain(&self) {}
}

static PMEM_OPS: PmemOps = PmemOps;
static MSYNC_OPS: MsyncOps = MsyncOps;

/// Selects the dispatch table for a pool mapping
pub fn dispatch(is_pmem: bool) -> &'static dyn MemOps {
    if cfg!(feature = "use_msync") || !is_pmem {
        &MSYNC_OPS
    } else {
        &PMEM_OPS
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dispatch_follows_medium() {
        // the fallback table is a no-op drain; the pmem table fences
        let nonpmem = dispatch(false);
        nonpmem.drain();

        if cfg!(feature = "use_msync") {
            return; // page-sync dispatch only works on mapped files
        }
        let mut buf = [0u8; 128];
        let forced = dispatch(true);
        forced.memset_persist(buf.as_mut_ptr(), 7, buf.len());
        assert!(buf.iter().all(|b| *b == 7));
    }
}
