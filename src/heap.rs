//! Persistent heap
//!
//! A power-of-two free-list allocator over the block area that follows the
//! heap header. Every allocated block is prefixed by one word holding its
//! block size; `pmalloc` hands out the offset just past that word, and
//! `pmalloc_usable_size` reads it back. Free blocks keep their order's
//! free-list link in their first word.
//!
//! Free-list updates are flushed but not failure-atomic: a crash inside
//! the allocator can leak a block, never corrupt object linkage. The
//! object layer's redo protocol is what makes whole operations atomic.

use crate::error::Error;
use crate::ll::MemOps;
use crate::log;
use crate::pool::PoolInner;
use crate::result::Result;
use std::mem;

const HEAP_MAGIC: u64 = u64::from_le_bytes(*b"SPNLHEAP");

/// Smallest block the heap hands out, header word included
const MIN_BLOCK: u64 = 64;

/// Word prefixed to every allocated block
const BLOCK_HDR: u64 = 8;

const NORDERS: usize = 64;

#[repr(C)]
struct HeapHdr {
    magic: u64,
    size: u64,
    available: u64,
    /// Heads of the per-order free lists; 0 is the list terminator
    buddies: [u64; NORDERS],
}

/// First usable block offset of a heap starting at `heap_offset`
fn data_start(heap_offset: u64) -> u64 {
    (heap_offset + mem::size_of::<HeapHdr>() as u64 + MIN_BLOCK - 1) & !(MIN_BLOCK - 1)
}

unsafe fn word(base: *mut u8, off: u64) -> &'static mut u64 {
    &mut *(base.add(off as usize) as *mut u64)
}

fn persist_word(pop: &PoolInner, p: *const u64) {
    pop.ops.persist(p as *const u8, mem::size_of::<u64>());
}

fn persist_off_word(pop: &PoolInner, off: u64) {
    pop.ops
        .persist(unsafe { pop.base().add(off as usize) }, mem::size_of::<u64>());
}

fn hdr<'a>(pop: &PoolInner) -> &'a mut HeapHdr {
    unsafe { pop.at(pop.heap_offset) }
}

/// Formats the heap: header plus the block area carved into power-of-two
/// free blocks, largest first
pub(crate) fn init(base: *mut u8, ops: &dyn MemOps, heap_offset: u64, heap_size: u64) -> Result<()> {
    let start = data_start(heap_offset);
    let end = heap_offset + heap_size;
    if start + MIN_BLOCK > end {
        return Err(Error::inval("pool too small to hold a heap"));
    }

    let mut h: HeapHdr = unsafe { mem::zeroed() };
    h.magic = HEAP_MAGIC;
    h.size = heap_size;

    let mut cur = start;
    while end - cur >= MIN_BLOCK {
        let k = 63 - (end - cur).leading_zeros() as usize;
        let bsize = 1u64 << k;
        unsafe {
            *word(base, cur) = h.buddies[k];
        }
        ops.flush(unsafe { base.add(cur as usize) }, mem::size_of::<u64>());
        h.buddies[k] = cur;
        h.available += bsize;
        cur += bsize;
    }
    ops.drain();

    ops.memcpy_persist(
        unsafe { base.add(heap_offset as usize) },
        &h as *const HeapHdr as *const u8,
        mem::size_of::<HeapHdr>(),
    );
    Ok(())
}

/// Brings the heap online after open
pub(crate) fn boot(pop: &PoolInner) -> Result<()> {
    let h = hdr(pop);
    if h.magic != HEAP_MAGIC {
        return Err(Error::image("bad heap magic"));
    }
    if h.size != pop.heap_size {
        return Err(Error::image("heap size disagrees with pool descriptor"));
    }
    log!(pop.name(), Green, "HEAP", "booted, {} bytes available", h.available);
    Ok(())
}

pub(crate) fn cleanup(_pop: &PoolInner) -> Result<()> {
    Ok(())
}

/// Validates heap metadata: magic, free-list membership, and accounting
pub(crate) fn check(pop: &PoolInner) -> Result<()> {
    let h = hdr(pop);
    if h.magic != HEAP_MAGIC {
        return Err(Error::image("bad heap magic"));
    }
    if h.size != pop.heap_size {
        return Err(Error::image("heap size disagrees with pool descriptor"));
    }

    let start = data_start(pop.heap_offset);
    let end = pop.heap_offset + pop.heap_size;
    let max_blocks = (pop.heap_size / MIN_BLOCK) as usize + 1;

    let mut free = 0u64;
    for k in 0..NORDERS {
        let bsize = 1u64 << k;
        let mut cur = h.buddies[k];
        let mut steps = 0usize;
        while cur != 0 {
            if cur < start || cur.checked_add(bsize).map_or(true, |e| e > end) {
                return Err(Error::image(format!(
                    "free block 0x{:x} of order {} out of range",
                    cur, k
                )));
            }
            free += bsize;
            cur = pop.read_u64(cur);
            steps += 1;
            if steps > max_blocks {
                return Err(Error::image(format!("free list of order {} has a cycle", k)));
            }
        }
    }
    if free != h.available {
        return Err(Error::image(format!(
            "free space accounting mismatch ({} walked, {} recorded)",
            free, h.available
        )));
    }
    Ok(())
}

/// Allocates `size` usable bytes; returns the offset of the usable area
pub(crate) fn pmalloc(pop: &PoolInner, size: usize) -> Result<u64> {
    let _guard = pop.heap_lock.lock().unwrap();
    let h = hdr(pop);

    let need = (size as u64)
        .checked_add(BLOCK_HDR)
        .filter(|n| *n <= pop.heap_size)
        .ok_or(Error::OutOfSpace(size))?
        .max(MIN_BLOCK);
    let k = 64 - (need - 1).leading_zeros() as usize;

    let mut j = k;
    while j < NORDERS && h.buddies[j] == 0 {
        j += 1;
    }
    if j == NORDERS {
        log!(
            pop.name(),
            Red,
            "ALLOC",
            "no space left (requested {}, available {})",
            size,
            h.available
        );
        return Err(Error::OutOfSpace(size));
    }

    let off = h.buddies[j];
    h.buddies[j] = pop.read_u64(off);
    persist_word(pop, &h.buddies[j]);

    // split down to the requested order, returning the upper halves
    while j > k {
        j -= 1;
        let half = off + (1u64 << j);
        pop.write_u64(half, h.buddies[j]);
        persist_off_word(pop, half);
        h.buddies[j] = half;
        persist_word(pop, &h.buddies[j]);
    }

    let bsize = 1u64 << k;
    pop.write_u64(off, bsize);
    persist_off_word(pop, off);

    h.available -= bsize;
    persist_word(pop, &h.available);

    log!(pop.name(), Green, "ALLOC", "{} bytes at 0x{:x}", size, off + BLOCK_HDR);
    Ok(off + BLOCK_HDR)
}

/// Block size of the allocation holding `data_off`, validated
fn block_size(pop: &PoolInner, data_off: u64) -> Result<u64> {
    let start = data_start(pop.heap_offset);
    let end = pop.heap_offset + pop.heap_size;
    if data_off < start + BLOCK_HDR || data_off >= end {
        return Err(Error::image(format!("offset 0x{:x} outside the heap", data_off)));
    }
    let bsize = pop.read_u64(data_off - BLOCK_HDR);
    if !bsize.is_power_of_two()
        || bsize < MIN_BLOCK
        || (data_off - BLOCK_HDR).checked_add(bsize).map_or(true, |e| e > end)
    {
        return Err(Error::image(format!(
            "corrupt block word at 0x{:x}",
            data_off - BLOCK_HDR
        )));
    }
    Ok(bsize)
}

/// Returns the allocation holding `data_off` to its free list
pub(crate) fn pfree(pop: &PoolInner, data_off: u64) -> Result<()> {
    let _guard = pop.heap_lock.lock().unwrap();
    let h = hdr(pop);

    let bsize = block_size(pop, data_off)?;
    let off = data_off - BLOCK_HDR;
    let k = bsize.trailing_zeros() as usize;

    pop.write_u64(off, h.buddies[k]);
    persist_off_word(pop, off);
    h.buddies[k] = off;
    persist_word(pop, &h.buddies[k]);
    h.available += bsize;
    persist_word(pop, &h.available);

    log!(pop.name(), Green, "FREE", "block 0x{:x} ({} bytes)", off, bsize);
    Ok(())
}

/// Usable bytes of the allocation holding `data_off`
pub(crate) fn pmalloc_usable_size(pop: &PoolInner, data_off: u64) -> usize {
    match block_size(pop, data_off) {
        Ok(bsize) => (bsize - BLOCK_HDR) as usize,
        Err(_) => 0,
    }
}

/// Tells if the allocation can serve `new_size` bytes in place
pub(crate) fn prealloc(pop: &PoolInner, data_off: u64, new_size: usize) -> bool {
    pmalloc_usable_size(pop, data_off) >= new_size
}
