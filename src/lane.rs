//! Per-pool lanes and the redo protocol
//!
//! Every mutating list operation runs inside a lane: a persistent slot
//! holding a redo section of `(offset, value)` word updates. The section
//! is staged volatile, written to the lane, and committed by making its
//! entry count durable; from that point the updates are applied even if
//! the process dies mid-way, because boot re-applies any lane whose count
//! is non-zero. Applying is idempotent, so a crash during recovery is
//! recovered again on the next boot.

use crate::error::Error;
use crate::log;
use crate::oid::Oid;
use crate::pool::PoolInner;
use crate::result::Result;
use std::cell::Cell;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::MutexGuard;

/// Number of lanes in every pool
pub(crate) const OBJ_NLANES: usize = 64;

/// On-media footprint of one lane
pub(crate) const LANE_SIZE: usize = 512;

/// Redo entries one lane can hold
pub(crate) const LANE_REDO_CAP: usize = 31;

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub(crate) struct RedoEntry {
    pub off: u64,
    pub val: u64,
}

/// Persistent layout of one lane; `n != 0` marks a committed redo section
/// that has not finished applying
#[repr(C)]
pub(crate) struct LaneLayout {
    pub n: u64,
    pub entries: [RedoEntry; LANE_REDO_CAP],
    pub reserved: u64,
}

fn lane_off(pop: &PoolInner, idx: usize) -> u64 {
    pop.lanes_offset + (idx * LANE_SIZE) as u64
}

fn section_valid(pop: &PoolInner, lane: &LaneLayout) -> bool {
    let n = lane.n as usize;
    if n > LANE_REDO_CAP {
        return false;
    }
    lane.entries[..n]
        .iter()
        .all(|e| pop.in_range(e.off, mem::size_of::<u64>() as u64))
}

/// Applies one committed redo section and clears it
fn recover(pop: &PoolInner, idx: usize) {
    let lane: &mut LaneLayout = unsafe { pop.at(lane_off(pop, idx)) };
    let n = lane.n as usize;
    for e in &lane.entries[..n] {
        pop.write_u64(e.off, e.val);
        pop.ops
            .flush(unsafe { pop.base().add(e.off as usize) }, mem::size_of::<u64>());
    }
    pop.ops.drain();
    lane.n = 0;
    pop.ops
        .persist(&lane.n as *const u64 as *const u8, mem::size_of::<u64>());
}

/// Re-applies committed redo sections left over from a crash
///
/// On a writable open an invalid section is fatal; the read-only check
/// path leaves it in place so `check` can report it.
pub(crate) fn boot(pop: &PoolInner) -> Result<()> {
    for idx in 0..pop.nlanes {
        let lane: &LaneLayout = unsafe { pop.at(lane_off(pop, idx)) };
        if lane.n == 0 {
            continue;
        }
        if !section_valid(pop, lane) {
            if pop.rdonly {
                log!(pop.name(), Red, "LANE", "lane {} has an invalid redo section", idx);
                continue;
            }
            return Err(Error::image(format!(
                "lane {} holds an invalid redo section",
                idx
            )));
        }
        log!(pop.name(), Magenta, "LANE", "recovering lane {} ({} entries)", idx, lane.n);
        recover(pop, idx);
    }
    Ok(())
}

pub(crate) fn cleanup(_pop: &PoolInner) -> Result<()> {
    Ok(())
}

/// Validates every lane of the pool; used by the consistency check
pub(crate) fn check(pop: &PoolInner) -> Result<()> {
    for idx in 0..pop.nlanes {
        let lane: &LaneLayout = unsafe { pop.at(lane_off(pop, idx)) };
        if !section_valid(pop, lane) {
            return Err(Error::image(format!(
                "lane {} holds an invalid redo section",
                idx
            )));
        }
    }
    Ok(())
}

thread_local! {
    static LANE_HINT: Cell<usize> = Cell::new(usize::MAX);
}

static LANE_SEQ: AtomicUsize = AtomicUsize::new(0);

/// A held lane with a redo section under construction
///
/// Word updates staged with [`push`](#method.push) become visible
/// all-or-nothing when [`commit`](#method.commit) runs. Dropping without
/// committing discards the staged updates.
pub(crate) struct Redo<'a> {
    pop: &'a PoolInner,
    idx: usize,
    _guard: MutexGuard<'a, ()>,
    staged: Vec<RedoEntry>,
}

/// Acquires a lane, preferring the thread's striped slot
pub(crate) fn hold(pop: &PoolInner) -> Redo {
    let hint = LANE_HINT.with(|h| {
        if h.get() == usize::MAX {
            h.set(LANE_SEQ.fetch_add(1, Ordering::Relaxed));
        }
        h.get()
    });
    let n = pop.runtime_nlanes;
    for i in 0..n {
        let idx = (hint + i) % n;
        if let Ok(guard) = pop.lanes[idx].try_lock() {
            return Redo {
                pop,
                idx,
                _guard: guard,
                staged: Vec::new(),
            };
        }
    }
    let idx = hint % n;
    let guard = pop.lanes[idx].lock().unwrap();
    Redo {
        pop,
        idx,
        _guard: guard,
        staged: Vec::new(),
    }
}

impl<'a> Redo<'a> {
    /// Stages one word update
    pub fn push(&mut self, off: u64, val: u64) {
        debug_assert!(self.staged.len() < LANE_REDO_CAP, "redo section overflow");
        self.staged.push(RedoEntry { off, val });
    }

    /// Stages both words of an `Oid` location
    pub fn push_oid(&mut self, off: u64, oid: Oid) {
        self.push(off, oid.pool_uuid_lo);
        self.push(off + 8, oid.off);
    }

    /// Commits the staged updates: durable as a unit, then applied
    pub fn commit(self) {
        if self.staged.is_empty() {
            return;
        }
        assert!(self.staged.len() <= LANE_REDO_CAP, "redo section overflow");

        let pop = self.pop;
        let lane: &mut LaneLayout = unsafe { pop.at(lane_off(pop, self.idx)) };

        for (i, e) in self.staged.iter().enumerate() {
            lane.entries[i] = *e;
        }
        pop.ops.flush(
            lane.entries.as_ptr() as *const u8,
            self.staged.len() * mem::size_of::<RedoEntry>(),
        );

        // commit point: the count becoming durable publishes the section
        lane.n = self.staged.len() as u64;
        pop.ops
            .persist(&lane.n as *const u64 as *const u8, mem::size_of::<u64>());

        for e in &self.staged {
            pop.write_u64(e.off, e.val);
            pop.ops
                .flush(unsafe { pop.base().add(e.off as usize) }, mem::size_of::<u64>());
        }
        pop.ops.drain();

        lane.n = 0;
        pop.ops
            .persist(&lane.n as *const u64 as *const u8, mem::size_of::<u64>());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lane_layout_size() {
        assert_eq!(mem::size_of::<LaneLayout>(), LANE_SIZE);
    }
}
