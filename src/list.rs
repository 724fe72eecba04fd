//! Persistent circular doubly-linked list primitives
//!
//! Lists are modeled as arena plus offset: no native pointers are ever
//! persisted, traversal reads `Oid` fields at known offsets. An element's
//! linkage lives `pe_offset` bytes past its out-of-band header, so the
//! same element can sit on the out-of-band ring of its type and on any
//! number of caller-embedded rings at other entry offsets.
//!
//! Every mutation stages its word updates in a lane redo section and
//! commits them as a unit, so a crash at any instruction leaves either
//! the old or the new shape of every ring. A freshly allocated element is
//! wired up with plain stores before the redo publishes it; a live
//! element is only ever rewritten through the redo.

use crate::error::Error;
use crate::heap;
use crate::lane::{self, Redo};
use crate::log;
use crate::oid::{ListEntry, Oid, OobHeader, OOB_OFFSET, OOB_SIZE_OFF, OOB_TYPE_WORD_OFF};
use crate::pool::PoolInner;
use crate::result::Result;
use std::mem;

const NEXT_OFF: u64 = 0;
const PREV_OFF: u64 = 16;

/// The out-of-band header of a live object
#[inline]
pub(crate) fn oob<'a>(pop: &PoolInner, oid: Oid) -> &'a mut OobHeader {
    unsafe { pop.at(oid.off - OOB_OFFSET) }
}

/// Allocation size of an element: payload plus its out-of-band header
#[inline]
fn total_size(size: usize) -> Result<usize> {
    size.checked_add(OOB_OFFSET as usize)
        .ok_or(Error::OutOfSpace(size))
}

/// Offset of an element's list entry for a given entry offset
#[inline]
fn entry_base(oid: Oid, pe_offset: u64) -> u64 {
    oid.off - OOB_OFFSET + pe_offset
}

#[inline]
fn entry<'a>(pop: &PoolInner, oid: Oid, pe_offset: u64) -> &'a mut ListEntry {
    unsafe { pop.at(entry_base(oid, pe_offset)) }
}

/// A transactional update of one OOB header field, resolved against the
/// element's final location
pub(crate) enum OobField {
    None,
    Size(u64),
    TypeWord(u64),
}

impl OobField {
    fn resolve(&self, oid: Oid) -> Option<(u64, u64)> {
        match self {
            OobField::None => None,
            OobField::Size(v) => Some((oid.off - OOB_OFFSET + OOB_SIZE_OFF, *v)),
            OobField::TypeWord(v) => Some((oid.off - OOB_OFFSET + OOB_TYPE_WORD_OFF, *v)),
        }
    }
}

/// Writes an element's own entry: plain stores for an unpublished element,
/// redo entries for one that is already reachable
fn set_own_entry(
    pop: &PoolInner,
    redo: &mut Redo,
    oid: Oid,
    pe_offset: u64,
    next: Oid,
    prev: Oid,
    live: bool,
) {
    if live {
        redo.push_oid(entry_base(oid, pe_offset) + NEXT_OFF, next);
        redo.push_oid(entry_base(oid, pe_offset) + PREV_OFF, prev);
    } else {
        let e = entry(pop, oid, pe_offset);
        e.pe_next = next;
        e.pe_prev = prev;
        pop.ops
            .flush(e as *const ListEntry as *const u8, mem::size_of::<ListEntry>());
        pop.ops.drain();
    }
}

/// Stages the linking of `oid` into the ring of `head_off`
///
/// A null `dest` appends at the ring's tail, keeping enumeration in
/// insertion order; otherwise the element lands before or after `dest`.
fn link_into(
    pop: &PoolInner,
    redo: &mut Redo,
    head_off: u64,
    pe_offset: u64,
    dest: Oid,
    before: bool,
    oid: Oid,
    live: bool,
) {
    let first = pop.head(head_off).pe_first;
    if first.is_null() {
        set_own_entry(pop, redo, oid, pe_offset, oid, oid, live);
        redo.push_oid(head_off, oid);
        return;
    }

    let (prev, next) = if dest.is_null() {
        (entry(pop, first, pe_offset).pe_prev, first)
    } else if before {
        (entry(pop, dest, pe_offset).pe_prev, dest)
    } else {
        (dest, entry(pop, dest, pe_offset).pe_next)
    };

    set_own_entry(pop, redo, oid, pe_offset, next, prev, live);
    redo.push_oid(entry_base(prev, pe_offset) + NEXT_OFF, oid);
    redo.push_oid(entry_base(next, pe_offset) + PREV_OFF, oid);
    if !dest.is_null() && dest == first && before {
        redo.push_oid(head_off, oid);
    }
}

/// Stages the unlinking of `oid` from the ring of `head_off`
fn unlink_from(pop: &PoolInner, redo: &mut Redo, head_off: u64, pe_offset: u64, oid: Oid) {
    let e = *entry(pop, oid, pe_offset);
    if e.pe_next == oid {
        // sole element
        redo.push_oid(head_off, Oid::NULL);
        return;
    }
    redo.push_oid(entry_base(e.pe_prev, pe_offset) + NEXT_OFF, e.pe_next);
    redo.push_oid(entry_base(e.pe_next, pe_offset) + PREV_OFF, e.pe_prev);
    if pop.head(head_off).pe_first == oid {
        redo.push_oid(head_off, e.pe_next);
    }
}

/// Allocates and constructs a new element and links it atomically into the
/// out-of-band ring of `lhead_off` and, when given, a caller ring
pub(crate) fn insert_new(
    pop: &PoolInner,
    lhead_off: u64,
    user: Option<(u64, u64, Oid, bool)>,
    size: usize,
    ctor: impl FnOnce(&PoolInner, *mut u8),
) -> Result<Oid> {
    if pop.rdonly {
        return Err(Error::ReadOnly);
    }
    let _guard = pop.list_lock.lock().unwrap();

    let data_off = heap::pmalloc(pop, total_size(size)?)?;
    let oid = Oid {
        pool_uuid_lo: pop.uuid_lo,
        off: data_off + OOB_OFFSET,
    };

    let h = oob(pop, oid);
    *h = unsafe { mem::zeroed() };
    ctor(pop, unsafe { pop.base().add(oid.off as usize) });

    let mut redo = lane::hold(pop);
    link_into(pop, &mut redo, lhead_off, 0, Oid::NULL, false, oid, false);
    if let Some((pe_offset, head_off, dest, before)) = user {
        link_into(pop, &mut redo, head_off, pe_offset, dest, before, oid, false);
    }
    redo.commit();
    Ok(oid)
}

/// Links an existing element into a caller ring
pub(crate) fn insert(
    pop: &PoolInner,
    pe_offset: u64,
    head_off: u64,
    dest: Oid,
    before: bool,
    oid: Oid,
) -> Result<()> {
    if pop.rdonly {
        return Err(Error::ReadOnly);
    }
    let _guard = pop.list_lock.lock().unwrap();

    let mut redo = lane::hold(pop);
    // the element is reachable elsewhere, but its entry at this offset is
    // not part of any ring yet
    link_into(pop, &mut redo, head_off, pe_offset, dest, before, oid, false);
    redo.commit();
    Ok(())
}

/// Unlinks an element from a caller ring without freeing it
pub(crate) fn remove(pop: &PoolInner, pe_offset: u64, head_off: u64, oid: Oid) -> Result<()> {
    if pop.rdonly {
        return Err(Error::ReadOnly);
    }
    let _guard = pop.list_lock.lock().unwrap();

    let mut redo = lane::hold(pop);
    unlink_from(pop, &mut redo, head_off, pe_offset, oid);
    redo.commit();
    Ok(())
}

/// Unlinks an element from its out-of-band ring and, when given, a caller
/// ring, then returns its allocation to the heap
pub(crate) fn remove_free(
    pop: &PoolInner,
    lhead_off: u64,
    user: Option<(u64, u64)>,
    oid: Oid,
) -> Result<()> {
    if pop.rdonly {
        return Err(Error::ReadOnly);
    }
    let _guard = pop.list_lock.lock().unwrap();

    let mut redo = lane::hold(pop);
    unlink_from(pop, &mut redo, lhead_off, 0, oid);
    if let Some((pe_offset, head_off)) = user {
        unlink_from(pop, &mut redo, head_off, pe_offset, oid);
    }
    redo.commit();

    // a crash here leaks the block; the links above are already durable
    if let Err(_e) = heap::pfree(pop, oid.off - OOB_OFFSET) {
        log!(pop.name(), Red, "FREE", "heap free failed: {}", _e);
    }
    Ok(())
}

/// Moves an element between two rings, or within one, atomically
pub(crate) fn move_elem(
    pop: &PoolInner,
    pe_old: u64,
    head_old: u64,
    pe_new: u64,
    head_new: u64,
    dest: Oid,
    before: bool,
    oid: Oid,
) -> Result<()> {
    if pop.rdonly {
        return Err(Error::ReadOnly);
    }
    if oid == dest {
        return Ok(());
    }
    let _guard = pop.list_lock.lock().unwrap();

    let same = head_old == head_new && pe_old == pe_new;
    let e_old = *entry(pop, oid, pe_old);

    // a neighbor read that still sees the element must be redirected to
    // the ring shape after its removal
    let fix = |read: Oid, toward_next: bool| -> Oid {
        if same && read == oid {
            if toward_next {
                e_old.pe_next
            } else {
                e_old.pe_prev
            }
        } else {
            read
        }
    };

    let mut redo = lane::hold(pop);
    unlink_from(pop, &mut redo, head_old, pe_old, oid);

    let mut first = pop.head(head_new).pe_first;
    if same {
        if e_old.pe_next == oid {
            first = Oid::NULL;
        } else if first == oid {
            first = e_old.pe_next;
        }
    }

    if first.is_null() {
        set_own_entry(pop, &mut redo, oid, pe_new, oid, oid, true);
        redo.push_oid(head_new, oid);
    } else {
        let (prev, next) = if dest.is_null() {
            (fix(entry(pop, first, pe_new).pe_prev, false), first)
        } else if before {
            (fix(entry(pop, dest, pe_new).pe_prev, false), dest)
        } else {
            (dest, fix(entry(pop, dest, pe_new).pe_next, true))
        };
        set_own_entry(pop, &mut redo, oid, pe_new, next, prev, true);
        redo.push_oid(entry_base(prev, pe_new) + NEXT_OFF, oid);
        redo.push_oid(entry_base(next, pe_new) + PREV_OFF, oid);
        if !dest.is_null() && dest == first && before {
            redo.push_oid(head_new, oid);
        }
    }
    redo.commit();
    Ok(())
}

/// Resizes an element in place when its block allows, otherwise carries it
/// into a fresh allocation and atomically splices the ring around it
pub(crate) fn realloc(
    pop: &PoolInner,
    head_off: u64,
    size: usize,
    ctor: Option<&dyn Fn(&PoolInner, *mut u8)>,
    field: OobField,
    oid: Oid,
) -> Result<Oid> {
    if pop.rdonly {
        return Err(Error::ReadOnly);
    }
    let _guard = pop.list_lock.lock().unwrap();

    let old_data = oid.off - OOB_OFFSET;
    if heap::prealloc(pop, old_data, total_size(size)?) {
        if let Some(c) = ctor {
            c(pop, unsafe { pop.base().add(oid.off as usize) });
        }
        let mut redo = lane::hold(pop);
        if let Some((off, val)) = field.resolve(oid) {
            redo.push(off, val);
        }
        redo.commit();
        return Ok(oid);
    }

    relocate(pop, head_off, size, ctor, &field, oid)
}

/// Resizes an element while moving it between two out-of-band rings,
/// updating its type word in the same atomic step
pub(crate) fn realloc_move(
    pop: &PoolInner,
    head_old: u64,
    head_new: u64,
    size: usize,
    ctor: Option<&dyn Fn(&PoolInner, *mut u8)>,
    type_word_val: u64,
    oid: Oid,
) -> Result<Oid> {
    if pop.rdonly {
        return Err(Error::ReadOnly);
    }
    let _guard = pop.list_lock.lock().unwrap();

    let old_data = oid.off - OOB_OFFSET;
    if heap::prealloc(pop, old_data, total_size(size)?) {
        if let Some(c) = ctor {
            c(pop, unsafe { pop.base().add(oid.off as usize) });
        }
        let mut redo = lane::hold(pop);
        unlink_from(pop, &mut redo, head_old, 0, oid);
        link_into(pop, &mut redo, head_new, 0, Oid::NULL, false, oid, true);
        if let Some((off, val)) = OobField::TypeWord(type_word_val).resolve(oid) {
            redo.push(off, val);
        }
        redo.commit();
        return Ok(oid);
    }

    // carry into a fresh allocation; the copied linkage still names the
    // old ring, so splice the old ring shut and wire the copy into the
    // new ring in one redo section
    let new_data = heap::pmalloc(pop, total_size(size)?)?;
    let new_oid = Oid {
        pool_uuid_lo: pop.uuid_lo,
        off: new_data + OOB_OFFSET,
    };
    carry_contents(pop, old_data, new_data, size, ctor, new_oid);

    let mut redo = lane::hold(pop);
    unlink_from(pop, &mut redo, head_old, 0, oid);
    link_into(pop, &mut redo, head_new, 0, Oid::NULL, false, new_oid, false);
    if let Some((off, val)) = OobField::TypeWord(type_word_val).resolve(new_oid) {
        redo.push(off, val);
    }
    redo.commit();

    if let Err(_e) = heap::pfree(pop, old_data) {
        log!(pop.name(), Red, "REALLOC", "heap free failed: {}", _e);
    }
    Ok(new_oid)
}

/// Copies an element into a new allocation and runs the constructor
fn carry_contents(
    pop: &PoolInner,
    old_data: u64,
    new_data: u64,
    size: usize,
    ctor: Option<&dyn Fn(&PoolInner, *mut u8)>,
    new_oid: Oid,
) {
    let old_usable = heap::pmalloc_usable_size(pop, old_data);
    let copy = old_usable.min(size + OOB_OFFSET as usize);
    pop.ops.memcpy_persist(
        unsafe { pop.base().add(new_data as usize) },
        unsafe { pop.base().add(old_data as usize) },
        copy,
    );
    if let Some(c) = ctor {
        c(pop, unsafe { pop.base().add(new_oid.off as usize) });
    }
}

/// The moved-allocation half of `realloc`: same ring, new location
fn relocate(
    pop: &PoolInner,
    head_off: u64,
    size: usize,
    ctor: Option<&dyn Fn(&PoolInner, *mut u8)>,
    field: &OobField,
    oid: Oid,
) -> Result<Oid> {
    let old_data = oid.off - OOB_OFFSET;
    let new_data = heap::pmalloc(pop, total_size(size)?)?;
    let new_oid = Oid {
        pool_uuid_lo: pop.uuid_lo,
        off: new_data + OOB_OFFSET,
    };
    carry_contents(pop, old_data, new_data, size, ctor, new_oid);

    let mut redo = lane::hold(pop);
    let e = *entry(pop, oid, 0);
    if e.pe_next == oid {
        // sole element: the copy closes over itself before publication
        let ne = entry(pop, new_oid, 0);
        ne.pe_next = new_oid;
        ne.pe_prev = new_oid;
        pop.ops
            .flush(ne as *const ListEntry as *const u8, mem::size_of::<ListEntry>());
        pop.ops.drain();
        redo.push_oid(head_off, new_oid);
    } else {
        redo.push_oid(entry_base(e.pe_prev, 0) + NEXT_OFF, new_oid);
        redo.push_oid(entry_base(e.pe_next, 0) + PREV_OFF, new_oid);
        if pop.head(head_off).pe_first == oid {
            redo.push_oid(head_off, new_oid);
        }
    }
    if let Some((off, val)) = field.resolve(new_oid) {
        redo.push(off, val);
    }
    redo.commit();

    if let Err(_e) = heap::pfree(pop, old_data) {
        log!(pop.name(), Red, "REALLOC", "heap free failed: {}", _e);
    }
    Ok(new_oid)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn oob_field_resolution() {
        let oid = Oid {
            pool_uuid_lo: 1,
            off: 1024,
        };
        assert!(OobField::None.resolve(oid).is_none());
        let (off, val) = OobField::Size(99).resolve(oid).unwrap();
        assert_eq!(off, 1024 - OOB_OFFSET + OOB_SIZE_OFF);
        assert_eq!(val, 99);
        let (off, _) = OobField::TypeWord(7).resolve(oid).unwrap();
        assert_eq!(off, 1024 - OOB_OFFSET + OOB_TYPE_WORD_OFF);
    }
}
