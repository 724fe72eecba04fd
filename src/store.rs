//! Object directory and allocation façade
//!
//! The object store partitions every live object of a pool into `NTYPES`
//! typed rings plus the distinguished root ring. The façade validates
//! inputs, picks the right list head, and installs the out-of-band header
//! through a constructor that runs inside the list primitive's atomic
//! section. Constructors must not allocate.

use crate::error::Error;
use crate::heap;
use crate::list::{self, OobField};
use crate::log;
use crate::oid::{
    type_word, Oid, LIST_HEAD_SIZE, NTYPES, OOB_OFFSET, OOB_SIZE_OFF, OOB_TYPE_WORD_OFF, OP_ALLOC,
    ROOT_TYPE,
};
use crate::pool::{ObjPool, PoolInner, POOLS};
use crate::result::Result;

fn check_type(type_num: usize) -> Result<()> {
    if type_num >= NTYPES {
        return Err(Error::inval(format!(
            "type_num has to be in range [0, {})",
            NTYPES
        )));
    }
    Ok(())
}

/// Tells if an identifier plausibly names an object of this pool
fn valid_oid(pop: &PoolInner, oid: Oid) -> bool {
    oid.pool_uuid_lo == pop.uuid_lo
        && oid.off >= OOB_OFFSET
        && pop.in_range(oid.off - OOB_OFFSET, OOB_OFFSET)
}

fn check_oid(pop: &PoolInner, oid: Oid) -> Result<()> {
    if oid.is_null() || !valid_oid(pop, oid) {
        return Err(Error::inval("object does not belong to this pool"));
    }
    Ok(())
}

fn check_head(pop: &PoolInner, head_off: u64) -> Result<()> {
    if !pop.in_range(head_off, LIST_HEAD_SIZE) {
        return Err(Error::inval("list head offset out of range"));
    }
    Ok(())
}

/// Fills and persists the out-of-band header of a fresh typed object
fn write_oob_type(pop: &PoolInner, payload: *mut u8, user_type: u16) {
    unsafe {
        let oob_ptr = payload.sub(OOB_OFFSET as usize);
        *(oob_ptr.add(OOB_TYPE_WORD_OFF as usize) as *mut u64) = type_word(OP_ALLOC, user_type);
        pop.ops.persist(oob_ptr, OOB_OFFSET as usize);
    }
}

impl ObjPool {
    /// Allocates a new object of `size` bytes on the type list `type_num`
    pub fn alloc(&self, size: usize, type_num: usize) -> Result<Oid> {
        self.alloc_construct(size, type_num, None)
    }

    /// Allocates a new object and runs `constructor` on the fresh payload
    ///
    /// The constructor runs inside the insertion's atomic section and must
    /// not allocate. Whatever it writes is made durable before the object
    /// becomes reachable.
    pub fn alloc_construct(
        &self,
        size: usize,
        type_num: usize,
        constructor: Option<&dyn Fn(&mut [u8])>,
    ) -> Result<Oid> {
        check_type(type_num)?;
        let pop = &*self.inner;
        list::insert_new(
            pop,
            pop.type_head_off(type_num),
            None,
            size,
            |pop: &PoolInner, payload: *mut u8| {
                write_oob_type(pop, payload, type_num as u16);
                if let Some(c) = constructor {
                    c(unsafe { std::slice::from_raw_parts_mut(payload, size) });
                    pop.ops.persist(payload, size);
                }
            },
        )
    }

    /// Allocates a new object with its payload zeroed
    pub fn zalloc(&self, size: usize, type_num: usize) -> Result<Oid> {
        check_type(type_num)?;
        let pop = &*self.inner;
        list::insert_new(
            pop,
            pop.type_head_off(type_num),
            None,
            size,
            |pop: &PoolInner, payload: *mut u8| {
                write_oob_type(pop, payload, type_num as u16);
                pop.ops.memset_persist(payload, 0, size);
            },
        )
    }

    /// Allocates a new object holding a copy of the bytes of `s`
    ///
    /// Exactly `s.len()` bytes are stored; no terminator is appended, and
    /// allocator rounding means [`alloc_usable_size`](./fn.alloc_usable_size.html)
    /// may exceed the string length. Callers that need the exact length
    /// must record it themselves.
    pub fn strdup(&self, s: &str, type_num: usize) -> Result<Oid> {
        check_type(type_num)?;
        let pop = &*self.inner;
        let bytes = s.as_bytes();
        list::insert_new(
            pop,
            pop.type_head_off(type_num),
            None,
            bytes.len(),
            |pop: &PoolInner, payload: *mut u8| {
                write_oob_type(pop, payload, type_num as u16);
                if !bytes.is_empty() {
                    pop.ops.memcpy_persist(payload, bytes.as_ptr(), bytes.len());
                }
            },
        )
    }

    /// Resizes an object, possibly moving it to the type list `type_num`
    ///
    /// Returns the object's identifier after the operation; the offset may
    /// change when the resize could not be served in place.
    pub fn realloc(&self, oid: Oid, size: usize, type_num: usize) -> Result<Oid> {
        self.obj_realloc(oid, size, type_num, None)
    }

    /// Like [`realloc`](#method.realloc), but any grown suffix reads zero
    pub fn zrealloc(&self, oid: Oid, size: usize, type_num: usize) -> Result<Oid> {
        let pop = &*self.inner;
        check_oid(pop, oid)?;
        let old = heap::pmalloc_usable_size(pop, oid.off - OOB_OFFSET)
            .saturating_sub(OOB_OFFSET as usize);
        if size > old {
            let zero_suffix = |pop: &PoolInner, payload: *mut u8| {
                pop.ops
                    .memset_persist(unsafe { payload.add(old) }, 0, size - old);
            };
            self.obj_realloc(oid, size, type_num, Some(&zero_suffix))
        } else {
            self.obj_realloc(oid, size, type_num, None)
        }
    }

    fn obj_realloc(
        &self,
        oid: Oid,
        size: usize,
        type_num: usize,
        ctor: Option<&dyn Fn(&PoolInner, *mut u8)>,
    ) -> Result<Oid> {
        check_type(type_num)?;
        let pop = &*self.inner;
        check_oid(pop, oid)?;

        let h = list::oob(pop, oid);
        let old_type = h.user_type as usize;
        if h.internal_type != OP_ALLOC || old_type >= NTYPES {
            return Err(Error::inval("not a live typed object"));
        }

        if old_type == type_num {
            list::realloc(
                pop,
                pop.type_head_off(old_type),
                size,
                ctor,
                OobField::None,
                oid,
            )
        } else {
            list::realloc_move(
                pop,
                pop.type_head_off(old_type),
                pop.type_head_off(type_num),
                size,
                ctor,
                type_word(OP_ALLOC, type_num as u16),
                oid,
            )
        }
    }

    /// First object on the type list `type_num`; null when the list is empty
    ///
    /// Together with [`next`](./fn.next.html) this enumerates the list in
    /// insertion order.
    pub fn first(&self, type_num: usize) -> Result<Oid> {
        check_type(type_num)?;
        let pop = &*self.inner;
        let _guard = pop.list_lock.lock().unwrap();
        Ok(pop.head(pop.type_head_off(type_num)).pe_first)
    }

    /// Declared size of the root object; 0 when it does not exist yet
    pub fn root_size(&self) -> usize {
        let pop = &*self.inner;
        let _guard = pop.list_lock.lock().unwrap();
        let first = pop.head(pop.root_head_off()).pe_first;
        if first.is_null() {
            0
        } else {
            list::oob(pop, first).size as usize
        }
    }

    /// The root object, created or grown to `size` bytes on demand
    ///
    /// The root is the single object reachable without a prior `Oid`. A
    /// second call with a smaller `size` returns the same object without
    /// shrinking it.
    pub fn root(&self, size: usize) -> Result<Oid> {
        let pop = &*self.inner;
        let _root_guard = pop.rootlock.lock().unwrap();

        let first = {
            let _guard = pop.list_lock.lock().unwrap();
            pop.head(pop.root_head_off()).pe_first
        };

        if first.is_null() {
            list::insert_new(pop, pop.root_head_off(), None, size, |pop: &PoolInner, payload: *mut u8| unsafe {
                let oob_ptr = payload.sub(OOB_OFFSET as usize);
                *(oob_ptr.add(OOB_SIZE_OFF as usize) as *mut u64) = size as u64;
                *(oob_ptr.add(OOB_TYPE_WORD_OFF as usize) as *mut u64) =
                    type_word(OP_ALLOC, ROOT_TYPE);
                pop.ops.persist(oob_ptr, OOB_OFFSET as usize);
            })?;
        } else if size > list::oob(pop, first).size as usize {
            list::realloc(
                pop,
                pop.root_head_off(),
                size,
                None,
                OobField::Size(size as u64),
                first,
            )?;
        }

        let _guard = pop.list_lock.lock().unwrap();
        Ok(pop.head(pop.root_head_off()).pe_first)
    }

    /// Links an existing object into a caller-embedded list
    ///
    /// `head_off` is the pool offset of a caller-owned list head and
    /// `pe_offset` the offset of the embedded entry, counted from the
    /// object's out-of-band header. A null `dest` appends at the tail.
    pub fn list_insert(
        &self,
        pe_offset: u64,
        head_off: u64,
        dest: Oid,
        before: bool,
        oid: Oid,
    ) -> Result<()> {
        let pop = &*self.inner;
        check_head(pop, head_off)?;
        check_oid(pop, oid)?;
        list::insert(pop, pe_offset, head_off, dest, before, oid)
    }

    /// Allocates a new object of `type_num` and links it into both its
    /// type list and a caller-embedded list in one atomic step
    pub fn list_insert_new(
        &self,
        pe_offset: u64,
        head_off: u64,
        dest: Oid,
        before: bool,
        size: usize,
        type_num: usize,
    ) -> Result<Oid> {
        check_type(type_num)?;
        let pop = &*self.inner;
        check_head(pop, head_off)?;
        list::insert_new(
            pop,
            pop.type_head_off(type_num),
            Some((pe_offset, head_off, dest, before)),
            size,
            |pop: &PoolInner, payload: *mut u8| {
                write_oob_type(pop, payload, type_num as u16);
            },
        )
    }

    /// Unlinks an object from a caller-embedded list; with `free` it also
    /// leaves its type list and returns its storage to the heap
    pub fn list_remove(
        &self,
        pe_offset: u64,
        head_off: u64,
        oid: Oid,
        free: bool,
    ) -> Result<()> {
        let pop = &*self.inner;
        check_head(pop, head_off)?;
        check_oid(pop, oid)?;
        if free {
            let user_type = list::oob(pop, oid).user_type as usize;
            if user_type >= NTYPES {
                return Err(Error::inval("not a typed object"));
            }
            list::remove_free(
                pop,
                pop.type_head_off(user_type),
                Some((pe_offset, head_off)),
                oid,
            )
        } else {
            list::remove(pop, pe_offset, head_off, oid)
        }
    }

    /// Moves an object between caller-embedded lists atomically
    pub fn list_move(
        &self,
        pe_old_offset: u64,
        head_old: u64,
        pe_new_offset: u64,
        head_new: u64,
        dest: Oid,
        before: bool,
        oid: Oid,
    ) -> Result<()> {
        let pop = &*self.inner;
        check_head(pop, head_old)?;
        check_head(pop, head_new)?;
        check_oid(pop, oid)?;
        list::move_elem(
            pop, pe_old_offset, head_old, pe_new_offset, head_new, dest, before, oid,
        )
    }
}

/// Translates an object identifier to a live pointer in O(1)
///
/// Returns null for the null identifier and for pools this process has
/// not opened. The pointer stays valid until the owning pool is closed.
pub fn direct(oid: Oid) -> *mut u8 {
    if oid.is_null() {
        return std::ptr::null_mut();
    }
    match POOLS.get(oid.pool_uuid_lo) {
        Some(p) => unsafe { (*p).base().add(oid.off as usize) },
        None => std::ptr::null_mut(),
    }
}

/// Usable payload bytes of an allocation, at least what was requested
pub fn alloc_usable_size(oid: Oid) -> usize {
    if oid.is_null() {
        return 0;
    }
    let pop = match POOLS.get(oid.pool_uuid_lo) {
        Some(p) => unsafe { &*p },
        None => return 0,
    };
    if !valid_oid(pop, oid) {
        return 0;
    }
    heap::pmalloc_usable_size(pop, oid.off - OOB_OFFSET).saturating_sub(OOB_OFFSET as usize)
}

/// Frees an object
///
/// Null-safe. Failures (unknown pool, corrupt header) are logged and not
/// reported; a free either completes durably or changes nothing.
pub fn free(oid: Oid) {
    if oid.is_null() {
        return;
    }
    let pop = match POOLS.get(oid.pool_uuid_lo) {
        Some(p) => unsafe { &*p },
        None => {
            log!("obj", Red, "FREE", "unknown pool id 0x{:016x}", oid.pool_uuid_lo);
            return;
        }
    };
    if !valid_oid(pop, oid) {
        log!(pop.name(), Red, "FREE", "object 0x{:x} out of range", oid.off);
        return;
    }
    let user_type = list::oob(pop, oid).user_type as usize;
    if user_type >= NTYPES {
        log!(pop.name(), Red, "FREE", "object 0x{:x} is not a typed object", oid.off);
        return;
    }
    if let Err(_e) = list::remove_free(pop, pop.type_head_off(user_type), None, oid) {
        log!(pop.name(), Red, "FREE", "remove failed: {}", _e);
    }
}

/// Successor of an object on its type list, in insertion order
///
/// Null for the null identifier, for unknown pools, and past the last
/// element. Must not be called on a freed object.
pub fn next(oid: Oid) -> Oid {
    if oid.is_null() {
        return Oid::NULL;
    }
    let pop = match POOLS.get(oid.pool_uuid_lo) {
        Some(p) => unsafe { &*p },
        None => return Oid::NULL,
    };
    if !valid_oid(pop, oid) {
        return Oid::NULL;
    }
    let _guard = pop.list_lock.lock().unwrap();

    let h = list::oob(pop, oid);
    let head_off = if h.user_type == ROOT_TYPE {
        pop.root_head_off()
    } else if (h.user_type as usize) < NTYPES {
        pop.type_head_off(h.user_type as usize)
    } else {
        return Oid::NULL;
    };

    let first = pop.head(head_off).pe_first;
    if h.oob.pe_next.off == first.off {
        Oid::NULL
    } else {
        h.oob.pe_next
    }
}
