//! *Spinel* is a transactional object store over persistent memory. It turns
//! a byte-addressable, memory-mapped pool file into a durable heap of typed
//! objects: clients allocate, free, resize, duplicate, and traverse objects,
//! and the objects survive process and machine restarts. The on-media image
//! stays consistent across a crash at any instruction, provided the medium
//! delivers the advertised persistence primitives (cache-line flush plus
//! store-buffer drain on real pmem, or a synchronous page sync as fallback).
//!
//! # Programming Model
//!
//! Persistent memory is available as a file on a DAX-enabled file system such
//! as EXT4-DAX. These files are called memory pools. A pool is created once
//! with [`ObjPool::create`] and reopened with [`ObjPool::open`]; both return a
//! pool handle through which all allocation happens. Every object is named by
//! an [`Oid`], a `(pool id, offset)` pair that stays valid across restarts
//! and is translated to a live pointer in O(1) by [`direct`].
//!
//! Objects are partitioned into `NTYPES` type-numbered lists, enumerable with
//! [`ObjPool::first`] and [`next`] in insertion order. One distinguished
//! *root object* per pool ([`ObjPool::root`]) is reachable without prior
//! knowledge of any `Oid`, and is the anchor from which applications find
//! everything else.
//!
//! ```no_run
//! use spinel::ObjPool;
//!
//! let pop = ObjPool::create("/mnt/pmem/app.pool", Some("inventory"),
//!                           8 * 1024 * 1024, 0o600).unwrap();
//!
//! let item = pop.zalloc(128, 3).unwrap();
//! let p = spinel::direct(item);
//! // ... fill *p through regular stores, then make them durable:
//! pop.persist(item, 128);
//! ```
//!
//! # Durability
//!
//! Each mutating list operation (allocation, free, resize, move) is made
//! failure-atomic by a per-pool lane holding a redo section: staged word
//! updates become visible all-or-nothing with respect to a crash. The
//! persistence primitives themselves are selected per pool at open time,
//! depending on whether the mapping resides on real persistent memory
//! (see [`ll`]).
//!
//! [`direct`]: ./fn.direct.html
//! [`next`]: ./fn.next.html
//! [`ObjPool::create`]: ./struct.ObjPool.html#method.create
//! [`ObjPool::open`]: ./struct.ObjPool.html#method.open
//! [`ObjPool::root`]: ./struct.ObjPool.html#method.root
//! [`ObjPool::first`]: ./struct.ObjPool.html#method.first
//! [`Oid`]: ./struct.Oid.html
//! [`ll`]: ./ll/index.html

pub mod ll;
pub mod utils;

mod error;
mod hdr;
mod heap;
mod lane;
mod list;
mod oid;
mod pool;
mod store;
mod tests;

pub use error::Error;
pub use hdr::{MAX_LAYOUT, MIN_POOL};
pub use oid::{Oid, NTYPES, OOB_OFFSET};
pub use pool::ObjPool;
pub use store::{alloc_usable_size, direct, free, next};

/// A `Result` type carrying this crate's [`Error`](./enum.Error.html)
pub mod result {
    pub type Result<T> = std::result::Result<T, crate::error::Error>;
}
