//! Pool lifecycle: create, open, close, check
//!
//! A pool file is mapped read/write (or copy-on-write for the read-only
//! check path), validated, and bootstrapped: the run identifier is bumped
//! and made durable, lane recovery runs, the heap is brought online, and
//! the pool registers itself in the process-wide registry that backs O(1)
//! pointer translation. Any failure after the mapping is established
//! unmaps the file and reports the first observed error.

use crate::error::Error;
use crate::hdr::{self, ArchFlags, PoolDesc, PoolHdr};
use crate::heap;
use crate::lane;
use crate::ll::{self, MemOps};
use crate::log;
use crate::oid::{ListHead, Oid, LIST_HEAD_SIZE, NTYPES};
use crate::result::Result;
use crate::utils;
use lazy_static::lazy_static;
use memmap::{MmapMut, MmapOptions};
use rand::Rng;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Process-wide mapping from pool id to pool handle
///
/// Inserted on open, removed on close, consulted by every pointer
/// translation. Lookups never fail; they return `None` for ids this
/// process has not opened.
pub(crate) struct Registry {
    map: RwLock<HashMap<u64, usize>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, uuid_lo: u64, pop: *const PoolInner) -> Result<()> {
        let mut map = self.map.write().unwrap();
        if map.contains_key(&uuid_lo) {
            return Err(Error::AlreadyPresent);
        }
        map.insert(uuid_lo, pop as usize);
        Ok(())
    }

    pub fn remove(&self, uuid_lo: u64) -> bool {
        self.map.write().unwrap().remove(&uuid_lo).is_some()
    }

    pub fn get(&self, uuid_lo: u64) -> Option<*const PoolInner> {
        self.map
            .read()
            .unwrap()
            .get(&uuid_lo)
            .map(|p| *p as *const PoolInner)
    }
}

lazy_static! {
    pub(crate) static ref POOLS: Registry = Registry::new();
}

/// Runtime state of one open pool
///
/// Everything here is volatile; it is rebuilt at every open and never
/// reaches media. The persistent image is reached only through the base
/// address and the offsets learned from the descriptor.
pub(crate) struct PoolInner {
    /// Keeps the mapping alive for the lifetime of the handle
    _mmap: MmapMut,
    /// Keeps the advisory file lock for the lifetime of the handle
    _file: File,
    path: PathBuf,
    base: usize,
    pub size: usize,
    pub rdonly: bool,
    pub is_pmem: bool,
    pub uuid_lo: u64,
    pub lanes_offset: u64,
    pub nlanes: usize,
    pub runtime_nlanes: usize,
    pub obj_store_offset: u64,
    pub obj_store_size: u64,
    pub heap_offset: u64,
    pub heap_size: u64,
    pub ops: &'static dyn MemOps,
    pub rootlock: Mutex<()>,
    pub list_lock: Mutex<()>,
    pub heap_lock: Mutex<()>,
    pub lanes: Vec<Mutex<()>>,
}

impl PoolInner {
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base as *mut u8
    }

    /// Short name for log lines
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "?".to_string())
    }

    /// Reference to a typed location inside the mapping
    ///
    /// # Safety
    ///
    /// `off` must address a properly aligned `T` within the pool.
    #[inline]
    pub unsafe fn at<'a, T: 'a>(&self, off: u64) -> &'a mut T {
        utils::read_addr(self.base as u64 + off)
    }

    #[inline]
    pub fn read_u64(&self, off: u64) -> u64 {
        unsafe { *(self.base().add(off as usize) as *const u64) }
    }

    #[inline]
    pub fn write_u64(&self, off: u64, val: u64) {
        unsafe {
            *(self.base().add(off as usize) as *mut u64) = val;
        }
    }

    #[inline]
    pub fn in_range(&self, off: u64, len: u64) -> bool {
        off != 0 && off.checked_add(len).map_or(false, |end| end <= self.size as u64)
    }

    /// Current run identifier, even on any cleanly opened pool
    pub fn run_id(&self) -> u64 {
        u64::from_le(self.read_u64(hdr::OBJ_RUN_ID_OFFSET))
    }

    fn bump_run_id(&self) {
        let mut rid = self.run_id().wrapping_add(2);
        if rid == 0 {
            rid = 2;
        }
        self.write_u64(hdr::OBJ_RUN_ID_OFFSET, rid.to_le());
        self.ops.persist(
            unsafe { self.base().add(hdr::OBJ_RUN_ID_OFFSET as usize) },
            mem::size_of::<u64>(),
        );
    }

    /// Offset of the list head for one user type
    #[inline]
    pub fn type_head_off(&self, type_num: usize) -> u64 {
        self.obj_store_offset + type_num as u64 * LIST_HEAD_SIZE
    }

    /// Offset of the root list head
    #[inline]
    pub fn root_head_off(&self) -> u64 {
        self.obj_store_offset + NTYPES as u64 * LIST_HEAD_SIZE
    }

    #[inline]
    pub fn head<'a>(&self, head_off: u64) -> &'a mut ListHead {
        unsafe { self.at(head_off) }
    }
}

/// Derives the pool id from the header UUID: XOR of the low 8 bytes with
/// the high 8 bytes, byte-reversed into a u64
fn uuid_lo(uuid: &[u8; 16]) -> u64 {
    let mut lo = 0u64;
    for i in 0..8 {
        lo = (lo << 8) | u64::from(uuid[i] ^ uuid[8 + i]);
    }
    lo
}

fn flock(file: &File, op: libc::c_int) -> Result<()> {
    if unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) } != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Handle of an open transactional object pool
///
/// Dropping the handle closes the pool: the registry entry is removed, the
/// heap and lanes are shut down, and the file is unmapped. All persistent
/// state is durable before any mutating method returns, so there is no
/// flush-on-close obligation.
pub struct ObjPool {
    pub(crate) inner: Box<PoolInner>,
}

unsafe impl Send for ObjPool {}
unsafe impl Sync for ObjPool {}

impl ObjPool {
    /// Creates a new transactional object pool
    ///
    /// With a non-zero `poolsize` a fresh file of that size is created
    /// (failing if it exists); with `poolsize == 0` an existing, zero-filled
    /// file is adopted and its size learned. `layout`, when given, names the
    /// application schema and is enforced on every subsequent open. `mode`
    /// sets the permission bits of a newly created file.
    pub fn create<P: AsRef<Path>>(
        path: P,
        layout: Option<&str>,
        poolsize: usize,
        mode: u32,
    ) -> Result<ObjPool> {
        let path = path.as_ref();
        let mut poolsize = poolsize;
        let file = if poolsize != 0 {
            if poolsize < hdr::MIN_POOL {
                return Err(Error::inval(format!(
                    "size {} smaller than minimum pool size {}",
                    poolsize,
                    hdr::MIN_POOL
                )));
            }
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(mode)
                .open(path)?;
            f.set_len(poolsize as u64)?;
            f
        } else {
            let f = OpenOptions::new().read(true).write(true).open(path)?;
            let len = f.metadata()?.len() as usize;
            if len < hdr::MIN_POOL {
                return Err(Error::inval(format!(
                    "file length {} smaller than minimum pool size {}",
                    len,
                    hdr::MIN_POOL
                )));
            }
            poolsize = len;
            f
        };
        flock(&file, libc::LOCK_EX)?;

        Self::map_common(file, path, layout, poolsize, false, true)
    }

    /// Opens an existing pool, enforcing the layout name when given
    pub fn open<P: AsRef<Path>>(path: P, layout: Option<&str>) -> Result<ObjPool> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let poolsize = file.metadata()?.len() as usize;
        if poolsize < hdr::MIN_POOL {
            return Err(Error::inval(format!(
                "file length {} smaller than minimum pool size {}",
                poolsize,
                hdr::MIN_POOL
            )));
        }
        flock(&file, libc::LOCK_EX)?;

        Self::map_common(file, path, layout, poolsize, false, false)
    }

    /// Consistency check of a closed pool
    ///
    /// Maps the pool copy-on-write, so nothing the check does reaches the
    /// file. Returns `Ok(true)` when consistent, `Ok(false)` when damage
    /// was found, and `Err` when the pool could not be opened at all.
    pub fn check<P: AsRef<Path>>(path: P, layout: Option<&str>) -> Result<bool> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).open(path)?;
        let poolsize = file.metadata()?.len() as usize;
        if poolsize < hdr::MIN_POOL {
            return Err(Error::inval(format!(
                "file length {} smaller than minimum pool size {}",
                poolsize,
                hdr::MIN_POOL
            )));
        }
        flock(&file, libc::LOCK_SH)?;

        let pop = Self::map_common(file, path, layout, poolsize, true, false)?;

        let mut consistent = true;
        if pop.inner.run_id() % 2 != 0 {
            log!(pop.inner.name(), Red, "CHECK", "invalid run_id {}", pop.inner.run_id());
            consistent = false;
        }
        if let Err(_e) = heap::check(&pop.inner) {
            log!(pop.inner.name(), Red, "CHECK", "heap check: {}", _e);
            consistent = false;
        }
        if let Err(_e) = lane::check(&pop.inner) {
            log!(pop.inner.name(), Red, "CHECK", "lane check: {}", _e);
            consistent = false;
        }
        drop(pop);
        Ok(consistent)
    }

    /// Closes the pool; equivalent to dropping the handle
    pub fn close(self) {}

    /// The id this pool contributes to every `Oid` it issues
    pub fn uuid_lo(&self) -> u64 {
        self.inner.uuid_lo
    }

    /// Run identifier of this instantiation; even and non-zero
    pub fn run_id(&self) -> u64 {
        self.inner.run_id()
    }

    /// Tells if the pool was opened, or demoted to, read-only
    pub fn is_read_only(&self) -> bool {
        self.inner.rdonly
    }

    /// Tells if the mapping resides on real persistent memory
    pub fn is_pmem(&self) -> bool {
        self.inner.is_pmem
    }

    /// Makes `len` bytes of an object's payload durable
    ///
    /// Use after filling object memory through [`direct`](./fn.direct.html).
    pub fn persist(&self, oid: Oid, len: usize) {
        if oid.is_null() || oid.pool_uuid_lo != self.inner.uuid_lo {
            return;
        }
        self.inner
            .ops
            .persist(unsafe { self.inner.base().add(oid.off as usize) }, len);
    }

    /// Maps a pool file and performs the shared part of create and open
    fn map_common(
        file: File,
        path: &Path,
        layout: Option<&str>,
        poolsize: usize,
        rdonly: bool,
        empty: bool,
    ) -> Result<ObjPool> {
        let mut mmap = unsafe {
            if rdonly {
                MmapOptions::new().map_copy(&file)?
            } else {
                MmapOptions::new().map_mut(&file)?
            }
        };
        let base = mmap.as_mut_ptr();

        let is_pmem = ll::is_pmem(base, poolsize);
        let ops = ll::dispatch(is_pmem);

        let (uuid, rdonly, dsc) = if empty {
            let hdr_region =
                unsafe { std::slice::from_raw_parts(base, hdr::POOL_HDR_SIZE as usize) };
            if !utils::is_zeroed(hdr_region) {
                return Err(Error::image("non-empty file detected"));
            }
            if let Some(l) = layout {
                if l.len() >= hdr::MAX_LAYOUT {
                    return Err(Error::inval("layout name too long"));
                }
            }

            // run_id starts at zero, the common path bumps it below
            ops.memset_persist(
                unsafe { base.add(hdr::OBJ_RUN_ID_OFFSET as usize) },
                0,
                mem::size_of::<u64>(),
            );

            // zero all lanes
            let lanes_len = lane::OBJ_NLANES * lane::LANE_SIZE;
            ops.memset_persist(
                unsafe { base.add(hdr::OBJ_LANES_OFFSET as usize) },
                0,
                lanes_len,
            );

            // zero the object store
            let obj_store_offset = hdr::OBJ_LANES_OFFSET + lanes_len as u64;
            let obj_store_size = (NTYPES as u64 + 1) * LIST_HEAD_SIZE;
            ops.memset_persist(
                unsafe { base.add(obj_store_offset as usize) },
                0,
                obj_store_size as usize,
            );

            let heap_offset = obj_store_offset + obj_store_size;
            let heap_size = poolsize as u64 - heap_offset;
            heap::init(base, ops, heap_offset, heap_size)?;

            let mut dsc: PoolDesc = unsafe { mem::zeroed() };
            if let Some(l) = layout {
                dsc.layout[..l.len()].copy_from_slice(l.as_bytes());
            }
            dsc.lanes_offset = hdr::OBJ_LANES_OFFSET;
            dsc.nlanes = lane::OBJ_NLANES as u64;
            dsc.obj_store_offset = obj_store_offset;
            dsc.obj_store_size = obj_store_size;
            dsc.heap_offset = heap_offset;
            dsc.heap_size = heap_size;
            unsafe { hdr::write_desc(base, dsc, ops) };
            let dsc = unsafe { hdr::read_desc(base)? };

            // the header is the last durable write of a create; a pool
            // becomes valid exactly when its checksum does
            let mut h: PoolHdr = unsafe { mem::zeroed() };
            h.signature = hdr::OBJ_HDR_SIG;
            h.major = hdr::OBJ_FORMAT_MAJOR;
            h.compat_features = hdr::OBJ_FORMAT_COMPAT;
            h.incompat_features = hdr::OBJ_FORMAT_INCOMPAT;
            h.ro_compat_features = hdr::OBJ_FORMAT_RO_COMPAT;
            h.uuid = rand::thread_rng().gen();
            h.crtime = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            h.arch_flags = ArchFlags::current();
            let uuid = h.uuid;
            unsafe { hdr::write_hdr(base, h, ops) };

            (uuid, rdonly, dsc)
        } else {
            let h = unsafe { hdr::read_hdr(base)? };
            hdr::check_hdr(&h)?;
            let dsc = unsafe { hdr::read_desc(base)? };
            if let Some(l) = layout {
                if dsc.layout_str() != l.as_bytes() {
                    return Err(Error::inval(format!(
                        "wrong layout (\"{}\"), pool created with layout \"{}\"",
                        l,
                        String::from_utf8_lossy(dsc.layout_str())
                    )));
                }
            }
            if dsc.obj_store_offset + dsc.obj_store_size != dsc.heap_offset
                || dsc.heap_offset + dsc.heap_size != poolsize as u64
            {
                return Err(Error::image("descriptor does not partition the pool"));
            }
            let rdonly = rdonly | hdr::check_features(&h)?;
            (h.uuid, rdonly, dsc)
        };

        let nlanes = dsc.nlanes as usize;
        let inner = Box::new(PoolInner {
            base: base as usize,
            size: poolsize,
            rdonly,
            is_pmem,
            uuid_lo: uuid_lo(&uuid),
            lanes_offset: dsc.lanes_offset,
            nlanes,
            runtime_nlanes: nlanes.min(num_cpus::get().max(1) * 4).max(1),
            obj_store_offset: dsc.obj_store_offset,
            obj_store_size: dsc.obj_store_size,
            heap_offset: dsc.heap_offset,
            heap_size: dsc.heap_size,
            ops,
            rootlock: Mutex::new(()),
            list_lock: Mutex::new(()),
            heap_lock: Mutex::new(()),
            lanes: (0..nlanes).map(|_| Mutex::new(())).collect(),
            path: path.to_path_buf(),
            _mmap: mmap,
            _file: file,
        });

        debug_assert_eq!(
            inner.obj_store_offset + inner.obj_store_size,
            inner.heap_offset
        );

        // run_id becomes durable before any runtime subsystem boots
        inner.bump_run_id();

        lane::boot(&inner)?;
        heap::boot(&inner)?;

        // revoke permissions on the header page where the OS allows;
        // failure is not an error
        unsafe {
            libc::mprotect(
                inner.base() as *mut libc::c_void,
                hdr::POOL_HDR_SIZE as usize,
                libc::PROT_NONE,
            );
        }

        POOLS.insert(inner.uuid_lo, &*inner)?;

        log!(
            inner.name(),
            Yellow,
            "OPEN",
            "uuid_lo 0x{:016x} run_id {} size {} pmem {}",
            inner.uuid_lo,
            inner.run_id(),
            inner.size,
            inner.is_pmem
        );

        Ok(ObjPool { inner })
    }
}

impl Drop for ObjPool {
    fn drop(&mut self) {
        if !POOLS.remove(self.inner.uuid_lo) {
            log!(self.inner.name(), Red, "CLOSE", "pool not in registry");
        }
        if let Err(_e) = heap::cleanup(&self.inner) {
            log!(self.inner.name(), Red, "CLOSE", "heap cleanup: {}", _e);
        }
        if let Err(_e) = lane::cleanup(&self.inner) {
            log!(self.inner.name(), Red, "CLOSE", "lane cleanup: {}", _e);
        }
        log!(self.inner.name(), Yellow, "CLOSE", "unmapping {} bytes", self.inner.size);
    }
}
