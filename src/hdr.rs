//! On-media pool header and descriptor codec
//!
//! The first 4 KiB of a pool is the header: signature, format version,
//! feature masks, UUID, creation time, architecture flags, and a CRC over
//! the whole page. The 2 KiB after it is the pool descriptor: layout name
//! and the offsets and sizes that partition the rest of the file. Both are
//! written once at create time and never mutated afterwards; both carry
//! their checksum in their final 8 bytes. Every integer is little-endian
//! on media and converted on read and write.

use crate::error::Error;
use crate::ll::MemOps;
use crate::result::Result;
use crate::utils;
use std::mem;

/// Size of the on-media pool header
pub(crate) const POOL_HDR_SIZE: u64 = 4096;

/// Size of the persistent part of the pool descriptor
pub(crate) const OBJ_DSC_P_SIZE: u64 = 2048;

/// Offset of the pool descriptor
pub(crate) const OBJ_DSC_OFFSET: u64 = POOL_HDR_SIZE;

/// Offset of the per-instantiation run identifier
pub(crate) const OBJ_RUN_ID_OFFSET: u64 = 8192;

/// Offset of the lane array
pub(crate) const OBJ_LANES_OFFSET: u64 = 12288;

/// Smallest pool file this library accepts
pub const MIN_POOL: usize = 2 * 1024 * 1024;

/// Longest layout name, including its terminator
pub const MAX_LAYOUT: usize = 1024;

pub(crate) const OBJ_HDR_SIG: [u8; 8] = *b"PMEMOBJ\0";
pub(crate) const OBJ_FORMAT_MAJOR: u32 = 1;
pub(crate) const OBJ_FORMAT_COMPAT: u32 = 0;
pub(crate) const OBJ_FORMAT_INCOMPAT: u32 = 0;
pub(crate) const OBJ_FORMAT_RO_COMPAT: u32 = 0;

const HDR_CSUM_OFF: usize = 4088;
const DSC_CSUM_OFF: usize = 2040;

/// Architecture the pool image was created on
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ArchFlags {
    /// Packed log2 alignments of the primitive types
    pub alignment_desc: u64,
    /// ELF machine id of the creating host
    pub e_machine: u16,
    /// ELF data encoding (1 = little-endian, 2 = big-endian)
    pub data: u8,
    pub reserved: [u8; 5],
}

fn alignment_desc() -> u64 {
    // one nibble of log2(alignment) per primitive type, most basic first
    let aligns = [
        mem::align_of::<u8>(),
        mem::align_of::<u16>(),
        mem::align_of::<u32>(),
        mem::align_of::<u64>(),
        mem::align_of::<u128>(),
        mem::align_of::<usize>(),
        mem::align_of::<f32>(),
        mem::align_of::<f64>(),
        mem::align_of::<*const u8>(),
    ];
    let mut desc = 0u64;
    for a in &aligns {
        desc = (desc << 4) | (a.trailing_zeros() as u64 & 0xf);
    }
    desc
}

impl ArchFlags {
    /// Flags describing the running machine
    pub fn current() -> ArchFlags {
        ArchFlags {
            alignment_desc: alignment_desc(),
            e_machine: if cfg!(target_arch = "x86_64") {
                62
            } else if cfg!(target_arch = "aarch64") {
                183
            } else if cfg!(target_arch = "x86") {
                3
            } else {
                0
            },
            data: if cfg!(target_endian = "little") { 1 } else { 2 },
            reserved: [0; 5],
        }
    }

    fn convert2h(&mut self) {
        self.alignment_desc = u64::from_le(self.alignment_desc);
        self.e_machine = u16::from_le(self.e_machine);
    }

    fn convert2le(&mut self) {
        self.alignment_desc = self.alignment_desc.to_le();
        self.e_machine = self.e_machine.to_le();
    }
}

/// The 4 KiB pool header
#[repr(C)]
pub(crate) struct PoolHdr {
    pub signature: [u8; 8],
    pub major: u32,
    pub compat_features: u32,
    pub incompat_features: u32,
    pub ro_compat_features: u32,
    pub uuid: [u8; 16],
    pub crtime: u64,
    pub arch_flags: ArchFlags,
    pub unused: [u8; 4024],
    pub checksum: u64,
}

impl PoolHdr {
    /// Converts a header copied off media into host byte order
    pub fn convert2h(&mut self) {
        self.major = u32::from_le(self.major);
        self.compat_features = u32::from_le(self.compat_features);
        self.incompat_features = u32::from_le(self.incompat_features);
        self.ro_compat_features = u32::from_le(self.ro_compat_features);
        self.crtime = u64::from_le(self.crtime);
        self.arch_flags.convert2h();
        self.checksum = u64::from_le(self.checksum);
    }

    pub fn convert2le(&mut self) {
        self.major = self.major.to_le();
        self.compat_features = self.compat_features.to_le();
        self.incompat_features = self.incompat_features.to_le();
        self.ro_compat_features = self.ro_compat_features.to_le();
        self.crtime = self.crtime.to_le();
        self.arch_flags.convert2le();
        self.checksum = self.checksum.to_le();
    }
}

/// The 2 KiB pool descriptor
#[repr(C)]
pub(crate) struct PoolDesc {
    pub layout: [u8; MAX_LAYOUT],
    pub lanes_offset: u64,
    pub nlanes: u64,
    pub obj_store_offset: u64,
    pub obj_store_size: u64,
    pub heap_offset: u64,
    pub heap_size: u64,
    pub unused: [u8; 968],
    pub checksum: u64,
}

impl PoolDesc {
    pub fn convert2h(&mut self) {
        self.lanes_offset = u64::from_le(self.lanes_offset);
        self.nlanes = u64::from_le(self.nlanes);
        self.obj_store_offset = u64::from_le(self.obj_store_offset);
        self.obj_store_size = u64::from_le(self.obj_store_size);
        self.heap_offset = u64::from_le(self.heap_offset);
        self.heap_size = u64::from_le(self.heap_size);
        self.checksum = u64::from_le(self.checksum);
    }

    pub fn convert2le(&mut self) {
        self.lanes_offset = self.lanes_offset.to_le();
        self.nlanes = self.nlanes.to_le();
        self.obj_store_offset = self.obj_store_offset.to_le();
        self.obj_store_size = self.obj_store_size.to_le();
        self.heap_offset = self.heap_offset.to_le();
        self.heap_size = self.heap_size.to_le();
        self.checksum = self.checksum.to_le();
    }

    /// The layout name as stored, up to its NUL terminator
    pub fn layout_str(&self) -> &[u8] {
        let nul = self
            .layout
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(MAX_LAYOUT);
        &self.layout[..nul]
    }
}

/// Copies the header off media, validates its checksum, and converts it
///
/// A failed checksum means none of the header fields are authoritative and
/// the pool is unusable.
pub(crate) unsafe fn read_hdr(base: *const u8) -> Result<PoolHdr> {
    let mut hdr: PoolHdr = std::ptr::read_unaligned(base as *const PoolHdr);
    if !utils::checksum_ok(utils::as_slice(&hdr), HDR_CSUM_OFF) {
        return Err(Error::image("invalid checksum of pool header"));
    }
    hdr.convert2h();
    Ok(hdr)
}

/// Checksums the header and writes it to media, last write of a create
pub(crate) unsafe fn write_hdr(base: *mut u8, mut hdr: PoolHdr, ops: &dyn MemOps) {
    hdr.convert2le();
    let csum = utils::checksum(utils::as_slice(&hdr), HDR_CSUM_OFF);
    hdr.checksum = csum.to_le();
    ops.memcpy_persist(base, &hdr as *const PoolHdr as *const u8, POOL_HDR_SIZE as usize);
}

/// Copies the descriptor off media, validates its checksum, and converts it
pub(crate) unsafe fn read_desc(base: *const u8) -> Result<PoolDesc> {
    let mut dsc: PoolDesc =
        std::ptr::read_unaligned(base.add(OBJ_DSC_OFFSET as usize) as *const PoolDesc);
    if !utils::checksum_ok(utils::as_slice(&dsc), DSC_CSUM_OFF) {
        return Err(Error::image("invalid checksum of pool descriptor"));
    }
    dsc.convert2h();
    Ok(dsc)
}

/// Checksums the descriptor and writes it to media
pub(crate) unsafe fn write_desc(base: *mut u8, mut dsc: PoolDesc, ops: &dyn MemOps) {
    dsc.convert2le();
    let csum = utils::checksum(utils::as_slice(&dsc), DSC_CSUM_OFF);
    dsc.checksum = csum.to_le();
    ops.memcpy_persist(
        base.add(OBJ_DSC_OFFSET as usize),
        &dsc as *const PoolDesc as *const u8,
        OBJ_DSC_P_SIZE as usize,
    );
}

/// Validates the fixed header fields of an existing pool
pub(crate) fn check_hdr(hdr: &PoolHdr) -> Result<()> {
    if hdr.signature != OBJ_HDR_SIG {
        return Err(Error::image("wrong pool type signature"));
    }
    if hdr.major != OBJ_FORMAT_MAJOR {
        return Err(Error::image(format!(
            "pool version {} (library expects {})",
            hdr.major, OBJ_FORMAT_MAJOR
        )));
    }
    if hdr.arch_flags != ArchFlags::current() {
        return Err(Error::image("wrong architecture flags"));
    }
    Ok(())
}

/// Applies the feature-bit policy of an existing pool
///
/// Unknown incompatible features make the pool unusable; unknown ro-compat
/// features demote the open to read-only; compat bits are informational.
pub(crate) fn check_features(hdr: &PoolHdr) -> Result<bool> {
    if hdr.incompat_features & !OBJ_FORMAT_INCOMPAT != 0 {
        return Err(Error::image(format!(
            "unknown incompat feature bits 0x{:x}",
            hdr.incompat_features & !OBJ_FORMAT_INCOMPAT
        )));
    }
    Ok(hdr.ro_compat_features & !OBJ_FORMAT_RO_COMPAT != 0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn on_media_sizes() {
        assert_eq!(mem::size_of::<PoolHdr>() as u64, POOL_HDR_SIZE);
        assert_eq!(mem::size_of::<PoolDesc>() as u64, OBJ_DSC_P_SIZE);
        assert_eq!(mem::size_of::<ArchFlags>(), 16);
    }

    #[test]
    fn arch_flags_match_self() {
        let mut a = ArchFlags::current();
        assert_eq!(a, ArchFlags::current());
        a.convert2le();
        a.convert2h();
        assert_eq!(a, ArchFlags::current());
    }

    #[test]
    fn hdr_roundtrip() {
        if cfg!(feature = "use_msync") {
            return; // the page-sync dispatch cannot persist heap buffers
        }
        let mut hdr: PoolHdr = unsafe { mem::zeroed() };
        hdr.signature = OBJ_HDR_SIG;
        hdr.major = OBJ_FORMAT_MAJOR;
        hdr.uuid = [0xab; 16];
        hdr.crtime = 123_456;
        hdr.arch_flags = ArchFlags::current();

        let mut page = vec![0u8; POOL_HDR_SIZE as usize];
        unsafe { write_hdr(page.as_mut_ptr(), hdr, crate::ll::dispatch(true)) };

        let back = unsafe { read_hdr(page.as_ptr()) }.unwrap();
        assert_eq!(back.uuid, [0xab; 16]);
        assert_eq!(back.crtime, 123_456);
        check_hdr(&back).unwrap();
        assert!(!check_features(&back).unwrap());

        page[HDR_CSUM_OFF] ^= 0xff;
        assert!(unsafe { read_hdr(page.as_ptr()) }.is_err());
    }
}
