//! Container header
//!
//! The header is self-sizing: `hdr_size` may exceed [`HEADER_SIZE`] for newer
//! minor versions, in which case the extra bytes are skipped by decoding but
//! still covered by the checksum.

use crate::codec::{ByteReader, ByteWriter, Record, Rva};
use crate::error::{LoadError, Result};
use crate::format::{
    CompressionAlgorithm, CpuFeatures, CpuId, FileType, HashType, HeaderFlags, RelroLevel,
    FORMAT_MAJOR, FORMAT_MINOR, PLAM_MAGIC,
};

/// Size of the header fields known to this version.
pub const HEADER_SIZE: usize = 380;

/// Offset of `hdr_crc32` inside the header.
pub const CRC_OFFSET: usize = 16;

/// Offset of `hdr_size` inside the header.
pub const HDR_SIZE_OFFSET: usize = 10;

/// Directories block (security blob, load config, TLS template, user config,
/// embedded fat-arch table).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Directories {
    pub security: Rva,
    pub loadcfg: Rva,
    pub tls: Rva,
    pub cfg: Rva,
    pub fat_off: u64,
    pub fat_cnt: u32,
    pub reserved: u32,
}

impl Record for Directories {
    const SIZE: usize = 80;

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            security: r.rva()?,
            loadcfg: r.rva()?,
            tls: r.rva()?,
            cfg: r.rva()?,
            fat_off: r.u64()?,
            fat_cnt: r.u32()?,
            reserved: r.u32()?,
        })
    }

    fn write(&self, w: &mut ByteWriter<'_>) {
        w.rva(self.security);
        w.rva(self.loadcfg);
        w.rva(self.tls);
        w.rva(self.cfg);
        w.u64(self.fat_off);
        w.u32(self.fat_cnt);
        w.u32(self.reserved);
    }
}

/// PLAM container header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub magic: u32,
    pub hdr_ver_major: u16,
    pub hdr_ver_minor: u16,
    pub file_type: FileType,
    pub hdr_size: u16,
    pub flags: HeaderFlags,
    pub hdr_crc32: u32,

    pub entry_off: u64,
    pub cpu_id: CpuId,
    pub cpu_sub: CpuFeatures,
    pub abi_ver: u32,
    pub cpu_feat: u64,

    pub str_table: Rva,
    pub sym_table: Rva,
    pub section_table_off: u64,
    pub section_count: u32,
    pub reloc_table_off: u64,
    pub reloc_count: u32,
    pub unwind_table_off: u64,
    pub unwind_count: u32,

    pub import_off: u64,
    pub export_off: u64,
    pub symbol_table_off: u64,
    pub symbol_count: u32,

    pub resources: Rva,
    pub debug: Rva,

    pub uuid: [u8; 16],
    pub build_hash: [u8; 32],
    pub timestamp: u64,

    pub os_abi: u32,
    pub os_ver_min: u32,
    pub os_ver_sdk: u32,
    pub crypto_mode: u16,
    pub hash_type: HashType,
    pub sig_scheme: u16,
    pub relro_lvl: RelroLevel,
    pub file_comp: CompressionAlgorithm,

    pub manifest: Rva,
    pub deps_cnt: u32,
    pub res_cnt: u32,

    pub lang_mask: u32,
    pub tool_major: u16,
    pub tool_minor: u16,
    pub stdlib_ver: u16,
    pub comp_model: u8,
    pub lto_pgo_flags: u8,

    pub dirs: Directories,
    pub reserved: [u8; 16],
}

impl ContainerHeader {
    /// Blank header for the given type and architecture.
    pub fn new(file_type: FileType, cpu_id: CpuId) -> Self {
        Self {
            magic: PLAM_MAGIC,
            hdr_ver_major: FORMAT_MAJOR,
            hdr_ver_minor: FORMAT_MINOR,
            file_type,
            hdr_size: HEADER_SIZE as u16,
            flags: HeaderFlags::empty(),
            hdr_crc32: 0,
            entry_off: 0,
            cpu_id,
            cpu_sub: CpuFeatures::empty(),
            abi_ver: 0,
            cpu_feat: 0,
            str_table: Rva::EMPTY,
            sym_table: Rva::EMPTY,
            section_table_off: 0,
            section_count: 0,
            reloc_table_off: 0,
            reloc_count: 0,
            unwind_table_off: 0,
            unwind_count: 0,
            import_off: 0,
            export_off: 0,
            symbol_table_off: 0,
            symbol_count: 0,
            resources: Rva::EMPTY,
            debug: Rva::EMPTY,
            uuid: [0; 16],
            build_hash: [0; 32],
            timestamp: 0,
            os_abi: 0,
            os_ver_min: 0,
            os_ver_sdk: 0,
            crypto_mode: 0,
            hash_type: HashType::None,
            sig_scheme: 0,
            relro_lvl: RelroLevel::None,
            file_comp: CompressionAlgorithm::None,
            manifest: Rva::EMPTY,
            deps_cnt: 0,
            res_cnt: 0,
            lang_mask: 0,
            tool_major: 0,
            tool_minor: 0,
            stdlib_ver: 0,
            comp_model: 0,
            lto_pgo_flags: 0,
            dirs: Directories::default(),
            reserved: [0; 16],
        }
    }

    /// Decode and check magic, major version and declared size.
    ///
    /// Returns the header together with the number of bytes it occupies
    /// (`hdr_size`).
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize)> {
        let header = Self::decode(bytes)?;
        if header.magic != PLAM_MAGIC {
            return Err(LoadError::MagicMismatch {
                expected: PLAM_MAGIC,
                found: header.magic,
            });
        }
        if header.hdr_ver_major != FORMAT_MAJOR {
            return Err(LoadError::UnsupportedMajorVersion(header.hdr_ver_major));
        }
        let declared = header.hdr_size as usize;
        if declared < HEADER_SIZE {
            return Err(LoadError::truncated(HEADER_SIZE, declared));
        }
        if bytes.len() < declared {
            return Err(LoadError::truncated(declared, bytes.len()));
        }
        Ok((header, declared))
    }

    /// Whether this container only wraps per-architecture sub-images.
    pub fn is_fat(&self) -> bool {
        self.dirs.fat_cnt > 0
    }
}

impl Record for ContainerHeader {
    const SIZE: usize = HEADER_SIZE;

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            magic: r.u32()?,
            hdr_ver_major: r.u16()?,
            hdr_ver_minor: r.u16()?,
            file_type: FileType::from_raw(r.u16()?),
            hdr_size: r.u16()?,
            flags: HeaderFlags::from_bits_retain(r.u32()?),
            hdr_crc32: r.u32()?,
            entry_off: r.u64()?,
            cpu_id: CpuId::from_raw(r.u16()?),
            cpu_sub: CpuFeatures::from_bits_retain(r.u16()?),
            abi_ver: r.u32()?,
            cpu_feat: r.u64()?,
            str_table: r.rva()?,
            sym_table: r.rva()?,
            section_table_off: r.u64()?,
            section_count: r.u32()?,
            reloc_table_off: r.u64()?,
            reloc_count: r.u32()?,
            unwind_table_off: r.u64()?,
            unwind_count: r.u32()?,
            import_off: r.u64()?,
            export_off: r.u64()?,
            symbol_table_off: r.u64()?,
            symbol_count: r.u32()?,
            resources: r.rva()?,
            debug: r.rva()?,
            uuid: r.array()?,
            build_hash: r.array()?,
            timestamp: r.u64()?,
            os_abi: r.u32()?,
            os_ver_min: r.u32()?,
            os_ver_sdk: r.u32()?,
            crypto_mode: r.u16()?,
            hash_type: HashType::from_raw(r.u16()?),
            sig_scheme: r.u16()?,
            relro_lvl: RelroLevel::from_raw(r.u8()?),
            file_comp: CompressionAlgorithm::from_raw(u32::from(r.u8()?)),
            manifest: r.rva()?,
            deps_cnt: r.u32()?,
            res_cnt: r.u32()?,
            lang_mask: r.u32()?,
            tool_major: r.u16()?,
            tool_minor: r.u16()?,
            stdlib_ver: r.u16()?,
            comp_model: r.u8()?,
            lto_pgo_flags: r.u8()?,
            dirs: Directories::read(r)?,
            reserved: r.array()?,
        })
    }

    fn write(&self, w: &mut ByteWriter<'_>) {
        w.u32(self.magic);
        w.u16(self.hdr_ver_major);
        w.u16(self.hdr_ver_minor);
        w.u16(self.file_type.raw());
        w.u16(self.hdr_size);
        w.u32(self.flags.bits());
        w.u32(self.hdr_crc32);
        w.u64(self.entry_off);
        w.u16(self.cpu_id.raw());
        w.u16(self.cpu_sub.bits());
        w.u32(self.abi_ver);
        w.u64(self.cpu_feat);
        w.rva(self.str_table);
        w.rva(self.sym_table);
        w.u64(self.section_table_off);
        w.u32(self.section_count);
        w.u64(self.reloc_table_off);
        w.u32(self.reloc_count);
        w.u64(self.unwind_table_off);
        w.u32(self.unwind_count);
        w.u64(self.import_off);
        w.u64(self.export_off);
        w.u64(self.symbol_table_off);
        w.u32(self.symbol_count);
        w.rva(self.resources);
        w.rva(self.debug);
        w.bytes(&self.uuid);
        w.bytes(&self.build_hash);
        w.u64(self.timestamp);
        w.u32(self.os_abi);
        w.u32(self.os_ver_min);
        w.u32(self.os_ver_sdk);
        w.u16(self.crypto_mode);
        w.u16(self.hash_type.raw());
        w.u16(self.sig_scheme);
        w.u8(self.relro_lvl.raw());
        // The writer refuses ids that have no byte tag.
        w.u8(self.file_comp.byte_tag().unwrap_or(u8::MAX));
        w.rva(self.manifest);
        w.u32(self.deps_cnt);
        w.u32(self.res_cnt);
        w.u32(self.lang_mask);
        w.u16(self.tool_major);
        w.u16(self.tool_minor);
        w.u16(self.stdlib_ver);
        w.u8(self.comp_model);
        w.u8(self.lto_pgo_flags);
        self.dirs.write(w);
        w.bytes(&self.reserved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_header_size_matches_layout() {
        let header = ContainerHeader::new(FileType::App, CpuId::X86_64);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..4], &PLAM_MAGIC.to_le_bytes());
        assert_eq!(&bytes[HDR_SIZE_OFFSET..HDR_SIZE_OFFSET + 2], &380u16.to_le_bytes());
        assert_eq!(&bytes[28..30], &0x8664u16.to_le_bytes());
    }

    #[test]
    fn test_fat_fields_at_fixed_offsets() {
        let mut header = ContainerHeader::new(FileType::Boot, CpuId::None);
        header.dirs.fat_off = 0x1000;
        header.dirs.fat_cnt = 2;
        let bytes = header.to_bytes();
        assert_eq!(&bytes[348..356], &0x1000u64.to_le_bytes());
        assert_eq!(&bytes[356..360], &2u32.to_le_bytes());
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut bytes = ContainerHeader::new(FileType::App, CpuId::X86_64).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            ContainerHeader::parse(&bytes),
            Err(LoadError::MagicMismatch { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_major_version() {
        let mut header = ContainerHeader::new(FileType::App, CpuId::X86_64);
        header.hdr_ver_major = 3;
        assert_eq!(
            ContainerHeader::parse(&header.to_bytes()),
            Err(LoadError::UnsupportedMajorVersion(3))
        );
    }

    #[test]
    fn test_parse_accepts_larger_minor_header() {
        let mut header = ContainerHeader::new(FileType::App, CpuId::X86_64);
        header.hdr_ver_minor = 7;
        header.hdr_size = 400;
        let mut bytes = header.to_bytes();
        bytes.extend_from_slice(&[0xEE; 20]);
        let (parsed, size) = ContainerHeader::parse(&bytes).unwrap();
        assert_eq!(size, 400);
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_parse_truncated() {
        let bytes = vec![0u8; 100];
        assert!(matches!(
            ContainerHeader::parse(&bytes),
            Err(LoadError::TruncatedInput { needed: 380, available: 100 })
        ));
    }
}
