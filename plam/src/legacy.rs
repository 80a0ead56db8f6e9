//! Deprecated PLM2 reader
//!
//! The flat PLM2 layout (one code blob, one data blob, a resource table) is
//! still found on older boot media. It is read here and upgraded into an
//! equivalent PLAM v2 container; nothing else in the crate sees PLM2.

use alloc::vec::Vec;

use sha2::{Digest, Sha256};

use crate::codec::{decode_table, slice_at, ByteReader, ByteWriter, Record};
use crate::compress;
use crate::config::DEFAULT_PAGE_SIZE;
use crate::deps::SemVer;
use crate::error::{LoadError, Result};
use crate::format::{
    CompressionAlgorithm, CpuId, FileType, HashType, ResourceType, LEGACY_MAGIC, PLAM_RES_MAGIC,
};
use crate::integrity;
use crate::writer::{ContainerBuilder, ResourceSpec, SectionSpec, SymbolSpec};

/// Image address of the upgraded code section.
pub const LEGACY_CODE_RVA: u64 = 0x1000;

/// PLM2 file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyHeader {
    pub magic: u32,
    pub version_major: u16,
    pub version_minor: u16,
    /// File offset of the entry point.
    pub entry_point: u64,
    pub file_flags: u32,
    pub target_arch: u32,
    pub code_offset: u64,
    pub code_size: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub resources_offset: u64,
    pub resource_count: u32,
    pub uuid: [u8; 16],
    /// CRC-32 of the code bytes, 0 when absent.
    pub checksum: u32,
    pub version_tag: [u8; 8],
    pub reserved: [u8; 24],
}

impl Record for LegacyHeader {
    const SIZE: usize = 120;

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            magic: r.u32()?,
            version_major: r.u16()?,
            version_minor: r.u16()?,
            entry_point: r.u64()?,
            file_flags: r.u32()?,
            target_arch: r.u32()?,
            code_offset: r.u64()?,
            code_size: r.u64()?,
            data_offset: r.u64()?,
            data_size: r.u64()?,
            resources_offset: r.u64()?,
            resource_count: r.u32()?,
            uuid: r.array()?,
            checksum: r.u32()?,
            version_tag: r.array()?,
            reserved: r.array()?,
        })
    }

    fn write(&self, w: &mut ByteWriter<'_>) {
        w.u32(self.magic);
        w.u16(self.version_major);
        w.u16(self.version_minor);
        w.u64(self.entry_point);
        w.u32(self.file_flags);
        w.u32(self.target_arch);
        w.u64(self.code_offset);
        w.u64(self.code_size);
        w.u64(self.data_offset);
        w.u64(self.data_size);
        w.u64(self.resources_offset);
        w.u32(self.resource_count);
        w.bytes(&self.uuid);
        w.u32(self.checksum);
        w.bytes(&self.version_tag);
        w.bytes(&self.reserved);
    }
}

/// PLM2 resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyResource {
    pub magic: u32,
    pub res_type: u32,
    pub offset: u64,
    /// Decompressed size.
    pub size: u64,
    pub compressed_size: u32,
    pub compression: u16,
    pub flags: u32,
    /// SHA-256 of the decompressed bytes, all zero when absent.
    pub hash: [u8; 32],
}

impl Record for LegacyResource {
    const SIZE: usize = 66;

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            magic: r.u32()?,
            res_type: r.u32()?,
            offset: r.u64()?,
            size: r.u64()?,
            compressed_size: r.u32()?,
            compression: r.u16()?,
            flags: r.u32()?,
            hash: r.array()?,
        })
    }

    fn write(&self, w: &mut ByteWriter<'_>) {
        w.u32(self.magic);
        w.u32(self.res_type);
        w.u64(self.offset);
        w.u64(self.size);
        w.u32(self.compressed_size);
        w.u16(self.compression);
        w.u32(self.flags);
        w.bytes(&self.hash);
    }
}

impl LegacyResource {
    /// PLM2 compression ids differ from v2 ones.
    fn algorithm(&self) -> CompressionAlgorithm {
        match self.compression {
            0 => CompressionAlgorithm::None,
            1 => CompressionAlgorithm::Lz4,
            2 => CompressionAlgorithm::Lzma,
            3 => CompressionAlgorithm::Zstd,
            other => CompressionAlgorithm::Other(other as u32),
        }
    }

    fn resource_type(&self) -> ResourceType {
        match self.res_type {
            0x01 => ResourceType::Icon,
            0x02 => ResourceType::String,
            _ => ResourceType::Vendor,
        }
    }

    fn stored_size(&self) -> u64 {
        if self.algorithm() == CompressionAlgorithm::None {
            self.size
        } else {
            self.compressed_size as u64
        }
    }
}

/// Whether `bytes` start with the PLM2 magic.
pub fn is_legacy(bytes: &[u8]) -> bool {
    bytes
        .get(..4)
        .map(|m| u32::from_le_bytes([m[0], m[1], m[2], m[3]]) == LEGACY_MAGIC)
        .unwrap_or(false)
}

/// Version from a tag like `v1.2.0`.
fn tag_version(tag: &[u8; 8]) -> Option<SemVer> {
    let len = tag.iter().position(|&b| b == 0).unwrap_or(tag.len());
    let text = core::str::from_utf8(&tag[..len]).ok()?;
    SemVer::parse(text.trim_start_matches(['v', 'V']))
}

/// Read a PLM2 file and re-encode it as a PLAM v2 container.
pub fn upgrade(bytes: &[u8]) -> Result<Vec<u8>> {
    let header = LegacyHeader::decode(bytes)?;
    if header.magic != LEGACY_MAGIC {
        return Err(LoadError::MagicMismatch {
            expected: LEGACY_MAGIC,
            found: header.magic,
        });
    }

    let code = slice_at(bytes, header.code_offset, header.code_size)?;
    if header.checksum != 0 && integrity::crc32(code) != header.checksum {
        return Err(LoadError::ChecksumMismatch);
    }
    let data = slice_at(bytes, header.data_offset, header.data_size)?;

    // Entry is a file offset inside the code blob.
    let entry = header
        .entry_point
        .checked_sub(header.code_offset)
        .filter(|&off| off < header.code_size)
        .ok_or(LoadError::InvalidEntryPoint(header.entry_point))?;

    let cpu = u16::try_from(header.target_arch)
        .map(CpuId::from_raw)
        .unwrap_or(CpuId::Unknown);
    let mut builder = ContainerBuilder::new(FileType::App, cpu);
    builder
        .uuid(header.uuid)
        .hash_type(HashType::Blake3)
        .entry(LEGACY_CODE_RVA + entry);

    let text = builder.add_section(SectionSpec::code(".text", LEGACY_CODE_RVA, code.to_vec()));
    if !data.is_empty() {
        let data_rva = (LEGACY_CODE_RVA + header.code_size.max(1)).next_multiple_of(DEFAULT_PAGE_SIZE);
        builder.add_section(SectionSpec::data(".data", data_rva, data.to_vec()));
    }
    builder.add_symbol(SymbolSpec::function("entry", text, LEGACY_CODE_RVA + entry));

    let records: Vec<LegacyResource> =
        decode_table(bytes, header.resources_offset, header.resource_count)?;
    for (index, record) in records.iter().enumerate() {
        if record.magic != LEGACY_MAGIC && record.magic != PLAM_RES_MAGIC {
            return Err(LoadError::MagicMismatch {
                expected: PLAM_RES_MAGIC,
                found: record.magic,
            });
        }
        let stored = slice_at(bytes, record.offset, record.stored_size())?;
        let content = compress::decompress(record.algorithm(), stored, record.size)
            .map_err(|_| LoadError::ResourceCorrupt { index })?;
        if record.hash != [0u8; 32] && Sha256::digest(&content).as_slice() != record.hash {
            log::warn!("[PLAM] legacy resource {} fails its hash, dropped", index);
            continue;
        }
        builder.add_resource(ResourceSpec::new(record.resource_type(), content));
    }

    if let Some(version) = tag_version(&header.version_tag) {
        builder.version(version);
    }

    log::info!(
        "[PLAM] upgraded PLM2 {}.{} container ({} resources)",
        header.version_major,
        header.version_minor,
        records.len()
    );
    builder.build().map_err(|err| {
        log::warn!("[PLAM] legacy upgrade failed: {}", err);
        LoadError::DecompressionFailed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadPolicy;
    use crate::container::Container;
    use crate::error::LoadWarning;
    use crate::resources::ResourceStore;

    /// Header, code, data, one resource record and its payload.
    fn legacy_file(checksum_ok: bool) -> Vec<u8> {
        let code = [0x90u8; 32];
        let data = [7u8; 8];
        let icon = b"icon-bytes";
        let code_offset = LegacyHeader::SIZE as u64;
        let data_offset = code_offset + code.len() as u64;
        let res_offset = data_offset + data.len() as u64;
        let payload_offset = res_offset + LegacyResource::SIZE as u64;

        let mut checksum = integrity::crc32(&code);
        if !checksum_ok {
            checksum ^= 1;
        }
        let mut tag = [0u8; 8];
        tag[..6].copy_from_slice(b"v1.2.0");
        let header = LegacyHeader {
            magic: LEGACY_MAGIC,
            version_major: 1,
            version_minor: 0,
            entry_point: code_offset + 4,
            file_flags: 0,
            target_arch: 0x8664,
            code_offset,
            code_size: code.len() as u64,
            data_offset,
            data_size: data.len() as u64,
            resources_offset: res_offset,
            resource_count: 1,
            uuid: [3; 16],
            checksum,
            version_tag: tag,
            reserved: [0; 24],
        };
        let resource = LegacyResource {
            magic: LEGACY_MAGIC,
            res_type: 0x01,
            offset: payload_offset,
            size: icon.len() as u64,
            compressed_size: icon.len() as u32,
            compression: 0,
            flags: 0,
            hash: Sha256::digest(icon).into(),
        };
        let mut out = header.to_bytes();
        out.extend_from_slice(&code);
        out.extend_from_slice(&data);
        resource.encode(&mut out);
        out.extend_from_slice(icon);
        out
    }

    #[test]
    fn test_upgrade_and_open() {
        let file = legacy_file(true);
        assert!(is_legacy(&file));
        let container = Container::open(&file, &LoadPolicy::default()).unwrap();
        assert_eq!(container.warnings(), &[LoadWarning::LegacyFormat]);
        let header = container.header();
        assert_eq!(header.entry_off, LEGACY_CODE_RVA + 4);
        assert_eq!(header.uuid, [3; 16]);
        assert_eq!(container.sections().unwrap().len(), 2);

        let store = ResourceStore::index(header, container.bytes()).unwrap();
        assert_eq!(&*store.get_resource(ResourceType::Icon, "").unwrap(), b"icon-bytes");
        let mut warnings = Vec::new();
        assert_eq!(store.version(&mut warnings), Some(SemVer::new(1, 2, 0)));
    }

    #[test]
    fn test_code_checksum_checked() {
        assert_eq!(upgrade(&legacy_file(false)), Err(LoadError::ChecksumMismatch));
    }

    #[test]
    fn test_truncated_legacy_header() {
        let file = legacy_file(true);
        assert!(matches!(
            upgrade(&file[..60]),
            Err(LoadError::TruncatedInput { .. })
        ));
    }
}
