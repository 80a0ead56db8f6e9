//! Container front end
//!
//! Opens a byte buffer as a verified container: legacy upgrade, fat selection,
//! header checksum, whole-file decompression, build hash and signature. The
//! result owns the logical bytes every table offset is relative to.

use alloc::vec::Vec;

use crate::codec::{decode_table, Record};
use crate::compress;
use crate::config::LoadPolicy;
use crate::deps::{decode_dependencies, DependencySpec};
use crate::error::{LoadError, LoadWarning, Result};
use crate::fat;
use crate::format::{CompressionAlgorithm, HashType, LEGACY_MAGIC};
use crate::header::ContainerHeader;
use crate::integrity::{self, SignatureStatus};
use crate::legacy;
use crate::reloc::decode_relocations;
use crate::symbols::SymbolTable;
use crate::tables::{FatArch, ManifestExt, Relocation, Section, StringTable, UnwindEntry};

/// A verified thin container.
#[derive(Debug, Clone)]
pub struct Container {
    header: ContainerHeader,
    hdr_size: usize,
    bytes: Vec<u8>,
    arch: Option<FatArch>,
    signature: SignatureStatus,
    warnings: Vec<LoadWarning>,
}

impl Container {
    /// Open `bytes` under `policy`.
    pub fn open(bytes: &[u8], policy: &LoadPolicy) -> Result<Self> {
        if legacy::is_legacy(bytes) {
            log::warn!("[PLAM] legacy PLM2 container, upgrading (deprecated format)");
            let upgraded = legacy::upgrade(bytes)?;
            let mut container = Self::open(&upgraded, policy)?;
            container.warnings.push(LoadWarning::LegacyFormat);
            return Ok(container);
        }

        let (header, hdr_size) = ContainerHeader::parse(bytes)?;
        if !integrity::verify_header_checksum(&bytes[..hdr_size]) {
            return Err(LoadError::ChecksumMismatch);
        }
        if !header.is_fat() {
            return Self::open_thin(bytes, policy, None);
        }
        let (arch, image) = fat::select(&header, bytes, policy.cpu)?;
        Self::open_thin(image, policy, Some(arch))
    }

    fn open_thin(bytes: &[u8], policy: &LoadPolicy, arch: Option<FatArch>) -> Result<Self> {
        let (header, hdr_size) = ContainerHeader::parse(bytes)?;
        let header_bytes = &bytes[..hdr_size];
        if arch.is_some() && !integrity::verify_header_checksum(header_bytes) {
            return Err(LoadError::ChecksumMismatch);
        }

        let logical = match header.file_comp {
            CompressionAlgorithm::None => bytes.to_vec(),
            alg => {
                let payload = compress::decompress_payload(alg, &bytes[hdr_size..])?;
                let mut logical = Vec::with_capacity(hdr_size + payload.len());
                logical.extend_from_slice(header_bytes);
                logical.extend_from_slice(&payload);
                logical
            }
        };

        let mut warnings = Vec::new();
        if policy.verify_build_hash {
            verify_build_hash(&header, hdr_size, &logical, &mut warnings)?;
        }

        let keys = policy.trusted_key_bytes();
        let signature = integrity::verify_signature(&header, header_bytes, &logical, &keys);
        match signature {
            SignatureStatus::Invalid => return Err(LoadError::SignatureInvalid),
            SignatureStatus::UnknownAlgorithm => {
                log::warn!("[PLAM] signature scheme not supported, not verified")
            }
            _ => {}
        }
        if policy.require_signature && signature != SignatureStatus::Valid {
            log::warn!("[PLAM] policy requires a valid signature, got {:?}", signature);
            return Err(LoadError::SignatureInvalid);
        }

        log::debug!(
            "[PLAM] opened {:?} container for {}, {} bytes",
            header.file_type,
            header.cpu_id.name(),
            logical.len()
        );
        Ok(Self {
            header,
            hdr_size,
            bytes: logical,
            arch,
            signature,
            warnings,
        })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Logical container bytes (header plus decompressed payload).
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn header_bytes(&self) -> &[u8] {
        &self.bytes[..self.hdr_size]
    }

    /// Fat-table entry this container was selected from.
    pub fn arch(&self) -> Option<FatArch> {
        self.arch
    }

    pub fn signature(&self) -> SignatureStatus {
        self.signature
    }

    pub fn warnings(&self) -> &[LoadWarning] {
        &self.warnings
    }

    pub fn strings(&self) -> Result<StringTable<'_>> {
        if self.header.str_table.is_empty() {
            return Ok(StringTable::new(&[]));
        }
        Ok(StringTable::new(
            self.header.str_table.slice(&self.bytes, "string table")?,
        ))
    }

    pub fn sections(&self) -> Result<Vec<Section>> {
        decode_table(
            &self.bytes,
            self.header.section_table_off,
            self.header.section_count,
        )
    }

    pub fn symbols(&self) -> Result<SymbolTable> {
        SymbolTable::decode(&self.header, &self.bytes, self.strings()?)
    }

    pub fn relocations(&self) -> Result<Vec<Relocation>> {
        decode_relocations(&self.header, &self.bytes)
    }

    pub fn dependencies(&self) -> Result<Vec<DependencySpec>> {
        decode_dependencies(&self.header, &self.bytes, self.strings()?)
    }

    pub fn unwind(&self) -> Result<Vec<UnwindEntry>> {
        decode_table(
            &self.bytes,
            self.header.unwind_table_off,
            self.header.unwind_count,
        )
    }

    pub fn manifest(&self) -> Result<Option<ManifestExt>> {
        if self.header.manifest.is_empty() {
            return Ok(None);
        }
        let raw = self.header.manifest.slice(&self.bytes, "manifest")?;
        ManifestExt::decode(raw).map(Some)
    }
}

fn verify_build_hash(
    header: &ContainerHeader,
    hdr_size: usize,
    logical: &[u8],
    warnings: &mut Vec<LoadWarning>,
) -> Result<()> {
    if header.hash_type == HashType::None {
        return Ok(());
    }
    match integrity::build_hash(header.hash_type, logical, hdr_size, header.dirs.security) {
        Some(hash) if hash == header.build_hash => Ok(()),
        Some(hash) => {
            log::warn!(
                "[PLAM] build hash mismatch: stored {}, computed {}",
                integrity::digest_hex(&header.build_hash),
                integrity::digest_hex(&hash)
            );
            Err(LoadError::ChecksumMismatch)
        }
        None => {
            let raw = header.hash_type.raw();
            log::warn!("[PLAM] unknown hash type {}, build hash not checked", raw);
            warnings.push(LoadWarning::UnverifiedBuildHash(raw));
            Ok(())
        }
    }
}

/// Whether `bytes` start with a container magic this crate understands.
pub fn has_container_magic(bytes: &[u8]) -> bool {
    let Some(magic) = bytes.get(..4) else {
        return false;
    };
    let magic = u32::from_le_bytes([magic[0], magic[1], magic[2], magic[3]]);
    magic == crate::format::PLAM_MAGIC || magic == LEGACY_MAGIC
}
