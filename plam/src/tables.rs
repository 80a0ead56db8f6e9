//! Table records
//!
//! Section, relocation, symbol, dependency, unwind, resource, fat-arch and
//! security records, plus the string and export tables that index into them.

use alloc::string::String;
use alloc::vec::Vec;

use crate::codec::{slice_at, ByteReader, ByteWriter, Record, Rva};
use crate::error::{LoadError, Result};
use crate::format::{
    CompressionAlgorithm, CpuId, DependencyFlags, RelocType, ResourceFlags, ResourceType,
    SectionFlags, SectionType, SignatureScheme, SymbolBinding, SymbolType, PLAM_RES_MAGIC,
    SECTION_ABS, SECTION_UNDEF,
};

// ============================================================================
// Sections
// ============================================================================

/// Section table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name_off: u64,
    pub section_type: SectionType,
    pub flags: SectionFlags,
    /// Image-relative virtual address.
    pub addr: u64,
    /// File offset of the stored bytes.
    pub offset: u64,
    /// Bytes stored in the file (zero-fill length for NOBITS).
    pub size: u64,
    pub entsize: u64,
    pub comp_alg: CompressionAlgorithm,
    /// Virtual size; 0 means same as `size`.
    pub mem_size: u32,
}

impl Section {
    /// Size of the section once mapped.
    pub fn virtual_size(&self) -> u64 {
        if self.mem_size != 0 {
            self.mem_size as u64
        } else {
            self.size
        }
    }

    /// Zero-filled, nothing read from the file.
    pub fn is_nobits(&self) -> bool {
        self.flags.contains(SectionFlags::NOBITS) || self.section_type == SectionType::NoBits
    }

    /// Occupies address space in the loaded image.
    pub fn is_mapped(&self) -> bool {
        self.section_type != SectionType::Null
            && self
                .flags
                .intersects(SectionFlags::READ | SectionFlags::WRITE | SectionFlags::EXEC)
    }

    pub fn is_executable(&self) -> bool {
        self.flags.contains(SectionFlags::EXEC)
    }

    /// Half-open virtual range, `None` on overflow.
    pub fn virtual_range(&self) -> Option<(u64, u64)> {
        Some((self.addr, self.addr.checked_add(self.virtual_size())?))
    }
}

impl Record for Section {
    const SIZE: usize = 56;

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            name_off: r.u64()?,
            section_type: SectionType::from_raw(r.u32()?),
            flags: SectionFlags::from_bits_retain(r.u32()?),
            addr: r.u64()?,
            offset: r.u64()?,
            size: r.u64()?,
            entsize: r.u64()?,
            comp_alg: CompressionAlgorithm::from_raw(r.u32()?),
            mem_size: r.u32()?,
        })
    }

    fn write(&self, w: &mut ByteWriter<'_>) {
        w.u64(self.name_off);
        w.u32(self.section_type.raw());
        w.u32(self.flags.bits());
        w.u64(self.addr);
        w.u64(self.offset);
        w.u64(self.size);
        w.u64(self.entsize);
        w.u32(self.comp_alg.raw());
        w.u32(self.mem_size);
    }
}

// ============================================================================
// Relocations and symbols
// ============================================================================

/// Relocation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Image RVA of the patch site.
    pub offset: u64,
    pub reloc_type: RelocType,
    pub sym_idx: u32,
    pub addend: i64,
}

impl Record for Relocation {
    const SIZE: usize = 24;

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            offset: r.u64()?,
            reloc_type: RelocType::from_raw(r.u32()?),
            sym_idx: r.u32()?,
            addend: r.i64()?,
        })
    }

    fn write(&self, w: &mut ByteWriter<'_>) {
        w.u64(self.offset);
        w.u32(self.reloc_type.raw());
        w.u32(self.sym_idx);
        w.i64(self.addend);
    }
}

/// Symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub name_off: u64,
    pub value: u64,
    pub size: u64,
    pub sym_type: SymbolType,
    pub binding: SymbolBinding,
    pub section_idx: u16,
    pub version: u32,
}

impl Symbol {
    /// Import: no defining section in this container.
    pub fn is_undefined(&self) -> bool {
        self.section_idx == SECTION_UNDEF
    }

    pub fn is_absolute(&self) -> bool {
        self.section_idx == SECTION_ABS
    }

    pub fn is_weak(&self) -> bool {
        self.binding == SymbolBinding::Weak
    }

    /// Visible to other modules when defined.
    pub fn is_external(&self) -> bool {
        matches!(self.binding, SymbolBinding::Global | SymbolBinding::Weak)
    }
}

impl Record for Symbol {
    const SIZE: usize = 32;

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let name_off = r.u64()?;
        let value = r.u64()?;
        let size = r.u64()?;
        let sym_type = SymbolType::from_raw(r.u8()?);
        let binding = SymbolBinding::from_raw(r.u8()?);
        Ok(Self {
            name_off,
            value,
            size,
            sym_type,
            binding,
            section_idx: r.u16()?,
            version: r.u32()?,
        })
    }

    fn write(&self, w: &mut ByteWriter<'_>) {
        w.u64(self.name_off);
        w.u64(self.value);
        w.u64(self.size);
        w.u8(self.sym_type.raw());
        w.u8(self.binding.raw());
        w.u16(self.section_idx);
        w.u32(self.version);
    }
}

// ============================================================================
// Dependencies and unwind info
// ============================================================================

/// Dependency table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub name_off: u64,
    /// Packed minimum version, see [`crate::deps::SemVer`].
    pub version: u64,
    /// All-zero matches any module of that name.
    pub uuid: [u8; 16],
    pub flags: DependencyFlags,
}

impl Dependency {
    /// Weak or optional: absence does not fail the load.
    pub fn is_soft(&self) -> bool {
        self.flags
            .intersects(DependencyFlags::WEAK | DependencyFlags::OPTIONAL)
    }
}

impl Record for Dependency {
    const SIZE: usize = 44;

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let dependency = Self {
            name_off: r.u64()?,
            version: r.u64()?,
            uuid: r.array()?,
            flags: DependencyFlags::from_bits_retain(r.u32()?),
        };
        // Reserved tail.
        r.array::<8>()?;
        Ok(dependency)
    }

    fn write(&self, w: &mut ByteWriter<'_>) {
        w.u64(self.name_off);
        w.u64(self.version);
        w.bytes(&self.uuid);
        w.u32(self.flags.bits());
        w.bytes(&[0; 8]);
    }
}

/// Unwind table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindEntry {
    pub begin: u64,
    pub end: u64,
    pub info_off: u64,
    pub flags: u32,
}

impl Record for UnwindEntry {
    const SIZE: usize = 28;

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            begin: r.u64()?,
            end: r.u64()?,
            info_off: r.u64()?,
            flags: r.u32()?,
        })
    }

    fn write(&self, w: &mut ByteWriter<'_>) {
        w.u64(self.begin);
        w.u64(self.end);
        w.u64(self.info_off);
        w.u32(self.flags);
    }
}

// ============================================================================
// Resources
// ============================================================================

/// Resource descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub magic: u32,
    pub res_type: ResourceType,
    pub flags: ResourceFlags,
    pub blob: Rva,
    pub orig_size: u64,
    pub comp_alg: CompressionAlgorithm,
    /// NUL padded; empty means language neutral.
    pub lang: [u8; 6],
    pub hash: [u8; 48],
    pub extra: [u8; 6],
}

impl ResourceDescriptor {
    /// Language tag without padding.
    pub fn language(&self) -> &str {
        let len = self.lang.iter().position(|&b| b == 0).unwrap_or(self.lang.len());
        core::str::from_utf8(&self.lang[..len]).unwrap_or("")
    }

    /// Pack a language tag, truncating to six bytes.
    pub fn pack_language(tag: &str) -> [u8; 6] {
        let mut lang = [0u8; 6];
        let bytes = tag.as_bytes();
        let len = bytes.len().min(lang.len());
        lang[..len].copy_from_slice(&bytes[..len]);
        lang
    }

    pub fn check_magic(&self) -> Result<()> {
        if self.magic != PLAM_RES_MAGIC {
            return Err(LoadError::MagicMismatch {
                expected: PLAM_RES_MAGIC,
                found: self.magic,
            });
        }
        Ok(())
    }
}

impl Record for ResourceDescriptor {
    const SIZE: usize = 93;

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            magic: r.u32()?,
            res_type: ResourceType::from_raw(r.u16()?),
            flags: ResourceFlags::from_bits_retain(r.u16()?),
            blob: r.rva()?,
            orig_size: r.u64()?,
            comp_alg: CompressionAlgorithm::from_raw(u32::from(r.u8()?)),
            lang: r.array()?,
            hash: r.array()?,
            extra: r.array()?,
        })
    }

    fn write(&self, w: &mut ByteWriter<'_>) {
        w.u32(self.magic);
        w.u16(self.res_type.raw());
        w.u16(self.flags.bits());
        w.rva(self.blob);
        w.u64(self.orig_size);
        w.u8(self.comp_alg.byte_tag().unwrap_or(u8::MAX));
        w.bytes(&self.lang);
        w.bytes(&self.hash);
        w.bytes(&self.extra);
    }
}

// ============================================================================
// Fat binaries
// ============================================================================

/// Fat-arch table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatArch {
    pub cpu_id: CpuId,
    pub abi_ver: u16,
    pub align_log2: u32,
    pub offset: u64,
    pub size: u64,
}

impl FatArch {
    pub fn range(&self) -> Rva {
        Rva::new(self.offset, self.size)
    }
}

impl Record for FatArch {
    const SIZE: usize = 24;

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            cpu_id: CpuId::from_raw(r.u16()?),
            abi_ver: r.u16()?,
            align_log2: r.u32()?,
            offset: r.u64()?,
            size: r.u64()?,
        })
    }

    fn write(&self, w: &mut ByteWriter<'_>) {
        w.u16(self.cpu_id.raw());
        w.u16(self.abi_ver);
        w.u32(self.align_log2);
        w.u64(self.offset);
        w.u64(self.size);
    }
}

// ============================================================================
// Security and manifest
// ============================================================================

/// Signature header, first part of the security blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureHeader {
    pub sig_type: SignatureScheme,
    /// Non-zero when the signing key has been revoked.
    pub key_revocation: u8,
    pub cert_count: u16,
    pub timestamp: u64,
    pub reserved: [u8; 16],
}

impl Record for SignatureHeader {
    const SIZE: usize = 28;

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            sig_type: SignatureScheme::from_raw(r.u8()?),
            key_revocation: r.u8()?,
            cert_count: r.u16()?,
            timestamp: r.u64()?,
            reserved: r.array()?,
        })
    }

    fn write(&self, w: &mut ByteWriter<'_>) {
        w.u8(self.sig_type.raw());
        w.u8(self.key_revocation);
        w.u16(self.cert_count);
        w.u64(self.timestamp);
        w.bytes(&self.reserved);
    }
}

/// Security blob: signature header, signer key and signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityBlob {
    pub header: SignatureHeader,
    pub public_key: [u8; 32],
    pub signature: [u8; 64],
}

impl Record for SecurityBlob {
    const SIZE: usize = SignatureHeader::SIZE + 32 + 64;

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            header: SignatureHeader::read(r)?,
            public_key: r.array()?,
            signature: r.array()?,
        })
    }

    fn write(&self, w: &mut ByteWriter<'_>) {
        self.header.write(w);
        w.bytes(&self.public_key);
        w.bytes(&self.signature);
    }
}

/// Extended manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManifestExt {
    pub mods_dir: Rva,
    pub l10n_table: Rva,
    pub src_repo: Rva,
    pub abi_rev: u32,
    pub build_flags: u32,
}

impl Record for ManifestExt {
    const SIZE: usize = 56;

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            mods_dir: r.rva()?,
            l10n_table: r.rva()?,
            src_repo: r.rva()?,
            abi_rev: r.u32()?,
            build_flags: r.u32()?,
        })
    }

    fn write(&self, w: &mut ByteWriter<'_>) {
        w.rva(self.mods_dir);
        w.rva(self.l10n_table);
        w.rva(self.src_repo);
        w.u32(self.abi_rev);
        w.u32(self.build_flags);
    }
}

// ============================================================================
// String and export tables
// ============================================================================

/// View over a NUL-terminated string table.
#[derive(Debug, Clone, Copy)]
pub struct StringTable<'a> {
    bytes: &'a [u8],
}

impl<'a> StringTable<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// String starting at `offset`.
    pub fn get(&self, offset: u64) -> Result<&'a str> {
        if offset == 0 && self.bytes.is_empty() {
            return Ok("");
        }
        let invalid = LoadError::InvalidString { offset };
        let start = usize::try_from(offset).map_err(|_| invalid.clone())?;
        let tail = self.bytes.get(start..).ok_or_else(|| invalid.clone())?;
        let len = tail.iter().position(|&b| b == 0).ok_or_else(|| invalid.clone())?;
        core::str::from_utf8(&tail[..len]).map_err(|_| invalid)
    }

    pub fn get_owned(&self, offset: u64) -> Result<String> {
        self.get(offset).map(String::from)
    }
}

/// Decode the export index table at `offset`.
pub fn decode_exports(bytes: &[u8], offset: u64) -> Result<Vec<u32>> {
    let count = u32::from_le_bytes(
        slice_at(bytes, offset, 4)?
            .try_into()
            .map_err(|_| LoadError::OutOfBounds { what: "export table" })?,
    );
    let len = (count as u64)
        .checked_mul(4)
        .ok_or(LoadError::OutOfBounds { what: "export table" })?;
    let body = slice_at(bytes, offset + 4, len)?;
    Ok(body
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Encode an export index table.
pub fn encode_exports(indices: &[u32], out: &mut Vec<u8>) {
    let mut w = ByteWriter::new(out);
    w.u32(indices.len() as u32);
    for &idx in indices {
        w.u32(idx);
    }
}
