//! Container Writer
//!
//! Assembles a PLAM container from sections, symbols and resources, computing
//! the header checksum, build hash, resource hashes and optional signature so
//! that the loader accepts the result as is.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use ed25519_dalek::{Signer, SigningKey};
use hashbrown::HashMap;

use crate::codec::{ByteWriter, Record, Rva};
use crate::compress;
use crate::deps::{DependencySpec, SemVer};
use crate::error::LoadError;
use crate::format::{
    CompressionAlgorithm, CpuFeatures, CpuId, FileType, HashType, HeaderFlags, RelocType,
    ResourceFlags, ResourceType, SectionFlags, SectionType, SignatureScheme, SymbolBinding,
    SymbolType, PLAM_FAT_MAGIC, PLAM_RES_MAGIC, SECTION_ABS, SECTION_UNDEF,
};
use crate::header::{ContainerHeader, HEADER_SIZE};
use crate::integrity;
use crate::tables::{
    encode_exports, Dependency, FatArch, ManifestExt, Relocation, ResourceDescriptor, Section,
    SecurityBlob, SignatureHeader, Symbol, UnwindEntry,
};

/// Alignment of every table and blob the writer emits.
const BLOB_ALIGN: usize = 16;

/// Container writer error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// No codec for the requested compression.
    UnsupportedCompression(u32),
    /// Export names a symbol index that is missing or undefined.
    ExportOutOfRange(u32),
    /// A count or size does not fit its on-disk field.
    TooLarge { what: &'static str },
    /// A fat entry is not a valid thin container.
    InvalidImage(LoadError),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::UnsupportedCompression(alg) => {
                write!(f, "no codec for compression algorithm {}", alg)
            }
            BuildError::ExportOutOfRange(idx) => write!(f, "export of invalid symbol {}", idx),
            BuildError::TooLarge { what } => write!(f, "{} too large", what),
            BuildError::InvalidImage(err) => write!(f, "invalid fat entry: {}", err),
        }
    }
}

fn codec_error(err: LoadError) -> BuildError {
    match err {
        LoadError::UnknownCompressionAlgorithm(alg) => BuildError::UnsupportedCompression(alg),
        other => BuildError::InvalidImage(other),
    }
}

/// Section to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionSpec {
    pub name: String,
    pub section_type: SectionType,
    pub flags: SectionFlags,
    pub addr: u64,
    pub data: Vec<u8>,
    /// Virtual size; 0 means `data.len()`.
    pub mem_size: u64,
    pub entsize: u64,
    pub compression: CompressionAlgorithm,
}

impl SectionSpec {
    pub fn new(name: &str, addr: u64, flags: SectionFlags, data: Vec<u8>) -> Self {
        Self {
            name: String::from(name),
            section_type: SectionType::ProgBits,
            flags,
            addr,
            data,
            mem_size: 0,
            entsize: 0,
            compression: CompressionAlgorithm::None,
        }
    }

    pub fn code(name: &str, addr: u64, data: Vec<u8>) -> Self {
        Self::new(name, addr, SectionFlags::READ | SectionFlags::EXEC, data)
    }

    pub fn data(name: &str, addr: u64, data: Vec<u8>) -> Self {
        Self::new(name, addr, SectionFlags::READ | SectionFlags::WRITE, data)
    }

    pub fn rodata(name: &str, addr: u64, data: Vec<u8>) -> Self {
        Self::new(name, addr, SectionFlags::READ, data)
    }

    /// Zero-filled section of `size` bytes.
    pub fn bss(name: &str, addr: u64, size: u64) -> Self {
        Self {
            section_type: SectionType::NoBits,
            mem_size: size,
            ..Self::new(
                name,
                addr,
                SectionFlags::READ | SectionFlags::WRITE | SectionFlags::NOBITS,
                Vec::new(),
            )
        }
    }

    pub fn compressed(mut self, alg: CompressionAlgorithm) -> Self {
        self.compression = alg;
        self
    }

    fn virtual_size(&self) -> u64 {
        self.mem_size.max(self.data.len() as u64)
    }

    fn is_nobits(&self) -> bool {
        self.flags.contains(SectionFlags::NOBITS) || self.section_type == SectionType::NoBits
    }
}

/// Symbol to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolSpec {
    pub name: String,
    /// Image RVA, or the absolute value for `SECTION_ABS`.
    pub value: u64,
    pub size: u64,
    pub sym_type: SymbolType,
    pub binding: SymbolBinding,
    pub section: u16,
    pub version: u32,
}

impl SymbolSpec {
    pub fn function(name: &str, section: u16, value: u64) -> Self {
        Self {
            name: String::from(name),
            value,
            size: 0,
            sym_type: SymbolType::Func,
            binding: SymbolBinding::Global,
            section,
            version: 0,
        }
    }

    pub fn object(name: &str, section: u16, value: u64, size: u64) -> Self {
        Self {
            sym_type: SymbolType::Object,
            size,
            ..Self::function(name, section, value)
        }
    }

    pub fn absolute(name: &str, value: u64) -> Self {
        Self {
            sym_type: SymbolType::NoType,
            ..Self::function(name, SECTION_ABS, value)
        }
    }

    /// Undefined symbol satisfied by a dependency or the host.
    pub fn import(name: &str) -> Self {
        Self {
            sym_type: SymbolType::NoType,
            ..Self::function(name, SECTION_UNDEF, 0)
        }
    }

    pub fn with_binding(mut self, binding: SymbolBinding) -> Self {
        self.binding = binding;
        self
    }
}

/// Resource to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub res_type: ResourceType,
    pub lang: String,
    pub data: Vec<u8>,
    pub compression: CompressionAlgorithm,
    pub flags: ResourceFlags,
}

impl ResourceSpec {
    pub fn new(res_type: ResourceType, data: Vec<u8>) -> Self {
        Self {
            res_type,
            lang: String::new(),
            data,
            compression: CompressionAlgorithm::None,
            flags: ResourceFlags::empty(),
        }
    }

    pub fn language(mut self, lang: &str) -> Self {
        self.lang = String::from(lang);
        self
    }

    pub fn compressed(mut self, alg: CompressionAlgorithm) -> Self {
        self.compression = alg;
        self
    }

    pub fn flags(mut self, flags: ResourceFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Extended manifest contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestSpec {
    pub abi_rev: u32,
    pub build_flags: u32,
    pub src_repo: Option<String>,
}

/// Deduplicating string table.
struct Strings {
    bytes: Vec<u8>,
    offsets: HashMap<String, u64>,
}

impl Strings {
    fn new() -> Self {
        Self {
            bytes: alloc::vec![0],
            offsets: HashMap::new(),
        }
    }

    fn intern(&mut self, s: &str) -> u64 {
        if s.is_empty() {
            return 0;
        }
        if let Some(&off) = self.offsets.get(s) {
            return off;
        }
        let off = self.bytes.len() as u64;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(String::from(s), off);
        off
    }
}

fn align(out: &mut Vec<u8>) -> u64 {
    let len = out.len().next_multiple_of(BLOB_ALIGN);
    out.resize(len, 0);
    len as u64
}

/// Append `blob` at the next aligned offset and return its range.
fn push_blob(out: &mut Vec<u8>, blob: &[u8]) -> Rva {
    let off = align(out);
    out.extend_from_slice(blob);
    Rva::new(off, blob.len() as u64)
}

fn count(len: usize, what: &'static str) -> Result<u32, BuildError> {
    u32::try_from(len).map_err(|_| BuildError::TooLarge { what })
}

/// Builder for a thin PLAM container.
#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    header: ContainerHeader,
    sections: Vec<SectionSpec>,
    symbols: Vec<SymbolSpec>,
    relocations: Vec<Relocation>,
    dependencies: Vec<DependencySpec>,
    unwind: Vec<UnwindEntry>,
    exports: Option<Vec<u32>>,
    resources: Vec<ResourceSpec>,
    manifest: Option<ManifestSpec>,
    debug: Option<Vec<u8>>,
    signing_key: Option<[u8; 32]>,
}

impl ContainerBuilder {
    pub fn new(file_type: FileType, cpu: CpuId) -> Self {
        Self {
            header: ContainerHeader::new(file_type, cpu),
            sections: Vec::new(),
            symbols: Vec::new(),
            relocations: Vec::new(),
            dependencies: Vec::new(),
            unwind: Vec::new(),
            exports: None,
            resources: Vec::new(),
            manifest: None,
            debug: None,
            signing_key: None,
        }
    }

    /// Direct access to header fields not covered by a setter.
    pub fn header_mut(&mut self) -> &mut ContainerHeader {
        &mut self.header
    }

    pub fn flags(&mut self, flags: HeaderFlags) -> &mut Self {
        self.header.flags = flags;
        self
    }

    pub fn cpu_features(&mut self, features: CpuFeatures) -> &mut Self {
        self.header.cpu_sub = features;
        self
    }

    pub fn entry(&mut self, rva: u64) -> &mut Self {
        self.header.entry_off = rva;
        self
    }

    pub fn uuid(&mut self, uuid: [u8; 16]) -> &mut Self {
        self.header.uuid = uuid;
        self
    }

    pub fn timestamp(&mut self, timestamp: u64) -> &mut Self {
        self.header.timestamp = timestamp;
        self
    }

    pub fn hash_type(&mut self, hash_type: HashType) -> &mut Self {
        self.header.hash_type = hash_type;
        self
    }

    pub fn file_compression(&mut self, alg: CompressionAlgorithm) -> &mut Self {
        self.header.file_comp = alg;
        self
    }

    /// Sign with an Ed25519 secret key (seed).
    pub fn sign_with(&mut self, secret: [u8; 32]) -> &mut Self {
        self.signing_key = Some(secret);
        self
    }

    /// Add a section; returns its index.
    pub fn add_section(&mut self, section: SectionSpec) -> u16 {
        self.sections.push(section);
        (self.sections.len() - 1) as u16
    }

    /// Add a symbol; returns its index.
    pub fn add_symbol(&mut self, symbol: SymbolSpec) -> u32 {
        self.symbols.push(symbol);
        (self.symbols.len() - 1) as u32
    }

    pub fn add_relocation(&mut self, offset: u64, reloc_type: RelocType, sym_idx: u32, addend: i64) -> &mut Self {
        self.relocations.push(Relocation {
            offset,
            reloc_type,
            sym_idx,
            addend,
        });
        self
    }

    pub fn add_dependency(&mut self, dependency: DependencySpec) -> &mut Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn add_unwind(&mut self, entry: UnwindEntry) -> &mut Self {
        self.unwind.push(entry);
        self
    }

    /// Export symbol `index` explicitly. Without any explicit export every
    /// defined global or weak symbol is exported.
    pub fn export(&mut self, index: u32) -> &mut Self {
        self.exports.get_or_insert_with(Vec::new).push(index);
        self
    }

    pub fn add_resource(&mut self, resource: ResourceSpec) -> &mut Self {
        self.resources.push(resource);
        self
    }

    /// Record the module version as a VERSION resource.
    pub fn version(&mut self, version: SemVer) -> &mut Self {
        self.resources
            .retain(|r| !(r.res_type == ResourceType::Version && r.lang.is_empty()));
        self.add_resource(ResourceSpec::new(
            ResourceType::Version,
            version.packed().to_le_bytes().to_vec(),
        ))
    }

    pub fn manifest(&mut self, manifest: ManifestSpec) -> &mut Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn debug_info(&mut self, bytes: Vec<u8>) -> &mut Self {
        self.debug = Some(bytes);
        self
    }

    /// Produce the container bytes.
    pub fn build(&self) -> Result<Vec<u8>, BuildError> {
        let mut header = self.header.clone();
        let byte_tagged = core::iter::once(header.file_comp)
            .chain(self.resources.iter().map(|r| r.compression));
        for alg in byte_tagged {
            if alg.byte_tag().is_none() {
                return Err(BuildError::UnsupportedCompression(alg.raw()));
            }
        }
        let mut strings = Strings::new();
        let mut out = alloc::vec![0u8; HEADER_SIZE];

        // Section contents.
        let mut records = Vec::with_capacity(self.sections.len());
        for spec in &self.sections {
            let name_off = strings.intern(&spec.name);
            let vsize = spec.virtual_size();
            let (offset, size, mem_size) = if spec.is_nobits() {
                (0, vsize, 0)
            } else {
                let mut plain = spec.data.clone();
                let stored = match spec.compression {
                    CompressionAlgorithm::None => plain,
                    alg => {
                        plain.resize(vsize as usize, 0);
                        compress::compress(alg, &plain).map_err(codec_error)?
                    }
                };
                let range = push_blob(&mut out, &stored);
                let mem_size = if vsize != range.size { vsize } else { 0 };
                (range.off, range.size, mem_size)
            };
            records.push(Section {
                name_off,
                section_type: spec.section_type,
                flags: spec.flags,
                addr: spec.addr,
                offset,
                size,
                entsize: spec.entsize,
                comp_alg: spec.compression,
                mem_size: u32::try_from(mem_size)
                    .map_err(|_| BuildError::TooLarge { what: "section" })?,
            });
        }

        let symbols: Vec<Symbol> = self
            .symbols
            .iter()
            .map(|spec| Symbol {
                name_off: strings.intern(&spec.name),
                value: spec.value,
                size: spec.size,
                sym_type: spec.sym_type,
                binding: spec.binding,
                section_idx: spec.section,
                version: spec.version,
            })
            .collect();
        let dependencies: Vec<Dependency> = self
            .dependencies
            .iter()
            .map(|dep| Dependency {
                name_off: strings.intern(&dep.name),
                version: dep.version.packed(),
                uuid: dep.uuid,
                flags: dep.flags,
            })
            .collect();

        // Tables.
        header.str_table = push_blob(&mut out, &strings.bytes);

        header.symbol_count = count(symbols.len(), "symbol table")?;
        header.sym_table = push_blob(&mut out, &encode_all(&symbols));
        header.symbol_table_off = header.sym_table.off;

        header.section_count = count(records.len(), "section table")?;
        header.section_table_off = push_blob(&mut out, &encode_all(&records)).off;

        header.reloc_count = count(self.relocations.len(), "relocation table")?;
        header.reloc_table_off = push_blob(&mut out, &encode_all(&self.relocations)).off;

        header.unwind_count = count(self.unwind.len(), "unwind table")?;
        header.unwind_table_off = push_blob(&mut out, &encode_all(&self.unwind)).off;

        header.deps_cnt = count(dependencies.len(), "dependency table")?;
        header.import_off = push_blob(&mut out, &encode_all(&dependencies)).off;

        header.export_off = match &self.exports {
            Some(indices) => {
                for &idx in indices {
                    match symbols.get(idx as usize) {
                        Some(sym) if !sym.is_undefined() => {}
                        _ => return Err(BuildError::ExportOutOfRange(idx)),
                    }
                }
                let mut table = Vec::new();
                encode_exports(indices, &mut table);
                push_blob(&mut out, &table).off
            }
            None => 0,
        };

        self.write_resources(&mut header, &mut out)?;

        if let Some(manifest) = &self.manifest {
            let src_repo = match &manifest.src_repo {
                Some(repo) => push_blob(&mut out, repo.as_bytes()),
                None => Rva::EMPTY,
            };
            let ext = ManifestExt {
                mods_dir: Rva::EMPTY,
                l10n_table: Rva::EMPTY,
                src_repo,
                abi_rev: manifest.abi_rev,
                build_flags: manifest.build_flags,
            };
            header.manifest = push_blob(&mut out, &ext.to_bytes());
        }

        if let Some(debug) = &self.debug {
            header.debug = push_blob(&mut out, debug);
        }

        let key = self.signing_key.map(|secret| SigningKey::from_bytes(&secret));
        if key.is_some() {
            header.crypto_mode = 1;
            header.sig_scheme = SignatureScheme::Ed25519.raw() as u16;
            header.dirs.security = push_blob(&mut out, &[0u8; SecurityBlob::SIZE]);
        }

        if let Some(hash) = integrity::build_hash(header.hash_type, &out, HEADER_SIZE, header.dirs.security) {
            header.build_hash = hash;
        }

        header.hdr_size = HEADER_SIZE as u16;
        header.hdr_crc32 = 0;
        out[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        integrity::seal_header(&mut out[..HEADER_SIZE]);

        if let Some(key) = key {
            let signature = key.sign(&out[..HEADER_SIZE]);
            let blob = SecurityBlob {
                header: SignatureHeader {
                    sig_type: SignatureScheme::Ed25519,
                    key_revocation: 0,
                    cert_count: 0,
                    timestamp: header.timestamp,
                    reserved: [0; 16],
                },
                public_key: key.verifying_key().to_bytes(),
                signature: signature.to_bytes(),
            };
            let range = header.dirs.security;
            out[range.off as usize..(range.off + range.size) as usize]
                .copy_from_slice(&blob.to_bytes());
        }

        if header.file_comp != CompressionAlgorithm::None {
            let payload =
                compress::compress_payload(header.file_comp, &out[HEADER_SIZE..]).map_err(codec_error)?;
            out.truncate(HEADER_SIZE);
            out.extend_from_slice(&payload);
        }

        log::debug!(
            "[PLAM] writer: {} bytes, {} sections, {} symbols",
            out.len(),
            records.len(),
            symbols.len()
        );
        Ok(out)
    }

    fn write_resources(&self, header: &mut ContainerHeader, out: &mut Vec<u8>) -> Result<(), BuildError> {
        header.res_cnt = count(self.resources.len(), "resource table")?;
        if self.resources.is_empty() {
            return Ok(());
        }
        let mut descriptors = Vec::with_capacity(self.resources.len());
        for spec in &self.resources {
            let stored = compress::compress(spec.compression, &spec.data).map_err(codec_error)?;
            descriptors.push(ResourceDescriptor {
                magic: PLAM_RES_MAGIC,
                res_type: spec.res_type,
                flags: spec.flags,
                blob: push_blob(out, &stored),
                orig_size: spec.data.len() as u64,
                comp_alg: spec.compression,
                lang: ResourceDescriptor::pack_language(&spec.lang),
                hash: integrity::resource_hash(header.hash_type, &spec.data),
                extra: [0; 6],
            });
        }
        header.resources = push_blob(out, &encode_all(&descriptors));
        Ok(())
    }
}

fn encode_all<T: Record>(records: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * T::SIZE);
    for record in records {
        record.encode(&mut out);
    }
    out
}

/// Builder for a multi-architecture container.
#[derive(Debug, Clone)]
pub struct FatBuilder {
    file_type: FileType,
    align_log2: u32,
    images: Vec<(FatArch, Vec<u8>)>,
}

impl FatBuilder {
    pub fn new(file_type: FileType) -> Self {
        Self {
            file_type,
            align_log2: 12,
            images: Vec::new(),
        }
    }

    pub fn align_log2(&mut self, align_log2: u32) -> &mut Self {
        self.align_log2 = align_log2.min(20);
        self
    }

    /// Add a thin container; its CPU id and ABI come from its own header.
    pub fn add(&mut self, image: Vec<u8>) -> Result<&mut Self, BuildError> {
        let (header, _) = ContainerHeader::parse(&image).map_err(BuildError::InvalidImage)?;
        if header.is_fat() {
            return Err(BuildError::InvalidImage(LoadError::ArchNotSupported {
                cpu_id: header.cpu_id.raw(),
            }));
        }
        let arch = FatArch {
            cpu_id: header.cpu_id,
            abi_ver: header.abi_ver as u16,
            align_log2: self.align_log2,
            offset: 0,
            size: image.len() as u64,
        };
        self.images.push((arch, image));
        Ok(self)
    }

    pub fn build(&self) -> Result<Vec<u8>, BuildError> {
        let mut header = ContainerHeader::new(self.file_type, CpuId::None);
        let table_off = HEADER_SIZE.next_multiple_of(BLOB_ALIGN);
        header.dirs.fat_off = table_off as u64;
        header.dirs.fat_cnt = count(self.images.len(), "fat table")?;

        let slot = 1usize << self.align_log2;
        let table_len = 4 + self.images.len() * FatArch::SIZE;
        let mut offset = (table_off + table_len).next_multiple_of(slot);
        let mut entries = Vec::with_capacity(self.images.len());
        for (arch, image) in &self.images {
            entries.push(FatArch {
                align_log2: self.align_log2,
                offset: offset as u64,
                ..*arch
            });
            offset = (offset + image.len()).next_multiple_of(slot);
        }

        let mut out = header.to_bytes();
        out.resize(table_off, 0);
        let mut w = ByteWriter::new(&mut out);
        w.u32(PLAM_FAT_MAGIC);
        for entry in &entries {
            entry.write(&mut w);
        }
        for (entry, (_, image)) in entries.iter().zip(&self.images) {
            out.resize(entry.offset as usize, 0);
            out.extend_from_slice(image);
        }
        integrity::seal_header(&mut out[..HEADER_SIZE]);
        Ok(out)
    }
}
