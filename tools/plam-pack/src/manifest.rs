//! Pack manifest parsing.
//!
//! A pack manifest is a TOML file describing one thin container: the module
//! header, its sections (raw bytes from files), symbols, relocations,
//! dependencies and resources. [`PackManifest::to_builder`] turns it into a
//! [`ContainerBuilder`], reading every referenced file relative to the
//! manifest's directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use plam::deps::{DependencySpec, SemVer};
use plam::format::{
    CompressionAlgorithm, CpuFeatures, CpuId, DependencyFlags, FileType, HashType, HeaderFlags,
    RelocType, ResourceFlags, ResourceType, SectionFlags, SymbolBinding, SymbolType,
};
use plam::writer::{ContainerBuilder, ManifestSpec, ResourceSpec, SectionSpec, SymbolSpec};
use serde::{Deserialize, Serialize};

use crate::error::{read_input, PackError};

// ── Data models ──────────────────────────────────────────────────────

/// Top-level pack manifest loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackManifest {
    pub module: ModuleInfo,
    #[serde(default)]
    pub sections: Vec<SectionEntry>,
    #[serde(default)]
    pub symbols: Vec<SymbolEntry>,
    #[serde(default)]
    pub relocations: Vec<RelocationEntry>,
    #[serde(default)]
    pub dependencies: Vec<DependencyEntry>,
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
}

/// Header-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleInfo {
    pub name: String,
    #[serde(rename = "type", default = "default_file_type")]
    pub file_type: String,
    pub arch: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Entry point RVA.
    #[serde(default)]
    pub entry: Option<u64>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default = "default_hash")]
    pub hash: String,
    /// Whole-file compression.
    #[serde(default = "default_compression")]
    pub compression: String,
    /// 32 hex digits.
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub timestamp: Option<u64>,
    /// File holding a 32-byte Ed25519 secret key, raw or hex.
    #[serde(default)]
    pub signing_key: Option<PathBuf>,
    #[serde(default)]
    pub abi_rev: Option<u32>,
    #[serde(default)]
    pub src_repo: Option<String>,
}

/// A section whose bytes come from `file` (or are zero-filled for `bss`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectionEntry {
    pub name: String,
    /// `code`, `data`, `rodata`, `bss`, or `jit` (write+exec, needs `allow_wx`).
    #[serde(default = "default_section_kind")]
    pub kind: String,
    pub addr: u64,
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Virtual size; required for `bss`, zero-extends the file otherwise.
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default = "default_compression")]
    pub compression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolEntry {
    pub name: String,
    /// Defining section name, `abs` for an absolute value, absent for an import.
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub value: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default = "default_symbol_kind")]
    pub kind: String,
    #[serde(default = "default_binding")]
    pub binding: String,
    #[serde(default)]
    pub export: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelocationEntry {
    /// Image RVA patched by the relocation.
    pub offset: u64,
    #[serde(rename = "type")]
    pub reloc_type: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub addend: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DependencyEntry {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub weak: bool,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceEntry {
    #[serde(rename = "type")]
    pub res_type: String,
    #[serde(default)]
    pub lang: String,
    pub file: PathBuf,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default)]
    pub critical: bool,
}

fn default_file_type() -> String {
    "app".to_string()
}

fn default_hash() -> String {
    "blake3".to_string()
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_section_kind() -> String {
    "code".to_string()
}

fn default_symbol_kind() -> String {
    "func".to_string()
}

fn default_binding() -> String {
    "global".to_string()
}

fn default_version() -> String {
    "0.0.0".to_string()
}

// ── Parsing ──────────────────────────────────────────────────────────

/// Parse a pack manifest from a TOML file path.
pub fn parse_manifest(path: &Path) -> Result<PackManifest, PackError> {
    let bytes = read_input(path)?;
    let content = String::from_utf8(bytes)
        .map_err(|e| PackError::ManifestParse(format!("manifest is not UTF-8: {e}")))?;
    parse_manifest_str(&content)
}

/// Parse a pack manifest from a TOML string.
pub fn parse_manifest_str(content: &str) -> Result<PackManifest, PackError> {
    toml::from_str(content).map_err(|e| PackError::ManifestParse(format!("invalid TOML: {e}")))
}

// ── Token tables ─────────────────────────────────────────────────────

pub fn parse_file_type(token: &str) -> Result<FileType, PackError> {
    let ty = match token {
        "kernel" => FileType::Kernel,
        "driver" => FileType::Driver,
        "lib" | "shared_lib" => FileType::SharedLib,
        "app" => FileType::App,
        "module" | "hot_plug" => FileType::HotPlugModule,
        "boot" => FileType::Boot,
        "plugin" => FileType::Plugin,
        "object" => FileType::RelocatableObject,
        _ => return Err(unknown("file type", token)),
    };
    Ok(ty)
}

pub fn parse_cpu(name: &str) -> Result<CpuId, PackError> {
    CpuId::from_name(name).ok_or_else(|| PackError::UnknownCpu {
        name: name.to_string(),
    })
}

pub fn parse_compression(name: &str) -> Result<CompressionAlgorithm, PackError> {
    CompressionAlgorithm::from_name(name).ok_or_else(|| PackError::UnknownCompression {
        name: name.to_string(),
    })
}

pub fn parse_resource_type(token: &str) -> Result<ResourceType, PackError> {
    ResourceType::from_token(token).ok_or_else(|| PackError::UnknownResourceType {
        token: token.to_string(),
    })
}

fn parse_hash(token: &str) -> Result<HashType, PackError> {
    match token {
        "none" => Ok(HashType::None),
        "sha2" | "sha256" => Ok(HashType::Sha2),
        "blake3" => Ok(HashType::Blake3),
        _ => Err(unknown("hash", token)),
    }
}

fn parse_header_flags(tokens: &[String]) -> Result<HeaderFlags, PackError> {
    tokens.iter().try_fold(HeaderFlags::empty(), |acc, token| {
        HeaderFlags::from_name(&token.to_ascii_uppercase())
            .map(|flag| acc | flag)
            .ok_or_else(|| unknown("header flag", token))
    })
}

fn parse_features(tokens: &[String]) -> Result<CpuFeatures, PackError> {
    tokens.iter().try_fold(CpuFeatures::empty(), |acc, token| {
        CpuFeatures::from_name(&token.to_ascii_uppercase())
            .map(|flag| acc | flag)
            .ok_or_else(|| unknown("cpu feature", token))
    })
}

fn parse_reloc_type(token: &str) -> Result<RelocType, PackError> {
    match token {
        "none" => Ok(RelocType::None),
        "abs64" => Ok(RelocType::Abs64),
        "pc32" => Ok(RelocType::Pc32),
        "relative" => Ok(RelocType::Relative),
        _ => Err(unknown("relocation type", token)),
    }
}

fn parse_symbol_kind(token: &str) -> Result<SymbolType, PackError> {
    match token {
        "notype" => Ok(SymbolType::NoType),
        "object" => Ok(SymbolType::Object),
        "func" => Ok(SymbolType::Func),
        _ => Err(unknown("symbol kind", token)),
    }
}

fn parse_binding(token: &str) -> Result<SymbolBinding, PackError> {
    match token {
        "local" => Ok(SymbolBinding::Local),
        "global" => Ok(SymbolBinding::Global),
        "weak" => Ok(SymbolBinding::Weak),
        _ => Err(unknown("symbol binding", token)),
    }
}

fn parse_version(text: &str) -> Result<SemVer, PackError> {
    SemVer::parse(text).ok_or_else(|| unknown("version", text))
}

fn parse_uuid(text: &str) -> Result<[u8; 16], PackError> {
    let mut uuid = [0u8; 16];
    hex::decode_to_slice(text.replace('-', ""), &mut uuid).map_err(|_| unknown("uuid", text))?;
    Ok(uuid)
}

fn unknown(field: &'static str, value: &str) -> PackError {
    PackError::UnknownToken {
        field,
        value: value.to_string(),
    }
}

/// Decode a 32-byte key given either as raw bytes or as 64 hex digits.
pub fn decode_key(bytes: &[u8]) -> Result<[u8; 32], PackError> {
    let mut key = [0u8; 32];
    if let Ok(text) = std::str::from_utf8(bytes) {
        if hex::decode_to_slice(text.trim(), &mut key).is_ok() {
            return Ok(key);
        }
    }
    if bytes.len() == 32 {
        key.copy_from_slice(bytes);
        return Ok(key);
    }
    Err(PackError::BadKey(format!(
        "expected 32 raw bytes or 64 hex digits, got {} bytes",
        bytes.len()
    )))
}

// ── Builder ──────────────────────────────────────────────────────────

impl PackManifest {
    /// Resolve every token and input file into a container builder.
    pub fn to_builder(&self, base_dir: &Path) -> Result<ContainerBuilder, PackError> {
        let m = &self.module;
        let mut builder = ContainerBuilder::new(parse_file_type(&m.file_type)?, parse_cpu(&m.arch)?);
        builder
            .flags(parse_header_flags(&m.flags)?)
            .cpu_features(parse_features(&m.features)?)
            .hash_type(parse_hash(&m.hash)?)
            .file_compression(parse_compression(&m.compression)?);
        if let Some(entry) = m.entry {
            builder.entry(entry);
        }
        if let Some(uuid) = &m.uuid {
            builder.uuid(parse_uuid(uuid)?);
        }
        if let Some(timestamp) = m.timestamp {
            builder.timestamp(timestamp);
        }
        if let Some(version) = &m.version {
            builder.version(parse_version(version)?);
        }
        if let Some(key) = &m.signing_key {
            builder.sign_with(decode_key(&read_input(&base_dir.join(key))?)?);
        }
        if m.abi_rev.is_some() || m.src_repo.is_some() {
            builder.manifest(ManifestSpec {
                abi_rev: m.abi_rev.unwrap_or(0),
                build_flags: 0,
                src_repo: m.src_repo.clone(),
            });
        }

        let mut section_index = HashMap::new();
        for entry in &self.sections {
            let spec = self.section_spec(entry, base_dir)?;
            section_index.insert(entry.name.as_str(), builder.add_section(spec));
        }

        let mut symbol_index = HashMap::new();
        for entry in &self.symbols {
            let mut spec = match entry.section.as_deref() {
                None => SymbolSpec::import(&entry.name),
                Some("abs") => SymbolSpec::absolute(&entry.name, entry.value),
                Some(section) => {
                    let idx = section_index.get(section).copied().ok_or_else(|| {
                        PackError::UnknownSection {
                            symbol: entry.name.clone(),
                            section: section.to_string(),
                        }
                    })?;
                    let mut spec = SymbolSpec::function(&entry.name, idx, entry.value);
                    spec.sym_type = parse_symbol_kind(&entry.kind)?;
                    spec.size = entry.size;
                    spec
                }
            };
            spec.binding = parse_binding(&entry.binding)?;
            let idx = builder.add_symbol(spec);
            symbol_index.insert(entry.name.as_str(), idx);
            if entry.export {
                builder.export(idx);
            }
        }

        for reloc in &self.relocations {
            let sym_idx = match reloc.symbol.as_deref() {
                None => 0,
                Some(name) => symbol_index.get(name).copied().ok_or_else(|| {
                    PackError::UnknownSymbol {
                        name: name.to_string(),
                    }
                })?,
            };
            let reloc_type = parse_reloc_type(&reloc.reloc_type)?;
            builder.add_relocation(reloc.offset, reloc_type, sym_idx, reloc.addend);
        }

        for dep in &self.dependencies {
            let mut flags = DependencyFlags::empty();
            flags.set(DependencyFlags::WEAK, dep.weak);
            flags.set(DependencyFlags::OPTIONAL, dep.optional);
            builder.add_dependency(DependencySpec {
                name: dep.name.clone(),
                version: parse_version(&dep.version)?,
                uuid: dep.uuid.as_deref().map(parse_uuid).transpose()?.unwrap_or([0; 16]),
                flags,
            });
        }

        for res in &self.resources {
            let data = read_input(&base_dir.join(&res.file))?;
            let mut spec = ResourceSpec::new(parse_resource_type(&res.res_type)?, data)
                .language(&res.lang)
                .compressed(parse_compression(&res.compression)?);
            if res.critical {
                spec = spec.flags(ResourceFlags::CRITICAL);
            }
            builder.add_resource(spec);
        }

        log::debug!(
            "[PLAM-PACK] manifest `{}`: {} sections, {} symbols, {} resources",
            m.name,
            self.sections.len(),
            self.symbols.len(),
            self.resources.len()
        );
        Ok(builder)
    }

    fn section_spec(&self, entry: &SectionEntry, base_dir: &Path) -> Result<SectionSpec, PackError> {
        let data = match &entry.file {
            Some(file) => read_input(&base_dir.join(file))?,
            None => Vec::new(),
        };
        let mut spec = match entry.kind.as_str() {
            "code" => SectionSpec::code(&entry.name, entry.addr, data),
            "data" => SectionSpec::data(&entry.name, entry.addr, data),
            "rodata" => SectionSpec::rodata(&entry.name, entry.addr, data),
            "bss" => SectionSpec::bss(&entry.name, entry.addr, entry.size.unwrap_or(0)),
            "jit" => SectionSpec::new(
                &entry.name,
                entry.addr,
                SectionFlags::READ | SectionFlags::WRITE | SectionFlags::EXEC,
                data,
            ),
            other => return Err(unknown("section kind", other)),
        };
        if let Some(size) = entry.size {
            spec.mem_size = size;
        }
        Ok(spec.compressed(parse_compression(&entry.compression)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[module]
name = "hello"
arch = "x86_64"
entry = 0x1000
flags = ["pie"]
"#;

    #[test]
    fn defaults_fill_in() {
        let m = parse_manifest_str(MINIMAL).unwrap();
        assert_eq!(m.module.file_type, "app");
        assert_eq!(m.module.hash, "blake3");
        assert_eq!(m.module.compression, "none");
        assert_eq!(m.module.entry, Some(0x1000));
        assert!(m.sections.is_empty());
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        assert!(matches!(
            parse_manifest_str("[module\nname = 1"),
            Err(PackError::ManifestParse(_))
        ));
    }

    #[test]
    fn tokens_map_to_format_values() {
        assert_eq!(parse_file_type("lib").unwrap(), FileType::SharedLib);
        assert_eq!(parse_cpu("aarch64").unwrap(), CpuId::Arm64);
        assert_eq!(parse_compression("deflate").unwrap(), CompressionAlgorithm::Deflate);
        assert_eq!(
            parse_header_flags(&["pie".into(), "hot_patchable".into()]).unwrap(),
            HeaderFlags::PIE | HeaderFlags::HOT_PATCHABLE
        );
        assert!(matches!(parse_cpu("mips"), Err(PackError::UnknownCpu { .. })));
        assert!(matches!(
            parse_resource_type("wallpaper"),
            Err(PackError::UnknownResourceType { .. })
        ));
        assert!(matches!(
            parse_header_flags(&["fast".into()]),
            Err(PackError::UnknownToken { field: "header flag", .. })
        ));
    }

    #[test]
    fn keys_accept_hex_or_raw() {
        let hex_key = "07".repeat(32);
        assert_eq!(decode_key(hex_key.as_bytes()).unwrap(), [7u8; 32]);
        assert_eq!(decode_key(&[9u8; 32]).unwrap(), [9u8; 32]);
        assert!(matches!(decode_key(b"short"), Err(PackError::BadKey(_))));
    }

    #[test]
    fn symbol_in_undeclared_section_rejected() {
        let mut m = parse_manifest_str(MINIMAL).unwrap();
        m.symbols.push(SymbolEntry {
            name: "entry".into(),
            section: Some(".text".into()),
            value: 0x1000,
            size: 0,
            kind: "func".into(),
            binding: "global".into(),
            export: true,
        });
        assert!(matches!(
            m.to_builder(Path::new(".")),
            Err(PackError::UnknownSection { .. })
        ));
    }
}
