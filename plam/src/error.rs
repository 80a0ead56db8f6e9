//! Loader Error Types
//!
//! Every stage of the pipeline returns a typed failure; nothing in the loader
//! panics or aborts the process.

use alloc::string::String;
use core::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, LoadError>;

/// Loader error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// A structure's magic number is not the defined constant.
    MagicMismatch { expected: u32, found: u32 },
    /// Header major version differs from the one this loader speaks.
    UnsupportedMajorVersion(u16),
    /// Input slice is shorter than the structure being decoded.
    TruncatedInput { needed: usize, available: usize },
    /// Header CRC-32 or whole-file build hash does not match.
    ChecksumMismatch,
    /// No fat-arch entry fits the requesting CPU.
    ArchNotSupported { cpu_id: u16 },
    /// Two sections overlap in virtual or file space.
    OverlappingSections { first: usize, second: usize },
    /// A section asks for write + execute without the container override.
    InsecureSectionPermissions { section: usize },
    /// Compression id unknown, or no codec for it is built in.
    UnknownCompressionAlgorithm(u32),
    /// A compressed stream failed to decode or has the wrong length.
    DecompressionFailed,
    /// Relocated value does not fit the patch site.
    RelocationOverflow { offset: u64 },
    /// Strong symbol without a local definition or a satisfied import.
    UnresolvedSymbol(String),
    /// Required dependency not loaded (or loaded at a lower version).
    MissingDependency { name: String, required: u64 },
    /// Dependency graph contains a cycle with a strong edge.
    DependencyCycle(String),
    /// Resource content does not match its declared size or hash.
    ResourceCorrupt { index: usize },
    /// Signature present but invalid, or required and absent.
    SignatureInvalid,
    /// An RVA or table does not fit inside the container.
    OutOfBounds { what: &'static str },
    /// An offset does not honour its declared alignment.
    Misaligned { what: &'static str },
    /// Entry point does not fall inside an executable section.
    InvalidEntryPoint(u64),
    /// Relocation references a symbol index past the symbol table.
    InvalidSymbolIndex(u32),
    /// Relocation type this loader does not implement.
    UnsupportedRelocation(u32),
    /// Decoded section length differs from its virtual size.
    SectionSizeMismatch { section: usize },
    /// Address-space collaborator refused a reservation or mapping.
    MapFailed { address: u64 },
    /// A module with this name is already registered.
    AlreadyLoaded(String),
    /// Another loaded module still depends on this one.
    InUse(String),
    /// Hot patch image is not position independent, so it cannot be mapped
    /// beside the image it replaces.
    NotRelocatable(String),
    /// Named module is not loaded.
    ModuleNotFound(String),
    /// Module id refers to a slot that was released or reused.
    StaleHandle,
    /// No resource of the requested type and language.
    ResourceNotFound,
    /// Driver implementation missing, or module lacks a dispatch table.
    DriverUnavailable(String),
    /// String table entry is unterminated or not UTF-8.
    InvalidString { offset: u64 },
}

impl LoadError {
    /// Shorthand for a truncation failure.
    pub(crate) fn truncated(needed: usize, available: usize) -> Self {
        LoadError::TruncatedInput { needed, available }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::MagicMismatch { expected, found } => {
                write!(f, "magic mismatch: expected {:#010x}, found {:#010x}", expected, found)
            }
            LoadError::UnsupportedMajorVersion(v) => {
                write!(f, "unsupported format major version {}", v)
            }
            LoadError::TruncatedInput { needed, available } => {
                write!(f, "truncated input: need {} bytes, have {}", needed, available)
            }
            LoadError::ChecksumMismatch => write!(f, "checksum mismatch"),
            LoadError::ArchNotSupported { cpu_id } => {
                write!(f, "no image for cpu {:#06x}", cpu_id)
            }
            LoadError::OverlappingSections { first, second } => {
                write!(f, "sections {} and {} overlap", first, second)
            }
            LoadError::InsecureSectionPermissions { section } => {
                write!(f, "section {} requests write+exec", section)
            }
            LoadError::UnknownCompressionAlgorithm(alg) => {
                write!(f, "unknown compression algorithm {}", alg)
            }
            LoadError::DecompressionFailed => write!(f, "decompression failed"),
            LoadError::RelocationOverflow { offset } => {
                write!(f, "relocation overflow at {:#x}", offset)
            }
            LoadError::UnresolvedSymbol(name) => write!(f, "unresolved symbol `{}`", name),
            LoadError::MissingDependency { name, required } => {
                write!(
                    f,
                    "missing dependency `{}` (>= {})",
                    name,
                    crate::deps::SemVer::from_packed(*required)
                )
            }
            LoadError::DependencyCycle(name) => {
                write!(f, "dependency cycle through `{}`", name)
            }
            LoadError::ResourceCorrupt { index } => write!(f, "resource {} is corrupt", index),
            LoadError::SignatureInvalid => write!(f, "signature invalid"),
            LoadError::OutOfBounds { what } => write!(f, "{} out of bounds", what),
            LoadError::Misaligned { what } => write!(f, "{} misaligned", what),
            LoadError::InvalidEntryPoint(rva) => {
                write!(f, "entry point {:#x} not in an executable section", rva)
            }
            LoadError::InvalidSymbolIndex(idx) => write!(f, "invalid symbol index {}", idx),
            LoadError::UnsupportedRelocation(ty) => write!(f, "unsupported relocation type {}", ty),
            LoadError::SectionSizeMismatch { section } => {
                write!(f, "section {} size mismatch", section)
            }
            LoadError::MapFailed { address } => write!(f, "mapping failed at {:#x}", address),
            LoadError::AlreadyLoaded(name) => write!(f, "module `{}` already loaded", name),
            LoadError::InUse(name) => write!(f, "module `{}` is in use", name),
            LoadError::NotRelocatable(name) => {
                write!(f, "module `{}` is not PIE and cannot be hot-patched", name)
            }
            LoadError::ModuleNotFound(name) => write!(f, "module `{}` not found", name),
            LoadError::StaleHandle => write!(f, "stale module handle"),
            LoadError::ResourceNotFound => write!(f, "resource not found"),
            LoadError::DriverUnavailable(name) => write!(f, "driver `{}` unavailable", name),
            LoadError::InvalidString { offset } => {
                write!(f, "invalid string at table offset {:#x}", offset)
            }
        }
    }
}

/// Recoverable condition recorded on a loaded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadWarning {
    /// Weak import bound to address zero.
    UnresolvedWeakSymbol(String),
    /// Weak or optional dependency absent (or too old).
    MissingSoftDependency { name: String, required: u64 },
    /// Resource failed verification; only that resource is unusable.
    CorruptResource { index: usize },
    /// `hash_type` names an algorithm this loader cannot compute.
    UnverifiedBuildHash(u16),
    /// Input used the deprecated PLM2 layout and was upgraded.
    LegacyFormat,
}

impl fmt::Display for LoadWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadWarning::UnresolvedWeakSymbol(name) => {
                write!(f, "weak symbol `{}` unresolved, bound to 0", name)
            }
            LoadWarning::MissingSoftDependency { name, required } => write!(
                f,
                "optional dependency `{}` (>= {}) not loaded",
                name,
                crate::deps::SemVer::from_packed(*required)
            ),
            LoadWarning::CorruptResource { index } => write!(f, "resource {} is corrupt", index),
            LoadWarning::UnverifiedBuildHash(ty) => {
                write!(f, "build hash type {} not verified", ty)
            }
            LoadWarning::LegacyFormat => write!(f, "legacy PLM2 container upgraded"),
        }
    }
}
