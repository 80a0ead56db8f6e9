//! PLAM format constants and enumerations.
//!
//! Enumerations keep unknown on-disk values verbatim in an `Other` variant so
//! that decoding never rejects a value and encoding reproduces it exactly.

use bitflags::bitflags;

/// Container magic: "PLAM".
pub const PLAM_MAGIC: u32 = 0x504C_414D;

/// Resource descriptor magic: "PLMR".
pub const PLAM_RES_MAGIC: u32 = 0x504C_4D52;

/// Fat-arch table magic: "PLMF".
pub const PLAM_FAT_MAGIC: u32 = 0x504C_4D46;

/// Magic of the deprecated flat layout: "PLM2".
pub const LEGACY_MAGIC: u32 = 0x504C_4D32;

/// Header major version understood by this loader.
pub const FORMAT_MAJOR: u16 = 2;

/// Header minor version written by this crate.
pub const FORMAT_MINOR: u16 = 0;

/// Section index of an undefined (imported) symbol.
pub const SECTION_UNDEF: u16 = 0xFFFF;

/// Section index of an absolute symbol.
pub const SECTION_ABS: u16 = 0xFFF1;

macro_rules! raw_enum {
    (
        $(#[$meta:meta])*
        $name:ident : $repr:ty {
            $( $(#[$vmeta:meta])* $variant:ident = $value:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
            /// Value not known to this version of the format.
            Other($repr),
        }

        impl $name {
            /// Decode from the on-disk value.
            pub const fn from_raw(raw: $repr) -> Self {
                match raw {
                    $( $value => $name::$variant, )+
                    other => $name::Other(other),
                }
            }

            /// On-disk value.
            pub const fn raw(self) -> $repr {
                match self {
                    $( $name::$variant => $value, )+
                    $name::Other(other) => other,
                }
            }
        }
    };
}

raw_enum! {
    /// Container file type.
    FileType: u16 {
        None = 0x00,
        Kernel = 0x01,
        Driver = 0x02,
        SharedLib = 0x03,
        App = 0x04,
        HotPlugModule = 0x05,
        Boot = 0x06,
        Plugin = 0x07,
        RelocatableObject = 0x08,
    }
}

impl FileType {
    /// Libraries and objects may omit an entry point (`entry_off == 0`).
    pub fn entry_optional(self) -> bool {
        matches!(
            self,
            FileType::SharedLib | FileType::RelocatableObject | FileType::Plugin | FileType::Driver
        )
    }
}

raw_enum! {
    /// CPU architecture id.
    CpuId: u16 {
        None = 0x0000,
        X86_64 = 0x8664,
        Arm64 = 0xAA64,
        Riscv64 = 0x00F3,
        Prum64 = 0x7072,
        Unknown = 0xFFFF,
    }
}

impl CpuId {
    /// Architecture family; micro-architecture variants share the upper bits.
    pub const fn family(self) -> u16 {
        self.raw() & 0xFFF0
    }

    /// Parse an architecture token as used on the command line.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "x86_64" | "amd64" => Some(CpuId::X86_64),
            "arm64" | "aarch64" => Some(CpuId::Arm64),
            "riscv64" => Some(CpuId::Riscv64),
            "prum64" => Some(CpuId::Prum64),
            _ => None,
        }
    }

    /// Human-readable architecture name.
    pub fn name(self) -> &'static str {
        match self {
            CpuId::None => "none",
            CpuId::X86_64 => "x86_64",
            CpuId::Arm64 => "arm64",
            CpuId::Riscv64 => "riscv64",
            CpuId::Prum64 => "prum64",
            CpuId::Unknown | CpuId::Other(_) => "unknown",
        }
    }
}

bitflags! {
    /// CPU sub-feature mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CpuFeatures: u16 {
        const X86_64_SSE4 = 0x0001;
        const ARM64_NEON = 0x0100;
        const RISCV_VECTOR = 0x1000;
    }
}

bitflags! {
    /// Global container flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u32 {
        const PIE = 1 << 0;
        const ASLR = 1 << 1;
        const NX_STACK = 1 << 2;
        const NX_HEAP = 1 << 3;
        const GUARD_CF = 1 << 4;
        const SEH_SAFE = 1 << 5;
        const ISOLATED_MEM = 1 << 6;
        const DEBUG_STRIPPED = 1 << 7;
        const NO_REEXPORTS = 1 << 8;
        const HW_ACCEL = 1 << 9;
        const HOT_PATCHABLE = 1 << 10;
        /// Sections may be writable and executable at once.
        const ALLOW_WX = 1 << 11;
    }
}

bitflags! {
    /// Section flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SectionFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const NOBITS = 1 << 3;
        const RELOC = 1 << 4;
        /// File range may alias another section's.
        const ALIAS = 1 << 5;
    }
}

bitflags! {
    /// Dependency entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DependencyFlags: u32 {
        const WEAK = 1 << 0;
        const OPTIONAL = 1 << 1;
    }
}

bitflags! {
    /// Resource descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceFlags: u16 {
        const ENCRYPTED = 1 << 0;
        /// Corruption of this resource fails an eager verification pass.
        const CRITICAL = 1 << 1;
    }
}

raw_enum! {
    /// Section type.
    SectionType: u32 {
        Null = 0,
        ProgBits = 1,
        SymTab = 2,
        StrTab = 3,
        Reloc = 4,
        Unwind = 5,
        NoBits = 8,
    }
}

raw_enum! {
    /// Relocation type.
    RelocType: u32 {
        None = 0,
        Abs64 = 1,
        Pc32 = 2,
        /// `image_base + addend`, no symbol.
        Relative = 3,
    }
}

raw_enum! {
    /// Symbol type.
    SymbolType: u8 {
        NoType = 0,
        Object = 1,
        Func = 2,
        Section = 3,
    }
}

raw_enum! {
    /// Symbol binding.
    SymbolBinding: u8 {
        Local = 0,
        Global = 1,
        Weak = 2,
    }
}

raw_enum! {
    /// Resource type.
    ResourceType: u16 {
        Icon = 0x0100,
        Version = 0x0200,
        DependencyInfo = 0x0300,
        String = 0x0400,
        Ui = 0x0500,
        Vendor = 0xF000,
    }
}

impl ResourceType {
    /// Parse a resource-type token as used by the packaging tool.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "icon" => Some(ResourceType::Icon),
            "version" => Some(ResourceType::Version),
            "dependency" => Some(ResourceType::DependencyInfo),
            "string" | "locale" => Some(ResourceType::String),
            "ui" => Some(ResourceType::Ui),
            "vendor" => Some(ResourceType::Vendor),
            _ => None,
        }
    }
}

raw_enum! {
    /// Compression algorithm. On disk as `u32` (sections) or `u8`
    /// (resources, whole file).
    CompressionAlgorithm: u32 {
        None = 0,
        Lz4 = 1,
        Zstd = 2,
        Lzma = 3,
        Brotli = 4,
        Deflate = 5,
    }
}

impl CompressionAlgorithm {
    /// Parse a compression argument as used by the packaging tool.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            "lz4" => Some(CompressionAlgorithm::Lz4),
            "zstd" => Some(CompressionAlgorithm::Zstd),
            "lzma" => Some(CompressionAlgorithm::Lzma),
            "brotli" => Some(CompressionAlgorithm::Brotli),
            "deflate" => Some(CompressionAlgorithm::Deflate),
            _ => None,
        }
    }

    /// Tag as stored in the one-byte fields of the header and resource
    /// descriptors. `None` for ids wider than a byte.
    pub fn byte_tag(self) -> Option<u8> {
        u8::try_from(self.raw()).ok()
    }
}

raw_enum! {
    /// Content hash algorithm declared by `hash_type`.
    HashType: u16 {
        None = 0,
        Sha2 = 1,
        Blake3 = 2,
    }
}

raw_enum! {
    /// Signature scheme.
    SignatureScheme: u8 {
        None = 0,
        Ed25519 = 1,
        Ecdsa = 2,
        Quantum = 3,
    }
}

raw_enum! {
    /// RELRO hardening level.
    RelroLevel: u8 {
        None = 0,
        Partial = 1,
        Full = 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_values_survive() {
        let ft = FileType::from_raw(0x42);
        assert_eq!(ft, FileType::Other(0x42));
        assert_eq!(ft.raw(), 0x42);
        assert_eq!(CpuId::from_raw(0xAA64), CpuId::Arm64);
    }

    #[test]
    fn test_cpu_family() {
        assert_eq!(CpuId::X86_64.family(), CpuId::Other(0x8665).family());
        assert_ne!(CpuId::X86_64.family(), CpuId::Arm64.family());
    }

    #[test]
    fn test_magic_spelling() {
        assert_eq!(&PLAM_MAGIC.to_be_bytes(), b"PLAM");
        assert_eq!(&PLAM_RES_MAGIC.to_be_bytes(), b"PLMR");
        assert_eq!(&PLAM_FAT_MAGIC.to_be_bytes(), b"PLMF");
    }

    #[test]
    fn test_compression_byte_tag() {
        assert_eq!(CompressionAlgorithm::Deflate.byte_tag(), Some(5));
        assert_eq!(CompressionAlgorithm::Other(0xFF).byte_tag(), Some(0xFF));
        assert_eq!(CompressionAlgorithm::Other(0x105).byte_tag(), None);
    }

    #[test]
    fn test_flags_keep_unknown_bits() {
        let flags = SectionFlags::from_bits_retain(0x8000_0005);
        assert!(flags.contains(SectionFlags::READ | SectionFlags::EXEC));
        assert_eq!(flags.bits(), 0x8000_0005);
    }
}
