//! Property: Pack manifest TOML round-trip
//!
//! For any valid `PackManifest`, serializing to TOML and parsing it back
//! produces an equal struct; malformed TOML produces a parse error.

use plam_pack::error::PackError;
use plam_pack::manifest::{
    parse_manifest_str, DependencyEntry, ModuleInfo, PackManifest, RelocationEntry, ResourceEntry,
    SectionEntry, SymbolEntry,
};
use proptest::prelude::*;
use std::path::PathBuf;

fn arb_module() -> impl Strategy<Value = ModuleInfo> {
    (
        "[a-z][a-z0-9_]{0,15}",
        prop_oneof![Just("app"), Just("lib"), Just("driver"), Just("module")],
        prop_oneof![Just("x86_64"), Just("arm64"), Just("riscv64")],
        proptest::option::of((0u16..10, 0u16..10, 0u32..100)),
        proptest::option::of(0u64..0x10_0000),
        proptest::collection::vec(prop_oneof![Just("pie"), Just("aslr"), Just("hot_patchable")], 0..3),
        prop_oneof![Just("none"), Just("sha2"), Just("blake3")],
        prop_oneof![Just("none"), Just("lz4"), Just("deflate")],
    )
        .prop_map(|(name, ty, arch, version, entry, flags, hash, comp)| ModuleInfo {
            name,
            file_type: ty.to_string(),
            arch: arch.to_string(),
            features: Vec::new(),
            version: version.map(|(a, b, c)| format!("{a}.{b}.{c}")),
            entry,
            flags: flags.into_iter().map(String::from).collect(),
            hash: hash.to_string(),
            compression: comp.to_string(),
            uuid: None,
            timestamp: None,
            signing_key: None,
            abi_rev: None,
            src_repo: None,
        })
}

fn arb_section() -> impl Strategy<Value = SectionEntry> {
    (
        "\\.[a-z]{1,8}",
        prop_oneof![Just("code"), Just("data"), Just("rodata"), Just("bss")],
        0u64..0x100_0000,
        proptest::option::of("[a-z]{1,8}\\.bin"),
        proptest::option::of(0u64..0x1_0000),
    )
        .prop_map(|(name, kind, addr, file, size)| SectionEntry {
            name,
            kind: kind.to_string(),
            addr,
            file: file.map(PathBuf::from),
            size,
            compression: "none".to_string(),
        })
}

fn arb_symbol() -> impl Strategy<Value = SymbolEntry> {
    (
        "[a-z_][a-z0-9_]{0,15}",
        proptest::option::of("\\.[a-z]{1,8}"),
        0u64..0x100_0000,
        any::<bool>(),
        prop_oneof![Just("global"), Just("weak")],
    )
        .prop_map(|(name, section, value, export, binding)| SymbolEntry {
            name,
            section,
            value,
            size: 0,
            kind: "func".to_string(),
            binding: binding.to_string(),
            export,
        })
}

fn arb_manifest() -> impl Strategy<Value = PackManifest> {
    (
        arb_module(),
        proptest::collection::vec(arb_section(), 0..4),
        proptest::collection::vec(arb_symbol(), 0..4),
        proptest::collection::vec((0u64..0x10000, -64i64..64), 0..3),
        proptest::collection::vec(("[a-z]{1,10}", any::<bool>()), 0..3),
        proptest::collection::vec(("[a-z]{2}", "[a-z]{1,8}\\.dat"), 0..3),
    )
        .prop_map(|(module, sections, symbols, relocs, deps, resources)| PackManifest {
            module,
            sections,
            symbols,
            relocations: relocs
                .into_iter()
                .map(|(offset, addend)| RelocationEntry {
                    offset,
                    reloc_type: "relative".to_string(),
                    symbol: None,
                    addend,
                })
                .collect(),
            dependencies: deps
                .into_iter()
                .map(|(name, weak)| DependencyEntry {
                    name,
                    version: "1.0.0".to_string(),
                    uuid: None,
                    weak,
                    optional: false,
                })
                .collect(),
            resources: resources
                .into_iter()
                .map(|(lang, file)| ResourceEntry {
                    res_type: "string".to_string(),
                    lang,
                    file: PathBuf::from(file),
                    compression: "lz4".to_string(),
                    critical: false,
                })
                .collect(),
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn manifest_round_trip(manifest in arb_manifest()) {
        let text = toml::to_string(&manifest).unwrap();
        let back = parse_manifest_str(&text).unwrap();
        prop_assert_eq!(back, manifest);
    }

    #[test]
    fn garbage_is_a_parse_error(junk in "[\\[\\]=\"]{1,12}") {
        let is_parse_error = matches!(parse_manifest_str(&junk), Err(PackError::ManifestParse(_)));
        prop_assert!(is_parse_error);
    }
}

#[test]
fn missing_module_table_is_a_parse_error() {
    assert!(matches!(
        parse_manifest_str("[[sections]]\nname = \".text\"\naddr = 4096\n"),
        Err(PackError::ManifestParse(_))
    ));
}
