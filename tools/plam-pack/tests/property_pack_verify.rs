//! Property: Pack then verify
//!
//! Any manifest built from valid tokens packs into a container that
//! `inspect` describes faithfully and `verify` links in a scratch address
//! space. Local input problems exit with 2, rejected containers with 1.

use std::fs;
use std::path::Path;

use plam::{LoadPolicy, LoadRequest};
use plam_pack::cli::{Command, InspectArgs, PackArgs, VerifyArgs};
use plam_pack::error::PackError;
use plam_pack::inspect::{inspect_bytes, verify_inputs};
use plam_pack::pack::{fat_to_file, pack_to_file};
use plam::format::CpuId;
use proptest::prelude::*;
use tempfile::TempDir;

fn write_manifest(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("pack.toml");
    fs::write(&path, body).unwrap();
    path
}

fn library_manifest(arch: &str, compression: &str, hash: &str) -> String {
    format!(
        r#"
[module]
name = "libdemo"
type = "lib"
arch = "{arch}"
version = "1.4.0"
flags = ["pie"]
hash = "{hash}"
compression = "{compression}"

[[sections]]
name = ".text"
kind = "code"
addr = 0x1000
file = "text.bin"
compression = "{compression}"

[[sections]]
name = ".bss"
kind = "bss"
addr = 0x2000
size = 0x400

[[symbols]]
name = "demo_init"
section = ".text"
value = 0x1000
export = true

[[relocations]]
offset = 0x1008
type = "relative"
addend = 0x1000

[[resources]]
type = "string"
lang = "en"
file = "strings.txt"
compression = "{compression}"
"#
    )
}

fn verify_args(file: std::path::PathBuf) -> VerifyArgs {
    VerifyArgs {
        file,
        cpu: "x86_64".to_string(),
        trusted_keys: Vec::new(),
        require_signature: false,
        with: Vec::new(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn packed_library_verifies(
        code in proptest::collection::vec(any::<u8>(), 16..512),
        compression in prop_oneof![Just("none"), Just("lz4"), Just("deflate")],
        hash in prop_oneof![Just("none"), Just("sha2"), Just("blake3")],
    ) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("text.bin"), &code).unwrap();
        fs::write(dir.path().join("strings.txt"), b"hello").unwrap();
        let manifest = write_manifest(dir.path(), &library_manifest("x86_64", compression, hash));
        let out = dir.path().join("libdemo.plam");

        let packed = pack_to_file(&manifest, &out).unwrap();
        prop_assert_eq!(packed.sections, 2);
        prop_assert_eq!(packed.symbols, 1);

        let bytes = fs::read(&out).unwrap();
        let report = inspect_bytes(&out, &bytes, CpuId::X86_64).unwrap();
        prop_assert_eq!(&report.cpu, "x86_64");
        prop_assert_eq!(&report.exports, &vec!["demo_init".to_string()]);
        prop_assert_eq!(report.sections.len(), 2);
        prop_assert_eq!(report.resources.len(), 2);

        let verified = verify_inputs(LoadPolicy::default(), &[("libdemo".to_string(), bytes)]).unwrap();
        prop_assert_eq!(&verified.version, "1.4.0");
        prop_assert_eq!(verified.relocations_applied, 1);
        prop_assert_eq!(verified.mapped_sections, 2);
        prop_assert!(verified.warnings.is_empty());
    }
}

#[test]
fn missing_section_file_exits_2() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("strings.txt"), b"hello").unwrap();
    let manifest = write_manifest(dir.path(), &library_manifest("x86_64", "none", "blake3"));
    let err = plam_pack::run(Command::Pack(PackArgs {
        manifest,
        out: dir.path().join("out.plam"),
    }))
    .unwrap_err();
    assert!(matches!(err, PackError::InputNotFound { .. }));
    assert_eq!(err.code(), 2);
}

#[test]
fn unknown_tokens_exit_2() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("text.bin"), [0x90; 16]).unwrap();
    fs::write(dir.path().join("strings.txt"), b"hello").unwrap();
    let out = dir.path().join("out.plam");

    let bad_resource =
        library_manifest("x86_64", "none", "blake3").replace("\"string\"", "\"wallpaper\"");
    let err = pack_to_file(&write_manifest(dir.path(), &bad_resource), &out).unwrap_err();
    assert!(matches!(err, PackError::UnknownResourceType { .. }));
    assert_eq!(err.code(), 2);

    let bad_codec = library_manifest("x86_64", "snappy", "blake3");
    let err = pack_to_file(&write_manifest(dir.path(), &bad_codec), &out).unwrap_err();
    assert!(matches!(err, PackError::UnknownCompression { .. }));
    assert_eq!(err.code(), 2);

    // Known to the format, but no codec in the writer.
    let no_codec = library_manifest("x86_64", "zstd", "blake3");
    let err = pack_to_file(&write_manifest(dir.path(), &no_codec), &out).unwrap_err();
    assert_eq!(err.code(), 2);

    let bad_arch = library_manifest("mips", "none", "blake3");
    let err = pack_to_file(&write_manifest(dir.path(), &bad_arch), &out).unwrap_err();
    assert!(matches!(err, PackError::UnknownCpu { .. }));
    assert!(!out.exists());
}

#[test]
fn corrupted_container_exits_1() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("text.bin"), [0x90; 16]).unwrap();
    fs::write(dir.path().join("strings.txt"), b"hello").unwrap();
    let out = dir.path().join("lib.plam");
    pack_to_file(&write_manifest(dir.path(), &library_manifest("x86_64", "none", "blake3")), &out).unwrap();

    let mut bytes = fs::read(&out).unwrap();
    bytes[40] ^= 0xFF;
    fs::write(&out, &bytes).unwrap();

    let err = plam_pack::run(Command::Verify(verify_args(out.clone()))).unwrap_err();
    assert!(matches!(err, PackError::Load(plam::LoadError::ChecksumMismatch)));
    assert_eq!(err.code(), 1);

    let err = plam_pack::run(Command::Inspect(InspectArgs {
        file: out,
        cpu: "x86_64".to_string(),
    }))
    .unwrap_err();
    assert_eq!(err.code(), 1);
}

#[test]
fn signed_pack_verifies_only_with_trusted_key() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("text.bin"), [0x90; 16]).unwrap();
    fs::write(dir.path().join("strings.txt"), b"hello").unwrap();
    fs::write(dir.path().join("signing.key"), "2a".repeat(32)).unwrap();
    let body = library_manifest("x86_64", "none", "sha2").replacen(
        "flags = [\"pie\"]",
        "flags = [\"pie\"]\nsigning_key = \"signing.key\"",
        1,
    );
    let out = dir.path().join("signed.plam");
    let packed = pack_to_file(&write_manifest(dir.path(), &body), &out).unwrap();
    assert!(packed.signed);

    let mut args = verify_args(out.clone());
    args.require_signature = true;
    let err = plam_pack::run(Command::Verify(args)).unwrap_err();
    assert!(matches!(err, PackError::Load(plam::LoadError::SignatureInvalid)));

    let mut args = verify_args(out);
    args.trusted_keys = vec!["zz".to_string()];
    assert!(matches!(
        plam_pack::run(Command::Verify(args)).unwrap_err(),
        PackError::BadKey(_)
    ));
}

#[test]
fn verify_links_against_companion_modules() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("text.bin"), [0x90; 16]).unwrap();
    fs::write(dir.path().join("strings.txt"), b"hello").unwrap();
    let lib = dir.path().join("libdemo.plam");
    pack_to_file(&write_manifest(dir.path(), &library_manifest("x86_64", "none", "blake3")), &lib).unwrap();

    let app_manifest = r#"
[module]
name = "app"
arch = "x86_64"
entry = 0x1000
flags = ["pie"]

[[sections]]
name = ".text"
addr = 0x1000
file = "text.bin"

[[symbols]]
name = "demo_init"

[[relocations]]
offset = 0x1000
type = "abs64"
symbol = "demo_init"

[[dependencies]]
name = "libdemo"
version = "1.0.0"
"#;
    let app_path = dir.path().join("app.toml");
    fs::write(&app_path, app_manifest).unwrap();
    let app = dir.path().join("app.plam");
    pack_to_file(&app_path, &app).unwrap();

    // Alone, the dependency is missing.
    let err = plam_pack::run(Command::Verify(verify_args(app.clone()))).unwrap_err();
    assert!(matches!(err, PackError::Load(plam::LoadError::MissingDependency { .. })));

    let mut args = verify_args(app);
    args.with = vec![lib];
    let report = plam_pack::run(Command::Verify(args)).unwrap();
    assert_eq!(report["module"], "app");
    assert_eq!(report["dependencies"][0], "libdemo");
    assert_eq!(report["relocations_applied"], 1);
}

#[test]
fn fat_container_selects_requested_cpu() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("text.bin"), [0x90; 16]).unwrap();
    fs::write(dir.path().join("strings.txt"), b"hello").unwrap();
    let mut images = Vec::new();
    for arch in ["x86_64", "arm64"] {
        let out = dir.path().join(format!("{arch}.plam"));
        pack_to_file(&write_manifest(dir.path(), &library_manifest(arch, "none", "blake3")), &out).unwrap();
        images.push(fs::read(&out).unwrap());
    }
    let fat = dir.path().join("fat.plam");
    let report = fat_to_file(images, &fat, 12).unwrap();
    assert_eq!(report.architectures.len(), 2);
    assert_eq!(report.architectures[1].cpu, "arm64");
    assert_eq!(report.architectures[0].offset % 4096, 0);

    let bytes = fs::read(&fat).unwrap();
    let arm = inspect_bytes(&fat, &bytes, CpuId::Arm64).unwrap();
    assert_eq!(arm.cpu, "arm64");
    assert_eq!(arm.fat, vec!["x86_64".to_string(), "arm64".to_string()]);

    let err = inspect_bytes(&fat, &bytes, CpuId::Riscv64).unwrap_err();
    assert!(matches!(err, PackError::Load(plam::LoadError::ArchNotSupported { .. })));

    // The loader picks the arm64 slice too.
    let policy = LoadPolicy::for_cpu(CpuId::Arm64, plam::format::CpuFeatures::empty());
    let ctx = plam::LoaderContext::new(policy, plam::InMemoryAddressSpace::new());
    let id = ctx.load(LoadRequest::new("fat", &bytes)).unwrap();
    assert_eq!(ctx.module(id).unwrap().cpu, CpuId::Arm64);
}
