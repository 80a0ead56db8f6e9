//! `inspect` and `verify` handlers.

use std::path::{Path, PathBuf};

use plam::format::{CpuFeatures, CpuId};
use plam::header::ContainerHeader;
use plam::integrity::digest_hex;
use plam::resources::ResourceStore;
use plam::{Container, CpuRequest, InMemoryAddressSpace, LoadPolicy, LoadRequest, LoaderContext};
use serde::Serialize;

use crate::cli::{InspectArgs, VerifyArgs};
use crate::error::{read_input, PackError};
use crate::manifest::parse_cpu;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SectionReport {
    pub name: String,
    pub addr: String,
    pub size: u64,
    pub flags: Vec<String>,
    pub compression: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResourceReport {
    #[serde(rename = "type")]
    pub res_type: String,
    pub lang: String,
    pub size: u64,
    pub compression: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DependencyReport {
    pub name: String,
    pub version: String,
    pub soft: bool,
}

/// Everything `inspect` prints about one container.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InspectReport {
    pub file: String,
    pub format: String,
    pub file_type: String,
    pub cpu: String,
    /// Architectures of a fat container; empty for a thin one.
    pub fat: Vec<String>,
    pub flags: Vec<String>,
    pub entry: Option<String>,
    pub uuid: String,
    pub timestamp: u64,
    pub hash_type: String,
    pub build_hash: String,
    pub file_compression: String,
    pub signature: String,
    pub sections: Vec<SectionReport>,
    pub imports: Vec<String>,
    pub exports: Vec<String>,
    pub relocations: usize,
    pub dependencies: Vec<DependencyReport>,
    pub resources: Vec<ResourceReport>,
    pub warnings: Vec<String>,
}

/// Result of a successful `verify`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VerifyReport {
    pub module: String,
    pub version: String,
    pub signature: String,
    pub base: String,
    pub entry: Option<String>,
    pub mapped_sections: usize,
    pub relocations_applied: usize,
    pub exports: usize,
    pub dependencies: Vec<String>,
    pub warnings: Vec<String>,
}

/// Lenient policy for looking at a container: any feature set, no signature demand.
fn inspect_policy(cpu: CpuId) -> LoadPolicy {
    LoadPolicy {
        cpu: CpuRequest::new(cpu, CpuFeatures::all()),
        ..LoadPolicy::default()
    }
}

fn flag_names<I: Iterator<Item = (&'static str, T)>, T>(names: I) -> Vec<String> {
    names.map(|(name, _)| name.to_ascii_lowercase()).collect()
}

/// `inspect <file>` handler.
pub fn inspect(args: InspectArgs) -> Result<serde_json::Value, PackError> {
    let bytes = read_input(&args.file)?;
    let report = inspect_bytes(&args.file, &bytes, parse_cpu(&args.cpu)?)?;
    Ok(serde_json::to_value(report)?)
}

/// Describe a container; a fat container is described through the sub-image for `cpu`.
pub fn inspect_bytes(path: &Path, bytes: &[u8], cpu: CpuId) -> Result<InspectReport, PackError> {
    let fat = match ContainerHeader::parse(bytes) {
        Ok((outer, _)) if outer.is_fat() => plam::fat::read_fat_table(&outer, bytes)?
            .iter()
            .map(|arch| arch.cpu_id.name().to_string())
            .collect(),
        _ => Vec::new(),
    };

    let container = Container::open(bytes, &inspect_policy(cpu))?;
    let header = container.header();
    let strings = container.strings()?;

    let mut sections = Vec::new();
    for section in container.sections()? {
        sections.push(SectionReport {
            name: strings.get_owned(section.name_off)?,
            addr: format!("{:#x}", section.addr),
            size: section.virtual_size(),
            flags: flag_names(section.flags.iter_names()),
            compression: format!("{:?}", section.comp_alg),
        });
    }

    let symbols = container.symbols()?;
    let imports = symbols.imports().map(|s| s.name.clone()).collect();
    let exports = symbols
        .export_indices(header, container.bytes())?
        .into_iter()
        .filter_map(|idx| symbols.get(idx).map(|s| s.name.clone()))
        .collect();

    let dependencies = container
        .dependencies()?
        .into_iter()
        .map(|dep| DependencyReport {
            soft: dep.is_soft(),
            version: dep.version.to_string(),
            name: dep.name,
        })
        .collect();

    let store = ResourceStore::index(header, container.bytes())?;
    let resources = store
        .descriptors()
        .iter()
        .map(|desc| ResourceReport {
            res_type: format!("{:?}", desc.res_type),
            lang: desc.language().to_string(),
            size: desc.orig_size,
            compression: format!("{:?}", desc.comp_alg),
        })
        .collect();

    Ok(InspectReport {
        file: path.display().to_string(),
        format: format!("{}.{}", header.hdr_ver_major, header.hdr_ver_minor),
        file_type: format!("{:?}", header.file_type),
        cpu: header.cpu_id.name().to_string(),
        fat,
        flags: flag_names(header.flags.iter_names()),
        entry: (header.entry_off != 0).then(|| format!("{:#x}", header.entry_off)),
        uuid: digest_hex(&header.uuid),
        timestamp: header.timestamp,
        hash_type: format!("{:?}", header.hash_type),
        build_hash: digest_hex(&header.build_hash),
        file_compression: format!("{:?}", header.file_comp),
        signature: format!("{:?}", container.signature()),
        sections,
        imports,
        exports,
        relocations: header.reloc_count as usize,
        dependencies,
        resources,
        warnings: container.warnings().iter().map(|w| w.to_string()).collect(),
    })
}

/// `verify <file>` handler.
pub fn verify(args: VerifyArgs) -> Result<serde_json::Value, PackError> {
    let cpu = parse_cpu(&args.cpu)?;
    for key in &args.trusted_keys {
        let mut raw = [0u8; 32];
        hex::decode_to_slice(key.trim(), &mut raw)
            .map_err(|e| PackError::BadKey(format!("trusted key `{key}`: {e}")))?;
    }
    let policy = LoadPolicy {
        cpu: CpuRequest::new(cpu, CpuFeatures::all()),
        require_signature: args.require_signature,
        trusted_keys: args.trusted_keys.clone(),
        verify_resources_eagerly: true,
        ..LoadPolicy::default()
    };

    let mut files: Vec<PathBuf> = args.with.clone();
    files.push(args.file.clone());
    let mut inputs = Vec::with_capacity(files.len());
    for file in &files {
        inputs.push((module_name(file), read_input(file)?));
    }
    let report = verify_inputs(policy, &inputs)?;
    Ok(serde_json::to_value(report)?)
}

/// Load every `(name, bytes)` input into a scratch address space and
/// report on the last one.
pub fn verify_inputs(policy: LoadPolicy, inputs: &[(String, Vec<u8>)]) -> Result<VerifyReport, PackError> {
    let ctx = LoaderContext::new(policy, InMemoryAddressSpace::new());
    let requests: Vec<LoadRequest<'_>> = inputs
        .iter()
        .map(|(name, bytes)| LoadRequest::new(name, bytes))
        .collect();
    let ids = ctx.load_batch(&requests)?;
    let Some(&target) = ids.last() else {
        return Err(PackError::NoInputs);
    };
    let module = ctx.module(target)?;
    let report = VerifyReport {
        module: module.name.clone(),
        version: module.version.to_string(),
        signature: format!("{:?}", module.signature),
        base: format!("{:#x}", module.base),
        entry: module.entry().map(|addr| format!("{:#x}", addr)),
        mapped_sections: module.sections.len(),
        relocations_applied: module.relocations_applied,
        exports: module.exports.len(),
        dependencies: module.dependencies.iter().map(|d| d.name.clone()).collect(),
        warnings: module.warnings.iter().map(|w| w.to_string()).collect(),
    };
    let released = ctx.shutdown();
    log::debug!("[PLAM-PACK] verify released {} modules", released);
    Ok(report)
}

fn module_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
