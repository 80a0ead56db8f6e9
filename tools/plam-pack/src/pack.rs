//! `pack` and `fat` handlers.

use std::path::Path;

use plam::header::ContainerHeader;
use plam::integrity::digest_hex;
use plam::writer::FatBuilder;
use serde::Serialize;

use crate::cli::{FatArgs, PackArgs};
use crate::error::{read_input, PackError};
use crate::manifest::parse_manifest;

/// Summary printed after `pack`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PackReport {
    pub module: String,
    pub output: String,
    pub size: usize,
    pub file_type: String,
    pub cpu: String,
    pub sections: usize,
    pub symbols: usize,
    pub resources: usize,
    pub signed: bool,
    pub build_hash: String,
}

/// One sub-image of a fat container.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FatEntryReport {
    pub cpu: String,
    pub offset: u64,
    pub size: u64,
}

/// Summary printed after `fat`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FatReport {
    pub output: String,
    pub size: usize,
    pub architectures: Vec<FatEntryReport>,
}

/// `pack <manifest> -o <out>` handler.
pub fn pack(args: PackArgs) -> Result<serde_json::Value, PackError> {
    let report = pack_to_file(&args.manifest, &args.out)?;
    Ok(serde_json::to_value(report)?)
}

/// Build the container a manifest describes and write it to `out`.
pub fn pack_to_file(manifest_path: &Path, out: &Path) -> Result<PackReport, PackError> {
    let manifest = parse_manifest(manifest_path)?;
    let base_dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let bytes = manifest.to_builder(base_dir)?.build()?;
    std::fs::write(out, &bytes)?;

    let (header, _) = ContainerHeader::parse(&bytes)?;
    log::info!(
        "[PLAM-PACK] wrote {} ({} bytes, {} sections)",
        out.display(),
        bytes.len(),
        header.section_count
    );
    Ok(PackReport {
        module: manifest.module.name.clone(),
        output: out.display().to_string(),
        size: bytes.len(),
        file_type: manifest.module.file_type.clone(),
        cpu: header.cpu_id.name().to_string(),
        sections: header.section_count as usize,
        symbols: header.symbol_count as usize,
        resources: header.res_cnt as usize,
        signed: !header.dirs.security.is_empty(),
        build_hash: digest_hex(&header.build_hash),
    })
}

/// `fat <inputs..> -o <out>` handler.
pub fn fat(args: FatArgs) -> Result<serde_json::Value, PackError> {
    let mut images = Vec::with_capacity(args.inputs.len());
    for input in &args.inputs {
        images.push(read_input(input)?);
    }
    let report = fat_to_file(images, &args.out, args.align_log2)?;
    Ok(serde_json::to_value(report)?)
}

/// Combine thin images into a fat container written to `out`.
///
/// The fat header takes its file type from the first image.
pub fn fat_to_file(images: Vec<Vec<u8>>, out: &Path, align_log2: u32) -> Result<FatReport, PackError> {
    let file_type = match images.first() {
        Some(first) => ContainerHeader::parse(first)?.0.file_type,
        None => return Err(PackError::NoInputs),
    };
    let mut builder = FatBuilder::new(file_type);
    builder.align_log2(align_log2);
    for image in images {
        builder.add(image)?;
    }
    let bytes = builder.build()?;
    std::fs::write(out, &bytes)?;

    let (header, _) = ContainerHeader::parse(&bytes)?;
    let architectures = plam::fat::read_fat_table(&header, &bytes)?
        .iter()
        .map(|arch| FatEntryReport {
            cpu: arch.cpu_id.name().to_string(),
            offset: arch.offset,
            size: arch.size,
        })
        .collect::<Vec<_>>();
    log::info!(
        "[PLAM-PACK] wrote fat container {} with {} architectures",
        out.display(),
        architectures.len()
    );
    Ok(FatReport {
        output: out.display().to_string(),
        size: bytes.len(),
        architectures,
    })
}
