//! Fat-Binary Selector
//!
//! Picks the embedded sub-container matching the requesting CPU. Offsets in
//! the returned slice are relative to the sub-container itself.

use alloc::vec::Vec;

use crate::codec::{decode_table, slice_at, Record};
use crate::config::CpuRequest;
use crate::error::{LoadError, Result};
use crate::format::PLAM_FAT_MAGIC;
use crate::header::ContainerHeader;
use crate::tables::FatArch;

/// Decode the fat-arch table of a fat container.
pub fn read_fat_table(header: &ContainerHeader, container: &[u8]) -> Result<Vec<FatArch>> {
    let magic_bytes = slice_at(container, header.dirs.fat_off, 4)?;
    let magic = u32::from_le_bytes([magic_bytes[0], magic_bytes[1], magic_bytes[2], magic_bytes[3]]);
    if magic != PLAM_FAT_MAGIC {
        return Err(LoadError::MagicMismatch {
            expected: PLAM_FAT_MAGIC,
            found: magic,
        });
    }
    decode_table(container, header.dirs.fat_off + 4, header.dirs.fat_cnt)
}

/// Select the sub-container for `request`.
///
/// First exact CPU id match in table order wins; failing that, the first entry
/// of the same family whose sub-image feature mask is a subset of the
/// requester's features.
pub fn select<'a>(
    header: &ContainerHeader,
    container: &'a [u8],
    request: CpuRequest,
) -> Result<(FatArch, &'a [u8])> {
    let entries = read_fat_table(header, container)?;
    let wanted = request.cpu();
    let not_supported = LoadError::ArchNotSupported { cpu_id: request.id };

    let exact = entries.iter().find(|e| e.cpu_id == wanted);
    let chosen = match exact {
        Some(entry) => *entry,
        None => *entries
            .iter()
            .filter(|e| e.cpu_id.family() == wanted.family())
            .find(|e| {
                sub_header(e, container)
                    .map(|h| request.features().contains(h.cpu_sub))
                    .unwrap_or(false)
            })
            .ok_or(not_supported.clone())?,
    };

    let image = sub_image(&chosen, container)?;
    let (inner, _) = ContainerHeader::parse(image)?;
    if inner.is_fat() {
        log::warn!("[PLAM] nested fat container rejected");
        return Err(not_supported);
    }
    log::debug!(
        "[PLAM] fat: selected {} at {:#x}+{:#x}",
        chosen.cpu_id.name(),
        chosen.offset,
        chosen.size
    );
    Ok((chosen, image))
}

fn sub_image<'a>(entry: &FatArch, container: &'a [u8]) -> Result<&'a [u8]> {
    if entry.align_log2 >= 64 || entry.offset & ((1u64 << entry.align_log2) - 1) != 0 {
        return Err(LoadError::Misaligned { what: "fat sub-image" });
    }
    entry.range().slice(container, "fat sub-image")
}

fn sub_header(entry: &FatArch, container: &[u8]) -> Option<ContainerHeader> {
    let image = entry.range().slice(container, "fat sub-image").ok()?;
    ContainerHeader::decode(image).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteWriter;
    use crate::format::{CpuFeatures, CpuId, FileType};
    use crate::header::HEADER_SIZE;

    fn image(cpu: CpuId, features: CpuFeatures) -> Vec<u8> {
        let mut header = ContainerHeader::new(FileType::App, cpu);
        header.cpu_sub = features;
        header.to_bytes()
    }

    /// Outer header, fat table at 0x200, images at 0x400-aligned slots.
    fn fat(images: &[(CpuId, Vec<u8>)]) -> Vec<u8> {
        let mut header = ContainerHeader::new(FileType::App, CpuId::None);
        header.dirs.fat_off = 0x200;
        header.dirs.fat_cnt = images.len() as u32;
        let mut out = header.to_bytes();
        out.resize(0x200, 0);
        let mut w = ByteWriter::new(&mut out);
        w.u32(PLAM_FAT_MAGIC);
        for (i, (cpu, img)) in images.iter().enumerate() {
            FatArch {
                cpu_id: *cpu,
                abi_ver: 1,
                align_log2: 10,
                offset: 0x400 * (i as u64 + 1),
                size: img.len() as u64,
            }
            .write(&mut w);
        }
        for (i, (_, img)) in images.iter().enumerate() {
            out.resize(0x400 * (i + 1), 0);
            out.extend_from_slice(img);
        }
        out
    }

    fn request(cpu: CpuId, features: CpuFeatures) -> CpuRequest {
        CpuRequest::new(cpu, features)
    }

    #[test]
    fn test_select_arm64_independent_of_order() {
        let x86 = image(CpuId::X86_64, CpuFeatures::empty());
        let arm = image(CpuId::Arm64, CpuFeatures::empty());
        for entries in [
            [(CpuId::X86_64, x86.clone()), (CpuId::Arm64, arm.clone())],
            [(CpuId::Arm64, arm.clone()), (CpuId::X86_64, x86.clone())],
        ] {
            let file = fat(&entries);
            let (header, _) = ContainerHeader::parse(&file).unwrap();
            let (entry, sub) =
                select(&header, &file, request(CpuId::Arm64, CpuFeatures::empty())).unwrap();
            assert_eq!(entry.cpu_id, CpuId::Arm64);
            assert_eq!(sub, &arm[..]);
        }
    }

    #[test]
    fn test_family_fallback_respects_features() {
        let variant = CpuId::Other(0xAA65);
        let neon = image(variant, CpuFeatures::ARM64_NEON);
        let file = fat(&[(variant, neon)]);
        let (header, _) = ContainerHeader::parse(&file).unwrap();

        assert_eq!(
            select(&header, &file, request(CpuId::Arm64, CpuFeatures::empty())).unwrap_err(),
            LoadError::ArchNotSupported { cpu_id: 0xAA64 }
        );
        let (entry, _) =
            select(&header, &file, request(CpuId::Arm64, CpuFeatures::ARM64_NEON)).unwrap();
        assert_eq!(entry.cpu_id, variant);
    }

    #[test]
    fn test_no_match() {
        let file = fat(&[(CpuId::X86_64, image(CpuId::X86_64, CpuFeatures::empty()))]);
        let (header, _) = ContainerHeader::parse(&file).unwrap();
        assert!(matches!(
            select(&header, &file, request(CpuId::Riscv64, CpuFeatures::empty())),
            Err(LoadError::ArchNotSupported { .. })
        ));
    }

    #[test]
    fn test_bad_table_magic() {
        let mut file = fat(&[(CpuId::X86_64, image(CpuId::X86_64, CpuFeatures::empty()))]);
        file[0x200] = 0;
        let (header, _) = ContainerHeader::parse(&file).unwrap();
        assert!(matches!(
            read_fat_table(&header, &file),
            Err(LoadError::MagicMismatch { .. })
        ));
        assert!(HEADER_SIZE < 0x200);
    }
}
