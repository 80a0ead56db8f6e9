//! Relocation Processing
//!
//! Patches the in-memory image once every symbol has an absolute value.
//!
//! - `ABS64`: `S + A`
//! - `PC32`: `S + A - P`, must fit a signed 32-bit field
//! - `RELATIVE`: `B + A`
//!
//! Every relocation's symbol index must name an entry of the symbol table.
//! A container without a symbol table may only carry symbol-less types, whose
//! index is then ignored.

use alloc::vec::Vec;

use crate::codec::decode_table;
use crate::error::{LoadError, Result};
use crate::format::RelocType;
use crate::header::ContainerHeader;
use crate::mapper::Image;
use crate::tables::Relocation;

/// Decode the relocation table.
pub fn decode_relocations(header: &ContainerHeader, container: &[u8]) -> Result<Vec<Relocation>> {
    decode_table(container, header.reloc_table_off, header.reloc_count)
}

fn symbol_value(values: &[u64], idx: u32) -> Result<u64> {
    values
        .get(idx as usize)
        .copied()
        .ok_or(LoadError::InvalidSymbolIndex(idx))
}

/// Apply one relocation to an image placed at `base`.
pub fn apply_relocation(
    image: &mut Image,
    base: u64,
    reloc: &Relocation,
    values: &[u64],
) -> Result<()> {
    // Types that take no symbol still carry an index; with a symbol table
    // present it must name an entry.
    if !values.is_empty() {
        symbol_value(values, reloc.sym_idx)?;
    }
    match reloc.reloc_type {
        RelocType::None => Ok(()),
        RelocType::Abs64 => {
            let s = symbol_value(values, reloc.sym_idx)?;
            let value = s.wrapping_add_signed(reloc.addend);
            image
                .bytes_mut(reloc.offset, 8)?
                .copy_from_slice(&value.to_le_bytes());
            Ok(())
        }
        RelocType::Pc32 => {
            let s = symbol_value(values, reloc.sym_idx)?;
            let place = base.wrapping_add(reloc.offset);
            let delta = s as i128 + reloc.addend as i128 - place as i128;
            let value = i32::try_from(delta).map_err(|_| LoadError::RelocationOverflow {
                offset: reloc.offset,
            })?;
            image
                .bytes_mut(reloc.offset, 4)?
                .copy_from_slice(&value.to_le_bytes());
            Ok(())
        }
        RelocType::Relative => {
            let value = base.wrapping_add_signed(reloc.addend);
            image
                .bytes_mut(reloc.offset, 8)?
                .copy_from_slice(&value.to_le_bytes());
            Ok(())
        }
        RelocType::Other(ty) => Err(LoadError::UnsupportedRelocation(ty)),
    }
}

/// Apply every relocation; returns how many patched the image.
pub fn apply_relocations(
    image: &mut Image,
    base: u64,
    relocs: &[Relocation],
    values: &[u64],
) -> Result<usize> {
    let mut applied = 0;
    for reloc in relocs {
        apply_relocation(image, base, reloc, values)?;
        if reloc.reloc_type != RelocType::None {
            applied += 1;
        }
    }
    log::debug!("[PLAM] reloc: applied {} of {}", applied, relocs.len());
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::ImageSection;
    use crate::space::Protection;
    use alloc::string::String;

    fn image() -> Image {
        Image {
            sections: alloc::vec![ImageSection {
                index: 0,
                name: String::from(".text"),
                rva: 0x1000,
                protection: Protection::READ | Protection::EXEC,
                data: alloc::vec![0u8; 32],
            }],
        }
    }

    fn reloc(offset: u64, reloc_type: RelocType, sym_idx: u32, addend: i64) -> Relocation {
        Relocation {
            offset,
            reloc_type,
            sym_idx,
            addend,
        }
    }

    #[test]
    fn test_abs64() {
        let mut img = image();
        apply_relocation(&mut img, 0, &reloc(0x1008, RelocType::Abs64, 0, 4), &[0xDEAD_0000]).unwrap();
        assert_eq!(img.bytes(0x1008, 8).unwrap(), &0xDEAD_0004u64.to_le_bytes());
    }

    #[test]
    fn test_pc32_in_range() {
        let mut img = image();
        let base = 0x40_0000;
        let target = base + 0x1100;
        apply_relocation(&mut img, base, &reloc(0x1004, RelocType::Pc32, 0, -4), &[target]).unwrap();
        let expected = (0x1100i64 - 4 - 0x1004) as i32;
        assert_eq!(img.bytes(0x1004, 4).unwrap(), &expected.to_le_bytes());
    }

    #[test]
    fn test_pc32_overflow_never_truncates() {
        let mut img = image();
        let far = 0x1_0000_0000u64 + 0x2000;
        assert_eq!(
            apply_relocation(&mut img, 0, &reloc(0x1000, RelocType::Pc32, 0, 0), &[far]),
            Err(LoadError::RelocationOverflow { offset: 0x1000 })
        );
        assert_eq!(img.bytes(0x1000, 4).unwrap(), &[0u8; 4]);
    }

    #[test]
    fn test_relative_and_bad_index() {
        let mut img = image();
        apply_relocation(&mut img, 0x8000, &reloc(0x1010, RelocType::Relative, 0, 0x20), &[]).unwrap();
        assert_eq!(img.bytes(0x1010, 8).unwrap(), &0x8020u64.to_le_bytes());
        assert_eq!(
            apply_relocation(&mut img, 0, &reloc(0x1000, RelocType::Abs64, 3, 0), &[1]),
            Err(LoadError::InvalidSymbolIndex(3))
        );
    }

    #[test]
    fn test_symbolless_types_still_check_index() {
        let mut img = image();
        assert_eq!(
            apply_relocation(&mut img, 0x8000, &reloc(0x1010, RelocType::Relative, 5, 0), &[1]),
            Err(LoadError::InvalidSymbolIndex(5))
        );
        assert_eq!(
            apply_relocation(&mut img, 0, &reloc(0x1000, RelocType::None, 9, 0), &[1, 2]),
            Err(LoadError::InvalidSymbolIndex(9))
        );
        assert_eq!(img.bytes(0x1010, 8).unwrap(), &[0u8; 8]);
        apply_relocation(&mut img, 0, &reloc(0x1000, RelocType::None, 9, 0), &[]).unwrap();
    }

    #[test]
    fn test_site_outside_sections() {
        let mut img = image();
        assert_eq!(
            apply_relocation(&mut img, 0, &reloc(0x101C, RelocType::Abs64, 0, 0), &[1]),
            Err(LoadError::OutOfBounds { what: "relocation site" })
        );
        assert_eq!(
            apply_relocation(&mut img, 0, &reloc(0x1000, RelocType::Other(42), 0, 0), &[1]),
            Err(LoadError::UnsupportedRelocation(42))
        );
    }
}
