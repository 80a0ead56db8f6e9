//! Section Mapper
//!
//! Turns the section table into an in-memory image: every mapped section is
//! read (or zero-filled), decompressed, checked against its virtual size and
//! placed in ascending address order. Nothing is committed to an address space
//! here; relocation happens on the in-memory copy first.

use alloc::string::String;
use alloc::vec::Vec;

use crate::codec::Rva;
use crate::compress;
use crate::config::MAX_IMAGE_SPAN;
use crate::error::{LoadError, Result};
use crate::format::{CompressionAlgorithm, SectionFlags, SectionType};
use crate::header::ContainerHeader;
use crate::space::{MappingRequest, Protection};
use crate::tables::{Section, StringTable};

/// One section of the image, contents fully materialised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSection {
    /// Index in the section table.
    pub index: usize,
    pub name: String,
    /// Image-relative address.
    pub rva: u64,
    pub protection: Protection,
    pub data: Vec<u8>,
}

impl ImageSection {
    pub fn end(&self) -> u64 {
        self.rva + self.data.len() as u64
    }

    pub fn contains(&self, rva: u64) -> bool {
        rva >= self.rva && rva < self.end()
    }

    /// Request placing this section at `base + rva`.
    pub fn request(&self, base: u64) -> MappingRequest<'_> {
        MappingRequest {
            address: base.wrapping_add(self.rva),
            protection: self.protection,
            data: &self.data,
        }
    }
}

/// Mapped sections in ascending address order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    pub sections: Vec<ImageSection>,
}

impl Image {
    /// Lowest section address.
    pub fn min_rva(&self) -> u64 {
        self.sections.first().map(|s| s.rva).unwrap_or(0)
    }

    /// Bytes between the lowest start and the highest end.
    pub fn span(&self) -> u64 {
        self.sections
            .iter()
            .map(|s| s.end())
            .max()
            .map(|end| end - self.min_rva())
            .unwrap_or(0)
    }

    pub fn section_containing(&self, rva: u64) -> Option<&ImageSection> {
        self.sections.iter().find(|s| s.contains(rva))
    }

    /// Borrow `len` bytes at `rva`, which must lie inside one section.
    pub fn bytes_mut(&mut self, rva: u64, len: usize) -> Result<&mut [u8]> {
        let section = self
            .sections
            .iter_mut()
            .find(|s| s.contains(rva))
            .ok_or(LoadError::OutOfBounds { what: "relocation site" })?;
        let start = (rva - section.rva) as usize;
        section
            .data
            .get_mut(start..start + len)
            .ok_or(LoadError::OutOfBounds { what: "relocation site" })
    }

    pub fn bytes(&self, rva: u64, len: usize) -> Option<&[u8]> {
        let section = self.section_containing(rva)?;
        let start = (rva - section.rva) as usize;
        section.data.get(start..start.checked_add(len)?)
    }
}

/// Read a section's contents at their virtual size.
fn materialise(index: usize, section: &Section, container: &[u8]) -> Result<Vec<u8>> {
    let vsize = section.virtual_size();
    if vsize > MAX_IMAGE_SPAN {
        return Err(LoadError::SectionSizeMismatch { section: index });
    }
    if section.is_nobits() {
        return Ok(alloc::vec![0u8; vsize as usize]);
    }
    let raw = Rva::new(section.offset, section.size).slice(container, "section data")?;
    let mut data = match section.comp_alg {
        CompressionAlgorithm::None => {
            if section.size > vsize {
                return Err(LoadError::SectionSizeMismatch { section: index });
            }
            raw.to_vec()
        }
        alg => compress::decompress_bounded(alg, raw, vsize)?,
    };
    if section.comp_alg != CompressionAlgorithm::None && data.len() as u64 != vsize {
        return Err(LoadError::SectionSizeMismatch { section: index });
    }
    // Uncompressed sections with mem_size > size get a zeroed tail.
    data.resize(vsize as usize, 0);
    Ok(data)
}

/// Validate the section table and build the image.
///
/// Layout (permissions, overlap, total span) is checked on the table alone,
/// so no section contents are allocated for an image that cannot be mapped.
pub fn build_image(
    sections: &[Section],
    container: &[u8],
    strings: StringTable<'_>,
    allow_wx: bool,
) -> Result<Image> {
    check_file_ranges(sections, container)?;

    // (index, start, end) of every mapped section.
    let mut layout: Vec<(usize, u64, u64)> = Vec::new();
    for (index, section) in sections.iter().enumerate() {
        if !section.is_mapped() {
            continue;
        }
        let (start, end) = section
            .virtual_range()
            .ok_or(LoadError::OutOfBounds { what: "section address" })?;
        let wx = SectionFlags::WRITE | SectionFlags::EXEC;
        if section.flags.contains(wx) && !allow_wx {
            return Err(LoadError::InsecureSectionPermissions { section: index });
        }
        layout.push((index, start, end));
    }

    layout.sort_by_key(|&(_, start, _)| start);
    for pair in layout.windows(2) {
        if pair[0].2 > pair[1].1 {
            return Err(LoadError::OverlappingSections {
                first: pair[0].0,
                second: pair[1].0,
            });
        }
    }
    if let (Some(first), Some(last_end)) = (layout.first(), layout.iter().map(|l| l.2).max()) {
        if last_end - first.1 > MAX_IMAGE_SPAN {
            return Err(LoadError::OutOfBounds { what: "image span" });
        }
    }

    let mut mapped = Vec::with_capacity(layout.len());
    for &(index, start, _) in &layout {
        let section = &sections[index];
        mapped.push(ImageSection {
            index,
            name: String::from(strings.get(section.name_off).unwrap_or("")),
            rva: start,
            protection: Protection::from_section_flags(section.flags),
            data: materialise(index, section, container)?,
        });
    }

    let image = Image { sections: mapped };
    log::debug!(
        "[PLAM] mapper: {} sections, span {:#x}",
        image.sections.len(),
        image.span()
    );
    Ok(image)
}

/// File ranges must stay inside the container and may only overlap when one
/// of the pair is marked `ALIAS`.
fn check_file_ranges(sections: &[Section], container: &[u8]) -> Result<()> {
    let stored = |s: &Section| s.section_type != SectionType::Null && !s.is_nobits() && s.size > 0;
    for (i, a) in sections.iter().enumerate() {
        if !stored(a) {
            continue;
        }
        let a_end = Rva::new(a.offset, a.size)
            .end()
            .filter(|&end| end <= container.len() as u64)
            .ok_or(LoadError::OutOfBounds { what: "section data" })?;
        for (j, b) in sections.iter().enumerate().skip(i + 1) {
            if !stored(b) || a.flags.contains(SectionFlags::ALIAS) || b.flags.contains(SectionFlags::ALIAS) {
                continue;
            }
            let b_end = b.offset.saturating_add(b.size);
            if a.offset < b_end && b.offset < a_end {
                return Err(LoadError::OverlappingSections { first: i, second: j });
            }
        }
    }
    Ok(())
}

/// `entry_off` must fall inside an executable mapped section. Types whose
/// entry point is optional may leave it at zero.
pub fn validate_entry(header: &ContainerHeader, image: &Image) -> Result<Option<u64>> {
    let entry = header.entry_off;
    if entry == 0 && header.file_type.entry_optional() {
        return Ok(None);
    }
    match image.section_containing(entry) {
        Some(section) if section.protection.contains(Protection::EXEC) => Ok(Some(entry)),
        _ => Err(LoadError::InvalidEntryPoint(entry)),
    }
}
