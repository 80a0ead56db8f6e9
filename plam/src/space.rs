//! Address-space collaborator
//!
//! The loader never touches page tables itself. It asks an [`AddressSpace`]
//! for a base address and hands it one [`MappingRequest`] per section.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::{LoadError, Result};
use crate::format::SectionFlags;

bitflags! {
    /// Page protection of a mapped section.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Protection {
    pub fn from_section_flags(flags: SectionFlags) -> Self {
        let mut prot = Protection::empty();
        if flags.contains(SectionFlags::READ) {
            prot |= Protection::READ;
        }
        if flags.contains(SectionFlags::WRITE) {
            prot |= Protection::WRITE;
        }
        if flags.contains(SectionFlags::EXEC) {
            prot |= Protection::EXEC;
        }
        prot
    }
}

/// Place `data` at `address` with `protection`.
#[derive(Debug, Clone, Copy)]
pub struct MappingRequest<'a> {
    pub address: u64,
    pub protection: Protection,
    /// Fully prepared contents; zero-fill is already materialised.
    pub data: &'a [u8],
}

impl MappingRequest<'_> {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Map/unmap primitive supplied by the storage or boot collaborator.
pub trait AddressSpace {
    /// Reserve `size` bytes aligned to `align`, near `preferred` if possible.
    fn reserve(&mut self, preferred: Option<u64>, size: u64, align: u64) -> Result<u64>;

    /// Give back a range obtained from [`AddressSpace::reserve`].
    fn release(&mut self, base: u64, size: u64);

    fn map(&mut self, request: &MappingRequest<'_>) -> Result<()>;

    fn unmap(&mut self, address: u64, size: u64);
}

/// A range handed out by [`AddressSpace::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub base: u64,
    pub size: u64,
}

/// A region placed by [`InMemoryAddressSpace`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub protection: Protection,
    pub bytes: Vec<u8>,
}

/// Heap-backed address space for hosted tools and tests.
#[derive(Debug)]
pub struct InMemoryAddressSpace {
    regions: BTreeMap<u64, Region>,
    /// Outstanding reservations, base to size.
    reservations: BTreeMap<u64, u64>,
    next_reservation: u64,
}

impl InMemoryAddressSpace {
    /// First address handed out by `reserve`.
    pub const RESERVATION_BASE: u64 = 0x0000_4000_0000;

    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            reservations: BTreeMap::new(),
            next_reservation: Self::RESERVATION_BASE,
        }
    }

    pub fn regions(&self) -> impl Iterator<Item = (u64, &Region)> {
        self.regions.iter().map(|(addr, region)| (*addr, region))
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Read `len` bytes at `address` from a single region.
    pub fn read(&self, address: u64, len: usize) -> Option<&[u8]> {
        let (start, region) = self.regions.range(..=address).next_back()?;
        let offset = (address - start) as usize;
        region.bytes.get(offset..offset.checked_add(len)?)
    }

    pub fn protection_at(&self, address: u64) -> Option<Protection> {
        let (start, region) = self.regions.range(..=address).next_back()?;
        if address - start < region.bytes.len() as u64 {
            Some(region.protection)
        } else {
            None
        }
    }

    fn reserved(&self, address: u64, end: u64) -> bool {
        if let Some((start, size)) = self.reservations.range(..end).next_back() {
            return start.saturating_add(*size) > address;
        }
        false
    }

    fn overlaps(&self, address: u64, end: u64) -> bool {
        if let Some((start, region)) = self.regions.range(..end).next_back() {
            return start + region.bytes.len() as u64 > address;
        }
        false
    }
}

impl Default for InMemoryAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for InMemoryAddressSpace {
    fn reserve(&mut self, preferred: Option<u64>, size: u64, align: u64) -> Result<u64> {
        let align = align.max(1);
        if let Some(addr) = preferred {
            let end = addr.saturating_add(size);
            if addr % align == 0 && !self.overlaps(addr, end) && !self.reserved(addr, end) {
                self.reservations.insert(addr, size);
                return Ok(addr);
            }
        }
        let base = self
            .next_reservation
            .checked_add(align - 1)
            .map(|v| v & !(align - 1))
            .ok_or(LoadError::MapFailed {
                address: self.next_reservation,
            })?;
        let end = base
            .checked_add(size.max(1))
            .ok_or(LoadError::MapFailed { address: base })?;
        self.next_reservation = end;
        self.reservations.insert(base, size);
        Ok(base)
    }

    fn release(&mut self, base: u64, size: u64) {
        if self.reservations.remove(&base).is_none() {
            log::warn!("[PLAM] release of unknown reservation {:#x}+{:#x}", base, size);
        }
    }

    fn map(&mut self, request: &MappingRequest<'_>) -> Result<()> {
        let end = request
            .address
            .checked_add(request.size())
            .ok_or(LoadError::MapFailed {
                address: request.address,
            })?;
        if request.data.is_empty() {
            return Ok(());
        }
        if self.overlaps(request.address, end) {
            return Err(LoadError::MapFailed {
                address: request.address,
            });
        }
        self.regions.insert(
            request.address,
            Region {
                protection: request.protection,
                bytes: request.data.to_vec(),
            },
        );
        Ok(())
    }

    fn unmap(&mut self, address: u64, _size: u64) {
        self.regions.remove(&address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_read_unmap() {
        let mut space = InMemoryAddressSpace::new();
        let data = [0x90u8; 16];
        let request = MappingRequest {
            address: 0x1000,
            protection: Protection::READ | Protection::EXEC,
            data: &data,
        };
        space.map(&request).unwrap();
        assert_eq!(space.read(0x1004, 4), Some(&[0x90u8; 4][..]));
        assert_eq!(space.read(0x100E, 4), None);
        assert_eq!(space.map(&request), Err(LoadError::MapFailed { address: 0x1000 }));
        space.unmap(0x1000, 16);
        assert_eq!(space.region_count(), 0);
    }

    #[test]
    fn test_reserve_aligns_and_advances() {
        let mut space = InMemoryAddressSpace::new();
        let a = space.reserve(None, 0x1800, 0x1000).unwrap();
        let b = space.reserve(None, 0x10, 0x1000).unwrap();
        assert_eq!(a % 0x1000, 0);
        assert!(b >= a + 0x1800);
        assert_eq!(b % 0x1000, 0);
        assert_eq!(space.reservation_count(), 2);

        space.release(a, 0x1800);
        space.release(b, 0x10);
        assert_eq!(space.reservation_count(), 0);
    }

    #[test]
    fn test_preferred_base_skips_live_reservation() {
        let mut space = InMemoryAddressSpace::new();
        let a = space.reserve(Some(0x10_0000), 0x2000, 0x1000).unwrap();
        assert_eq!(a, 0x10_0000);
        let b = space.reserve(Some(0x10_1000), 0x1000, 0x1000).unwrap();
        assert_ne!(b, 0x10_1000);
        space.release(a, 0x2000);
        assert_eq!(space.reserve(Some(0x10_1000), 0x1000, 0x1000).unwrap(), 0x10_1000);
    }

    #[test]
    fn test_protection_from_flags() {
        let prot = Protection::from_section_flags(SectionFlags::READ | SectionFlags::NOBITS);
        assert_eq!(prot, Protection::READ);
    }
}
