//! # Boot Memory Map
//!
//! The physical memory description handed over by the boot loader, as
//! consumed by the frame allocator.

use kernel_memory_addresses::PhysicalAddress;

/// What a physical range may be used for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Conventional RAM, free for the frame allocator.
    Usable,
    /// Firmware, loader, ACPI or MMIO ranges. Never handed out.
    Reserved,
}

/// One contiguous range of physical memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    pub len: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn usable(start: u64, len: u64) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            len,
            kind: MemoryRegionKind::Usable,
        }
    }

    #[must_use]
    pub const fn reserved(start: u64, len: u64) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            len,
            kind: MemoryRegionKind::Reserved,
        }
    }

    /// Exclusive end address.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u64() + self.len)
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }
}

/// Borrowed view of the boot loader's memory map.
///
/// Regions may come in any order and usable regions may overlap reserved
/// ones; reserved wins.
#[derive(Copy, Clone, Debug)]
pub struct BootMemoryMap<'a> {
    regions: &'a [MemoryRegion],
}

impl<'a> BootMemoryMap<'a> {
    #[must_use]
    pub const fn new(regions: &'a [MemoryRegion]) -> Self {
        Self { regions }
    }

    pub fn regions(&self) -> impl Iterator<Item = &'a MemoryRegion> + 'a {
        self.regions.iter()
    }

    pub fn usable(&self) -> impl Iterator<Item = &'a MemoryRegion> + 'a {
        self.regions.iter().filter(|r| r.is_usable())
    }

    pub fn reserved(&self) -> impl Iterator<Item = &'a MemoryRegion> + 'a {
        self.regions.iter().filter(|r| !r.is_usable())
    }

    /// Exclusive end of the highest usable region, or zero.
    #[must_use]
    pub fn usable_end(&self) -> PhysicalAddress {
        self.usable()
            .map(MemoryRegion::end)
            .max()
            .unwrap_or_default()
    }

    /// Total bytes of usable memory, not counting overlaps with reserved ranges.
    #[must_use]
    pub fn usable_bytes(&self) -> u64 {
        self.usable().map(|r| r.len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_end_ignores_reserved_ranges() {
        let regions = [
            MemoryRegion::reserved(0, 0x1000),
            MemoryRegion::usable(0x1000, 0x9_f000),
            MemoryRegion::usable(0x10_0000, 0x70_0000),
            MemoryRegion::reserved(0xfee0_0000, 0x1000),
        ];
        let map = BootMemoryMap::new(&regions);
        assert_eq!(map.usable_end(), PhysicalAddress::new(0x80_0000));
        assert_eq!(map.usable_bytes(), 0x9_f000 + 0x70_0000);
        assert_eq!(map.reserved().count(), 2);
    }

    #[test]
    fn empty_map() {
        let map = BootMemoryMap::new(&[]);
        assert_eq!(map.usable_end(), PhysicalAddress::zero());
    }
}
