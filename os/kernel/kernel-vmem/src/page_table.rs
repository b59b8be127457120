//! # Paging Structures
//!
//! One node type serves all four levels: each is a 4 KiB-aligned array of
//! 512 [`PageEntryBits`]. The [`TableLevel`] of a node is implied by how deep
//! the walk is, not by its type.
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```

use crate::PageEntryBits;
use kernel_info::memory::{KERNEL_PML4_START, PAGE_TABLE_ENTRIES};
use kernel_memory_addresses::VirtualAddress;

/// Depth of a node in the four-level hierarchy.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TableLevel {
    /// Page Map Level 4, the root referenced by CR3.
    Pml4,
    /// Page Directory Pointer Table.
    Pdpt,
    /// Page Directory.
    Pd,
    /// Page Table; its entries are 4 KiB leaves.
    Pt,
}

impl TableLevel {
    /// Levels from the root down.
    pub const WALK: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    /// Position of this level's index field within a virtual address.
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// The level below, or `None` for the leaf level.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> TableIndex {
        #[allow(clippy::cast_possible_truncation)]
        TableIndex::new(((va.as_u64() >> self.shift()) & 0x1FF) as u16)
    }

    /// Bytes of virtual address space covered by one entry at this level.
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }
}

/// Index into a paging structure (`0..512`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// Construct from a raw `u16`. Asserts `v < 512` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 512);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Whether this PML4 slot belongs to the shared kernel half.
    #[inline]
    #[must_use]
    pub const fn is_kernel_slot(self) -> bool {
        self.as_usize() >= KERNEL_PML4_START
    }
}

/// Builds the sign-extended virtual address addressed by a walk prefix.
#[must_use]
pub const fn compose_address(l4: usize, l3: usize, l2: usize, l1: usize) -> VirtualAddress {
    let raw = ((l4 as u64) << 39) | ((l3 as u64) << 30) | ((l2 as u64) << 21) | ((l1 as u64) << 12);
    let canonical = if raw & (1 << 47) != 0 {
        raw | 0xffff_0000_0000_0000
    } else {
        raw
    };
    VirtualAddress::new(canonical)
}

/// A paging structure at any level: 512 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PageEntryBits {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PageEntryBits) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    pub const fn entry_mut(&mut self, i: TableIndex) -> &mut PageEntryBits {
        &mut self.entries[i.as_usize()]
    }

    /// Set all entries to zero (non-present).
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntryBits::new());
    }

    /// Present entries with their indices, in ascending order.
    pub fn present(&self) -> impl Iterator<Item = (usize, PageEntryBits)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, e)| e.present())
    }
}

const _: () = {
    assert!(size_of::<PageTable>() == 4096);
    assert!(align_of::<PageTable>() == 4096);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_extracted_per_level() {
        let va = VirtualAddress::new(0xffff_8000_4020_3000);
        assert_eq!(TableLevel::Pml4.index_of(va), TableIndex::new(256));
        assert_eq!(TableLevel::Pdpt.index_of(va), TableIndex::new(1));
        assert_eq!(TableLevel::Pd.index_of(va), TableIndex::new(1));
        assert_eq!(TableLevel::Pt.index_of(va), TableIndex::new(3));
        assert!(TableLevel::Pml4.index_of(va).is_kernel_slot());
    }

    #[test]
    fn compose_is_inverse_of_index_extraction() {
        let va = compose_address(256, 1, 1, 3);
        assert_eq!(va, VirtualAddress::new(0xffff_8000_4020_3000));
        assert_eq!(compose_address(0, 0, 0, 1), VirtualAddress::new(0x1000));
    }

    #[test]
    fn level_chain_ends_at_pt() {
        let depth = core::iter::successors(Some(TableLevel::Pml4), |l| l.next()).count();
        assert_eq!(depth, 4);
        assert_eq!(TableLevel::Pd.entry_span(), 2 * 1024 * 1024);
    }

    #[test]
    fn present_skips_empty_slots() {
        let mut table = PageTable {
            entries: [PageEntryBits::new(); PAGE_TABLE_ENTRIES],
        };
        table.set(TableIndex::new(7), PageEntryBits::kernel_rw());
        table.set(TableIndex::new(300), PageEntryBits::user_ro());
        let slots: Vec<usize> = table.present().map(|(i, _)| i).collect();
        assert_eq!(slots, [7, 300]);

        table.zero();
        assert_eq!(table.present().count(), 0);
    }
}
