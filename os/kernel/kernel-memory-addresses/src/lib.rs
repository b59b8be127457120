//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses, page bases and frame
//! numbers used by the frame allocator and the page-table code.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`VirtualAddress`] | A byte address translated by the page tables. |
//! | [`PhysicalPage<S>`] / [`VirtualPage<S>`] | A page-aligned base of a page of size `S`. |
//! | [`FrameNumber`] | The index of a 4 KiB physical frame (`pa >> 12`). |
//!
//! The [`PageSize`] markers [`Size4K`], [`Size2M`] and [`Size1G`] carry the
//! page size at the type level, so a 2 MiB base can never be confused with a
//! 4 KiB base.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0000_7fff_dead_b123);
//! let page = va.page::<Size4K>();
//! assert_eq!(page.base().as_u64(), 0x0000_7fff_dead_b000);
//! assert_eq!(va.offset::<Size4K>(), 0x123);
//!
//! let frame = FrameNumber::containing(PhysicalAddress::new(0x5042));
//! assert_eq!(frame.as_u64(), 5);
//! assert_eq!(frame.base(), PhysicalAddress::new(0x5000));
//! ```
//!
//! All types are `#[repr(transparent)]`, `Copy`, `Ord` and `Hash`, and all
//! arithmetic helpers are `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod frame_number;
mod page;
mod page_size;
mod physical_address;
mod virtual_address;

pub use frame_number::FrameNumber;
pub use page::{PhysicalPage, VirtualPage};
pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Rounds `value` down to a multiple of `align` (a power of two).
#[inline(always)]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Rounds `value` up to a multiple of `align` (a power of two).
#[inline(always)]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(align_down(0x1fff, Size4K::SIZE), 0x1000);
        assert_eq!(align_up(0x1001, Size4K::SIZE), 0x2000);
        assert_eq!(align_up(0x2000, Size4K::SIZE), 0x2000);
        assert_eq!(align_down(0x3f_ffff, Size2M::SIZE), 0x20_0000);
    }

    #[test]
    fn page_split_and_join() {
        let va = VirtualAddress::new(0xffff_8000_0012_3456);
        let page = va.page::<Size4K>();
        assert_eq!(page.base().as_u64(), 0xffff_8000_0012_3000);
        assert_eq!(page.join(va.offset::<Size4K>()), va);

        let pa = PhysicalAddress::new(0x0000_0010_2034_5678);
        let huge = pa.page::<Size2M>();
        assert_eq!(huge.base().as_u64(), 0x0000_0010_2020_0000);
        assert_eq!(huge.join(pa.offset::<Size2M>()), pa);
    }

    #[test]
    fn frame_number_roundtrips_through_page() {
        let page = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x7000));
        let frame = FrameNumber::from(page);
        assert_eq!(frame, FrameNumber::new(7));
        assert_eq!(frame.page(), page);
        assert_eq!(frame + 3, FrameNumber::new(10));
    }

    #[test]
    fn debug_formatting() {
        assert_eq!(
            format!("{:?}", PhysicalAddress::new(0x1000)),
            "PA(0x0000000000001000)"
        );
        assert_eq!(
            format!("{:?}", VirtualAddress::new(0x2000)),
            "VA(0x0000000000002000)"
        );
        assert_eq!(format!("{:?}", FrameNumber::new(0x42)), "Frame(0x42)");
    }
}
