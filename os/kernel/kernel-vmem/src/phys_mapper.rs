//! # Physical Memory Access
//!
//! Page tables live in physical frames, but code can only dereference
//! virtual addresses. A [`PhysMapper`] bridges the two: the kernel uses the
//! higher-half direct map ([`HhdmPhysMapper`]), host tests use simulated RAM
//! (`testing::TestPhys`).

use crate::PageTable;
use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{FrameNumber, PageSize, PhysicalAddress, Size4K};

/// Raw contents of one 4 KiB frame.
pub type FrameBytes = [u8; Size4K::SIZE as usize];

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space.
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be mapped writable through this mapper for `'a`.
    /// - `T` must match the bytes at `pa`, and no other live reference may
    ///   alias them.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Borrow the paging structure stored in `frame`.
    ///
    /// # Safety
    /// `frame` must hold a page table owned by (or shared into) the caller's
    /// address space. See [`phys_to_mut`](Self::phys_to_mut).
    #[inline]
    unsafe fn table_mut<'a>(&self, frame: FrameNumber) -> &'a mut PageTable {
        unsafe { self.phys_to_mut(frame.base()) }
    }

    /// Borrow the bytes of `frame`.
    ///
    /// # Safety
    /// See [`phys_to_mut`](Self::phys_to_mut).
    #[inline]
    unsafe fn frame_mut<'a>(&self, frame: FrameNumber) -> &'a mut FrameBytes {
        unsafe { self.phys_to_mut(frame.base()) }
    }
}

/// [`PhysMapper`] for kernels with a higher-half direct map: physical
/// address `pa` is visible at `HHDM_BASE + pa`.
///
/// The HHDM must cover every frame handed out by the frame allocator.
#[derive(Copy, Clone, Debug, Default)]
pub struct HhdmPhysMapper;

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = (HHDM_BASE + pa.as_u64()) as *mut T;
        // SAFETY: Caller must ensure the physical address is valid and mapped via HHDM.
        unsafe { &mut *va }
    }
}
