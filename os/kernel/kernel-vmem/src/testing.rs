//! Simulated physical memory for host-side tests.
//!
//! Physical addresses are byte offsets into a vector of 4 KiB-aligned
//! frames. [`TestPhys`] maps them the way the HHDM does on hardware, and
//! [`TestMachine`] pairs it with a frame allocator covering the same range.

use crate::{AddressSpace, FrameBytes, PhysMapper};
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use kernel_alloc::BitmapFrameAlloc;
use kernel_info::boot::{BootMemoryMap, MemoryRegion};
use kernel_memory_addresses::{FrameNumber, PageSize, PhysicalAddress, Size4K};
use kernel_sync::SpinLock;

/// A 4 KiB-aligned raw frame.
#[repr(C, align(4096))]
struct Aligned4K(FrameBytes);

/// A tiny in-memory "RAM".
pub struct TestPhys {
    frames: Vec<UnsafeCell<Aligned4K>>,
}

// SAFETY: the frames are only ever accessed through `PhysMapper`, whose
// callers uphold the same aliasing rules as for real physical memory.
unsafe impl Sync for TestPhys {}

impl TestPhys {
    #[must_use]
    pub fn with_frames(n: usize) -> Self {
        let mut frames = Vec::with_capacity(n);
        frames.resize_with(n, || UnsafeCell::new(Aligned4K([0; Size4K::SIZE as usize])));
        Self { frames }
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Copy of the bytes in `frame`.
    #[must_use]
    pub fn read(&self, frame: FrameNumber) -> FrameBytes {
        // SAFETY: shared read of test memory.
        unsafe { (*self.frames[frame.as_usize()].get()).0 }
    }

    pub fn fill(&self, frame: FrameNumber, byte: u8) {
        // SAFETY: tests never hold another reference across this call.
        unsafe { (*self.frames[frame.as_usize()].get()).0.fill(byte) }
    }

    pub fn write(&self, pa: PhysicalAddress, bytes: &[u8]) {
        let offset = usize::try_from(pa.offset::<Size4K>()).unwrap_or_default();
        // SAFETY: see `fill`.
        unsafe {
            (&mut (*self.frames[pa.frame().as_usize()].get()).0)[offset..offset + bytes.len()]
                .copy_from_slice(bytes);
        }
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let frame = &self.frames[pa.frame().as_usize()];
        #[allow(clippy::cast_possible_truncation)]
        let offset = pa.offset::<Size4K>() as usize;
        debug_assert!(offset + size_of::<T>() <= Size4K::SIZE as usize);

        // SAFETY: The caller promises `T` matches the bytes in the frame.
        unsafe { &mut *frame.get().cast::<u8>().add(offset).cast::<T>() }
    }
}

/// Simulated RAM plus the allocator handing out its frames.
///
/// Frame 0 is reserved, as it is on real firmware.
pub struct TestMachine {
    pub phys: TestPhys,
    pub frames: SpinLock<BitmapFrameAlloc>,
}

impl TestMachine {
    #[must_use]
    pub fn new(frame_count: usize) -> Self {
        let bytes = frame_count as u64 * Size4K::SIZE;
        let regions = [
            MemoryRegion::usable(0, bytes),
            MemoryRegion::reserved(0, Size4K::SIZE),
        ];
        Self {
            phys: TestPhys::with_frames(frame_count),
            frames: SpinLock::new(BitmapFrameAlloc::from_memory_map(&BootMemoryMap::new(
                &regions,
            ))),
        }
    }

    #[must_use]
    pub fn free_frames(&self) -> u64 {
        self.frames.lock().free_frames()
    }

    /// A kernel reference space with every kernel PML4 slot populated.
    ///
    /// # Panics
    /// If the machine is too small to hold 257 tables.
    #[must_use]
    pub fn kernel_space(&self) -> AddressSpace<'_, TestPhys> {
        let mut alloc = &self.frames;
        let mut space = AddressSpace::new_kernel(&self.phys, &mut alloc).expect("kernel root");
        space
            .preallocate_kernel_half(&mut alloc)
            .expect("kernel half");
        space
    }
}
