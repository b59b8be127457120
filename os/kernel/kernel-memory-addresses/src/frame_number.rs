use crate::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use core::fmt;
use core::ops::Add;

/// Index of a 4 KiB physical frame.
///
/// This is the unit the frame allocator hands out: frame `n` covers
/// physical bytes `n * 4096 .. (n + 1) * 4096`.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameNumber(u64);

impl FrameNumber {
    #[inline]
    #[must_use]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        addr.frame()
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Physical address of the first byte of the frame.
    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << Size4K::SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(self.base())
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:#x})", self.0)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<PhysicalPage<Size4K>> for FrameNumber {
    #[inline]
    fn from(page: PhysicalPage<Size4K>) -> Self {
        page.base().frame()
    }
}

impl Add<u64> for FrameNumber {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}
