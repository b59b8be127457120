use crate::{PageSize, PhysicalAddress, VirtualAddress};
use core::fmt;
use core::marker::PhantomData;

/// Physical page base for size `S`.
///
/// The low `S::SHIFT` bits of the base are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: PhysicalAddress,
    _size: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// The page containing `addr`, rounding down.
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self {
            base: PhysicalAddress::new(addr.as_u64() & !S::MASK),
            _size: PhantomData,
        }
    }

    /// Wraps an already aligned base.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: PhysicalAddress) -> Self {
        debug_assert!(addr.as_u64() & S::MASK == 0, "unaligned physical page base");
        Self::containing(addr)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> PhysicalAddress {
        debug_assert!(offset < S::SIZE);
        PhysicalAddress::new(self.base.as_u64() | (offset & S::MASK))
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>({:#018X})", S::as_str(), self.base.as_u64())
    }
}

impl<S: PageSize> From<PhysicalPage<S>> for PhysicalAddress {
    #[inline]
    fn from(value: PhysicalPage<S>) -> Self {
        value.base()
    }
}

/// Virtual page base for size `S`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize> {
    base: VirtualAddress,
    _size: PhantomData<S>,
}

impl<S: PageSize> VirtualPage<S> {
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self {
            base: VirtualAddress::new(addr.as_u64() & !S::MASK),
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn from_addr(addr: VirtualAddress) -> Self {
        debug_assert!(addr.as_u64() & S::MASK == 0, "unaligned virtual page base");
        Self::containing(addr)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> VirtualAddress {
        debug_assert!(offset < S::SIZE);
        VirtualAddress::new(self.base.as_u64() | (offset & S::MASK))
    }

    /// The page directly following this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self {
            base: VirtualAddress::new(self.base.as_u64() + S::SIZE),
            _size: PhantomData,
        }
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>({:#018X})", S::as_str(), self.base.as_u64())
    }
}

impl<S: PageSize> From<VirtualPage<S>> for VirtualAddress {
    #[inline]
    fn from(value: VirtualPage<S>) -> Self {
        value.base()
    }
}
