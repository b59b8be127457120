#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// CR3: Page-Map Level-4 Base Register (IA-32e, PCID disabled).
///
/// Holds the physical base address of the PML4 table and cache-control flags
/// for PML4 walks. Writing it switches the active address space and flushes
/// every non-global TLB entry of the executing processor.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2: Reserved (must be 0).
    #[bits(3)]
    __: u8,

    /// Bit 3 (PWT): Page-level Write-Through for PML4.
    pub pwt: bool,

    /// Bit 4 (PCD): Page-level Cache Disable for PML4.
    pub pcd: bool,

    /// Bits 5–11: Reserved (must be 0 when written).
    #[bits(7)]
    __: u8,

    /// Bits 12–51: PML4 physical base >> 12.
    #[bits(40)]
    pml4_base_4k: u64,

    /// Bits 52–63: Reserved.
    #[bits(12)]
    __: u16,
}

impl Cr3 {
    /// Create a write-back `Cr3` value for the given PML4 frame.
    #[must_use]
    pub const fn from_pml4(pml4: PhysicalPage<Size4K>) -> Self {
        Self::new().with_pml4_base_4k(pml4.base().as_u64() >> 12)
    }

    /// Return the physical page holding the PML4.
    #[must_use]
    pub const fn pml4(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.pml4_base_4k() << 12))
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
