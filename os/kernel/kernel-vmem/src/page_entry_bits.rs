use bitfield_struct::bitfield;
use kernel_memory_addresses::{FrameNumber, PhysicalAddress};

/// A single 64-bit x86-64 paging-structure entry in its raw bitfield form.
///
/// Models the **common superset** of fields found in all four paging levels
/// (PML4E, PDPTE, PDE, PTE), plus the two software bits this kernel keeps in
/// the OS-available range of leaf entries.
///
/// ### Bit layout
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PS`              | Large page flag |
/// | 8         | `G`               | Global (leaf only) |
/// | 9         | `COW`             | Copy-on-write pending (software) |
/// | 10        | `BRW`             | Frame is borrowed, not owned (software) |
/// | 11        | –                 | Available |
/// | 12–51     | `addr`            | Physical frame bits [51:12] |
/// | 52–62     | –                 | Available / protection key |
/// | 63        | `NX`              | Execute disable |
///
/// ```rust
/// # use kernel_memory_addresses::FrameNumber;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::user_rw().with_frame(FrameNumber::new(0x12));
/// assert!(e.present() && e.writable() && e.user_access());
/// assert_eq!(e.frame(), FrameNumber::new(0x12));
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Permissions are the intersection over the walk; intermediate entries
    /// are always writable so the leaf decides.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    ///
    /// Must be set on **every** level of the walk for ring 3 to reach the leaf.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6) (**leaf only**). Set by the CPU on first write.
    pub dirty: bool,

    /// Large Page / Page Size (PS, bit 7).
    ///
    /// Only 4 KiB leaves are created here; a set `PS` bit is only ever seen
    /// on boot-time kernel mappings.
    pub large_page: bool,

    /// Global (G, bit 8) (**leaf only**).
    pub global_translation: bool,

    /// Copy-on-write pending (OS bit 9) (**leaf only**).
    ///
    /// The leaf is read-only because its frame is shared with another
    /// address space; a write fault gets a private copy.
    pub copy_on_write: bool,

    /// Borrowed frame (OS bit 10) (**leaf only**).
    ///
    /// The frame is not owned by this mapping (kernel image code, MMIO,
    /// trampolines). Unmapping never releases it.
    pub borrowed: bool,

    /// OS-available (bit 11).
    #[bits(1)]
    __: u8,

    /// Physical address bits [51:12] (bits 12..=51).
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available / protection key (bits 52..=62).
    #[bits(11)]
    __: u16,

    /// No-Execute (NX, bit 63), Execute Disable.
    pub no_execute: bool,
}

impl PageEntryBits {
    /// Flags that describe access rights, without address or CPU-set bits.
    const PERMISSION_MASK: u64 = 0b0111_0001_1111 | (1 << 63);

    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> FrameNumber {
        FrameNumber::new(self.phys_addr_bits_51_12())
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: FrameNumber) -> Self {
        self.with_phys_addr_bits_51_12(frame.as_u64())
    }

    /// The entry's permission and software bits, with the address and the
    /// CPU-maintained accessed/dirty bits cleared.
    #[inline]
    #[must_use]
    pub const fn permissions(&self) -> Self {
        Self::from_bits(self.into_bits() & Self::PERMISSION_MASK)
    }

    /// Link to a next-level table: present, writable, supervisor-only.
    #[inline]
    #[must_use]
    pub const fn table_link(table: FrameNumber) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame(table)
    }

    /// Kernel data: present, writable, not executable, supervisor-only.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_no_execute(true)
    }

    /// Kernel code: present, read-only, executable, supervisor-only.
    #[inline]
    #[must_use]
    pub const fn kernel_rx() -> Self {
        Self::new().with_present(true)
    }

    /// User code: present, read-only, executable.
    #[inline]
    #[must_use]
    pub const fn user_rx() -> Self {
        Self::new().with_present(true).with_user_access(true)
    }

    /// User data and stacks: present, writable, not executable.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
            .with_no_execute(true)
    }

    /// User read-only data: present, not writable, not executable.
    #[inline]
    #[must_use]
    pub const fn user_ro() -> Self {
        Self::new()
            .with_present(true)
            .with_user_access(true)
            .with_no_execute(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_bits_live_in_os_available_range() {
        assert_eq!(PageEntryBits::new().with_copy_on_write(true).into_bits(), 1 << 9);
        assert_eq!(PageEntryBits::new().with_borrowed(true).into_bits(), 1 << 10);
    }

    #[test]
    fn frame_roundtrip() {
        let e = PageEntryBits::kernel_rw().with_frame(FrameNumber::new(0xABCDE));
        assert_eq!(e.physical_address(), PhysicalAddress::new(0xABCD_E000));
        assert_eq!(e.frame(), FrameNumber::new(0xABCDE));
        assert!(e.no_execute());
    }

    #[test]
    fn permissions_strip_address_and_cpu_bits() {
        let e = PageEntryBits::user_rw()
            .with_frame(FrameNumber::new(7))
            .with_accessed(true)
            .with_dirty(true)
            .with_copy_on_write(true);
        let p = e.permissions();
        assert_eq!(p.frame(), FrameNumber::new(0));
        assert!(!p.accessed() && !p.dirty());
        assert!(p.copy_on_write() && p.user_access() && p.no_execute());
    }
}
