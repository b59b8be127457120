//! # TLB Maintenance
//!
//! Operations that change a present entry hand back a `#[must_use]` token.
//! The caller either flushes it (the space is active on this processor) or
//! explicitly ignores it (the space is not loaded anywhere).
//!
//! Changes to the shared kernel half are visible to every processor and go
//! through a [`TlbShootdown`] instead.

use kernel_memory_addresses::VirtualAddress;

/// Pending invalidation of a single page.
#[must_use = "the TLB may still cache the old translation"]
#[derive(Debug, Eq, PartialEq)]
pub struct TlbFlush(VirtualAddress);

impl TlbFlush {
    pub(crate) const fn new(va: VirtualAddress) -> Self {
        Self(va)
    }

    #[must_use]
    pub const fn address(&self) -> VirtualAddress {
        self.0
    }

    /// Invalidate the page on the executing processor.
    pub fn flush(self) {
        invalidate_page(self.0);
    }

    /// The address space is not active on this processor.
    pub const fn ignore(self) {}
}

/// Pending invalidation of every non-global translation.
#[must_use = "the TLB may still cache stale translations"]
#[derive(Debug, Eq, PartialEq)]
pub struct TlbFlushAll(());

impl TlbFlushAll {
    pub(crate) const fn new() -> Self {
        Self(())
    }

    /// Reload CR3 on the executing processor.
    pub fn flush(self) {
        flush_all();
    }

    pub const fn ignore(self) {}
}

/// Cross-processor invalidation, implemented by the SMP layer (IPI broadcast).
pub trait TlbShootdown {
    /// Invalidate `va` on every processor, including the caller.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Flush all non-global translations on every processor.
    fn flush_all(&self);
}

/// Shootdown for a single processor; used before the APs are up.
#[derive(Copy, Clone, Debug, Default)]
pub struct LocalShootdown;

impl TlbShootdown for LocalShootdown {
    fn invalidate_page(&self, va: VirtualAddress) {
        invalidate_page(va);
    }

    fn flush_all(&self) {
        flush_all();
    }
}

/// `invlpg` on the executing processor.
#[inline]
#[allow(unused_variables)]
pub fn invalidate_page(va: VirtualAddress) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Reload CR3 with its current value, dropping non-global translations.
#[inline]
pub fn flush_all() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        use kernel_registers::{Cr3, LoadRegisterUnsafe, StoreRegisterUnsafe};
        Cr3::load_unsafe().store_unsafe();
    }
}
