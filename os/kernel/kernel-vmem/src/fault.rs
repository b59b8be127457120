//! # Copy-on-Write Fault Completion
//!
//! The page-fault entry stub reads CR2 and the error code pushed by the CPU
//! and hands both to [`PageFault::from_error_code`]. The result goes to
//! [`AddressSpace::resolve_cow_fault`] for the faulting task's space. Every
//! fault it cannot resolve is fatal to that task only.

use crate::address_space::AddressSpace;
use crate::tlb::TlbFlush;
use crate::PhysMapper;
use bitfield_struct::bitfield;
use kernel_alloc::{FrameAlloc, FrameAllocError};
use kernel_memory_addresses::{FrameNumber, Size4K, VirtualAddress};
use log::{debug, warn};

/// Page-fault error code layout (x86-64).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15.1 “Page-Fault Exception (#PF)”.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultErrorCode {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64, // reserved / ignored bits
}

impl PageFaultErrorCode {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (page not mapped or swapped out)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// A decoded page fault, as delivered by fault dispatch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageFault {
    /// Faulting virtual address (CR2).
    pub address: VirtualAddress,
    pub write: bool,
    pub user: bool,
    /// The translation existed; the access violated its permissions.
    pub present: bool,
}

impl PageFault {
    #[must_use]
    pub const fn from_error_code(cr2: VirtualAddress, code: PageFaultErrorCode) -> Self {
        Self {
            address: cr2,
            write: code.write(),
            user: code.user(),
            present: code.present(),
        }
    }
}

/// How a copy-on-write fault was completed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CowResolution {
    /// The faulting space held the last reference; the page was made
    /// writable in place.
    MadeWritable(FrameNumber),
    /// The page was copied into a private frame.
    Copied { from: FrameNumber, to: FrameNumber },
}

impl CowResolution {
    /// The frame now mapped writable at the faulting address.
    #[must_use]
    pub const fn frame(&self) -> FrameNumber {
        match *self {
            Self::MadeWritable(frame) | Self::Copied { to: frame, .. } => frame,
        }
    }
}

/// A fault that is not a pending copy-on-write; fatal to the task.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CowFaultError {
    #[error("fault at {0} on a non-present page")]
    NotPresent(VirtualAddress),
    #[error("fault at {0} is not a write")]
    NotAWrite(VirtualAddress),
    #[error("{0} is not mapped")]
    Unmapped(VirtualAddress),
    #[error("write to read-only page at {0}")]
    NotCopyOnWrite(VirtualAddress),
    #[error(transparent)]
    Frames(#[from] FrameAllocError),
}

impl<M: PhysMapper> AddressSpace<'_, M> {
    /// Complete a write fault on a copy-on-write page in this space.
    ///
    /// If other spaces still share the frame, it is copied into a fresh
    /// frame which is installed writable here only; this space's reference
    /// to the shared frame is dropped. If this space holds the last
    /// reference the page is simply made writable again.
    ///
    /// The returned token must be flushed on the faulting processor before
    /// the faulting instruction is resumed.
    ///
    /// # Errors
    /// Everything that is not a write to a present copy-on-write page, and
    /// frame exhaustion while copying.
    pub fn resolve_cow_fault<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        fault: &PageFault,
    ) -> Result<(CowResolution, TlbFlush), CowFaultError> {
        let va = fault.address;
        let result = self.resolve(alloc, fault);
        if let Err(e) = &result {
            warn!("Unresolvable page fault at {va}: {e}");
        }
        result
    }

    fn resolve<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        fault: &PageFault,
    ) -> Result<(CowResolution, TlbFlush), CowFaultError> {
        let va = fault.address;
        if !fault.present {
            return Err(CowFaultError::NotPresent(va));
        }
        if !fault.write {
            return Err(CowFaultError::NotAWrite(va));
        }

        let mapper = self.mapper();
        let leaf = self.walk(va).map_err(|_| CowFaultError::Unmapped(va))?;
        if !leaf.present() {
            return Err(CowFaultError::Unmapped(va));
        }
        if !leaf.copy_on_write() {
            return Err(CowFaultError::NotCopyOnWrite(va));
        }

        let shared = leaf.frame();
        let resolution = if alloc.ref_count(shared) <= 1 {
            *leaf = leaf.with_writable(true).with_copy_on_write(false);
            CowResolution::MadeWritable(shared)
        } else {
            let private = alloc.alloc_4k()?;
            // SAFETY: `private` is fresh; `shared` is only read, and only
            // written through mappings whose writes fault first.
            unsafe {
                mapper
                    .frame_mut(private)
                    .copy_from_slice(mapper.frame_mut(shared));
            }
            *leaf = leaf
                .with_frame(private)
                .with_writable(true)
                .with_copy_on_write(false);
            alloc.release(shared)?;
            CowResolution::Copied {
                from: shared,
                to: private,
            }
        };

        debug!("Resolved copy-on-write fault at {va}: {resolution:?}");
        Ok((resolution, TlbFlush::new(va.page::<Size4K>().base())))
    }
}
