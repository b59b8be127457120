//! Kernel-only mappings for drivers and the scheduler.
//!
//! Mappings in the kernel half are shared by every address space, so a
//! change there must be invalidated on every processor. User-half addresses
//! (e.g. the identity-mapped AP trampoline) only need a local flush.

use crate::address_space::{AddressSpace, MapError, UnmapError};
use crate::tlb::TlbShootdown;
use crate::{PageEntryBits, PhysMapper, TableLevel};
use kernel_alloc::FrameAlloc;
use kernel_memory_addresses::{FrameNumber, VirtualAddress};

/// Map `va → frame` supervisor-only in `space`.
///
/// The user bit in `flags` is ignored.
///
/// # Errors
/// See [`AddressSpace::map`].
pub fn map_page<M, A, S>(
    space: &mut AddressSpace<'_, M>,
    alloc: &mut A,
    va: VirtualAddress,
    frame: FrameNumber,
    flags: PageEntryBits,
    shootdown: &S,
) -> Result<(), MapError>
where
    M: PhysMapper,
    A: FrameAlloc,
    S: TlbShootdown + ?Sized,
{
    space.map(alloc, va, frame, flags.with_user_access(false))?;

    // A new translation can still be cached as "not present" on x86-64.
    if is_kernel_half(va) {
        shootdown.invalidate_page(va);
    } else {
        crate::tlb::invalidate_page(va);
    }
    Ok(())
}

/// Remove the mapping at `va`, invalidating it wherever it may be cached.
///
/// # Errors
/// See [`AddressSpace::unmap`].
pub fn unmap_page<M, A, S>(
    space: &mut AddressSpace<'_, M>,
    alloc: &mut A,
    va: VirtualAddress,
    shootdown: &S,
) -> Result<(), UnmapError>
where
    M: PhysMapper,
    A: FrameAlloc,
    S: TlbShootdown + ?Sized,
{
    let flush = space.unmap(alloc, va)?;
    if is_kernel_half(va) {
        flush.ignore();
        shootdown.invalidate_page(va);
    } else {
        flush.flush();
    }
    Ok(())
}

/// Make `space` the active address space of the executing processor.
///
/// # Safety
/// See [`AddressSpace::switch_to`].
pub unsafe fn switch_address_space<M: PhysMapper>(space: &AddressSpace<'_, M>) {
    unsafe { space.switch_to() }
}

fn is_kernel_half(va: VirtualAddress) -> bool {
    TableLevel::Pml4.index_of(va).is_kernel_slot()
}
