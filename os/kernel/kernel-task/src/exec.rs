//! # Image Replacement
//!
//! Replaces the user image of the current task with a function from the
//! kernel image:
//!
//! ```text
//! 0x1000 ┌────────────────┐
//!        │ code (2 pages) │  user, read + execute, borrowed kernel frames
//! 0x3000 ├────────────────┤
//!        │ stack (2 pages)│  user, read + write, fresh zeroed frames
//! 0x5000 └────────────────┘  ← initial rsp
//! ```
//!
//! The entry point keeps the function's offset within its first page.

use crate::task::{Task, release_address_space};
use alloc::sync::Arc;
use kernel_alloc::{FrameAlloc, FrameAllocError};
use kernel_info::memory::{
    EXEC_CODE_BASE, EXEC_CODE_PAGES, EXEC_STACK_BASE, EXEC_STACK_PAGES, EXEC_STACK_TOP,
};
use kernel_memory_addresses::{FrameNumber, PageSize, Size4K, VirtualAddress};
use kernel_vmem::{AddressSpace, MapError, PageEntryBits, PhysMapper, UnmapError};
use kernel_sync::SpinLock;
use log::{debug, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ExecError {
    /// The function to run is not backed by the kernel image.
    #[error("kernel code at {0} is not mapped")]
    KernelCodeNotMapped(VirtualAddress),
    #[error(transparent)]
    Frames(#[from] FrameAllocError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Unmap(#[from] UnmapError),
}

/// Where a replaced image starts executing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UserEntry {
    pub rip: VirtualAddress,
    pub rsp: VirtualAddress,
}

/// Build the new user image of `task` without transferring control.
///
/// A task without an address space (a kernel thread) gets a fresh one
/// seeded with the kernel half of `kernel` and stops being a kernel thread.
/// So does a thread whose space is shared with other tasks; they keep the
/// old image. Otherwise all user mappings of its space are discarded first.
///
/// # Errors
/// - [`ExecError::KernelCodeNotMapped`] if `function` or the page after it
///   is not mapped in `kernel`; the task is left untouched.
/// - Frame exhaustion. A task that needed a fresh space is left untouched;
///   a reused space has already lost its old image.
pub fn prepare_image<'m, M: PhysMapper, A: FrameAlloc>(
    task: &Task<'m, M>,
    kernel: &AddressSpace<'m, M>,
    function: VirtualAddress,
    alloc: &mut A,
) -> Result<UserEntry, ExecError> {
    let code = code_frames(kernel, function)?;

    let mut slot = task.address_space_slot();
    let exclusive = slot
        .as_ref()
        .filter(|space| Arc::strong_count(*space) == 1)
        .cloned();

    if let Some(space) = exclusive {
        let mut space = space.lock();
        // Only the current task execs, so the space is active here.
        space.destroy_low_mappings(alloc)?.flush();
        map_image(&mut *space, code, alloc)?;
    } else {
        let space = fresh_image(kernel, code, alloc)?;
        if let Some(previous) = slot.replace(Arc::new(SpinLock::new(space))) {
            release_address_space(previous, alloc)?;
        }
    }
    drop(slot);
    task.set_flags(task.flags().with_kernel_thread(false));

    let entry = UserEntry {
        rip: VirtualAddress::new(EXEC_CODE_BASE + function.offset::<Size4K>()),
        rsp: VirtualAddress::new(EXEC_STACK_TOP),
    };
    debug!(
        "PID {} executes {function} at {} with stack {}",
        task.pid(),
        entry.rip,
        entry.rsp
    );
    Ok(entry)
}

/// A new space holding only the kernel half and the image.
#[allow(clippy::cast_possible_truncation)]
fn fresh_image<'m, M: PhysMapper, A: FrameAlloc>(
    kernel: &AddressSpace<'m, M>,
    code: [FrameNumber; EXEC_CODE_PAGES as usize],
    alloc: &mut A,
) -> Result<AddressSpace<'m, M>, ExecError> {
    let mut space = AddressSpace::new_user(kernel, alloc)?;
    if let Err(e) = map_image(&mut space, code, alloc) {
        if let Err(leak) = space.destroy(alloc) {
            warn!("Failed to destroy partial image: {leak}");
        }
        return Err(e);
    }
    Ok(space)
}

#[allow(clippy::cast_possible_truncation)]
fn map_image<M: PhysMapper, A: FrameAlloc>(
    space: &mut AddressSpace<'_, M>,
    code: [FrameNumber; EXEC_CODE_PAGES as usize],
    alloc: &mut A,
) -> Result<(), ExecError> {
    for (i, frame) in (0u64..).zip(code) {
        let va = VirtualAddress::new(EXEC_CODE_BASE + i * Size4K::SIZE);
        space.map(alloc, va, frame, PageEntryBits::user_rx().with_borrowed(true))?;
    }

    for i in 0..EXEC_STACK_PAGES {
        let va = VirtualAddress::new(EXEC_STACK_BASE + i * Size4K::SIZE);
        let frame = alloc.alloc_4k()?;
        // SAFETY: fresh frame, not yet mapped anywhere.
        unsafe { space.mapper().frame_mut(frame).fill(0) };

        if let Err(e) = space.map(alloc, va, frame, PageEntryBits::user_rw()) {
            alloc.release(frame)?;
            return Err(e.into());
        }
    }
    Ok(())
}

/// Frames backing the pages starting at `function`'s page.
#[allow(clippy::cast_possible_truncation)]
fn code_frames<M: PhysMapper>(
    kernel: &AddressSpace<'_, M>,
    function: VirtualAddress,
) -> Result<[FrameNumber; EXEC_CODE_PAGES as usize], ExecError> {
    let mut frames = [FrameNumber::new(0); EXEC_CODE_PAGES as usize];
    let mut page = function.page::<Size4K>();
    for frame in &mut frames {
        let va = page.base();
        *frame = kernel
            .translate(va)
            .ok_or(ExecError::KernelCodeNotMapped(va))?
            .frame;
        page = page.next();
    }
    Ok(frames)
}

/// Replace the current task's image with `function` and jump to it in ring 3.
///
/// Only returns on failure; see [`prepare_image`].
///
/// # Safety
/// `task` must be the task running on this processor, on its own kernel
/// stack, with interrupts disabled.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub unsafe fn replace_image<'m, M: PhysMapper, A: FrameAlloc>(
    task: &Task<'m, M>,
    kernel: &AddressSpace<'m, M>,
    function: VirtualAddress,
    alloc: &mut A,
) -> Result<core::convert::Infallible, ExecError> {
    use kernel_info::memory::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};
    use kernel_registers::Rflags;

    let entry = prepare_image(task, kernel, function, alloc)?;
    if let Some(space) = task.address_space() {
        // SAFETY: the kernel half is shared from `kernel`.
        unsafe { space.lock().switch_to() };
    }

    // SAFETY: one-way transfer; nothing on this stack is used again.
    unsafe {
        core::arch::asm!(
            "push {ss}",
            "push {stack}",
            "push {rflags}",
            "push {cs}",
            "push {entry}",
            "iretq",
            ss = in(reg) USER_DATA_SELECTOR,
            stack = in(reg) entry.rsp.as_u64(),
            rflags = in(reg) Rflags::user_entry().into_bits(),
            cs = in(reg) USER_CODE_SELECTOR,
            entry = in(reg) entry.rip.as_u64(),
            options(noreturn)
        )
    }
}
