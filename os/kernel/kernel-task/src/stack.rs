//! Kernel stacks and the frames placed on them before a task first runs.

use crate::task::CalleeSavedRegisters;
use kernel_alloc::{FrameAlloc, FrameAllocError};
use kernel_info::memory::{HHDM_BASE, TASK_KSTACK_ORDER, TASK_KSTACK_SIZE};
use kernel_memory_addresses::{FrameNumber, PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// A task's kernel stack: `2^TASK_KSTACK_ORDER` contiguous frames, accessed
/// through the direct map.
#[derive(Debug, Eq, PartialEq)]
pub struct KernelStack {
    base: FrameNumber,
}

impl KernelStack {
    /// # Errors
    /// Frame exhaustion.
    pub fn allocate<A: FrameAlloc>(alloc: &mut A) -> Result<Self, FrameAllocError> {
        let base = alloc.allocate(TASK_KSTACK_ORDER)?;
        Ok(Self { base })
    }

    /// Return the frames to the allocator.
    ///
    /// # Errors
    /// Reported by the allocator if the frames were not ours.
    pub fn free<A: FrameAlloc>(self, alloc: &mut A) -> Result<(), FrameAllocError> {
        alloc.free(self.base, TASK_KSTACK_ORDER)
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> FrameNumber {
        self.base
    }

    /// One past the highest byte of the stack, physically.
    #[inline]
    #[must_use]
    pub const fn top_phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.base().as_u64() + TASK_KSTACK_SIZE)
    }

    /// One past the highest byte of the stack, as the kernel sees it.
    #[inline]
    #[must_use]
    pub const fn top(&self) -> VirtualAddress {
        VirtualAddress::new(HHDM_BASE + self.top_phys().as_u64())
    }

    /// Physical address of the slot `depth` bytes below the top.
    #[inline]
    #[must_use]
    pub const fn below_top(&self, depth: u64) -> PhysicalAddress {
        PhysicalAddress::new(self.top_phys().as_u64() - depth)
    }

    /// Write `frame` against the top of the stack and return the stack
    /// pointer that addresses its first field.
    ///
    /// # Safety
    /// The stack must not be in use.
    pub(crate) unsafe fn place<T: Copy, M: PhysMapper>(
        &self,
        mapper: &M,
        frame: T,
    ) -> VirtualAddress {
        let size = size_of::<T>() as u64;
        // SAFETY: the slot lies within the top frame of a stack we own.
        let slot: &mut T = unsafe { mapper.phys_to_mut(self.below_top(size)) };
        *slot = frame;
        VirtualAddress::new(self.top().as_u64() - size)
    }
}

/// The frame `iretq` pops, lowest address first.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IretFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Callee-saved registers as the context switch pops them: `r15` first.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SavedFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
}

impl From<&CalleeSavedRegisters> for SavedFrame {
    fn from(regs: &CalleeSavedRegisters) -> Self {
        Self {
            r15: regs.r15,
            r14: regs.r14,
            r13: regs.r13,
            r12: regs.r12,
            rbp: regs.rbp,
            rbx: regs.rbx,
        }
    }
}

/// Initial stack of a forked user task.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UserForkFrame {
    pub saved: SavedFrame,
    /// Return address of the context switch: the "return from fork" stub.
    pub resume: u64,
    pub iret: IretFrame,
}

/// Initial stack of a kernel thread.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KernelThreadFrame {
    pub saved: SavedFrame,
    /// Return address of the context switch: the "fresh kernel thread" stub.
    pub resume: u64,
    /// Called by the stub.
    pub entry: u64,
}

const _: () = {
    assert!(size_of::<IretFrame>() == 5 * 8);
    assert!(size_of::<UserForkFrame>() == 12 * 8);
    assert!(size_of::<KernelThreadFrame>() == 8 * 8);
    assert!(core::mem::offset_of!(UserForkFrame, resume) == 6 * 8);
    assert!(core::mem::offset_of!(UserForkFrame, iret) == 7 * 8);
    assert!((size_of::<UserForkFrame>() as u64) < TASK_KSTACK_SIZE);
};

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_alloc::BitmapFrameAlloc;

    #[test]
    fn stack_top_is_past_both_frames() {
        let mut alloc = BitmapFrameAlloc::new(16);
        let first = KernelStack::allocate(&mut alloc).unwrap();
        let second = KernelStack::allocate(&mut alloc).unwrap();
        assert_eq!(first.base(), FrameNumber::new(0));
        assert_eq!(second.base(), FrameNumber::new(2));

        assert_eq!(first.top_phys(), PhysicalAddress::new(0x2000));
        assert_eq!(first.top(), VirtualAddress::new(HHDM_BASE + 0x2000));
        assert_eq!(first.below_top(8), PhysicalAddress::new(0x1ff8));

        first.free(&mut alloc).unwrap();
        assert_eq!(alloc.free_frames(), 14);
    }

    #[test]
    fn iret_frame_matches_hardware_order() {
        let frame = UserForkFrame {
            saved: SavedFrame::default(),
            resume: 0xAAAA,
            iret: IretFrame {
                rip: 1,
                cs: 2,
                rflags: 3,
                rsp: 4,
                ss: 5,
            },
        };
        // SAFETY: plain `repr(C)` struct of `u64`s.
        let words: [u64; 12] = unsafe { core::mem::transmute(frame) };
        assert_eq!(&words[6..], &[0xAAAA, 1, 2, 3, 4, 5]);
    }
}
