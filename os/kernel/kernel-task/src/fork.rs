//! # Task Constructor
//!
//! [`TaskConstructor::fork`] builds a complete, self-consistent task and
//! hands it to the [`Scheduler`]. Nothing else in the kernel writes initial
//! stack frames.

use crate::stack::{IretFrame, KernelStack, KernelThreadFrame, SavedFrame, UserForkFrame};
use crate::task::{CalleeSavedRegisters, SharedAddressSpace, Task, TaskFlags};
use alloc::sync::Arc;
use kernel_alloc::{FrameAlloc, FrameAllocError};
use kernel_info::memory::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use kernel_memory_addresses::VirtualAddress;
use kernel_registers::Rflags;
use kernel_sync::SpinLock;
use kernel_vmem::{AddressSpace, CloneError, PhysMapper, TlbShootdown};
use log::{info, warn};

/// Receives fully constructed tasks.
pub trait Scheduler<'m, M: PhysMapper> {
    fn schedule_runnable(&self, task: Arc<Task<'m, M>>);
}

/// Where the context switch "returns" to the first time a new task runs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ResumePoints {
    /// Calls the entry point found above the marker.
    pub kernel_thread: VirtualAddress,
    /// `iretq`s through the simulated interrupt frame above the marker.
    pub user_fork: VirtualAddress,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ForkError {
    #[error("no frames for the kernel stack: {0}")]
    Frames(#[from] FrameAllocError),
    #[error("failed to clone the parent's address space: {0}")]
    Clone(#[from] CloneError),
    /// A user task can only be forked from a task with a user image.
    #[error("parent has no address space to clone")]
    ParentHasNoAddressSpace,
}

pub struct TaskConstructor<'a, 'm, M: PhysMapper, S: ?Sized> {
    mapper: &'m M,
    resume: ResumePoints,
    scheduler: &'a S,
    /// Reaches the processors running sibling threads of a forking parent.
    shootdown: &'a (dyn TlbShootdown + Sync),
}

impl<'a, 'm, M, S> TaskConstructor<'a, 'm, M, S>
where
    M: PhysMapper,
    S: Scheduler<'m, M> + ?Sized,
{
    #[must_use]
    pub const fn new(
        mapper: &'m M,
        resume: ResumePoints,
        scheduler: &'a S,
        shootdown: &'a (dyn TlbShootdown + Sync),
    ) -> Self {
        Self {
            mapper,
            resume,
            scheduler,
            shootdown,
        }
    }

    /// Create a task that starts at `entry`.
    ///
    /// A kernel thread (`flags.kernel_thread()`) gets no address space and
    /// starts in ring 0. Otherwise the parent's address space is cloned
    /// copy-on-write and the task enters ring 3 at `entry` with the user
    /// stack pointer `regs.rsp`. Either way the callee-saved registers from
    /// `regs` are restored before the task starts.
    ///
    /// Must be called by the task that is `parent`, so its address space is
    /// active on this processor and not running anywhere else.
    ///
    /// # Errors
    /// Frame exhaustion. Nothing allocated for the child survives a failure.
    pub fn fork<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        parent: &Task<'m, M>,
        entry: VirtualAddress,
        flags: TaskFlags,
        regs: &CalleeSavedRegisters,
    ) -> Result<Arc<Task<'m, M>>, ForkError> {
        let kernel_stack = KernelStack::allocate(alloc)?;
        let child_flags = parent
            .flags()
            .with_kernel_thread(flags.kernel_thread());

        let built = if flags.kernel_thread() {
            Ok((self.kernel_thread_frame(&kernel_stack, entry, regs), None))
        } else {
            self.clone_parent_space(alloc, parent)
                .map(|space| (self.user_fork_frame(&kernel_stack, entry, regs), Some(space)))
        };

        let (rsp_top, address_space) = match built {
            Ok(built) => built,
            Err(e) => {
                warn!("Fork of PID {} failed: {e}", parent.pid());
                if let Err(leak) = kernel_stack.free(alloc) {
                    warn!("Failed to free kernel stack of failed fork: {leak}");
                }
                return Err(e);
            }
        };

        let address_space = address_space.map(|space| Arc::new(SpinLock::new(space)));
        let task = Arc::new(Task::new(child_flags, kernel_stack, rsp_top, address_space));
        info!("Forked PID {} to create PID {}", parent.pid(), task.pid());

        self.scheduler.schedule_runnable(Arc::clone(&task));
        Ok(task)
    }

    /// Create a user thread that shares `parent`'s address space.
    ///
    /// The thread enters ring 3 at `entry` with the user stack pointer
    /// `regs.rsp`. The space lives until the last task using it is reaped.
    ///
    /// # Errors
    /// [`ForkError::ParentHasNoAddressSpace`] for a kernel-thread parent, or
    /// frame exhaustion while allocating the kernel stack.
    pub fn spawn_thread<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        parent: &Task<'m, M>,
        entry: VirtualAddress,
        regs: &CalleeSavedRegisters,
    ) -> Result<Arc<Task<'m, M>>, ForkError> {
        let space = parent
            .address_space()
            .ok_or(ForkError::ParentHasNoAddressSpace)?;
        let kernel_stack = KernelStack::allocate(alloc)?;
        let rsp_top = self.user_fork_frame(&kernel_stack, entry, regs);

        let flags = parent.flags().with_kernel_thread(false);
        let task = Arc::new(Task::new(flags, kernel_stack, rsp_top, Some(space)));
        info!("PID {} spawned thread PID {}", parent.pid(), task.pid());

        self.scheduler.schedule_runnable(Arc::clone(&task));
        Ok(task)
    }

    fn clone_parent_space<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        parent: &Task<'m, M>,
    ) -> Result<AddressSpace<'m, M>, ForkError> {
        let shared = parent
            .address_space()
            .ok_or(ForkError::ParentHasNoAddressSpace)?;
        let (child, flush) = shared.lock().clone_cow(alloc)?;

        // Sibling threads may cache the demoted entries on other processors.
        if is_shared(&shared) {
            flush.ignore();
            self.shootdown.flush_all();
        } else {
            flush.flush();
        }
        Ok(child)
    }

    fn kernel_thread_frame(
        &self,
        stack: &KernelStack,
        entry: VirtualAddress,
        regs: &CalleeSavedRegisters,
    ) -> VirtualAddress {
        let frame = KernelThreadFrame {
            saved: SavedFrame::from(regs),
            resume: self.resume.kernel_thread.as_u64(),
            entry: entry.as_u64(),
        };
        // SAFETY: the stack was just allocated.
        unsafe { stack.place(self.mapper, frame) }
    }

    fn user_fork_frame(
        &self,
        stack: &KernelStack,
        entry: VirtualAddress,
        regs: &CalleeSavedRegisters,
    ) -> VirtualAddress {
        let frame = UserForkFrame {
            saved: SavedFrame::from(regs),
            resume: self.resume.user_fork.as_u64(),
            iret: IretFrame {
                rip: entry.as_u64(),
                cs: USER_CODE_SELECTOR,
                rflags: Rflags::user_entry().into_bits(),
                rsp: regs.rsp,
                ss: USER_DATA_SELECTOR,
            },
        };
        // SAFETY: the stack was just allocated.
        unsafe { stack.place(self.mapper, frame) }
    }
}

/// Whether a task other than the caller references `space`; the caller
/// holds one reference in its task and one in `space`.
fn is_shared<M: PhysMapper>(space: &SharedAddressSpace<'_, M>) -> bool {
    Arc::strong_count(space) > 2
}
