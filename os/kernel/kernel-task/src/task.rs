use crate::pid::Pid;
use crate::stack::KernelStack;
use alloc::sync::Arc;
use bitfield_struct::bitfield;
use kernel_alloc::{FrameAlloc, FrameAllocError};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::{SpinLock, SpinLockGuard};
use kernel_vmem::{AddressSpace, PhysMapper, UnmapError};
use log::debug;

/// An address space referenced by every thread of one process.
pub type SharedAddressSpace<'m, M> = Arc<SpinLock<AddressSpace<'m, M>>>;

/// Per-task flags.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct TaskFlags {
    /// Runs only kernel code and has no user address space.
    pub kernel_thread: bool,

    #[bits(63)]
    __: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    Runnable,
    Running,
}

/// Registers a new task starts with, captured from the forking context.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CalleeSavedRegisters {
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// User stack pointer for the new task.
    pub rsp: u64,
}

/// A schedulable task.
pub struct Task<'m, M: PhysMapper> {
    pid: Pid,
    flags: SpinLock<TaskFlags>,
    state: SpinLock<TaskState>,
    kernel_stack: KernelStack,
    /// Saved kernel stack pointer; the context switch resumes from here.
    rsp_top: SpinLock<VirtualAddress>,
    address_space: SpinLock<Option<SharedAddressSpace<'m, M>>>,
}

impl<'m, M: PhysMapper> Task<'m, M> {
    pub(crate) fn new(
        flags: TaskFlags,
        kernel_stack: KernelStack,
        rsp_top: VirtualAddress,
        address_space: Option<SharedAddressSpace<'m, M>>,
    ) -> Self {
        Self {
            pid: Pid::next(),
            flags: SpinLock::new(flags),
            state: SpinLock::new(TaskState::Runnable),
            kernel_stack,
            rsp_top: SpinLock::new(rsp_top),
            address_space: SpinLock::new(address_space),
        }
    }

    /// The task a processor is already executing when tasking starts.
    ///
    /// It gets a pid and a kernel stack of its own for when it is switched
    /// out; its current stack is left alone.
    ///
    /// # Errors
    /// Frame exhaustion while allocating the kernel stack.
    pub fn bootstrap<A: FrameAlloc>(
        alloc: &mut A,
        address_space: Option<AddressSpace<'m, M>>,
    ) -> Result<Self, FrameAllocError> {
        let flags = TaskFlags::new().with_kernel_thread(address_space.is_none());
        let kernel_stack = KernelStack::allocate(alloc)?;
        let top = kernel_stack.top();
        let address_space = address_space.map(|space| Arc::new(SpinLock::new(space)));
        let task = Self::new(flags, kernel_stack, top, address_space);
        task.set_state(TaskState::Running);
        Ok(task)
    }

    #[inline]
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn flags(&self) -> TaskFlags {
        *self.flags.lock()
    }

    #[must_use]
    pub fn is_kernel_thread(&self) -> bool {
        self.flags().kernel_thread()
    }

    pub(crate) fn set_flags(&self, flags: TaskFlags) {
        *self.flags.lock() = flags;
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TaskState) {
        *self.state.lock() = state;
    }

    #[inline]
    #[must_use]
    pub const fn kernel_stack(&self) -> &KernelStack {
        &self.kernel_stack
    }

    /// Top of the kernel stack, i.e. the stack pointer of an empty stack.
    #[must_use]
    pub const fn rsp_original(&self) -> VirtualAddress {
        self.kernel_stack.top()
    }

    #[must_use]
    pub fn rsp_top(&self) -> VirtualAddress {
        *self.rsp_top.lock()
    }

    /// Record where the context switch left this task's kernel stack.
    pub fn set_rsp_top(&self, rsp: VirtualAddress) {
        *self.rsp_top.lock() = rsp;
    }

    /// The task's address space; `None` for kernel threads.
    #[must_use]
    pub fn address_space(&self) -> Option<SharedAddressSpace<'m, M>> {
        self.address_space.lock().clone()
    }

    pub(crate) fn address_space_slot(
        &self,
    ) -> SpinLockGuard<'_, Option<SharedAddressSpace<'m, M>>> {
        self.address_space.lock()
    }

    #[must_use]
    pub fn has_address_space(&self) -> bool {
        self.address_space.lock().is_some()
    }

    /// Release everything the task owns. The task must not be running.
    ///
    /// The address space is destroyed only if no other task shares it.
    ///
    /// # Errors
    /// Reference-count corruption reported by the allocator.
    pub fn reap<A: FrameAlloc>(self, alloc: &mut A) -> Result<(), UnmapError> {
        let pid = self.pid;
        if let Some(space) = self.address_space.into_inner() {
            release_address_space(space, alloc)?;
        }
        self.kernel_stack.free(alloc)?;
        debug!("Reaped PID {pid}");
        Ok(())
    }
}

/// Drop one task's reference to `space`, destroying it with the last one.
pub(crate) fn release_address_space<M: PhysMapper, A: FrameAlloc>(
    space: SharedAddressSpace<'_, M>,
    alloc: &mut A,
) -> Result<(), UnmapError> {
    match Arc::into_inner(space) {
        Some(last) => last.into_inner().destroy(alloc),
        None => Ok(()),
    }
}
