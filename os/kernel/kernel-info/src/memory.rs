//! # Memory Layout

use kernel_memory_addresses::{PageSize, Size1G, Size4K};

/// End of the canonical lower half; user mappings live below.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// First top-level (PML4) slot reserved for the kernel.
///
/// Entries at and above this index are copied by value into every new
/// address space and are never owned by a process.
pub const KERNEL_PML4_START: usize = 256;

/// Number of entries in every paging structure.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Allocation order of a task's kernel stack (`2^order` contiguous frames).
pub const TASK_KSTACK_ORDER: u8 = 1;

/// Size of a task's kernel stack in bytes.
pub const TASK_KSTACK_SIZE: u64 = Size4K::SIZE << TASK_KSTACK_ORDER;

/// Where a replaced image's code is mapped.
pub const EXEC_CODE_BASE: u64 = 0x1000;

/// Number of code pages mapped for a replaced image.
pub const EXEC_CODE_PAGES: u64 = 2;

/// Base of a replaced image's stack/data region.
pub const EXEC_STACK_BASE: u64 = EXEC_CODE_BASE + EXEC_CODE_PAGES * Size4K::SIZE;

/// Number of freshly allocated stack/data pages for a replaced image.
pub const EXEC_STACK_PAGES: u64 = 2;

/// Initial user stack pointer of a replaced image (grows down from here).
pub const EXEC_STACK_TOP: u64 = EXEC_STACK_BASE + EXEC_STACK_PAGES * Size4K::SIZE;

/// User data segment selector (GDT index 4, RPL 3).
pub const USER_DATA_SELECTOR: u64 = 0x20 | 3;

/// User code segment selector (GDT index 5, RPL 3).
pub const USER_CODE_SELECTOR: u64 = 0x28 | 3;

const _: () = {
    assert!(KERNEL_PML4_START == PAGE_TABLE_ENTRIES / 2);
    assert!(HHDM_BASE >= USERSPACE_END);
    assert!(KERNEL_BASE > HHDM_BASE);
    assert!(HHDM_BASE.is_multiple_of(Size1G::SIZE));
    assert!(EXEC_CODE_BASE.is_multiple_of(Size4K::SIZE));
    assert!(EXEC_STACK_TOP < USERSPACE_END);
};
