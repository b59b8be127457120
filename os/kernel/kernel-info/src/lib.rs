//! # Kernel Configuration and Boot Interface
//!
//! Compile-time memory layout and the boot-time memory map shared by the
//! frame allocator, the page-table code and the task constructor.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐  PML4[0]
//!                       │  unmapped (null guard)          │
//! EXEC_CODE_BASE        ├─────────────────────────────────┤ 0x0000_0000_0000_1000
//!                       │  exec image code (2 pages)      │
//! EXEC_STACK_BASE       ├─────────────────────────────────┤ 0x0000_0000_0000_3000
//!                       │  exec stack / data (2 pages)    │
//! EXEC_STACK_TOP        ├─────────────────────────────────┤ 0x0000_0000_0000_5000
//!                       │         User Space              │
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │   non-canonical hole            │
//! 0xffff_8000_0000_0000 ├─────────────────────────────────┤  PML4[KERNEL_PML4_START]
//!                       │   Kernel half (shared by value  │
//!                       │   in every address space)       │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! The top-level table is split in two halves: slots `0..KERNEL_PML4_START`
//! belong to the process, slots `KERNEL_PML4_START..512` are kernel-reserved
//! and point at the *same* lower-level tables in every address space.
//!
//! ## Boot Memory Map
//!
//! [`boot::BootMemoryMap`] is the boot loader's view of physical memory,
//! reduced to what the frame allocator needs: which ranges are usable RAM
//! and which are reserved by firmware or the loader itself.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
