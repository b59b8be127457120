//! # Virtual Memory Support
//!
//! x86-64 four-level paging for the kernel: building, walking and tearing
//! down address spaces, copy-on-write cloning for `fork`, and completion of
//! copy-on-write faults.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  4 KiB frame
//!   │        │        │        │
//!   │        │        │        └───► PTE   (leaf, maps 4 KiB)
//!   │        │        └────────────► PDE   (points to a PT)
//!   │        └─────────────────────► PDPTE (points to a PD)
//!   └──────────────────────────────► PML4E (points to a PDPT)
//! ```
//!
//! ## Ownership
//!
//! The PML4 is split at [`KERNEL_PML4_START`](kernel_info::memory::KERNEL_PML4_START):
//!
//! - **User half** (`0..256`): every node and every leaf frame below it is
//!   owned by exactly one [`AddressSpace`]. Leaf frames may additionally be
//!   shared copy-on-write, tracked by the frame allocator's reference counts.
//! - **Kernel half** (`256..512`): the entries are copied *by value* into
//!   every address space, so all of them point at the same PDPTs. Per-process
//!   spaces never create, free or modify these slots; a new kernel mapping
//!   made through any space is therefore visible in all of them.
//!
//! Leaves whose frame does not belong to the mapping (kernel code mapped for
//! `exec`, MMIO, trampolines) carry the software [`borrowed`](PageEntryBits::borrowed)
//! bit and are never released on unmap.
//!
//! ## Entry points
//!
//! | Operation | Where |
//! |-----------|-------|
//! | walk / map / unmap / translate | [`AddressSpace`] |
//! | copy-on-write clone | [`AddressSpace::clone_cow`] |
//! | copy-on-write fault completion | [`AddressSpace::resolve_cow_fault`] |
//! | kernel-only mappings with shootdown | [`map_page`], [`unmap_page`], [`switch_address_space`] |

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

pub mod address_space;
mod fault;
mod kernel_map;
mod page_entry_bits;
mod page_table;
mod phys_mapper;
pub mod tlb;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crate::address_space::{
    AddressSpace, CloneError, MapError, RootPage, Translation, UnmapError, WalkError,
};
pub use crate::fault::{CowFaultError, CowResolution, PageFault, PageFaultErrorCode};
pub use crate::kernel_map::{map_page, switch_address_space, unmap_page};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{PageTable, TableIndex, TableLevel, compose_address};
pub use crate::phys_mapper::{FrameBytes, HhdmPhysMapper, PhysMapper};
pub use crate::tlb::{LocalShootdown, TlbFlush, TlbFlushAll, TlbShootdown};
