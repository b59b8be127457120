//! # Physical Frame Allocation
//!
//! The only component with direct knowledge of how much physical memory the
//! machine has. Everything above it (page tables, kernel stacks, copied
//! copy-on-write pages) obtains 4 KiB frames through the [`FrameAlloc`] trait.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │   Page tables / Cloner / Task constructor           │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ FrameAlloc (allocate/free/share/release)
//! ┌─────────────────▼───────────────────────────────────┐
//! │   &'static SpinLock<BitmapFrameAlloc>               │
//! │    • one lock per scan-and-claim or clear           │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │   BitmapFrameAlloc                                  │
//! │    • one bit per frame, set = claimed               │
//! │    • first-fit by ascending index, word by word     │
//! │    • per-frame reference counts for shared pages    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Orders
//!
//! Allocations are made in runs of `2^order` contiguous frames. A run is
//! always aligned to its own size, so an order-1 kernel stack starts on an
//! even frame and an order-6 run starts on a bitmap word boundary.
//!
//! ## Reference counts
//!
//! The first frame of every live allocation carries a reference count,
//! starting at 1. Copy-on-write sharing bumps it through
//! [`FrameAlloc::share`]; every mapping that goes away drops it through
//! [`FrameAlloc::release`], and the frame is returned to the bitmap when the
//! last reference disappears. [`FrameAlloc::free`] is the exclusive-owner
//! path and refuses to free a frame somebody else still references.
//!
//! ## Global instance
//!
//! [`init_frames`] builds the allocator from the boot memory map once, and
//! [`frames`] hands out the process-wide `&'static SpinLock<_>`, which itself
//! implements [`FrameAlloc`] by locking for the duration of each call.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod bitmap;
mod frame_alloc;
mod global;

pub use bitmap::{BitmapFrameAlloc, MAX_ORDER};
pub use frame_alloc::{FrameAlloc, FrameAllocError};
pub use global::{GlobalFrames, frames, init_frames};
