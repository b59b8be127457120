//! # Kernel synchronization primitives
//!
//! * [`SpinLock`] guards state shared between processors for short,
//!   non-blocking critical sections (the frame bitmap, per-process page
//!   tables, task state).
//! * [`SyncOnceCell`] holds process-wide state that is initialized exactly
//!   once at boot and read-only afterwards.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;
mod sync_once_cell;

pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
