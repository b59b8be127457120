//! # Tasks
//!
//! Construction of new tasks (`fork`) and replacement of a task's user image
//! (`exec`).
//!
//! Threads of one process share a single [`SharedAddressSpace`]; it is
//! destroyed when the last of them is reaped.
//!
//! ## Kernel stack at hand-off
//!
//! Every task is handed to the scheduler with a kernel stack that the
//! generic context-switch restore sequence can pop without knowing what kind
//! of task it resumes:
//!
//! ```text
//!   user task                     kernel thread
//!  ┌──────────────┐ top          ┌──────────────┐ top
//!  │ ss           │              │ entry        │
//!  │ rsp (user)   │              │ kthread mark │
//!  │ rflags 0x202 │              │ rbx          │
//!  │ cs           │              │ rbp          │
//!  │ rip (entry)  │              │ r12 … r15    │ ← rsp_top
//!  │ fork mark    │              └──────────────┘
//!  │ rbx          │
//!  │ rbp          │
//!  │ r12 … r15    │ ← rsp_top
//!  └──────────────┘
//! ```
//!
//! The restore sequence pops `r15 … rbx` and returns into the marker, which
//! either `iretq`s through the simulated interrupt frame into user mode or
//! calls the kernel thread's entry point.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod exec;
mod fork;
mod pid;
mod stack;
mod task;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use crate::exec::replace_image;
pub use crate::exec::{ExecError, UserEntry, prepare_image};
pub use crate::fork::{ForkError, ResumePoints, Scheduler, TaskConstructor};
pub use crate::pid::Pid;
pub use crate::stack::{IretFrame, KernelStack, KernelThreadFrame, SavedFrame, UserForkFrame};
pub use crate::task::{CalleeSavedRegisters, SharedAddressSpace, Task, TaskFlags, TaskState};
