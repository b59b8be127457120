//! # Typed `X84_64` Registers
//!
//! Only the registers the address-space code touches: [`Cr3`] (active
//! top-level table) and [`Rflags`] (initial flags of a user task).
//! Privileged accessors are compiled with the `asm` feature on `x86_64`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod cr3;
mod rflags;

pub use cr3::Cr3;
pub use rflags::Rflags;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}
