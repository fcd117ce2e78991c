//! Boot stage that loads the Info blob, kernel image, device tree and initrd
//! from three mirrored partitions, keeps only copies that match their hash
//! records, and hands the staged artifacts to `booti`.
//!
//! Storage and memory access go through [`shared::storage::BlockDevice`] and
//! [`shared::memory::PhysMemory`]; the environment, autoboot countdown, the
//! handoff itself and the recovery shell go through [`BootEnv`].

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod assembly;
pub mod boot;
pub mod cmdline;

pub use assembly::{assemble, BootError, BootPlan, Outcome, Outcomes, Staged};
pub use boot::{main_loop, BootEnv, RecoveryReason};
pub use cmdline::{kernel_cmdline, BootCommand, Environment};
