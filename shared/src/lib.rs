//! Shared utilities and self-contained helpers
//!
//! This crate contains everything the boot stage needs that can be tested on
//! the host: the board layout and its extent arithmetic, the storage and
//! memory boundaries, triple-mirror verification, and Info blob parsing. Unit
//! testing is a big motivation for this crate.
//!
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(test), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod digest;
#[cfg(feature = "alloc")]
pub mod image;
pub mod info;
pub mod layout;
pub mod log;
pub mod memory;
pub mod storage;
#[cfg(feature = "alloc")]
pub mod tmr;
