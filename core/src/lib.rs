//! # PCIe DMA Core
//!
//! Shared types for the PCIe DMA driver core.
//!
//! The driver reasons about three address spaces at once. Each one gets its
//! own newtype so that a CPU pointer can never be handed to the device, and a
//! bus address can never be dereferenced by the CPU.
//!
//! ## Address spaces
//!
//! ```text
//!   CPU virtual (CpuAddr) ──┐
//!                           ├── same physical memory (coherent DMA buffer)
//!   device bus  (BusAddr) ──┤
//!                           │
//!   user virtual (UserAddr)─┘   (zero-copy process mapping)
//! ```
//!
//! ## Components
//!
//! - **types**: addresses, sizes, PCI identity, interrupt lines
//! - **error**: unified error type for every layer of the driver

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

#[cfg(test)]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod types;

pub use error::{Error, PciError, Result};
pub use types::*;
