//! # PCIe DMA Driver
//!
//! Hardware-resource lifecycle and DMA-mapping manager for PCI-Express DMA
//! devices.
//!
//! Binding a device walks a strictly ordered acquisition sequence. Each step
//! yields an owned guard that releases its resource on drop, so a failure at
//! any step unwinds exactly the steps already taken, in reverse order.
//!
//! ## Lifecycle
//!
//! ```text
//! Unbound ─▶ Enabling ─▶ RegionsReserved ─▶ RegistersMapped
//!                                                 │
//!   Active ◀─ InterruptArmed ◀─ DmaAllocated ◀────┘
//! ```
//!
//! ## Components
//!
//! - **id**: identity matcher (vendor/device table)
//! - **resource**: device enable, region reservation, bus-mastering
//! - **window**: CPU mapping of the register BAR
//! - **dma**: coherent buffer allocator and descriptor
//! - **irq**: interrupt bridge and completion signal
//! - **mapping**: zero-copy user mapping exporter
//! - **binding**: acquisition/teardown state machine and instance record
//! - **node**: device node, minors and sessions
//! - **driver**: instance table, probe/remove/open

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod binding;
pub mod config;
pub mod dma;
pub mod driver;
pub mod id;
pub mod irq;
pub mod mapping;
pub mod node;
pub mod resource;
pub mod window;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use binding::{BindError, BindStep, DeviceInstance, LifecycleState};
pub use config::{DriverConfig, RegisterLayout};
pub use dma::{DmaBuffer, DmaBufferDescriptor};
pub use driver::PcieDmaDriver;
pub use id::IdTable;
pub use irq::{Completion, InterruptRegistration, InterruptStats};
pub use mapping::UserMapping;
pub use node::{DeviceNode, MinorMap, Session};
pub use pcidma_core::{Error, Result};
