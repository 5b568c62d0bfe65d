//! # PCIe DMA HAL
//!
//! Hardware abstraction for the PCIe DMA driver core.
//!
//! The driver never touches the bus, the interrupt controller or the page
//! tables directly. Everything goes through the [`Platform`] trait defined
//! here, so the same acquisition and teardown logic runs on a real kernel
//! and on the host-memory [`sim`] platform used by the tests.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Platform                             │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────────┐ ┌──────────────┐ │
//! │  │  PciBus  │ │  DmaOps  │ │IrqController │ │ UserMemory / │ │
//! │  │ (BARs,   │ │(coherent │ │ (shared line │ │ NodeRegistry │ │
//! │  │  iomem)  │ │ buffers) │ │  dispatch)   │ │              │ │
//! │  └──────────┘ └──────────┘ └──────────────┘ └──────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod bar;
pub mod irq;
pub mod platform;
pub mod resource;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use bar::{BarInfo, BarPrefetch, BarType, MAX_BARS};
pub use irq::{InterruptHandler, IrqCookie, IrqFlags, IrqLineTable, IrqReturn};
pub use platform::{
    DmaOps, IrqController, MappingFlags, NodeId, NodeRegistry, PciBus, Platform, PlatformCaps,
    UserMemory,
};
pub use resource::IoResourceTree;
