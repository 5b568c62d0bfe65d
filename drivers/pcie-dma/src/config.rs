//! # Driver Configuration
//!
//! Compile-time defaults with `const` builders, kernel style.

use pcidma_core::{is_page_aligned, ByteSize, Error, Result};
use pcidma_hal::MAX_BARS;
use static_assertions::const_assert;

use crate::id::IdTable;

/// Driver and device-node base name
pub const DRIVER_NAME: &str = "pcie_dma";

/// Default coherent buffer size (4 MiB)
pub const DMA_BUF_SIZE: ByteSize = ByteSize::from_mib(4);

const_assert!(is_page_aligned(DMA_BUF_SIZE.as_bytes()));

// =============================================================================
// REGISTER LAYOUT
// =============================================================================

/// Offsets of the registers the driver touches, relative to the register BAR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout {
    /// DMA bus address (64-bit, low word first)
    pub dma_addr: u32,
    /// DMA length in bytes
    pub dma_len: u32,
    /// Write 1 to start a transfer
    pub dma_start: u32,
    /// Write to acknowledge (de-assert) the interrupt
    pub irq_ack: u32,
    /// Non-zero while the device has an interrupt pending
    pub irq_status: u32,
}

impl RegisterLayout {
    /// Layout of the PCIe DMA device
    pub const DEFAULT: Self = Self {
        dma_addr: 0x00,
        dma_len: 0x08,
        dma_start: 0x10,
        irq_ack: 0x18,
        irq_status: 0x1c,
    };

    fn offsets(&self) -> [u32; 6] {
        [
            self.dma_addr,
            self.dma_addr + 4,
            self.dma_len,
            self.dma_start,
            self.irq_ack,
            self.irq_status,
        ]
    }

    /// Smallest window that covers every register
    pub fn span(&self) -> u64 {
        self.offsets().iter().map(|&o| o as u64 + 4).max().unwrap_or(0)
    }

    /// All offsets must be 32-bit aligned
    pub fn validate(&self) -> Result<()> {
        if self.dma_addr > u32::MAX - 4 || self.offsets().iter().any(|o| o % 4 != 0) {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for RegisterLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// =============================================================================
// DRIVER CONFIG
// =============================================================================

/// Driver configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// Driver name; also the device-node prefix and iomem owner tag
    pub name: &'static str,
    /// Devices to bind
    pub id_table: IdTable,
    /// Coherent buffer size per device
    pub buffer_size: ByteSize,
    /// BAR holding the control registers
    pub register_bar: u8,
    /// Accept sharing the interrupt line
    pub shared_irq: bool,
    /// Register offsets
    pub registers: RegisterLayout,
}

impl DriverConfig {
    /// Defaults for the PCIe DMA device
    pub const DEFAULT: Self = Self {
        name: DRIVER_NAME,
        id_table: IdTable::DEFAULT,
        buffer_size: DMA_BUF_SIZE,
        register_bar: 0,
        shared_irq: true,
        registers: RegisterLayout::DEFAULT,
    };

    /// Set the driver name
    pub const fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Set the identity table
    pub const fn with_id_table(mut self, id_table: IdTable) -> Self {
        self.id_table = id_table;
        self
    }

    /// Set the buffer size
    pub const fn with_buffer_size(mut self, size: ByteSize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the register BAR
    pub const fn with_register_bar(mut self, bar: u8) -> Self {
        self.register_bar = bar;
        self
    }

    /// Choose shared or exclusive interrupt
    pub const fn with_shared_irq(mut self, shared: bool) -> Self {
        self.shared_irq = shared;
        self
    }

    /// Set register offsets
    pub const fn with_registers(mut self, registers: RegisterLayout) -> Self {
        self.registers = registers;
        self
    }

    /// Reject configurations no device could be bound with
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.id_table.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if self.buffer_size.is_zero() || !is_page_aligned(self.buffer_size.as_bytes()) {
            return Err(Error::InvalidArgument);
        }
        if self.register_bar >= MAX_BARS {
            return Err(Error::InvalidArgument);
        }
        self.registers.validate()
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
