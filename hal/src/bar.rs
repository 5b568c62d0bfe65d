//! # BAR (Base Address Register) Description
//!
//! Describes the register ranges a PCI function exposes.

use pcidma_core::{ByteSize, Error, PciError, PhysAddr, Result};

/// Number of standard BARs in a type-0 configuration header
pub const MAX_BARS: u8 = 6;

// =============================================================================
// BAR TYPES
// =============================================================================

/// BAR type (memory or I/O)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarType {
    /// Memory BAR (32-bit)
    Memory32,
    /// Memory BAR (64-bit)
    Memory64,
    /// I/O BAR
    Io,
    /// Disabled/empty BAR
    Disabled,
}

/// BAR prefetchable flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarPrefetch {
    /// Non-prefetchable (MMIO registers)
    NonPrefetchable,
    /// Prefetchable (memory apertures)
    Prefetchable,
}

// =============================================================================
// BAR INFO
// =============================================================================

/// Information about a single BAR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarInfo {
    /// BAR index (0-5)
    pub index: u8,
    /// BAR type
    pub bar_type: BarType,
    /// Prefetchable flag
    pub prefetch: BarPrefetch,
    /// Physical base address
    pub base: PhysAddr,
    /// BAR size
    pub size: ByteSize,
}

impl BarInfo {
    /// Non-prefetchable 32-bit memory BAR
    pub const fn mmio(index: u8, base: PhysAddr, size: ByteSize) -> Self {
        Self {
            index,
            bar_type: BarType::Memory32,
            prefetch: BarPrefetch::NonPrefetchable,
            base,
            size,
        }
    }

    /// Empty BAR slot
    pub const fn disabled(index: u8) -> Self {
        Self {
            index,
            bar_type: BarType::Disabled,
            prefetch: BarPrefetch::NonPrefetchable,
            base: PhysAddr::new(0),
            size: ByteSize::ZERO,
        }
    }

    /// Check if BAR is valid/enabled
    pub fn is_enabled(&self) -> bool {
        self.bar_type != BarType::Disabled && !self.size.is_zero()
    }

    /// Check if BAR is memory mapped (and so can be iomapped)
    pub fn is_memory(&self) -> bool {
        matches!(self.bar_type, BarType::Memory32 | BarType::Memory64)
    }

    /// Exclusive end of the range
    pub fn end(&self) -> u64 {
        self.base.raw().saturating_add(self.size.as_bytes())
    }

    /// Validate a BAR index
    pub fn check_index(index: u8) -> Result<()> {
        if index < MAX_BARS {
            Ok(())
        } else {
            Err(Error::Pci(PciError::NoSuchBar))
        }
    }
}
