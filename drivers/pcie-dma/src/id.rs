//! # Identity Matcher
//!
//! Decides whether a discovered device should be bound by this driver.

use pcidma_core::{PciDeviceId, PciDeviceInfo};

/// Wildcard vendor or device ID
pub const PCI_ANY_ID: u16 = 0xFFFF;

/// Identities the PCIe DMA devices report
pub const PCIE_DMA_IDS: &[PciDeviceId] = &[PciDeviceId::new(0x1234, 0x5678)];

/// Static (vendor, device) table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdTable {
    ids: &'static [PciDeviceId],
}

impl IdTable {
    /// Table for the PCIe DMA devices
    pub const DEFAULT: Self = Self::new(PCIE_DMA_IDS);

    /// Wrap a static table
    pub const fn new(ids: &'static [PciDeviceId]) -> Self {
        Self { ids }
    }

    /// Entries in the table
    pub fn ids(&self) -> &'static [PciDeviceId] {
        self.ids
    }

    /// Check for an empty table
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Entry matching `id`, if any
    pub fn lookup(&self, id: PciDeviceId) -> Option<&'static PciDeviceId> {
        self.ids.iter().find(|entry| {
            (entry.vendor == PCI_ANY_ID || entry.vendor == id.vendor)
                && (entry.device == PCI_ANY_ID || entry.device == id.device)
        })
    }

    /// Should this driver bind `info`
    pub fn matches(&self, info: &PciDeviceInfo) -> bool {
        self.lookup(info.id).is_some()
    }
}

impl Default for IdTable {
    fn default() -> Self {
        Self::DEFAULT
    }
}
