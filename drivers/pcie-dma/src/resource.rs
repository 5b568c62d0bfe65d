//! # Resource Reservation Manager
//!
//! Enables the device and claims its address ranges. Both are held by guards
//! whose `Drop` gives the resource back, so callers cannot forget a release
//! and cannot release twice.

use alloc::sync::Arc;

use arrayvec::ArrayVec;
use pcidma_core::{Error, PciAddr, PciError, Result};
use pcidma_hal::{BarInfo, Platform, MAX_BARS};

// =============================================================================
// ENABLED DEVICE
// =============================================================================

/// A device that has been enabled on the bus
#[derive(Debug)]
pub struct EnabledDevice<P: Platform> {
    platform: Arc<P>,
    dev: PciAddr,
}

impl<P: Platform> EnabledDevice<P> {
    /// Enable `dev`
    pub fn enable(platform: &Arc<P>, dev: PciAddr) -> Result<Self> {
        platform.enable_device(dev)?;
        log::debug!("{}: device enabled", dev);
        Ok(Self {
            platform: Arc::clone(platform),
            dev,
        })
    }

    /// Bus address of the device
    pub fn addr(&self) -> PciAddr {
        self.dev
    }

    /// Platform the device lives on
    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }
}

impl<P: Platform> Drop for EnabledDevice<P> {
    fn drop(&mut self) {
        self.platform.disable_device(self.dev);
        log::debug!("{}: device disabled", self.dev);
    }
}

// =============================================================================
// RESERVED REGIONS
// =============================================================================

/// Exclusive claim on every BAR of a device, with bus-mastering on
#[derive(Debug)]
pub struct ResourceHandle<P: Platform> {
    platform: Arc<P>,
    dev: PciAddr,
    bars: ArrayVec<BarInfo, { MAX_BARS as usize }>,
}

impl<P: Platform> ResourceHandle<P> {
    /// Claim the device's regions for `owner`
    ///
    /// The claim is all or nothing: on `Busy` no range stays claimed.
    pub fn reserve(device: &EnabledDevice<P>, owner: &'static str) -> Result<Self> {
        let platform = device.platform();
        let dev = device.addr();

        let mut bars = ArrayVec::new();
        for index in 0..MAX_BARS {
            bars.push(platform.bar_info(dev, index)?);
        }

        platform.request_regions(dev, owner)?;
        platform.set_bus_master(dev, true);
        log::debug!(
            "{}: {} region(s) reserved for {}, bus mastering on",
            dev,
            bars.iter().filter(|b| b.is_enabled()).count(),
            owner
        );

        Ok(Self {
            platform: Arc::clone(platform),
            dev,
            bars,
        })
    }

    /// Bus address of the device
    pub fn addr(&self) -> PciAddr {
        self.dev
    }

    /// Platform the regions were claimed on
    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    /// Description of a claimed BAR
    pub fn bar(&self, index: u8) -> Result<BarInfo> {
        BarInfo::check_index(index)?;
        let bar = *self
            .bars
            .get(index as usize)
            .ok_or(Error::Pci(PciError::NoSuchBar))?;
        if !bar.is_enabled() {
            return Err(PciError::BarDisabled.into());
        }
        Ok(bar)
    }
}

impl<P: Platform> Drop for ResourceHandle<P> {
    fn drop(&mut self) {
        self.platform.set_bus_master(self.dev, false);
        self.platform.release_regions(self.dev);
        log::debug!("{}: regions released", self.dev);
    }
}
