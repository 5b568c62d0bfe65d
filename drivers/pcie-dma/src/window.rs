//! # Register Window
//!
//! CPU-side mapping of the control-register BAR. Accesses are 32-bit,
//! volatile and bounds-checked against the mapped length.

use alloc::sync::Arc;
use core::ptr;

use pcidma_core::{CpuAddr, Error, PciAddr, Result};
use pcidma_hal::{BarInfo, Platform};

use crate::config::RegisterLayout;
use crate::resource::ResourceHandle;

// =============================================================================
// MMIO HANDLE
// =============================================================================

/// Raw view of a mapped register range
///
/// Copied into the interrupt handler, which must not take locks to reach
/// the registers. The owner of the mapping guarantees the handle is not
/// used after the range is unmapped.
#[derive(Debug, Clone, Copy)]
pub struct MmioHandle {
    base: CpuAddr,
    len: u64,
}

impl MmioHandle {
    /// Wrap a mapped range
    ///
    /// # Safety
    ///
    /// `base..base + len` must be mapped device memory for as long as the
    /// handle (or any copy of it) is used.
    pub const unsafe fn new(base: CpuAddr, len: u64) -> Self {
        Self { base, len }
    }

    /// Start of the range
    pub fn base(&self) -> CpuAddr {
        self.base
    }

    /// Length of the range in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Check for an empty range
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: u32) -> Result<*mut u32> {
        if offset % 4 != 0 {
            return Err(Error::InvalidArgument);
        }
        if offset as u64 + 4 > self.len {
            return Err(Error::OutOfBounds);
        }
        Ok(self.base.offset(offset as usize).as_ptr().cast::<u32>())
    }

    /// Read a 32-bit register
    #[inline]
    pub fn read32(&self, offset: u32) -> Result<u32> {
        let reg = self.check(offset)?;
        // SAFETY: in bounds and aligned; the range is mapped per `new`
        Ok(unsafe { ptr::read_volatile(reg) })
    }

    /// Write a 32-bit register
    #[inline]
    pub fn write32(&self, offset: u32, value: u32) -> Result<()> {
        let reg = self.check(offset)?;
        // SAFETY: in bounds and aligned; the range is mapped per `new`
        unsafe { ptr::write_volatile(reg, value) };
        Ok(())
    }
}

// =============================================================================
// REGISTER WINDOW
// =============================================================================

/// A BAR mapped into CPU address space
#[derive(Debug)]
pub struct RegisterWindow<P: Platform> {
    platform: Arc<P>,
    dev: PciAddr,
    bar: BarInfo,
    mmio: MmioHandle,
}

impl<P: Platform> RegisterWindow<P> {
    /// Map BAR `index` of a device whose regions are reserved
    pub fn map(regions: &ResourceHandle<P>, index: u8) -> Result<Self> {
        let bar = regions.bar(index)?;
        if !bar.is_memory() {
            return Err(Error::MapFailed);
        }

        let platform = regions.platform();
        let dev = regions.addr();
        let base = platform.iomap(dev, &bar)?;
        if base.is_null() {
            return Err(Error::MapFailed);
        }
        log::debug!("{}: BAR{} mapped at {:?} ({})", dev, index, base, bar.size);

        Ok(Self {
            platform: Arc::clone(platform),
            dev,
            bar,
            // SAFETY: iomap returned a mapping of the whole BAR; it is
            // unmapped only when this window drops
            mmio: unsafe { MmioHandle::new(base, bar.size.as_bytes()) },
        })
    }

    /// The mapped BAR
    pub fn bar(&self) -> &BarInfo {
        &self.bar
    }

    /// Raw handle for interrupt context
    pub fn mmio(&self) -> MmioHandle {
        self.mmio
    }

    /// Is `offset` a readable register
    pub fn is_valid(&self, offset: u32) -> bool {
        self.mmio.check(offset).is_ok()
    }

    /// Fail with `OutOfBounds` unless every register of `layout` is mapped
    pub fn check_layout(&self, layout: &RegisterLayout) -> Result<()> {
        if layout.span() > self.mmio.len() {
            log::warn!(
                "{}: BAR{} is {} but registers need {:#x} bytes",
                self.dev,
                self.bar.index,
                self.bar.size,
                layout.span()
            );
            return Err(Error::OutOfBounds);
        }
        Ok(())
    }

    /// Read a 32-bit register
    pub fn read32(&self, offset: u32) -> Result<u32> {
        self.mmio.read32(offset)
    }

    /// Write a 32-bit register
    pub fn write32(&self, offset: u32, value: u32) -> Result<()> {
        self.mmio.write32(offset, value)
    }
}

impl<P: Platform> Drop for RegisterWindow<P> {
    fn drop(&mut self) {
        self.platform
            .iounmap(self.dev, self.mmio.base(), self.bar.size);
        log::debug!("{}: BAR{} unmapped", self.dev, self.bar.index);
    }
}
