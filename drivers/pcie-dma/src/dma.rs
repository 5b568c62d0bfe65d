//! # DMA Buffer Allocator
//!
//! One physically contiguous, cache-coherent buffer per bound device.
//!
//! The buffer is known by two addresses: the CPU address the driver uses,
//! and the bus address the device is programmed with. They are not
//! interchangeable, so they carry different types and every bus address
//! handed to the device is computed here, from the descriptor.
//!
//! The memory itself is described by a shared [`DmaRegion`]. User mappings
//! hold the region, not the buffer; when the buffer is freed the region is
//! revoked first, so no mapping can reach freed memory.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr;

use pcidma_core::{BusAddr, ByteSize, CpuAddr, Error, PciAddr, Result, UserAddr};
use pcidma_hal::Platform;
use spin::RwLock;

// =============================================================================
// DESCRIPTOR
// =============================================================================

/// Addresses and size of a coherent buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBufferDescriptor {
    /// Address the CPU uses
    pub cpu_address: CpuAddr,
    /// Address the device uses
    pub bus_address: BusAddr,
    /// Size in bytes (page multiple)
    pub length_bytes: ByteSize,
    /// Whether the buffer is currently allocated
    pub allocated: bool,
}

impl DmaBufferDescriptor {
    /// Descriptor of no buffer
    pub const fn empty() -> Self {
        Self {
            cpu_address: CpuAddr::null(),
            bus_address: BusAddr::null(),
            length_bytes: ByteSize::ZERO,
            allocated: false,
        }
    }

    /// Allocated descriptors have both addresses and a length; empty ones
    /// have none of them
    pub fn is_consistent(&self) -> bool {
        let populated = !self.cpu_address.is_null()
            && !self.bus_address.is_null()
            && !self.length_bytes.is_zero();
        let cleared = self.cpu_address.is_null()
            && self.bus_address.is_null()
            && self.length_bytes.is_zero();
        if self.allocated {
            populated
        } else {
            cleared
        }
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        if !self.allocated {
            return Err(Error::NotBound);
        }
        let end = offset.checked_add(len).ok_or(Error::InvalidArgument)?;
        if end > self.length_bytes.as_bytes() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Bus address of `offset`, for a device access of `len` bytes
    pub fn bus_address_at(&self, offset: u64, len: u64) -> Result<BusAddr> {
        self.check_range(offset, len)?;
        Ok(self.bus_address.offset(offset))
    }
}

impl Default for DmaBufferDescriptor {
    fn default() -> Self {
        Self::empty()
    }
}

// =============================================================================
// REGION
// =============================================================================

#[derive(Debug)]
struct RegionState {
    live: bool,
    mappings: Vec<(UserAddr, ByteSize)>,
}

/// Coherent memory shared by a buffer and its user mappings
#[derive(Debug)]
pub struct DmaRegion {
    desc: DmaBufferDescriptor,
    state: RwLock<RegionState>,
}

impl DmaRegion {
    fn new(desc: DmaBufferDescriptor) -> Self {
        Self {
            desc,
            state: RwLock::new(RegionState {
                live: true,
                mappings: Vec::new(),
            }),
        }
    }

    /// Descriptor, or the empty descriptor once revoked
    pub fn descriptor(&self) -> DmaBufferDescriptor {
        if self.state.read().live {
            self.desc
        } else {
            DmaBufferDescriptor::empty()
        }
    }

    /// Has the buffer been freed
    pub fn is_revoked(&self) -> bool {
        !self.state.read().live
    }

    /// Number of user mappings attached
    pub fn mapping_count(&self) -> usize {
        self.state.read().mappings.len()
    }

    /// Copy bytes out of the buffer
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        // Held across the copy: revocation waits for us
        let state = self.state.read();
        if !state.live {
            return Err(Error::NotBound);
        }
        self.desc.check_range(offset, buf.len() as u64)?;
        // SAFETY: range checked against the live allocation
        unsafe {
            ptr::copy_nonoverlapping(
                self.desc.cpu_address.offset(offset as usize).as_ptr(),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Copy bytes into the buffer
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let state = self.state.read();
        if !state.live {
            return Err(Error::NotBound);
        }
        self.desc.check_range(offset, data.len() as u64)?;
        // SAFETY: range checked against the live allocation
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.desc.cpu_address.offset(offset as usize).as_ptr(),
                data.len(),
            );
        }
        Ok(())
    }

    pub(crate) fn attach(&self, user: UserAddr, len: ByteSize) -> Result<()> {
        let mut state = self.state.write();
        if !state.live {
            return Err(Error::NotBound);
        }
        state.mappings.push((user, len));
        Ok(())
    }

    /// Forget a mapping; `None` if it was already revoked
    pub(crate) fn detach(&self, user: UserAddr) -> Option<ByteSize> {
        let mut state = self.state.write();
        let pos = state.mappings.iter().position(|&(u, _)| u == user)?;
        Some(state.mappings.swap_remove(pos).1)
    }

    /// Mark the region dead and hand back the mappings still attached
    fn revoke(&self) -> Vec<(UserAddr, ByteSize)> {
        let mut state = self.state.write();
        state.live = false;
        core::mem::take(&mut state.mappings)
    }
}

// =============================================================================
// BUFFER
// =============================================================================

/// An allocated coherent buffer
#[derive(Debug)]
pub struct DmaBuffer<P: Platform> {
    platform: Arc<P>,
    dev: PciAddr,
    region: Arc<DmaRegion>,
}

impl<P: Platform> DmaBuffer<P> {
    /// Allocate `size` bytes (rounded up to whole pages) for `dev`
    pub fn allocate(platform: &Arc<P>, dev: PciAddr, size: ByteSize) -> Result<Self> {
        let size = size
            .page_aligned()
            .filter(|s| !s.is_zero())
            .ok_or(Error::InvalidArgument)?;

        let caps = platform.caps();
        if !caps.coherent_dma {
            log::warn!("{}: platform has no coherent DMA", dev);
            return Err(Error::OutOfMemory);
        }

        let (cpu, bus) = platform.alloc_coherent(dev, size)?;
        if cpu.is_null() || bus.is_null() {
            return Err(Error::OutOfMemory);
        }
        if !caps.dma_reachable(bus.raw(), size.as_bytes()) {
            log::warn!(
                "{}: buffer at {} is beyond the {}-bit DMA limit",
                dev,
                bus,
                caps.dma_bits
            );
            platform.free_coherent(dev, size, cpu, bus);
            return Err(Error::OutOfMemory);
        }
        log::info!(
            "{}: DMA buffer of {} at cpu {:?}, bus {}",
            dev,
            size,
            cpu,
            bus
        );

        let desc = DmaBufferDescriptor {
            cpu_address: cpu,
            bus_address: bus,
            length_bytes: size,
            allocated: true,
        };
        Ok(Self {
            platform: Arc::clone(platform),
            dev,
            region: Arc::new(DmaRegion::new(desc)),
        })
    }

    /// Device the buffer belongs to
    pub fn addr(&self) -> PciAddr {
        self.dev
    }

    /// Platform the buffer was allocated on
    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    /// Current descriptor
    pub fn descriptor(&self) -> DmaBufferDescriptor {
        self.region.descriptor()
    }

    /// Shared region for mappings
    pub fn region(&self) -> &Arc<DmaRegion> {
        &self.region
    }

    /// Copy bytes out of the buffer
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.region.read(offset, buf)
    }

    /// Copy bytes into the buffer
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.region.write(offset, data)
    }
}

impl<P: Platform> Drop for DmaBuffer<P> {
    fn drop(&mut self) {
        let desc = self.region.desc;
        let stale = self.region.revoke();
        if !stale.is_empty() {
            log::warn!(
                "{}: revoking {} user mapping(s) of the DMA buffer",
                self.dev,
                stale.len()
            );
        }
        for (user, len) in stale {
            self.platform.unmap_user(self.dev, user, len);
        }
        self.platform.free_coherent(
            self.dev,
            desc.length_bytes,
            desc.cpu_address,
            desc.bus_address,
        );
        log::debug!("{}: DMA buffer freed", self.dev);
    }
}
