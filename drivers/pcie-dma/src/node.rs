//! # Device Nodes and Sessions
//!
//! Each bound instance publishes one node, `<driver-name><minor>`, as the
//! last bind step. User space opens it to get a [`Session`], through which
//! it maps the buffer, starts transfers and waits for completions.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;

use pcidma_core::{Error, PciAddr, Result};
use pcidma_hal::{NodeId, Platform};
use spin::Mutex;

use crate::binding::DeviceInstance;
use crate::dma::DmaBufferDescriptor;
use crate::irq::InterruptStats;
use crate::mapping::UserMapping;

/// Minor numbers available per driver
pub const MAX_MINORS: u32 = 64;

// =============================================================================
// MINOR ALLOCATION
// =============================================================================

/// Bitmap of minor numbers in use
#[derive(Debug, Default)]
pub struct MinorMap {
    used: Mutex<u64>,
}

impl MinorMap {
    /// Create an empty map
    pub const fn new() -> Self {
        Self {
            used: Mutex::new(0),
        }
    }

    /// Take the lowest free minor
    pub fn alloc(&self) -> Result<u32> {
        let mut used = self.used.lock();
        let minor = (!*used).trailing_zeros();
        if minor >= MAX_MINORS {
            return Err(Error::Busy);
        }
        *used |= 1 << minor;
        Ok(minor)
    }

    /// Return a minor
    pub fn free(&self, minor: u32) {
        if minor < MAX_MINORS {
            *self.used.lock() &= !(1 << minor);
        }
    }

    /// Minors currently taken
    pub fn in_use(&self) -> u32 {
        self.used.lock().count_ones()
    }
}

// =============================================================================
// DEVICE NODE
// =============================================================================

/// A published device node
#[derive(Debug)]
pub struct DeviceNode<P: Platform> {
    platform: Arc<P>,
    dev: PciAddr,
    minors: Arc<MinorMap>,
    id: NodeId,
    name: String,
}

impl<P: Platform> DeviceNode<P> {
    /// Publish `<base><minor>` for `dev`
    pub fn create(
        platform: &Arc<P>,
        dev: PciAddr,
        minors: &Arc<MinorMap>,
        base: &str,
    ) -> Result<Self> {
        let minor = minors.alloc()?;
        let name = format!("{}{}", base, minor);
        let id = match platform.create_node(dev, &name, minor) {
            Ok(id) => id,
            Err(e) => {
                minors.free(minor);
                return Err(e);
            },
        };
        log::info!("{}: created /dev/{} ({:?})", dev, name, id);

        Ok(Self {
            platform: Arc::clone(platform),
            dev,
            minors: Arc::clone(minors),
            id,
            name,
        })
    }

    /// Node name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node identity
    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl<P: Platform> Drop for DeviceNode<P> {
    fn drop(&mut self) {
        self.platform.destroy_node(self.dev, self.id);
        self.minors.free(self.id.minor);
        log::info!("{}: removed /dev/{}", self.dev, self.name);
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// An open handle on a device node
///
/// Closing the session (dropping it, or [`Session::release`]) does not
/// affect the binding; mappings made through it stay valid until dropped
/// or revoked.
#[derive(Debug)]
pub struct Session<P: Platform> {
    instance: Arc<DeviceInstance<P>>,
    id: u64,
}

impl<P: Platform> Session<P> {
    pub(crate) fn open(instance: Arc<DeviceInstance<P>>, id: u64) -> Result<Self> {
        if !instance.state().is_active() {
            return Err(Error::NotBound);
        }
        log::info!("{}: session {} opened", instance.node_name(), id);
        Ok(Self { instance, id })
    }

    /// Session number
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Node the session was opened on
    pub fn node_name(&self) -> &str {
        self.instance.node_name()
    }

    /// Buffer descriptor
    pub fn descriptor(&self) -> DmaBufferDescriptor {
        self.instance.descriptor()
    }

    /// Map `size` bytes of the buffer at `offset`
    pub fn mmap(&self, size: u64, offset: u64) -> Result<UserMapping<P>> {
        self.instance.map_into_process(size, offset)
    }

    /// Kick off a transfer of `len` bytes at `offset`
    pub fn start_transfer(&self, offset: u64, len: u64) -> Result<()> {
        self.instance.start_transfer(offset, len)
    }

    /// Block until the next completion
    pub fn wait_for_interrupt(&self) -> Result<()> {
        self.instance.wait_for_interrupt()
    }

    /// Consume a completion without blocking
    pub fn try_wait(&self) -> Result<bool> {
        self.instance.try_wait_interrupt()
    }

    /// Copy out of the buffer
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.instance.read_buffer(offset, buf)
    }

    /// Copy into the buffer
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.instance.write_buffer(offset, data)
    }

    /// Interrupt counters of the device
    pub fn interrupt_stats(&self) -> InterruptStats {
        self.instance.interrupt_stats()
    }

    /// Close the session
    pub fn release(self) {}
}

impl<P: Platform> Drop for Session<P> {
    fn drop(&mut self) {
        log::info!("{}: session {} closed", self.instance.node_name(), self.id);
    }
}
