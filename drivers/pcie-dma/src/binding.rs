//! # Binding Controller
//!
//! Drives a matched device through the acquisition sequence and owns the
//! resulting instance record.
//!
//! ```text
//! step               guard                      released by
//! ────────────────── ────────────────────────── ───────────────────────
//! Enabling           EnabledDevice              disable_device
//! RegionsReserved    ResourceHandle             release_regions
//! RegistersMapped    RegisterWindow             iounmap
//! DmaAllocated       DmaBuffer                  free_coherent
//! InterruptArmed     InterruptRegistration      free_irq
//! NodeCreated        DeviceNode                 destroy_node
//! ```
//!
//! During [`DeviceInstance::bind`] each guard is a local. A failing step
//! returns early and the locals already created drop in reverse order,
//! which is exactly the unwind. Once every step has succeeded the guards
//! move into [`Resources`], whose teardown walks the same list backwards.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::fmt;

use pcidma_core::{Error, PciAddr, PciDeviceInfo, Result};
use pcidma_hal::platform::arch;
use pcidma_hal::Platform;
use spin::Mutex;

use crate::config::{DriverConfig, RegisterLayout};
use crate::dma::{DmaBuffer, DmaBufferDescriptor};
use crate::irq::{InterruptRegistration, InterruptStats, IrqContext};
use crate::mapping::UserMapping;
use crate::node::{DeviceNode, MinorMap};
use crate::resource::{EnabledDevice, ResourceHandle};
use crate::window::RegisterWindow;

// =============================================================================
// STEPS AND STATES
// =============================================================================

/// One step of the bind sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BindStep {
    /// Identity and duplicate check
    Matching = 0,
    /// Enable the device
    Enabling = 1,
    /// Claim BARs, turn on bus-mastering
    RegionsReserved = 2,
    /// Map the register BAR
    RegistersMapped = 3,
    /// Allocate the coherent buffer
    DmaAllocated = 4,
    /// Attach the interrupt handler
    InterruptArmed = 5,
    /// Publish the device node
    NodeCreated = 6,
}

impl BindStep {
    /// Every step acquiring a resource, in order
    pub const ACQUIRING: [Self; 6] = [
        Self::Enabling,
        Self::RegionsReserved,
        Self::RegistersMapped,
        Self::DmaAllocated,
        Self::InterruptArmed,
        Self::NodeCreated,
    ];

    /// Position in the sequence; also the number of resources held when
    /// this step starts
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Step name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Matching => "matching",
            Self::Enabling => "enabling",
            Self::RegionsReserved => "reserving regions",
            Self::RegistersMapped => "mapping registers",
            Self::DmaAllocated => "allocating DMA buffer",
            Self::InterruptArmed => "arming interrupt",
            Self::NodeCreated => "creating device node",
        }
    }
}

impl fmt::Display for BindStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of a device instance
///
/// Each intermediate state names the last resource held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing held
    Unbound,
    /// Device enabled
    Enabling,
    /// Regions claimed
    RegionsReserved,
    /// Registers mapped
    RegistersMapped,
    /// Buffer allocated
    DmaAllocated,
    /// Handler attached
    InterruptArmed,
    /// Node published, ready for use
    Active,
    /// Bind failed at the given step and was unwound
    Failed(BindStep),
}

impl LifecycleState {
    /// Is the instance usable
    pub fn is_active(self) -> bool {
        self == Self::Active
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbound => f.write_str("unbound"),
            Self::Enabling => f.write_str("enabled"),
            Self::RegionsReserved => f.write_str("regions reserved"),
            Self::RegistersMapped => f.write_str("registers mapped"),
            Self::DmaAllocated => f.write_str("DMA allocated"),
            Self::InterruptArmed => f.write_str("interrupt armed"),
            Self::Active => f.write_str("active"),
            Self::Failed(step) => write!(f, "failed while {}", step),
        }
    }
}

/// A bind failure and the step it happened at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindError {
    /// Step that failed
    pub step: BindStep,
    /// Why
    pub error: Error,
}

impl BindError {
    /// Create a bind error
    pub const fn new(step: BindStep, error: Error) -> Self {
        Self { step, error }
    }

    /// State the device was left in
    pub fn state(&self) -> LifecycleState {
        LifecycleState::Failed(self.step)
    }
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.step, self.error)
    }
}

impl From<BindError> for Error {
    fn from(e: BindError) -> Self {
        e.error
    }
}

#[inline]
fn trace_transition(dev: PciAddr, state: LifecycleState) {
    #[cfg(feature = "debug")]
    log::debug!("{}: -> {}", dev, state);
    #[cfg(not(feature = "debug"))]
    let _ = (dev, state);
}

// =============================================================================
// RESOURCES
// =============================================================================

/// Guards held by a bound instance
///
/// Fields are listed in teardown order.
#[derive(Debug)]
struct Resources<P: Platform> {
    state: LifecycleState,
    node: Option<DeviceNode<P>>,
    interrupt: Option<InterruptRegistration<P>>,
    dma: Option<DmaBuffer<P>>,
    window: Option<RegisterWindow<P>>,
    regions: Option<ResourceHandle<P>>,
    device: Option<EnabledDevice<P>>,
}

impl<P: Platform> Resources<P> {
    fn active(&self) -> Result<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(Error::NotBound)
        }
    }

    fn dma(&self) -> Result<&DmaBuffer<P>> {
        self.active()?;
        self.dma.as_ref().ok_or(Error::NotBound)
    }

    fn window(&self) -> Result<&RegisterWindow<P>> {
        self.active()?;
        self.window.as_ref().ok_or(Error::NotBound)
    }

    /// Release whatever is still held, newest first; `false` if nothing was
    fn teardown(&mut self, dev: PciAddr) -> bool {
        if self.state == LifecycleState::Unbound {
            return false;
        }
        if let Some(node) = self.node.take() {
            drop(node);
            self.advance(dev, LifecycleState::InterruptArmed);
        }
        if let Some(interrupt) = self.interrupt.take() {
            drop(interrupt);
            self.advance(dev, LifecycleState::DmaAllocated);
        }
        if let Some(dma) = self.dma.take() {
            drop(dma);
            self.advance(dev, LifecycleState::RegistersMapped);
        }
        if let Some(window) = self.window.take() {
            drop(window);
            self.advance(dev, LifecycleState::RegionsReserved);
        }
        if let Some(regions) = self.regions.take() {
            drop(regions);
            self.advance(dev, LifecycleState::Enabling);
        }
        if let Some(device) = self.device.take() {
            drop(device);
        }
        self.advance(dev, LifecycleState::Unbound);
        true
    }

    fn advance(&mut self, dev: PciAddr, state: LifecycleState) {
        self.state = state;
        trace_transition(dev, state);
    }
}

impl<P: Platform> Drop for Resources<P> {
    fn drop(&mut self) {
        let dev = self.device.as_ref().map(EnabledDevice::addr);
        if let Some(dev) = dev {
            self.teardown(dev);
        }
    }
}

// =============================================================================
// DEVICE INSTANCE
// =============================================================================

/// Everything the driver holds for one bound device
#[derive(Debug)]
pub struct DeviceInstance<P: Platform> {
    info: PciDeviceInfo,
    node_name: String,
    regs: RegisterLayout,
    irq: Arc<IrqContext>,
    inner: Mutex<Resources<P>>,
}

impl<P: Platform> DeviceInstance<P> {
    /// Acquire every resource for `info`, in order
    ///
    /// On failure the resources already acquired are released in reverse
    /// order before this returns, and the error names the failing step.
    pub(crate) fn bind(
        platform: &Arc<P>,
        config: &DriverConfig,
        info: PciDeviceInfo,
        minors: &Arc<MinorMap>,
    ) -> core::result::Result<Self, BindError> {
        let dev = info.addr;
        let fail = |step: BindStep| {
            move |error: Error| {
                log::error!("{}: bind failed while {}: {}", dev, step, error);
                BindError::new(step, error)
            }
        };

        let device = EnabledDevice::enable(platform, dev).map_err(fail(BindStep::Enabling))?;
        trace_transition(dev, LifecycleState::Enabling);

        let regions = ResourceHandle::reserve(&device, config.name)
            .map_err(fail(BindStep::RegionsReserved))?;
        trace_transition(dev, LifecycleState::RegionsReserved);

        let window = RegisterWindow::map(&regions, config.register_bar)
            .map_err(fail(BindStep::RegistersMapped))?;
        window
            .check_layout(&config.registers)
            .map_err(fail(BindStep::RegistersMapped))?;
        trace_transition(dev, LifecycleState::RegistersMapped);

        let dma = DmaBuffer::allocate(platform, dev, config.buffer_size)
            .map_err(fail(BindStep::DmaAllocated))?;
        trace_transition(dev, LifecycleState::DmaAllocated);

        let interrupt = InterruptRegistration::arm(
            platform,
            dev,
            &window,
            config.registers,
            config.shared_irq,
        )
        .map_err(fail(BindStep::InterruptArmed))?;
        trace_transition(dev, LifecycleState::InterruptArmed);

        let node = DeviceNode::create(platform, dev, minors, config.name)
            .map_err(fail(BindStep::NodeCreated))?;
        trace_transition(dev, LifecycleState::Active);

        log::info!(
            "{}: bound {} as {} ({} DMA buffer, {:?})",
            dev,
            info.id,
            node.name(),
            config.buffer_size,
            interrupt.line()
        );

        Ok(Self {
            info,
            node_name: node.name().to_string(),
            regs: config.registers,
            irq: Arc::clone(interrupt.context()),
            inner: Mutex::new(Resources {
                state: LifecycleState::Active,
                node: Some(node),
                interrupt: Some(interrupt),
                dma: Some(dma),
                window: Some(window),
                regions: Some(regions),
                device: Some(device),
            }),
        })
    }

    /// Release everything, newest first
    ///
    /// Safe from any state; returns `false` (and does nothing) when the
    /// instance is already unbound.
    pub fn teardown(&self) -> bool {
        let released = self.inner.lock().teardown(self.info.addr);
        if released {
            log::info!("{}: unbound {}", self.info.addr, self.node_name);
        }
        released
    }

    /// Bus address of the device
    pub fn addr(&self) -> PciAddr {
        self.info.addr
    }

    /// Identity the device was bound with
    pub fn info(&self) -> &PciDeviceInfo {
        &self.info
    }

    /// Name of the published device node
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    /// Descriptor of the DMA buffer; empty once unbound
    pub fn descriptor(&self) -> DmaBufferDescriptor {
        self.inner
            .lock()
            .dma()
            .map_or_else(|_| DmaBufferDescriptor::empty(), DmaBuffer::descriptor)
    }

    /// Export `size` bytes of the buffer at `offset` to the calling process
    pub fn map_into_process(&self, size: u64, offset: u64) -> Result<UserMapping<P>> {
        let inner = self.inner.lock();
        UserMapping::map_into_process(inner.dma()?, size, offset)
    }

    /// Program the device to transfer `len` bytes at `offset` of the buffer
    pub fn start_transfer(&self, offset: u64, len: u64) -> Result<()> {
        let inner = self.inner.lock();
        let window = inner.window()?;
        let dma = inner.dma()?;
        if len == 0 || len > u32::MAX as u64 {
            return Err(Error::InvalidArgument);
        }
        let bus = dma.descriptor().bus_address_at(offset, len)?;

        // Buffer contents must be visible to the device before the doorbell
        arch::io_barrier();
        window.write32(self.regs.dma_addr, bus.lo32())?;
        window.write32(self.regs.dma_addr + 4, bus.hi32())?;
        window.write32(self.regs.dma_len, len as u32)?;
        arch::io_barrier();
        window.write32(self.regs.dma_start, 1)?;
        log::debug!("{}: transfer of {:#x} bytes from {}", self.info.addr, len, bus);
        Ok(())
    }

    /// Copy bytes out of the DMA buffer
    pub fn read_buffer(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.lock().dma()?.read(offset, buf)
    }

    /// Copy bytes into the DMA buffer
    pub fn write_buffer(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.inner.lock().dma()?.write(offset, data)
    }

    /// Block until the device signals completion
    pub fn wait_for_interrupt(&self) -> Result<()> {
        self.irq.wait()
    }

    /// Consume a completion if one is pending
    pub fn try_wait_interrupt(&self) -> Result<bool> {
        if self.irq.completion().try_wait() {
            return Ok(true);
        }
        if self.irq.is_armed() {
            Ok(false)
        } else {
            Err(Error::NotBound)
        }
    }

    /// Interrupt counters
    pub fn interrupt_stats(&self) -> InterruptStats {
        self.irq.stats()
    }
}
