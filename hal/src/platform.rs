//! # Platform Abstraction
//!
//! Traits through which the driver reaches the bus, the DMA allocator, the
//! interrupt controller, the process address space and the device-node
//! namespace.
//!
//! Every acquiring method has an inverse. The driver pairs them 1:1, so an
//! implementation may treat an unpaired release as a bug and log it.

use alloc::sync::Arc;
use core::fmt;

use pcidma_core::{BusAddr, ByteSize, CpuAddr, IrqLine, PciAddr, Result, UserAddr};

use crate::bar::BarInfo;
use crate::irq::{InterruptHandler, IrqCookie, IrqFlags};

// =============================================================================
// PCI BUS
// =============================================================================

/// Bus-level operations on one PCI function
pub trait PciBus {
    /// Power up and enable the device
    fn enable_device(&self, dev: PciAddr) -> Result<()>;

    /// Disable the device
    fn disable_device(&self, dev: PciAddr);

    /// Toggle bus-mastering (required for the device to initiate DMA)
    fn set_bus_master(&self, dev: PciAddr, enable: bool);

    /// Describe one BAR
    fn bar_info(&self, dev: PciAddr, index: u8) -> Result<BarInfo>;

    /// Interrupt line wired to the device
    fn irq_line(&self, dev: PciAddr) -> Result<IrqLine>;

    /// Claim every enabled BAR of the device for `owner`, all or nothing
    fn request_regions(&self, dev: PciAddr, owner: &'static str) -> Result<()>;

    /// Release the claims taken by `request_regions`
    fn release_regions(&self, dev: PciAddr);

    /// Map a claimed BAR into CPU address space
    fn iomap(&self, dev: PciAddr, bar: &BarInfo) -> Result<CpuAddr>;

    /// Undo `iomap`
    fn iounmap(&self, dev: PciAddr, base: CpuAddr, size: ByteSize);
}

// =============================================================================
// DMA
// =============================================================================

/// Coherent DMA memory
pub trait DmaOps {
    /// Allocate physically contiguous, cache-coherent memory
    ///
    /// Returns the CPU address and the bus address of the same memory.
    fn alloc_coherent(&self, dev: PciAddr, size: ByteSize) -> Result<(CpuAddr, BusAddr)>;

    /// Free memory returned by `alloc_coherent` with the same arguments
    fn free_coherent(&self, dev: PciAddr, size: ByteSize, cpu: CpuAddr, bus: BusAddr);
}

// =============================================================================
// INTERRUPTS
// =============================================================================

/// Interrupt line management
pub trait IrqController {
    /// Attach `handler` to `line`
    ///
    /// Fails with `AlreadyInUse` when the line is held and either side does
    /// not accept sharing.
    fn request_irq(
        &self,
        dev: PciAddr,
        line: IrqLine,
        flags: IrqFlags,
        handler: Arc<dyn InterruptHandler>,
    ) -> Result<IrqCookie>;

    /// Detach a handler
    ///
    /// Must not return while the handler is still executing.
    fn free_irq(&self, dev: PciAddr, line: IrqLine, cookie: IrqCookie);
}

// =============================================================================
// USER MEMORY
// =============================================================================

bitflags::bitflags! {
    /// Policy flags attached to a user mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u32 {
        /// Raw PFN mapping of device-owned memory
        const IO = 1 << 0;
        /// Mapping may not be grown with mremap
        const DONT_EXPAND = 1 << 1;
        /// Excluded from core dumps
        const DONT_DUMP = 1 << 2;
        /// Not inherited across fork
        const DONT_COPY = 1 << 3;
        /// Never paged out
        const LOCKED = 1 << 4;

        /// Flags every DMA buffer mapping carries
        const DMA_BUFFER = Self::IO.bits()
            | Self::DONT_EXPAND.bits()
            | Self::DONT_DUMP.bits()
            | Self::DONT_COPY.bits()
            | Self::LOCKED.bits();
    }
}

/// Process address-space operations
pub trait UserMemory {
    /// Map `len` bytes of DMA memory starting at `bus` into the calling process
    fn map_user(
        &self,
        dev: PciAddr,
        bus: BusAddr,
        len: ByteSize,
        flags: MappingFlags,
    ) -> Result<UserAddr>;

    /// Undo `map_user`
    fn unmap_user(&self, dev: PciAddr, addr: UserAddr, len: ByteSize);
}

// =============================================================================
// DEVICE NODES
// =============================================================================

/// Identity of a user-visible device node
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    /// Major number
    pub major: u32,
    /// Minor number
    pub minor: u32,
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}:{})", self.major, self.minor)
    }
}

/// User-visible device namespace
pub trait NodeRegistry {
    /// Publish a node called `name`
    fn create_node(&self, dev: PciAddr, name: &str, minor: u32) -> Result<NodeId>;

    /// Remove a published node
    fn destroy_node(&self, dev: PciAddr, node: NodeId);
}

// =============================================================================
// PLATFORM TRAIT
// =============================================================================

/// Platform abstraction trait
///
/// Each target (a kernel, the host simulator) implements this to provide
/// the hardware resources a bound device needs.
pub trait Platform:
    PciBus + DmaOps + IrqController + UserMemory + NodeRegistry + Send + Sync + 'static
{
    /// Get platform name
    fn name(&self) -> &'static str;

    /// Get platform capabilities
    fn caps(&self) -> PlatformCaps;
}

// =============================================================================
// PLATFORM CAPABILITIES
// =============================================================================

/// Platform capabilities
#[derive(Debug, Clone, Copy)]
pub struct PlatformCaps {
    /// Width of bus addresses the device can generate
    pub dma_bits: u8,
    /// Coherent DMA supported
    pub coherent_dma: bool,
    /// Number of interrupt lines
    pub irq_lines: u32,
    /// Handlers allowed per shared line
    pub max_shared_handlers: usize,
}

impl Default for PlatformCaps {
    fn default() -> Self {
        Self {
            dma_bits: 64,
            coherent_dma: true,
            irq_lines: 32,
            max_shared_handlers: crate::irq::MAX_SHARED_HANDLERS,
        }
    }
}

// =============================================================================
// ARCHITECTURE HELPERS
// =============================================================================

/// Architecture-specific operations
pub mod arch {
    //! Architecture-specific helpers

    /// Order prior writes to DMA memory before a subsequent MMIO write
    #[inline(always)]
    pub fn io_barrier() {
        #[cfg(target_arch = "x86_64")]
        {
            // SAFETY: mfence has no side effects beyond ordering
            unsafe {
                core::arch::asm!("mfence", options(nostack, preserves_flags));
            }
        }

        #[cfg(target_arch = "aarch64")]
        {
            // SAFETY: dsb has no side effects beyond ordering
            unsafe {
                core::arch::asm!("dsb sy", options(nostack, preserves_flags));
            }
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }
    }

    /// Pause hint for spin loops
    #[inline(always)]
    pub fn spin_hint() {
        core::hint::spin_loop();
    }
}

impl PlatformCaps {
    /// Can a device reach `[base, base + len)` with `dma_bits` of address
    pub fn dma_reachable(&self, base: u64, len: u64) -> bool {
        let Some(end) = base.checked_add(len) else {
            return false;
        };
        self.dma_bits >= 64 || end <= 1u64 << self.dma_bits
    }
}
