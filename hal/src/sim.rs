//! # Simulated Platform
//!
//! A host-memory platform for exercising the driver without hardware.
//!
//! - BARs are backed by heap-allocated register files, so `iomap` returns a
//!   real CPU address and register reads/writes are real volatile accesses.
//! - Coherent buffers come from the global allocator; their bus addresses
//!   are synthetic and deliberately differ from the CPU addresses.
//! - User mappings get addresses from a private user address range and
//!   resolve back to the same bytes as the buffer.
//! - Every acquisition point can be made to fail, and every acquire/release
//!   is written to a journal for leak and ordering checks.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use pcidma_core::{
    BusAddr, ByteSize, CpuAddr, Error, IrqLine, PciAddr, PciDeviceInfo, PciError, PhysAddr,
    Result, UserAddr, PAGE_SIZE,
};
use spin::Mutex;
use static_assertions::const_assert;

use crate::bar::{BarInfo, MAX_BARS};
use crate::irq::{InterruptHandler, IrqCookie, IrqFlags, IrqLineTable, IrqReturn};
use crate::platform::{
    DmaOps, IrqController, MappingFlags, NodeId, NodeRegistry, PciBus, Platform, PlatformCaps,
    UserMemory,
};
use crate::resource::IoResourceTree;

/// Major number handed out for simulated device nodes
pub const SIM_NODE_MAJOR: u32 = 240;

const SIM_BUS_BASE: u64 = 0x8000_0000;
const SIM_USER_BASE: u64 = 0x7f00_0000_0000;

const_assert!(SIM_BUS_BASE % PAGE_SIZE == 0);
const_assert!(SIM_USER_BASE % PAGE_SIZE == 0);

// =============================================================================
// FAULT INJECTION
// =============================================================================

bitflags::bitflags! {
    /// Acquisition points that can be made to fail
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Faults: u32 {
        /// `enable_device` fails with `DeviceUnavailable`
        const ENABLE = 1 << 0;
        /// `request_regions` fails with `Busy`
        const REQUEST_REGIONS = 1 << 1;
        /// `iomap` fails with `MapFailed`
        const IOMAP = 1 << 2;
        /// `alloc_coherent` fails with `OutOfMemory`
        const ALLOC_COHERENT = 1 << 3;
        /// `request_irq` fails with `AlreadyInUse`
        const REQUEST_IRQ = 1 << 4;
        /// `create_node` fails with `Busy`
        const CREATE_NODE = 1 << 5;
        /// `map_user` fails with `MapFailed`
        const MAP_USER = 1 << 6;
        /// `iomap` and `alloc_coherent` report success with a null address
        /// and acquire nothing
        const NULL_ADDRESS = 1 << 7;
    }
}

// =============================================================================
// JOURNAL
// =============================================================================

/// Kinds of resources the platform hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Device enabled
    Device,
    /// BARs claimed
    Regions,
    /// BAR mapped into CPU space
    Registers,
    /// Coherent DMA buffer
    DmaBuffer,
    /// Interrupt handler attached
    Interrupt,
    /// Device node published
    Node,
    /// User mapping established
    UserMapping,
}

/// One journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEntry {
    /// A resource was handed out
    Acquired(PciAddr, ResourceKind),
    /// A resource was given back
    Released(PciAddr, ResourceKind),
}

impl JournalEntry {
    /// Device the entry concerns
    pub fn device(&self) -> PciAddr {
        match *self {
            Self::Acquired(dev, _) | Self::Released(dev, _) => dev,
        }
    }
}

// =============================================================================
// DEVICE SPEC
// =============================================================================

/// Description of a simulated PCI function
#[derive(Debug, Clone)]
pub struct SimDeviceSpec {
    /// Location and identity
    pub info: PciDeviceInfo,
    /// BAR layout
    pub bars: [BarInfo; MAX_BARS as usize],
    /// Wired interrupt line
    pub irq_line: IrqLine,
    /// BAR holding the interrupt status/ack registers
    pub irq_bar: u8,
    /// Interrupt status register offset
    pub irq_status: u32,
    /// Interrupt acknowledge register offset
    pub irq_ack: u32,
}

impl SimDeviceSpec {
    /// Device with no BARs on line 0
    pub fn new(info: PciDeviceInfo) -> Self {
        Self {
            info,
            bars: [
                BarInfo::disabled(0),
                BarInfo::disabled(1),
                BarInfo::disabled(2),
                BarInfo::disabled(3),
                BarInfo::disabled(4),
                BarInfo::disabled(5),
            ],
            irq_line: IrqLine::new(0),
            irq_bar: 0,
            irq_status: 0x1c,
            irq_ack: 0x18,
        }
    }

    /// Add a memory BAR
    pub fn with_bar(mut self, index: u8, base: u64, size: ByteSize) -> Self {
        if let Some(slot) = self.bars.get_mut(index as usize) {
            *slot = BarInfo::mmio(index, PhysAddr::new(base), size);
        }
        self
    }

    /// Wire the interrupt line
    pub fn with_irq(mut self, line: u32) -> Self {
        self.irq_line = IrqLine::new(line);
        self
    }

}

// =============================================================================
// INTERNAL STATE
// =============================================================================

#[derive(Debug)]
struct SimDevice {
    spec: SimDeviceSpec,
    /// One register file per enabled BAR
    regs: [Option<Box<[AtomicU32]>>; MAX_BARS as usize],
    /// Outstanding `enable_device` calls; disabled when it drops to zero
    enable_count: u32,
    bus_master: bool,
    mapped: u32,
}

impl SimDevice {
    fn new(spec: SimDeviceSpec) -> Self {
        let regs = core::array::from_fn(|i| {
            let bar = spec.bars[i];
            if bar.is_enabled() && bar.is_memory() {
                let words = (bar.size.as_usize() / 4).max(1);
                Some((0..words).map(|_| AtomicU32::new(0)).collect::<Box<[AtomicU32]>>())
            } else {
                None
            }
        });
        Self {
            spec,
            regs,
            enable_count: 0,
            bus_master: false,
            mapped: 0,
        }
    }

    fn reg(&self, bar: u8, offset: u32) -> Option<&AtomicU32> {
        let file = self.regs.get(bar as usize)?.as_ref()?;
        if offset % 4 != 0 {
            return None;
        }
        file.get((offset / 4) as usize)
    }
}

#[derive(Debug)]
struct DmaAlloc {
    dev: PciAddr,
    cpu: CpuAddr,
    size: ByteSize,
    layout: Layout,
}

#[derive(Debug)]
struct DmaState {
    allocs: BTreeMap<u64, DmaAlloc>,
    next_bus: u64,
    in_use: u64,
    limit: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct UserMap {
    dev: PciAddr,
    cpu: CpuAddr,
    len: ByteSize,
    flags: MappingFlags,
}

#[derive(Debug)]
struct UserState {
    maps: BTreeMap<u64, UserMap>,
    next_va: u64,
}

#[derive(Debug)]
struct NodeEntry {
    dev: PciAddr,
    name: String,
}

// =============================================================================
// SIM PLATFORM
// =============================================================================

/// Host-memory platform
#[derive(Debug)]
pub struct SimPlatform {
    caps: PlatformCaps,
    devices: Mutex<BTreeMap<PciAddr, SimDevice>>,
    iomem: IoResourceTree,
    irqs: IrqLineTable,
    dma: Mutex<DmaState>,
    user: Mutex<UserState>,
    nodes: Mutex<BTreeMap<NodeId, NodeEntry>>,
    faults: Mutex<Faults>,
    journal: Mutex<Vec<JournalEntry>>,
}

impl SimPlatform {
    /// Create an empty platform
    pub fn new() -> Self {
        Self::with_caps(PlatformCaps::default())
    }

    /// Create an empty platform with explicit capabilities
    pub fn with_caps(caps: PlatformCaps) -> Self {
        Self {
            caps,
            devices: Mutex::new(BTreeMap::new()),
            iomem: IoResourceTree::new(),
            irqs: IrqLineTable::new(caps.irq_lines, caps.max_shared_handlers),
            dma: Mutex::new(DmaState {
                allocs: BTreeMap::new(),
                next_bus: SIM_BUS_BASE,
                in_use: 0,
                limit: None,
            }),
            user: Mutex::new(UserState {
                maps: BTreeMap::new(),
                next_va: SIM_USER_BASE,
            }),
            nodes: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::empty()),
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Convenience constructor returning a shared handle
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // =========================================================================
    // Device population
    // =========================================================================

    /// Plug in a device
    pub fn add_device(&self, spec: SimDeviceSpec) {
        let addr = spec.info.addr;
        self.devices.lock().insert(addr, SimDevice::new(spec));
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Make the given points fail until cleared
    pub fn inject(&self, faults: Faults) {
        self.faults.lock().insert(faults);
    }

    /// Clear injected faults
    pub fn clear_faults(&self, faults: Faults) {
        self.faults.lock().remove(faults);
    }

    /// Cap total coherent memory
    pub fn set_dma_limit(&self, limit: Option<ByteSize>) {
        self.dma.lock().limit = limit.map(ByteSize::as_bytes);
    }

    fn check(&self, fault: Faults, err: Error) -> Result<()> {
        if self.faults.lock().contains(fault) {
            Err(err)
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Journal
    // =========================================================================

    fn record(&self, entry: JournalEntry) {
        self.journal.lock().push(entry);
    }

    /// Snapshot of the journal
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().clone()
    }

    /// Journal entries concerning `dev`
    pub fn journal_for(&self, dev: PciAddr) -> Vec<JournalEntry> {
        self.journal
            .lock()
            .iter()
            .copied()
            .filter(|e| e.device() == dev)
            .collect()
    }

    /// Resources currently held by `dev` according to the platform's state
    pub fn outstanding(&self, dev: PciAddr) -> usize {
        let mut count = 0;
        if let Some(d) = self.devices.lock().get(&dev) {
            count += d.enable_count as usize + d.mapped as usize;
        }
        if self.iomem.claims_of(dev) > 0 {
            count += 1;
        }
        count += self.dma.lock().allocs.values().filter(|a| a.dev == dev).count();
        count += self.irqs.owned_by(dev);
        count += self.nodes.lock().values().filter(|n| n.dev == dev).count();
        count += self.user.lock().maps.values().filter(|m| m.dev == dev).count();
        count
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Is the device enabled
    pub fn is_enabled(&self, dev: PciAddr) -> bool {
        self.devices.lock().get(&dev).is_some_and(|d| d.enable_count > 0)
    }

    /// Is bus-mastering on
    pub fn is_bus_master(&self, dev: PciAddr) -> bool {
        self.devices.lock().get(&dev).is_some_and(|d| d.bus_master)
    }

    /// Is a node with this name published
    pub fn node_exists(&self, name: &str) -> bool {
        self.nodes.lock().values().any(|n| n.name == name)
    }

    /// Live coherent allocations
    pub fn dma_allocations(&self) -> usize {
        self.dma.lock().allocs.len()
    }

    /// Live user mappings
    pub fn user_mappings(&self) -> usize {
        self.user.lock().maps.len()
    }

    /// Flags of the user mapping starting at `addr`
    pub fn user_mapping_flags(&self, addr: UserAddr) -> Option<MappingFlags> {
        self.user.lock().maps.get(&addr.raw()).map(|m| m.flags)
    }

    /// Resolve a user address to the CPU address of the same byte
    pub fn user_to_cpu(&self, addr: UserAddr) -> Option<CpuAddr> {
        let user = self.user.lock();
        let (&start, map) = user.maps.range(..=addr.raw()).next_back()?;
        let off = addr.raw() - start;
        (off < map.len.as_bytes()).then(|| map.cpu.offset(off as usize))
    }

    /// The platform's interrupt table
    pub fn irq_table(&self) -> &IrqLineTable {
        &self.irqs
    }

    // =========================================================================
    // Device-side behaviour
    // =========================================================================

    /// Read a register as the device sees it
    pub fn register(&self, dev: PciAddr, bar: u8, offset: u32) -> Option<u32> {
        let devices = self.devices.lock();
        devices
            .get(&dev)?
            .reg(bar, offset)
            .map(|r| r.load(Ordering::SeqCst))
    }

    /// Write a register from the device side
    pub fn set_register(&self, dev: PciAddr, bar: u8, offset: u32, value: u32) -> bool {
        let devices = self.devices.lock();
        match devices.get(&dev).and_then(|d| d.reg(bar, offset)) {
            Some(r) => {
                r.store(value, Ordering::SeqCst);
                true
            },
            None => false,
        }
    }

    /// The device asserts its interrupt
    ///
    /// Sets the status register, dispatches the line, and de-asserts once a
    /// handler has written the acknowledge register.
    pub fn raise_interrupt(&self, dev: PciAddr) -> IrqReturn {
        let Some((line, bar, status, ack)) = self.devices.lock().get(&dev).map(|d| {
            (d.spec.irq_line, d.spec.irq_bar, d.spec.irq_status, d.spec.irq_ack)
        }) else {
            return IrqReturn::NotMine;
        };

        self.set_register(dev, bar, status, 1);
        let result = self.irqs.dispatch(line);
        if self.register(dev, bar, ack).unwrap_or(0) != 0 {
            self.set_register(dev, bar, ack, 0);
            self.set_register(dev, bar, status, 0);
        }
        result
    }

    /// Deliver an interrupt on a line without any device asserting it
    pub fn spurious_interrupt(&self, line: IrqLine) -> IrqReturn {
        self.irqs.dispatch(line)
    }
}

impl Drop for SimPlatform {
    fn drop(&mut self) {
        let dma = self.dma.get_mut();
        for (_, alloc) in core::mem::take(&mut dma.allocs) {
            // SAFETY: allocated in alloc_coherent with this layout and not yet freed
            unsafe { dealloc(alloc.cpu.as_ptr(), alloc.layout) };
        }
    }
}

// =============================================================================
// TRAIT IMPLEMENTATIONS
// =============================================================================

impl PciBus for SimPlatform {
    fn enable_device(&self, dev: PciAddr) -> Result<()> {
        self.check(Faults::ENABLE, Error::DeviceUnavailable)?;
        let mut devices = self.devices.lock();
        let device = devices.get_mut(&dev).ok_or(Error::DeviceUnavailable)?;
        device.enable_count += 1;
        drop(devices);
        self.record(JournalEntry::Acquired(dev, ResourceKind::Device));
        Ok(())
    }

    fn disable_device(&self, dev: PciAddr) {
        if let Some(device) = self.devices.lock().get_mut(&dev) {
            device.enable_count = device.enable_count.saturating_sub(1);
            if device.enable_count == 0 {
                device.bus_master = false;
            }
        }
        self.record(JournalEntry::Released(dev, ResourceKind::Device));
    }

    fn set_bus_master(&self, dev: PciAddr, enable: bool) {
        if let Some(device) = self.devices.lock().get_mut(&dev) {
            device.bus_master = enable;
        }
    }

    fn bar_info(&self, dev: PciAddr, index: u8) -> Result<BarInfo> {
        BarInfo::check_index(index)?;
        let devices = self.devices.lock();
        let device = devices.get(&dev).ok_or(PciError::DeviceNotFound)?;
        Ok(device.spec.bars[index as usize])
    }

    fn irq_line(&self, dev: PciAddr) -> Result<IrqLine> {
        let devices = self.devices.lock();
        let device = devices.get(&dev).ok_or(PciError::DeviceNotFound)?;
        Ok(device.spec.irq_line)
    }

    fn request_regions(&self, dev: PciAddr, owner: &'static str) -> Result<()> {
        self.check(Faults::REQUEST_REGIONS, Error::Busy)?;
        let ranges: Vec<(PhysAddr, ByteSize)> = {
            let devices = self.devices.lock();
            let device = devices.get(&dev).ok_or(PciError::DeviceNotFound)?;
            device
                .spec
                .bars
                .iter()
                .filter(|b| b.is_enabled())
                .map(|b| (b.base, b.size))
                .collect()
        };
        self.iomem.claim_all(&ranges, dev, owner)?;
        self.record(JournalEntry::Acquired(dev, ResourceKind::Regions));
        Ok(())
    }

    fn release_regions(&self, dev: PciAddr) {
        self.iomem.release_owner(dev);
        self.record(JournalEntry::Released(dev, ResourceKind::Regions));
    }

    fn iomap(&self, dev: PciAddr, bar: &BarInfo) -> Result<CpuAddr> {
        self.check(Faults::IOMAP, Error::MapFailed)?;
        BarInfo::check_index(bar.index)?;
        if self.faults.lock().contains(Faults::NULL_ADDRESS) {
            return Ok(CpuAddr::new(0));
        }
        if self.iomem.owner_of(bar.base) != Some(dev) {
            return Err(Error::MapFailed);
        }
        let mut devices = self.devices.lock();
        let device = devices.get_mut(&dev).ok_or(Error::MapFailed)?;
        let file = device.regs[bar.index as usize]
            .as_ref()
            .ok_or(Error::MapFailed)?;
        let base = CpuAddr::new(file.as_ptr() as usize);
        device.mapped += 1;
        drop(devices);
        self.record(JournalEntry::Acquired(dev, ResourceKind::Registers));
        Ok(base)
    }

    fn iounmap(&self, dev: PciAddr, _base: CpuAddr, _size: ByteSize) {
        if let Some(device) = self.devices.lock().get_mut(&dev) {
            device.mapped = device.mapped.saturating_sub(1);
        }
        self.record(JournalEntry::Released(dev, ResourceKind::Registers));
    }
}

impl DmaOps for SimPlatform {
    fn alloc_coherent(&self, dev: PciAddr, size: ByteSize) -> Result<(CpuAddr, BusAddr)> {
        self.check(Faults::ALLOC_COHERENT, Error::OutOfMemory)?;
        if self.faults.lock().contains(Faults::NULL_ADDRESS) {
            return Ok((CpuAddr::new(0), BusAddr::new(0)));
        }
        let size = size
            .page_aligned()
            .filter(|s| !s.is_zero())
            .ok_or(Error::OutOfMemory)?;

        let mut dma = self.dma.lock();
        if let Some(limit) = dma.limit {
            if dma.in_use.saturating_add(size.as_bytes()) > limit {
                return Err(Error::OutOfMemory);
            }
        }
        let layout = Layout::from_size_align(size.as_usize(), PAGE_SIZE as usize)
            .map_err(|_| Error::OutOfMemory)?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::OutOfMemory);
        }

        let bus = dma.next_bus;
        // Leave a guard page between buffers
        dma.next_bus = bus + size.as_bytes() + PAGE_SIZE;
        dma.in_use += size.as_bytes();
        let cpu = CpuAddr::new(ptr as usize);
        dma.allocs.insert(
            bus,
            DmaAlloc {
                dev,
                cpu,
                size,
                layout,
            },
        );
        drop(dma);

        self.record(JournalEntry::Acquired(dev, ResourceKind::DmaBuffer));
        Ok((cpu, BusAddr::new(bus)))
    }

    fn free_coherent(&self, dev: PciAddr, size: ByteSize, cpu: CpuAddr, bus: BusAddr) {
        let mut dma = self.dma.lock();
        let matches = dma.allocs.get(&bus.raw()).is_some_and(|a| {
            a.cpu == cpu && a.dev == dev && size.page_aligned() == Some(a.size)
        });
        if !matches {
            log::error!("{}: free_coherent of unknown buffer {:?}/{:?}", dev, cpu, bus);
            return;
        }
        if let Some(alloc) = dma.allocs.remove(&bus.raw()) {
            dma.in_use -= alloc.size.as_bytes();
            // SAFETY: allocated in alloc_coherent with this layout; removed from the map
            unsafe { dealloc(alloc.cpu.as_ptr(), alloc.layout) };
        }
        drop(dma);
        self.record(JournalEntry::Released(dev, ResourceKind::DmaBuffer));
    }
}

impl IrqController for SimPlatform {
    fn request_irq(
        &self,
        dev: PciAddr,
        line: IrqLine,
        flags: IrqFlags,
        handler: Arc<dyn InterruptHandler>,
    ) -> Result<IrqCookie> {
        self.check(Faults::REQUEST_IRQ, Error::AlreadyInUse)?;
        let cookie = self.irqs.register(dev, line, flags, handler)?;
        self.record(JournalEntry::Acquired(dev, ResourceKind::Interrupt));
        Ok(cookie)
    }

    fn free_irq(&self, dev: PciAddr, line: IrqLine, cookie: IrqCookie) {
        if self.irqs.unregister(line, cookie) {
            self.record(JournalEntry::Released(dev, ResourceKind::Interrupt));
        } else {
            log::error!("{}: free_irq of unknown handler on {:?}", dev, line);
        }
    }
}

impl UserMemory for SimPlatform {
    fn map_user(
        &self,
        dev: PciAddr,
        bus: BusAddr,
        len: ByteSize,
        flags: MappingFlags,
    ) -> Result<UserAddr> {
        self.check(Faults::MAP_USER, Error::MapFailed)?;
        let len = len
            .page_aligned()
            .filter(|l| !l.is_zero())
            .ok_or(Error::MapFailed)?;

        // The range must sit inside one coherent buffer of this device
        let cpu = {
            let dma = self.dma.lock();
            let (&start, alloc) = dma
                .allocs
                .range(..=bus.raw())
                .next_back()
                .ok_or(Error::MapFailed)?;
            let off = bus.raw() - start;
            if alloc.dev != dev || off.saturating_add(len.as_bytes()) > alloc.size.as_bytes() {
                return Err(Error::MapFailed);
            }
            alloc.cpu.offset(off as usize)
        };

        let mut user = self.user.lock();
        let va = user.next_va;
        user.next_va = va + len.as_bytes() + PAGE_SIZE;
        user.maps.insert(
            va,
            UserMap {
                dev,
                cpu,
                len,
                flags,
            },
        );
        drop(user);

        self.record(JournalEntry::Acquired(dev, ResourceKind::UserMapping));
        Ok(UserAddr::new(va))
    }

    fn unmap_user(&self, dev: PciAddr, addr: UserAddr, _len: ByteSize) {
        if self.user.lock().maps.remove(&addr.raw()).is_some() {
            self.record(JournalEntry::Released(dev, ResourceKind::UserMapping));
        }
    }
}

impl NodeRegistry for SimPlatform {
    fn create_node(&self, dev: PciAddr, name: &str, minor: u32) -> Result<NodeId> {
        self.check(Faults::CREATE_NODE, Error::Busy)?;
        let id = NodeId {
            major: SIM_NODE_MAJOR,
            minor,
        };
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&id) || nodes.values().any(|n| n.name == name) {
            return Err(Error::Busy);
        }
        nodes.insert(
            id,
            NodeEntry {
                dev,
                name: name.to_string(),
            },
        );
        drop(nodes);
        self.record(JournalEntry::Acquired(dev, ResourceKind::Node));
        Ok(id)
    }

    fn destroy_node(&self, dev: PciAddr, node: NodeId) {
        if self.nodes.lock().remove(&node).is_some() {
            self.record(JournalEntry::Released(dev, ResourceKind::Node));
        }
    }
}

impl Platform for SimPlatform {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn caps(&self) -> PlatformCaps {
        self.caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcidma_core::PciDeviceId;

    const DEV: PciAddr = PciAddr::new(0, 3, 0, 0);

    fn platform() -> SimPlatform {
        let sim = SimPlatform::new();
        sim.add_device(
            SimDeviceSpec::new(PciDeviceInfo::new(DEV, PciDeviceId::new(0x1234, 0x5678)))
                .with_bar(0, 0xfebf_0000, ByteSize::from_kib(4))
                .with_irq(11),
        );
        sim
    }

    #[test]
    fn test_enable_and_fault() {
        let sim = platform();
        sim.inject(Faults::ENABLE);
        assert_eq!(sim.enable_device(DEV), Err(Error::DeviceUnavailable));
        sim.clear_faults(Faults::ENABLE);
        sim.enable_device(DEV).unwrap();
        assert!(sim.is_enabled(DEV));
        assert_eq!(sim.outstanding(DEV), 1);
    }

    #[test]
    fn test_enable_is_counted() {
        let sim = platform();
        sim.enable_device(DEV).unwrap();
        sim.set_bus_master(DEV, true);
        sim.enable_device(DEV).unwrap();
        assert_eq!(sim.outstanding(DEV), 2);

        sim.disable_device(DEV);
        assert!(sim.is_enabled(DEV));
        assert!(sim.is_bus_master(DEV));

        sim.disable_device(DEV);
        assert!(!sim.is_enabled(DEV));
        assert!(!sim.is_bus_master(DEV));
        assert_eq!(sim.outstanding(DEV), 0);
        assert_eq!(sim.journal_for(DEV).len(), 4);
    }

    #[test]
    fn test_iomap_requires_claim() {
        let sim = platform();
        let bar = sim.bar_info(DEV, 0).unwrap();
        assert_eq!(sim.iomap(DEV, &bar), Err(Error::MapFailed));
        sim.request_regions(DEV, "test").unwrap();
        let base = sim.iomap(DEV, &bar).unwrap();
        assert!(!base.is_null());
    }

    #[test]
    fn test_coherent_addresses_differ() {
        let sim = platform();
        let (cpu, bus) = sim.alloc_coherent(DEV, ByteSize::from_kib(8)).unwrap();
        assert!(!cpu.is_null());
        assert!(!bus.is_null());
        assert_ne!(cpu.raw() as u64, bus.raw());
        assert_eq!(sim.dma_allocations(), 1);
        sim.free_coherent(DEV, ByteSize::from_kib(8), cpu, bus);
        assert_eq!(sim.dma_allocations(), 0);
        // A second free is ignored
        sim.free_coherent(DEV, ByteSize::from_kib(8), cpu, bus);
        assert_eq!(sim.journal_for(DEV).len(), 2);
    }

    #[test]
    fn test_dma_limit() {
        let sim = platform();
        sim.set_dma_limit(Some(ByteSize::from_kib(4)));
        assert_eq!(
            sim.alloc_coherent(DEV, ByteSize::from_kib(8)),
            Err(Error::OutOfMemory)
        );
    }

    #[test]
    fn test_user_mapping_aliases_buffer() {
        let sim = platform();
        let (cpu, bus) = sim.alloc_coherent(DEV, ByteSize::from_kib(16)).unwrap();
        let user = sim
            .map_user(
                DEV,
                bus.offset(PAGE_SIZE),
                ByteSize::from_kib(4),
                MappingFlags::DMA_BUFFER,
            )
            .unwrap();
        assert_eq!(
            sim.user_to_cpu(user),
            Some(cpu.offset(PAGE_SIZE as usize))
        );
        assert_eq!(sim.user_mapping_flags(user), Some(MappingFlags::DMA_BUFFER));
        // Past the end of the buffer
        assert_eq!(
            sim.map_user(DEV, bus, ByteSize::from_kib(20), MappingFlags::DMA_BUFFER),
            Err(Error::MapFailed)
        );
        sim.unmap_user(DEV, user, ByteSize::from_kib(4));
        assert_eq!(sim.user_mappings(), 0);
    }

    #[test]
    fn test_nodes_unique() {
        let sim = platform();
        let node = sim.create_node(DEV, "pcie_dma0", 0).unwrap();
        assert!(sim.node_exists("pcie_dma0"));
        assert_eq!(sim.create_node(DEV, "pcie_dma0", 1), Err(Error::Busy));
        sim.destroy_node(DEV, node);
        assert!(!sim.node_exists("pcie_dma0"));
    }
}
