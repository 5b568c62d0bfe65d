//! # Core Types
//!
//! Fundamental type definitions used across the driver core.
//!
//! These types provide:
//! - Strong typing for addresses (CPU vs bus vs user vs physical)
//! - PCI identifiers used for matching and keying instances
//! - Size and page-alignment helpers

use core::fmt;

use static_assertions::const_assert;

// =============================================================================
// PAGES
// =============================================================================

/// Page shift used for user mappings and DMA rounding
pub const PAGE_SHIFT: u32 = 12;

/// Page size in bytes
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(PAGE_SIZE >= 4096);

/// Check that `value` is a multiple of the page size
#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

// =============================================================================
// CPU ADDRESS
// =============================================================================

/// CPU virtual address of driver-owned memory
///
/// Only the CPU may dereference this. It is never programmed into a device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct CpuAddr(usize);

impl CpuAddr {
    /// Create a new CPU address
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Null CPU address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Raw value
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// As a raw byte pointer
    #[inline]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

impl fmt::Debug for CpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuAddr(0x{:016x})", self.0)
    }
}

// =============================================================================
// BUS ADDRESS
// =============================================================================

/// Device-visible bus address (what the device uses for DMA)
///
/// Not a CPU pointer and cannot be dereferenced.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct BusAddr(u64);

impl BusAddr {
    /// Create a new bus address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Null bus address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Raw value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Low 32 bits (for split 64-bit register writes)
    #[inline]
    pub const fn lo32(self) -> u32 {
        self.0 as u32
    }

    /// High 32 bits
    #[inline]
    pub const fn hi32(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// USER ADDRESS
// =============================================================================

/// Virtual address inside a user process
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct UserAddr(u64);

impl UserAddr {
    /// Create a new user address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Raw value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for UserAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserAddr(0x{:016x})", self.0)
    }
}

// =============================================================================
// PHYSICAL ADDRESS (BAR bases)
// =============================================================================

/// Physical address of a device register range
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Raw value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr(0x{:016x})", self.0)
    }
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from KiB
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Get as usize (saturating on 32-bit hosts)
    #[inline]
    pub const fn as_usize(self) -> usize {
        if self.0 > usize::MAX as u64 {
            usize::MAX
        } else {
            self.0 as usize
        }
    }

    /// Check for zero
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Round up to a power-of-two alignment, `None` on overflow
    #[inline]
    pub const fn checked_align_up(self, alignment: u64) -> Option<Self> {
        let mask = alignment - 1;
        match self.0.checked_add(mask) {
            Some(v) => Some(Self(v & !mask)),
            None => None,
        }
    }

    /// Round up to the page size, `None` on overflow
    #[inline]
    pub const fn page_aligned(self) -> Option<Self> {
        self.checked_align_up(PAGE_SIZE)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 && self.0 % (1024 * 1024) == 0 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 && self.0 % 1024 == 0 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// PCI ADDRESS (BDF)
// =============================================================================

/// PCI Bus:Device.Function address
///
/// Identifies one physical function; one bound instance exists per address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddr {
    /// Domain (segment)
    pub domain: u16,
    /// Bus number
    pub bus: u8,
    /// Device number (0-31)
    pub device: u8,
    /// Function number (0-7)
    pub function: u8,
}

impl PciAddr {
    /// Create a new PCI address
    #[inline]
    pub const fn new(domain: u16, bus: u8, device: u8, function: u8) -> Self {
        Self {
            domain,
            bus,
            device,
            function,
        }
    }
}

impl fmt::Debug for PciAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PCI({:04x}:{:02x}:{:02x}.{:x})",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl fmt::Display for PciAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

// =============================================================================
// PCI IDENTITY
// =============================================================================

/// (vendor-id, device-id) pair used as the match key
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciDeviceId {
    /// PCI vendor ID
    pub vendor: u16,
    /// PCI device ID
    pub device: u16,
}

impl PciDeviceId {
    /// Create a new identity
    #[inline]
    pub const fn new(vendor: u16, device: u16) -> Self {
        Self { vendor, device }
    }
}

impl fmt::Debug for PciDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.device)
    }
}

impl fmt::Display for PciDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A device as reported by platform discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDeviceInfo {
    /// Location on the bus
    pub addr: PciAddr,
    /// Vendor/device identity
    pub id: PciDeviceId,
}

impl PciDeviceInfo {
    /// Create a new device description
    pub const fn new(addr: PciAddr, id: PciDeviceId) -> Self {
        Self { addr, id }
    }
}

// =============================================================================
// INTERRUPT LINE
// =============================================================================

/// Hardware interrupt line number
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct IrqLine(u32);

impl IrqLine {
    /// Create a new line number
    #[inline]
    pub const fn new(line: u32) -> Self {
        Self(line)
    }

    /// Raw line number
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for IrqLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IRQ{}", self.0)
    }
}

impl fmt::Display for IrqLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::format;

    #[test]
    fn test_pci_addr_display() {
        let addr = PciAddr::new(0, 0x3a, 0x1f, 0x7);
        assert_eq!(format!("{}", addr), "0000:3a:1f.7");
        assert_eq!(format!("{:?}", addr), "PCI(0000:3a:1f.7)");
    }

    #[test]
    fn test_page_alignment() {
        assert!(is_page_aligned(0));
        assert!(is_page_aligned(PAGE_SIZE * 3));
        assert!(!is_page_aligned(PAGE_SIZE + 1));
        assert_eq!(
            ByteSize::from_bytes(1).page_aligned(),
            Some(ByteSize::from_kib(4))
        );
        assert_eq!(ByteSize::from_bytes(u64::MAX).page_aligned(), None);
    }

    #[test]
    fn test_bus_addr_split() {
        let bus = BusAddr::new(0x0000_0001_8000_2000);
        assert_eq!(bus.lo32(), 0x8000_2000);
        assert_eq!(bus.hi32(), 0x1);
    }

    #[test]
    fn test_byte_size_display() {
        assert_eq!(format!("{}", ByteSize::from_mib(4)), "4 MiB");
        assert_eq!(format!("{}", ByteSize::from_kib(8)), "8 KiB");
        assert_eq!(format!("{}", ByteSize::from_bytes(100)), "100 B");
    }
}
