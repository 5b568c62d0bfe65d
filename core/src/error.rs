//! # Error Handling
//!
//! Error types shared by the HAL and the driver.
//!
//! - Errors are typed and categorized by the resource they concern
//! - No panics in acquisition or teardown paths
//! - Errors are `no_std` compatible and `Copy`, so interrupt-context code
//!   can produce them without allocating

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Driver-core result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Unified error type for the PCIe DMA driver core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Device / bus
    // =========================================================================
    /// Device cannot be powered up or enabled
    DeviceUnavailable,
    /// Address range already claimed by another binding
    Busy,
    /// Configuration space problem
    Pci(PciError),

    // =========================================================================
    // Mapping / memory
    // =========================================================================
    /// CPU or user address-space mapping rejected or exhausted
    MapFailed,
    /// Coherent DMA allocation could not be satisfied
    OutOfMemory,
    /// Register access outside the mapped window
    OutOfBounds,

    // =========================================================================
    // Interrupts
    // =========================================================================
    /// Interrupt line held by a handler that does not share
    AlreadyInUse,
    /// Interrupt line does not exist or cannot take another handler
    InterruptUnavailable,

    // =========================================================================
    // Requests
    // =========================================================================
    /// Malformed request (bad size, offset or alignment)
    InvalidArgument,
    /// Operation requested on a device that is not in the `Active` state
    NotBound,
    /// Device identity is not in the driver's identity table
    NoMatch,
    /// Device is already bound to an instance of this driver
    AlreadyBound,
    /// Unknown device or device node
    NotFound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceUnavailable => write!(f, "device unavailable"),
            Self::Busy => write!(f, "resource busy"),
            Self::Pci(e) => write!(f, "PCI error: {}", e),

            Self::MapFailed => write!(f, "mapping failed"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::OutOfBounds => write!(f, "access out of bounds"),

            Self::AlreadyInUse => write!(f, "interrupt line already in use"),
            Self::InterruptUnavailable => write!(f, "interrupt unavailable"),

            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotBound => write!(f, "device not bound"),
            Self::NoMatch => write!(f, "device not in identity table"),
            Self::AlreadyBound => write!(f, "device already bound"),
            Self::NotFound => write!(f, "not found"),
        }
    }
}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// PCI configuration error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciError {
    /// BAR index outside 0..=5
    NoSuchBar,
    /// BAR is not implemented by the device
    BarDisabled,
    /// Device is not present at the given address
    DeviceNotFound,
}

impl fmt::Display for PciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchBar => write!(f, "no such BAR"),
            Self::BarDisabled => write!(f, "BAR disabled"),
            Self::DeviceNotFound => write!(f, "device not found"),
        }
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<PciError> for Error {
    fn from(e: PciError) -> Self {
        Error::Pci(e)
    }
}
