//! Shared fixtures for the unit and scenario tests.

use alloc::sync::Arc;

use pcidma_core::{ByteSize, PciAddr, PciDeviceId, PciDeviceInfo};
use pcidma_hal::sim::{SimDeviceSpec, SimPlatform};

pub(crate) const DEV: PciAddr = PciAddr::new(0, 0x3a, 0, 0);
pub(crate) const DEV_ID: PciDeviceId = PciDeviceId::new(0x1234, 0x5678);
pub(crate) const BAR0_BASE: u64 = 0xfebf_0000;
pub(crate) const IRQ: u32 = 11;

pub(crate) fn info(addr: PciAddr) -> PciDeviceInfo {
    PciDeviceInfo::new(addr, DEV_ID)
}

/// A DMA device with one 4 KiB register BAR
pub(crate) fn spec(addr: PciAddr, bar_base: u64, line: u32) -> SimDeviceSpec {
    SimDeviceSpec::new(info(addr))
        .with_bar(0, bar_base, ByteSize::from_kib(4))
        .with_irq(line)
}

/// Platform with [`DEV`] plugged in
pub(crate) fn platform() -> Arc<SimPlatform> {
    let sim = SimPlatform::shared();
    sim.add_device(spec(DEV, BAR0_BASE, IRQ));
    sim
}

/// Deterministic xorshift64 generator
pub(crate) struct XorShift(u64);

impl XorShift {
    pub(crate) fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub(crate) fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub(crate) fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}
