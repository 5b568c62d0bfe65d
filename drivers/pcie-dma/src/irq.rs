//! # Interrupt Bridge
//!
//! Connects the device's interrupt line to a handler that acknowledges the
//! device and signals process context through a [`Completion`].
//!
//! The handler runs in interrupt context: it touches only the raw register
//! handle and atomics. Disarming clears the armed flag and then detaches the
//! handler; the platform's `free_irq` returns only after any in-flight
//! invocation has finished, so nothing runs against the registers once
//! [`InterruptRegistration`] has dropped.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use pcidma_core::{Error, IrqLine, PciAddr, Result};
use pcidma_hal::platform::arch;
use pcidma_hal::{InterruptHandler, IrqCookie, IrqFlags, IrqReturn, Platform};

use crate::config::RegisterLayout;
use crate::window::{MmioHandle, RegisterWindow};

// =============================================================================
// COMPLETION
// =============================================================================

/// Counting completion signalled from interrupt context
///
/// Every `complete` is consumed by exactly one successful wait, so an
/// interrupt that arrives before the waiter is not lost.
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicU32,
}

impl Completion {
    /// Create a completion with nothing pending
    pub const fn new() -> Self {
        Self {
            done: AtomicU32::new(0),
        }
    }

    /// Signal one completion
    #[inline]
    pub fn complete(&self) {
        self.done.fetch_add(1, Ordering::Release);
    }

    /// Consume one completion if available
    pub fn try_wait(&self) -> bool {
        self.done
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Spin until a completion is available
    pub fn wait(&self) {
        while !self.try_wait() {
            arch::spin_hint();
        }
    }

    /// Completions signalled but not yet consumed
    pub fn pending(&self) -> u32 {
        self.done.load(Ordering::Acquire)
    }
}

// =============================================================================
// HANDLER CONTEXT
// =============================================================================

/// Interrupt counters of one instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptStats {
    /// Interrupts acknowledged by this instance
    pub handled: u64,
    /// Invocations where the device had nothing pending
    pub spurious: u64,
    /// Completions not yet consumed by a waiter
    pub pending: u32,
}

/// State shared between the handler and process context
#[derive(Debug)]
pub struct IrqContext {
    dev: PciAddr,
    mmio: MmioHandle,
    regs: RegisterLayout,
    completion: Completion,
    armed: AtomicBool,
    handled: AtomicU64,
    spurious: AtomicU64,
}

impl IrqContext {
    fn new(dev: PciAddr, mmio: MmioHandle, regs: RegisterLayout) -> Self {
        Self {
            dev,
            mmio,
            regs,
            completion: Completion::new(),
            armed: AtomicBool::new(false),
            handled: AtomicU64::new(0),
            spurious: AtomicU64::new(0),
        }
    }

    /// Device the context belongs to
    pub fn addr(&self) -> PciAddr {
        self.dev
    }

    /// Is the handler accepting interrupts
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Completion signalled on every handled interrupt
    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// Wait for the next handled interrupt
    ///
    /// Fails with `NotBound` once the handler has been disarmed and no
    /// completion is left to consume.
    pub fn wait(&self) -> Result<()> {
        loop {
            if self.completion.try_wait() {
                return Ok(());
            }
            if !self.is_armed() {
                return Err(Error::NotBound);
            }
            arch::spin_hint();
        }
    }

    /// Current counters
    pub fn stats(&self) -> InterruptStats {
        InterruptStats {
            handled: self.handled.load(Ordering::Relaxed),
            spurious: self.spurious.load(Ordering::Relaxed),
            pending: self.completion.pending(),
        }
    }
}

impl InterruptHandler for IrqContext {
    fn handle(&self, _line: IrqLine) -> IrqReturn {
        if !self.is_armed() {
            return IrqReturn::NotMine;
        }
        match self.mmio.read32(self.regs.irq_status) {
            Ok(status) if status != 0 => {},
            _ => {
                self.spurious.fetch_add(1, Ordering::Relaxed);
                return IrqReturn::NotMine;
            },
        }
        if self.mmio.write32(self.regs.irq_ack, 1).is_err() {
            return IrqReturn::NotMine;
        }
        self.handled.fetch_add(1, Ordering::Relaxed);
        self.completion.complete();
        IrqReturn::Handled
    }
}

// =============================================================================
// REGISTRATION
// =============================================================================

/// An armed interrupt handler
#[derive(Debug)]
pub struct InterruptRegistration<P: Platform> {
    platform: Arc<P>,
    dev: PciAddr,
    line: IrqLine,
    cookie: IrqCookie,
    context: Arc<IrqContext>,
}

impl<P: Platform> InterruptRegistration<P> {
    /// Attach the handler for `dev` to its interrupt line
    pub fn arm(
        platform: &Arc<P>,
        dev: PciAddr,
        window: &RegisterWindow<P>,
        regs: RegisterLayout,
        shared: bool,
    ) -> Result<Self> {
        let line = platform
            .irq_line(dev)
            .map_err(|_| Error::InterruptUnavailable)?;
        let flags = if shared {
            IrqFlags::SHARED
        } else {
            IrqFlags::empty()
        };

        let context = Arc::new(IrqContext::new(dev, window.mmio(), regs));
        // Armed before the line goes live so the first interrupt is not dropped
        context.armed.store(true, Ordering::Release);
        let handler: Arc<dyn InterruptHandler> = context.clone();
        let cookie = match platform.request_irq(dev, line, flags, handler) {
            Ok(cookie) => cookie,
            Err(e) => {
                context.disarm();
                return Err(e);
            },
        };
        log::debug!("{}: interrupt armed on {:?} ({:?})", dev, line, flags);

        Ok(Self {
            platform: Arc::clone(platform),
            dev,
            line,
            cookie,
            context,
        })
    }

    /// Line the handler is attached to
    pub fn line(&self) -> IrqLine {
        self.line
    }

    /// Shared handler state
    pub fn context(&self) -> &Arc<IrqContext> {
        &self.context
    }
}

impl<P: Platform> Drop for InterruptRegistration<P> {
    fn drop(&mut self) {
        self.context.disarm();
        self.platform.free_irq(self.dev, self.line, self.cookie);
        log::debug!("{}: interrupt disarmed on {:?}", self.dev, self.line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{EnabledDevice, ResourceHandle};
    use crate::testing::{platform, spec, DEV, IRQ};
    use pcidma_hal::sim::Faults;
    use std::thread;

    #[test]
    fn test_completion_counts() {
        let completion = Completion::new();
        assert!(!completion.try_wait());
        completion.complete();
        completion.complete();
        assert_eq!(completion.pending(), 2);
        assert!(completion.try_wait());
        completion.wait();
        assert!(!completion.try_wait());
    }

    #[test]
    fn test_handler_acks_and_completes() {
        let sim = platform();
        let device = EnabledDevice::enable(&sim, DEV).unwrap();
        let regions = ResourceHandle::reserve(&device, "pcie_dma").unwrap();
        let window = RegisterWindow::map(&regions, 0).unwrap();
        let irq =
            InterruptRegistration::arm(&sim, DEV, &window, RegisterLayout::DEFAULT, true).unwrap();
        assert_eq!(irq.line(), IrqLine::new(IRQ));

        assert_eq!(sim.raise_interrupt(DEV), IrqReturn::Handled);
        // Acknowledged: the device de-asserted
        assert_eq!(sim.register(DEV, 0, 0x1c), Some(0));
        assert!(irq.context().wait().is_ok());

        assert_eq!(sim.spurious_interrupt(IrqLine::new(IRQ)), IrqReturn::NotMine);
        let stats = irq.context().stats();
        assert_eq!(stats.handled, 1);
        assert_eq!(stats.spurious, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_disarm_stops_handler() {
        let sim = platform();
        let device = EnabledDevice::enable(&sim, DEV).unwrap();
        let regions = ResourceHandle::reserve(&device, "pcie_dma").unwrap();
        let window = RegisterWindow::map(&regions, 0).unwrap();
        let irq =
            InterruptRegistration::arm(&sim, DEV, &window, RegisterLayout::DEFAULT, true).unwrap();
        let context = Arc::clone(irq.context());
        drop(irq);

        assert!(!context.is_armed());
        assert_eq!(sim.irq_table().handler_count(IrqLine::new(IRQ)), 0);
        assert_eq!(sim.raise_interrupt(DEV), IrqReturn::NotMine);
        assert_eq!(context.wait(), Err(Error::NotBound));
    }

    #[test]
    fn test_exclusive_line_conflict() {
        let sim = platform();
        let other = PciAddr::new(0, 0x3b, 0, 0);
        sim.add_device(spec(other, 0xfeaf_0000, IRQ));

        let dev_a = EnabledDevice::enable(&sim, DEV).unwrap();
        let reg_a = ResourceHandle::reserve(&dev_a, "pcie_dma").unwrap();
        let win_a = RegisterWindow::map(&reg_a, 0).unwrap();
        let _irq_a =
            InterruptRegistration::arm(&sim, DEV, &win_a, RegisterLayout::DEFAULT, false).unwrap();

        let dev_b = EnabledDevice::enable(&sim, other).unwrap();
        let reg_b = ResourceHandle::reserve(&dev_b, "pcie_dma").unwrap();
        let win_b = RegisterWindow::map(&reg_b, 0).unwrap();
        assert_eq!(
            InterruptRegistration::arm(&sim, other, &win_b, RegisterLayout::DEFAULT, true)
                .unwrap_err(),
            Error::AlreadyInUse
        );
    }

    #[test]
    fn test_shared_line_routes_to_owner() {
        let sim = platform();
        let other = PciAddr::new(0, 0x3b, 0, 0);
        sim.add_device(spec(other, 0xfeaf_0000, IRQ));

        let dev_a = EnabledDevice::enable(&sim, DEV).unwrap();
        let reg_a = ResourceHandle::reserve(&dev_a, "pcie_dma").unwrap();
        let win_a = RegisterWindow::map(&reg_a, 0).unwrap();
        let irq_a =
            InterruptRegistration::arm(&sim, DEV, &win_a, RegisterLayout::DEFAULT, true).unwrap();

        let dev_b = EnabledDevice::enable(&sim, other).unwrap();
        let reg_b = ResourceHandle::reserve(&dev_b, "pcie_dma").unwrap();
        let win_b = RegisterWindow::map(&reg_b, 0).unwrap();
        let irq_b =
            InterruptRegistration::arm(&sim, other, &win_b, RegisterLayout::DEFAULT, true).unwrap();

        assert_eq!(sim.raise_interrupt(other), IrqReturn::Handled);
        assert_eq!(irq_a.context().stats().handled, 0);
        assert_eq!(irq_b.context().stats().handled, 1);
    }

    #[test]
    fn test_request_failure_leaves_nothing() {
        let sim = platform();
        let device = EnabledDevice::enable(&sim, DEV).unwrap();
        let regions = ResourceHandle::reserve(&device, "pcie_dma").unwrap();
        let window = RegisterWindow::map(&regions, 0).unwrap();
        sim.inject(Faults::REQUEST_IRQ);
        assert_eq!(
            InterruptRegistration::arm(&sim, DEV, &window, RegisterLayout::DEFAULT, true)
                .unwrap_err(),
            Error::AlreadyInUse
        );
        assert_eq!(sim.irq_table().handler_count(IrqLine::new(IRQ)), 0);
    }

    #[test]
    fn test_wait_across_threads() {
        let sim = platform();
        let device = EnabledDevice::enable(&sim, DEV).unwrap();
        let regions = ResourceHandle::reserve(&device, "pcie_dma").unwrap();
        let window = RegisterWindow::map(&regions, 0).unwrap();
        let irq =
            InterruptRegistration::arm(&sim, DEV, &window, RegisterLayout::DEFAULT, true).unwrap();
        let context = Arc::clone(irq.context());

        let waiter = thread::spawn(move || context.wait());
        let raiser = {
            let sim = Arc::clone(&sim);
            thread::spawn(move || sim.raise_interrupt(DEV))
        };
        assert_eq!(raiser.join().unwrap(), IrqReturn::Handled);
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }
}
