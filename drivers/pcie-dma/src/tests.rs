//! End-to-end scenarios through the driver front-end on the simulated
//! platform.

use alloc::sync::Arc;
use alloc::vec::Vec;
use std::thread;

use pcidma_core::{ByteSize, Error, IrqLine, PciAddr};
use pcidma_hal::sim::{Faults, JournalEntry, ResourceKind, SimPlatform};
use pcidma_hal::IrqReturn;

use crate::binding::{BindStep, LifecycleState};
use crate::config::DriverConfig;
use crate::driver::PcieDmaDriver;
use crate::testing::{info, platform, spec, XorShift, BAR0_BASE, DEV, IRQ};

const MIB: u64 = 1 << 20;

const STEP_FAULTS: [(BindStep, Faults); 6] = [
    (BindStep::Enabling, Faults::ENABLE),
    (BindStep::RegionsReserved, Faults::REQUEST_REGIONS),
    (BindStep::RegistersMapped, Faults::IOMAP),
    (BindStep::DmaAllocated, Faults::ALLOC_COHERENT),
    (BindStep::InterruptArmed, Faults::REQUEST_IRQ),
    (BindStep::NodeCreated, Faults::CREATE_NODE),
];

fn default_driver(sim: &Arc<SimPlatform>) -> PcieDmaDriver<SimPlatform> {
    PcieDmaDriver::new(Arc::clone(sim), DriverConfig::DEFAULT).unwrap()
}

fn acquired(journal: &[JournalEntry]) -> Vec<ResourceKind> {
    journal
        .iter()
        .filter_map(|e| match *e {
            JournalEntry::Acquired(_, kind) => Some(kind),
            JournalEntry::Released(..) => None,
        })
        .collect()
}

fn released(journal: &[JournalEntry]) -> Vec<ResourceKind> {
    journal
        .iter()
        .filter_map(|e| match *e {
            JournalEntry::Released(_, kind) => Some(kind),
            JournalEntry::Acquired(..) => None,
        })
        .collect()
}

#[test]
fn test_happy_path() {
    let sim = platform();
    let driver = default_driver(&sim);

    driver.probe(&info(DEV)).unwrap();
    assert_eq!(driver.state(DEV), LifecycleState::Active);
    assert!(sim.node_exists("pcie_dma0"));
    assert!(sim.is_bus_master(DEV));
    assert_eq!(acquired(&sim.journal_for(DEV)).len(), 6);

    assert!(driver.remove(DEV));
    let journal = sim.journal_for(DEV);
    let mut order = acquired(&journal);
    order.reverse();
    assert_eq!(released(&journal), order);
    assert_eq!(driver.state(DEV), LifecycleState::Unbound);
    assert_eq!(sim.outstanding(DEV), 0);
    assert!(!sim.node_exists("pcie_dma0"));
}

#[test]
fn test_double_unbind_is_noop() {
    let sim = platform();
    let driver = default_driver(&sim);
    driver.probe(&info(DEV)).unwrap();
    assert!(driver.remove(DEV));
    let journal = sim.journal();
    assert!(!driver.remove(DEV));
    assert_eq!(sim.journal(), journal);
}

#[test]
fn test_randomized_failure_injection() {
    let mut rng = XorShift::new(0x5eed_cafe);
    for round in 0..64 {
        let sim = platform();
        let config = DriverConfig::DEFAULT.with_buffer_size(ByteSize::from_kib(64));
        let driver = PcieDmaDriver::new(Arc::clone(&sim), config).unwrap();

        // Zero, one or two faulty points
        let mut faults = Faults::empty();
        for _ in 0..rng.below(3) {
            faults |= STEP_FAULTS[rng.below(6) as usize].1;
        }
        sim.inject(faults);

        let result = driver.probe(&info(DEV));
        let first_faulty = STEP_FAULTS
            .iter()
            .position(|&(_, f)| faults.contains(f));
        match (result, first_faulty) {
            (Ok(()), None) => {
                assert_eq!(sim.outstanding(DEV), 6, "round {}", round);
                driver.remove(DEV);
            },
            (Err(e), Some(k)) => {
                assert_eq!(e.step, STEP_FAULTS[k].0, "round {}", round);
                let journal = sim.journal_for(DEV);
                // Exactly the k steps before the failing one, then unwound
                assert_eq!(acquired(&journal).len(), k, "round {}", round);
                let mut order = acquired(&journal);
                order.reverse();
                assert_eq!(released(&journal), order, "round {}", round);
            },
            (result, expected) => panic!("round {}: {:?} vs {:?}", round, result, expected),
        }
        assert_eq!(sim.outstanding(DEV), 0, "round {}", round);
        assert_ne!(driver.state(DEV), LifecycleState::Active);
    }
}

#[test]
fn test_reservation_conflict() {
    let sim = platform();
    let twin = PciAddr::new(0, 0x3b, 0, 0);
    // Overlaps the first device's BAR
    sim.add_device(spec(twin, BAR0_BASE + 0x800, IRQ + 1));
    let driver = default_driver(&sim);

    driver.probe(&info(DEV)).unwrap();
    let before = sim.journal_for(DEV);

    let err = driver.probe(&info(twin)).unwrap_err();
    assert_eq!(err.step, BindStep::RegionsReserved);
    assert_eq!(err.error, Error::Busy);
    assert_eq!(sim.outstanding(twin), 0);
    assert_eq!(
        sim.journal_for(twin),
        [
            JournalEntry::Acquired(twin, ResourceKind::Device),
            JournalEntry::Released(twin, ResourceKind::Device),
        ]
    );

    // The first binding is untouched
    assert_eq!(sim.journal_for(DEV), before);
    assert_eq!(driver.state(DEV), LifecycleState::Active);
    assert_eq!(sim.outstanding(DEV), 6);
}

#[test]
fn test_second_driver_leaves_binding_intact() {
    let sim = platform();
    let first = default_driver(&sim);
    let second = PcieDmaDriver::new(
        Arc::clone(&sim),
        DriverConfig::DEFAULT.with_name("pcie_dma_b"),
    )
    .unwrap();

    first.probe(&info(DEV)).unwrap();
    let err = second.probe(&info(DEV)).unwrap_err();
    assert_eq!(err.step, BindStep::RegionsReserved);
    assert_eq!(err.error, Error::Busy);

    // The failed bind released only its own enable
    assert!(sim.is_enabled(DEV));
    assert!(sim.is_bus_master(DEV));
    assert_eq!(sim.outstanding(DEV), 6);
    assert_eq!(first.state(DEV), LifecycleState::Active);

    assert!(first.remove(DEV));
    assert!(!sim.is_enabled(DEV));
    assert_eq!(sim.outstanding(DEV), 0);
}

#[test]
fn test_interrupt_arming_failure() {
    let sim = platform();
    let holder = PciAddr::new(0, 0x3b, 0, 0);
    sim.add_device(spec(holder, 0xfeaf_0000, IRQ));

    // Another driver holds the line exclusively
    let exclusive = PcieDmaDriver::new(
        Arc::clone(&sim),
        DriverConfig::DEFAULT
            .with_name("exclusive")
            .with_shared_irq(false)
            .with_buffer_size(ByteSize::from_kib(64)),
    )
    .unwrap();
    exclusive.probe(&info(holder)).unwrap();

    let driver = default_driver(&sim);
    let err = driver.probe(&info(DEV)).unwrap_err();
    assert_eq!(err.step, BindStep::InterruptArmed);
    assert_eq!(err.error, Error::AlreadyInUse);
    assert_eq!(driver.state(DEV), LifecycleState::Failed(BindStep::InterruptArmed));

    let journal = sim.journal_for(DEV);
    assert_eq!(
        acquired(&journal),
        [
            ResourceKind::Device,
            ResourceKind::Regions,
            ResourceKind::Registers,
            ResourceKind::DmaBuffer,
        ]
    );
    assert_eq!(
        released(&journal),
        [
            ResourceKind::DmaBuffer,
            ResourceKind::Registers,
            ResourceKind::Regions,
            ResourceKind::Device,
        ]
    );
    assert_eq!(sim.outstanding(DEV), 0);
    assert_eq!(sim.irq_table().handler_count(IrqLine::new(IRQ)), 1);
}

#[test]
fn test_mmap_boundaries() {
    let sim = platform();
    let driver = default_driver(&sim);
    driver.probe(&info(DEV)).unwrap();
    let session = driver.open("pcie_dma0").unwrap();

    assert_eq!(session.mmap(8 * MIB, 0).unwrap_err(), Error::InvalidArgument);
    let whole = session.mmap(4 * MIB, 0).unwrap();
    let upper = session.mmap(2 * MIB, 2 * MIB).unwrap();
    assert_eq!(whole.len(), 4 * MIB);
    assert_eq!(upper.offset(), 2 * MIB);
}

#[test]
fn test_mapping_round_trip() {
    let sim = platform();
    let driver = default_driver(&sim);
    driver.probe(&info(DEV)).unwrap();
    let session = driver.open("pcie_dma0").unwrap();
    let mapping = session.mmap(4 * MIB, 0).unwrap();

    session.write(0x1234, &[0x5a, 0xa5]).unwrap();
    let mut out = [0u8; 2];
    mapping.read(0x1234, &mut out).unwrap();
    assert_eq!(out, [0x5a, 0xa5]);

    mapping.write(4 * MIB - 4, b"tail").unwrap();
    let mut tail = [0u8; 4];
    session.read(4 * MIB - 4, &mut tail).unwrap();
    assert_eq!(&tail, b"tail");
}

#[test]
fn test_removal_revokes_mappings() {
    let sim = platform();
    let driver = default_driver(&sim);
    driver.probe(&info(DEV)).unwrap();
    let session = driver.open("pcie_dma0").unwrap();
    let mapping = session.mmap(MIB, 0).unwrap();
    assert_eq!(sim.user_mappings(), 1);

    driver.remove(DEV);
    assert!(mapping.is_revoked());
    assert_eq!(sim.user_mappings(), 0);
    assert_eq!(sim.dma_allocations(), 0);
    let mut out = [0u8; 8];
    assert_eq!(mapping.read(0, &mut out), Err(Error::NotBound));
    assert_eq!(session.read(0, &mut out), Err(Error::NotBound));
}

#[test]
fn test_transfer_completion() {
    let sim = platform();
    let driver = default_driver(&sim);
    driver.probe(&info(DEV)).unwrap();
    let session = driver.open("pcie_dma0").unwrap();

    session.start_transfer(0, 4096).unwrap();
    assert_eq!(session.try_wait(), Ok(false));

    let device = {
        let sim = Arc::clone(&sim);
        thread::spawn(move || sim.raise_interrupt(DEV))
    };
    assert_eq!(session.wait_for_interrupt(), Ok(()));
    assert_eq!(device.join().unwrap(), IrqReturn::Handled);

    // Delivered before anyone waits: kept, not lost
    assert_eq!(sim.raise_interrupt(DEV), IrqReturn::Handled);
    assert_eq!(session.try_wait(), Ok(true));
    assert_eq!(session.try_wait(), Ok(false));

    let stats = session.interrupt_stats();
    assert_eq!(stats.handled, 2);
    assert_eq!(stats.pending, 0);
}

#[test]
fn test_spurious_interrupts() {
    let sim = platform();
    let driver = default_driver(&sim);
    driver.probe(&info(DEV)).unwrap();

    assert_eq!(sim.spurious_interrupt(IrqLine::new(IRQ)), IrqReturn::NotMine);
    let instance = driver.instance(DEV).unwrap();
    assert_eq!(instance.interrupt_stats().spurious, 1);
    assert_eq!(instance.try_wait_interrupt(), Ok(false));
}

#[test]
fn test_removal_wakes_waiter() {
    let sim = platform();
    let driver = default_driver(&sim);
    driver.probe(&info(DEV)).unwrap();
    let session = driver.open("pcie_dma0").unwrap();

    let waiter = thread::spawn(move || session.wait_for_interrupt());
    assert!(driver.remove(DEV));
    assert_eq!(waiter.join().unwrap(), Err(Error::NotBound));
    assert_eq!(sim.raise_interrupt(DEV), IrqReturn::NotMine);
}

#[test]
fn test_concurrent_interrupts_during_removal() {
    let sim = platform();
    let driver = default_driver(&sim);
    driver.probe(&info(DEV)).unwrap();

    let storm = {
        let sim = Arc::clone(&sim);
        thread::spawn(move || {
            let mut handled = 0u32;
            for _ in 0..10_000 {
                if sim.raise_interrupt(DEV) == IrqReturn::Handled {
                    handled += 1;
                }
            }
            handled
        })
    };
    driver.remove(DEV);
    let handled = storm.join().unwrap();
    assert!(handled <= 10_000);

    // Nothing was left attached to the line
    assert_eq!(sim.irq_table().handler_count(IrqLine::new(IRQ)), 0);
    assert_eq!(sim.outstanding(DEV), 0);
}
