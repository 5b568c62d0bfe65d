//! # Driver Front-End
//!
//! Entry points the bus and user space call: probe, remove, open and
//! shutdown. Bound instances are kept in a table keyed by bus address, so
//! any number of devices can be bound at once.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use pcidma_core::{Error, PciAddr, PciDeviceInfo, Result};
use pcidma_hal::Platform;
use spin::Mutex;

use crate::binding::{BindError, BindStep, DeviceInstance, LifecycleState};
use crate::config::DriverConfig;
use crate::node::{MinorMap, Session};

/// The PCIe DMA driver
#[derive(Debug)]
pub struct PcieDmaDriver<P: Platform> {
    platform: Arc<P>,
    config: DriverConfig,
    instances: Mutex<HashMap<PciAddr, Arc<DeviceInstance<P>>>>,
    failures: Mutex<HashMap<PciAddr, BindStep>>,
    minors: Arc<MinorMap>,
    /// Serializes bind and unbind
    transitions: Mutex<()>,
    next_session: AtomicU64,
}

impl<P: Platform> PcieDmaDriver<P> {
    /// Register the driver on `platform`
    pub fn new(platform: Arc<P>, config: DriverConfig) -> Result<Self> {
        config.validate()?;
        log::info!(
            "{}: registered on {} platform ({} id(s))",
            config.name,
            platform.name(),
            config.id_table.ids().len()
        );
        Ok(Self {
            platform,
            config,
            instances: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            minors: Arc::new(MinorMap::new()),
            transitions: Mutex::new(()),
            next_session: AtomicU64::new(1),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Platform the driver runs on
    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    /// Bind a newly discovered device
    pub fn probe(&self, info: &PciDeviceInfo) -> core::result::Result<(), BindError> {
        let _serial = self.transitions.lock();
        let dev = info.addr;

        if !self.config.id_table.matches(info) {
            log::debug!("{}: {} not handled by {}", dev, info.id, self.config.name);
            return Err(BindError::new(BindStep::Matching, Error::NoMatch));
        }
        if self.instances.lock().contains_key(&dev) {
            log::warn!("{}: already bound", dev);
            return Err(BindError::new(BindStep::Matching, Error::AlreadyBound));
        }

        match DeviceInstance::bind(&self.platform, &self.config, *info, &self.minors) {
            Ok(instance) => {
                self.failures.lock().remove(&dev);
                self.instances.lock().insert(dev, Arc::new(instance));
                Ok(())
            },
            Err(e) => {
                self.failures.lock().insert(dev, e.step);
                Err(e)
            },
        }
    }

    /// Unbind a device; `false` if it was not bound
    pub fn remove(&self, dev: PciAddr) -> bool {
        let _serial = self.transitions.lock();
        self.failures.lock().remove(&dev);
        let Some(instance) = self.instances.lock().remove(&dev) else {
            return false;
        };
        instance.teardown()
    }

    /// Open the device node called `node_name`
    pub fn open(&self, node_name: &str) -> Result<Session<P>> {
        let instance = self
            .instances
            .lock()
            .values()
            .find(|i| i.node_name() == node_name)
            .cloned()
            .ok_or(Error::NotFound)?;
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        Session::open(instance, id)
    }

    /// The bound instance at `dev`
    pub fn instance(&self, dev: PciAddr) -> Option<Arc<DeviceInstance<P>>> {
        self.instances.lock().get(&dev).cloned()
    }

    /// Lifecycle state of `dev` as seen by this driver
    pub fn state(&self, dev: PciAddr) -> LifecycleState {
        if let Some(instance) = self.instances.lock().get(&dev) {
            return instance.state();
        }
        self.failures
            .lock()
            .get(&dev)
            .map_or(LifecycleState::Unbound, |&step| LifecycleState::Failed(step))
    }

    /// Addresses of all bound devices, sorted
    pub fn bound_devices(&self) -> Vec<PciAddr> {
        let mut devices: Vec<PciAddr> = self.instances.lock().keys().copied().collect();
        devices.sort_unstable();
        devices
    }

    /// Unbind every device; returns how many were unbound
    pub fn shutdown(&self) -> usize {
        let _serial = self.transitions.lock();
        let drained: Vec<_> = self.instances.lock().drain().collect();
        let count = drained
            .into_iter()
            .filter(|(_, instance)| instance.teardown())
            .count();
        if count > 0 {
            log::info!("{}: unbound {} device(s)", self.config.name, count);
        }
        count
    }
}

impl<P: Platform> Drop for PcieDmaDriver<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
