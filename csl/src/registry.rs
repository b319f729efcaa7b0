// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! KMD device registry
//!
//! Every camera kernel device the instance opened at initialization gets a
//! [`KmdDevice`] record: its fd, type, operations, guard, active flag and
//! the table of handles sessions currently hold on it. Records are shared
//! as `Arc`s so sessions can reach their backing device without going
//! through the registry lock.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kmd::{
    Capabilities, DeviceContext, DeviceHandle, DeviceOps, DeviceType, Kernel, MAX_HANDLES,
    MediaEntity, PlatformInfo, Version, ops_for,
};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::config::CslConfig;
use crate::guard::{GuardKind, LifecycleState, RefGuard};
use crate::{CslError, Result};

/// A kernel device slot.
pub struct KmdDevice {
    index: usize,
    device_type: DeviceType,
    entity: MediaEntity,
    fd: RawFd,
    kernel: Arc<dyn Kernel>,
    ops: Box<dyn DeviceOps>,
    caps: Capabilities,
    pub(crate) guard: RefGuard,
    active: AtomicBool,
    acquired: Mutex<Vec<DeviceHandle>>,
}

impl KmdDevice {
    /// Open `entity` and bind the operations for its type.
    pub(crate) fn open(
        kernel: Arc<dyn Kernel>,
        entity: MediaEntity,
        device_type: DeviceType,
        index: usize,
        config: &CslConfig,
    ) -> Result<Self> {
        let fd = kmd::open_with_retry(
            kernel.as_ref(),
            &entity,
            config.open_retry.max_attempts,
            config.open_retry.sleep(),
        )?;
        let mut device = KmdDevice {
            index,
            device_type,
            entity,
            fd,
            kernel,
            ops: ops_for(device_type),
            caps: Capabilities::default(),
            guard: RefGuard::new(GuardKind::KmdDevice),
            active: AtomicBool::new(false),
            acquired: Mutex::new(vec![DeviceHandle::INVALID; MAX_HANDLES]),
        };
        if !device_type.is_private() {
            match device.ops.query_caps(&device.context()) {
                Ok(caps) => device.caps = caps,
                Err(e) => warn!(
                    "{} [{}] capability query failed: {e}",
                    device.device_type, device.index
                ),
            }
        }
        debug!(
            "opened {} as {} [{}] fd {}",
            device.entity.name, device.device_type, device.index, device.fd
        );
        Ok(device)
    }

    pub(crate) fn context(&self) -> DeviceContext<'_> {
        DeviceContext {
            kernel: self.kernel.as_ref(),
            fd: self.fd,
            index: self.index,
            device_type: self.device_type,
        }
    }

    pub(crate) fn ops(&self) -> &dyn DeviceOps {
        self.ops.as_ref()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn name(&self) -> &str {
        &self.entity.name
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    fn acquired(&self) -> MutexGuard<'_, Vec<DeviceHandle>> {
        self.acquired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a handle a session acquired on this device.
    pub(crate) fn record_acquired(&self, handle: DeviceHandle) -> Result<()> {
        let mut acquired = self.acquired();
        let limit = acquired.len();
        let slot = acquired
            .get_mut(handle.index())
            .ok_or(CslError::OutOfBounds {
                index: handle.index(),
                limit,
            })?;
        *slot = handle;
        Ok(())
    }

    pub(crate) fn clear_acquired(&self, handle: DeviceHandle) {
        if let Some(slot) = self.acquired().get_mut(handle.index()) {
            if *slot == handle {
                *slot = DeviceHandle::INVALID;
            } else {
                warn!(
                    "{} [{}] slot {} holds {slot}, not {handle}",
                    self.device_type,
                    self.index,
                    handle.index()
                );
            }
        }
    }

    /// Handles currently held on this device.
    pub fn acquired_handles(&self) -> Vec<DeviceHandle> {
        self.acquired()
            .iter()
            .copied()
            .filter(|handle| handle.is_valid())
            .collect()
    }

    /// Platform versions, answered by the CPAS device.
    pub(crate) fn query_platform(&self) -> Result<PlatformInfo> {
        Ok(self.ops.query_platform(&self.context())?)
    }

    /// Invalidate and close the device. The refcount must have drained.
    pub(crate) fn close(&self) {
        self.guard.set_state(LifecycleState::Invalid);
        let refcount = self.guard.refcount();
        if refcount != 0 {
            error!(
                "{} [{}] closed with refcount {refcount}",
                self.device_type, self.index
            );
        }
        if let Err(e) = self.kernel.close(self.fd) {
            warn!("closing {} fd {} failed: {e}", self.entity.name, self.fd);
        }
        self.guard.reset();
    }
}

/// Public description of a KMD device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub index: usize,
    pub device_type: DeviceType,
    pub name: String,
    pub driver_version: Version,
    pub hw_version: Version,
    pub refcount: u32,
    pub active: bool,
    pub acquired: usize,
}

impl From<&KmdDevice> for DeviceDescriptor {
    fn from(device: &KmdDevice) -> Self {
        DeviceDescriptor {
            index: device.index,
            device_type: device.device_type,
            name: device.entity.name.clone(),
            driver_version: device.caps.driver_version,
            hw_version: device.caps.hw_version,
            refcount: device.guard.refcount(),
            active: device.is_active(),
            acquired: device.acquired_handles().len(),
        }
    }
}

/// The enumerated KMD devices, in enumeration order.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Vec<Arc<KmdDevice>>,
}

impl DeviceRegistry {
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<KmdDevice>> {
        self.devices.get(index)
    }

    /// Look up a device by a caller-supplied index.
    pub fn lookup(&self, index: i32) -> Result<Arc<KmdDevice>> {
        let slot = usize::try_from(index)
            .map_err(|_| CslError::InvalidArgument(format!("device index {index}")))?;
        self.devices
            .get(slot)
            .cloned()
            .ok_or_else(|| CslError::InvalidArgument(format!("no device at index {index}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<KmdDevice>> {
        self.devices.iter()
    }

    /// Enumerate and open every public camera device among `entities`.
    ///
    /// Unknown groups and devices that fail to open are skipped.
    pub(crate) fn enumerate(
        &mut self,
        kernel: &Arc<dyn Kernel>,
        entities: &[MediaEntity],
        config: &CslConfig,
    ) {
        for entity in entities {
            if DeviceType::is_private_group(entity.group_id) {
                continue;
            }
            let Some(device_type) = DeviceType::from_group_id(entity.group_id) else {
                warn!(
                    "skipping {} with unknown group id 0x{:x}",
                    entity.name, entity.group_id
                );
                continue;
            };
            if self.devices.len() >= config.max_kmd_devices {
                warn!("device table full, ignoring {}", entity.name);
                break;
            }

            let index = self.devices.len();
            match KmdDevice::open(kernel.clone(), entity.clone(), device_type, index, config) {
                Ok(device) => {
                    if device_type == DeviceType::ImageSensor {
                        info!("sensor slot {index} at {}", entity.name);
                    }
                    device.guard.set_state(LifecycleState::Valid);
                    self.devices.push(Arc::new(device));
                }
                Err(e) => error!("failed to add {} ({device_type}): {e}", entity.name),
            }
        }

        if self.devices.is_empty() {
            warn!("no KMD devices found");
        } else {
            info!("{} KMD devices enumerated", self.devices.len());
        }
    }

    /// Remove every device, most recently enumerated first.
    pub(crate) fn drain_reverse(&mut self) -> Vec<Arc<KmdDevice>> {
        let mut devices = std::mem::take(&mut self.devices);
        devices.reverse();
        devices
    }
}

#[cfg(test)]
mod tests {
    use kmd::SimKernel;

    use super::*;

    fn enumerate(sim: &Arc<SimKernel>) -> DeviceRegistry {
        let kernel: Arc<dyn Kernel> = sim.clone();
        let entities = kernel.entities().unwrap();
        let mut registry = DeviceRegistry::default();
        registry.enumerate(&kernel, &entities, &CslConfig::for_testing());
        registry
    }

    #[test]
    fn test_enumerate_skips_private_and_unknown() {
        let sim = Arc::new(SimKernel::with_camera_topology());
        let registry = enumerate(&sim);

        assert_eq!(registry.len(), 11);
        assert!(registry.iter().all(|device| !device.device_type().is_private()));
        assert_eq!(registry.get(0).unwrap().device_type(), DeviceType::Ife);
        assert_eq!(sim.open_fd_count(), 11);
    }

    #[test]
    fn test_enumerate_retries_busy_nodes() {
        let sim = Arc::new(SimKernel::with_camera_topology());
        sim.busy_on_open("v4l-subdev1", 2);
        let registry = enumerate(&sim);
        assert_eq!(registry.get(0).unwrap().device_type(), DeviceType::Ife);
    }

    #[test]
    fn test_exhausted_retries_skip_only_that_device() {
        let sim = Arc::new(SimKernel::with_camera_topology());
        sim.busy_on_open("v4l-subdev1", 10);
        let registry = enumerate(&sim);
        assert_eq!(registry.len(), 10);
        assert_eq!(registry.get(0).unwrap().device_type(), DeviceType::Csiphy);
    }

    #[test]
    fn test_lookup_rejects_bad_index() {
        let sim = Arc::new(SimKernel::with_camera_topology());
        let registry = enumerate(&sim);
        assert!(matches!(registry.lookup(-1), Err(CslError::InvalidArgument(_))));
        assert!(matches!(registry.lookup(99), Err(CslError::InvalidArgument(_))));
    }

    #[test]
    fn test_acquired_slot_tracking() {
        let sim = Arc::new(SimKernel::with_camera_topology());
        let registry = enumerate(&sim);
        let device = registry.get(0).unwrap();
        let handle = DeviceHandle(kmd::handle::compose(1, 7));

        device.record_acquired(handle).unwrap();
        assert_eq!(device.acquired_handles(), vec![handle]);
        device.clear_acquired(handle);
        assert!(device.acquired_handles().is_empty());
    }

    #[test]
    fn test_lrme_capability_failure_is_not_fatal() {
        let sim = Arc::new(SimKernel::with_camera_topology());
        let registry = enumerate(&sim);
        let lrme = registry
            .iter()
            .find(|device| device.device_type() == DeviceType::Lrme)
            .unwrap();
        assert_eq!(lrme.capabilities(), &Capabilities::default());
    }
}
