// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The CSL instance
//!
//! [`Csl`] is the explicit context every operation runs against. It owns
//! the kernel connection, the device registry, the session table and the
//! event dispatch thread. [`Csl::initialize`] and [`Csl::uninitialize`]
//! bracket its useful life; between them callers on any thread open
//! sessions and drive devices through it.

use std::process;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kmd::{
    Capabilities, ControlOp, ControlReply, DeviceType, EventKind, Kernel, MediaEntity,
    PlatformInfo,
};
use log::{debug, error, info, warn};

use crate::config::CslConfig;
use crate::dispatch::EventDispatcher;
use crate::guard::{GuardKind, LifecycleState, RefGuard, RefHold};
use crate::registry::{DeviceDescriptor, DeviceRegistry, KmdDevice};
use crate::session::SessionTable;
use crate::{CslError, Result};

#[derive(Default)]
struct PrivateDevices {
    cpas: Option<Arc<KmdDevice>>,
    dispatcher: Option<EventDispatcher>,
    platform: Option<PlatformInfo>,
}

/// Camera hardware session and device lifecycle manager.
pub struct Csl {
    pub(crate) kernel: Arc<dyn Kernel>,
    pub(crate) config: CslConfig,
    pub(crate) guard: RefGuard,
    owner: Mutex<Option<u32>>,
    pub(crate) registry: RwLock<DeviceRegistry>,
    pub(crate) sessions: Arc<SessionTable>,
    request_manager: RwLock<Option<Arc<KmdDevice>>>,
    private: Mutex<PrivateDevices>,
}

impl Csl {
    /// Create an uninitialized instance over `kernel`.
    pub fn new(kernel: Arc<dyn Kernel>, config: CslConfig) -> Result<Self> {
        config.validate()?;
        Ok(Csl {
            kernel,
            sessions: Arc::new(SessionTable::new(config.max_sessions)),
            config,
            guard: RefGuard::new(GuardKind::Instance),
            owner: Mutex::new(None),
            registry: RwLock::new(DeviceRegistry::default()),
            request_manager: RwLock::new(None),
            private: Mutex::new(PrivateDevices::default()),
        })
    }

    pub fn config(&self) -> &CslConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.guard.state()
    }

    pub fn is_initialized(&self) -> bool {
        self.guard.state() == LifecycleState::Valid
    }

    // ========================================================================
    // Init / Shutdown
    // ========================================================================

    /// Open the private devices, start event dispatch and enumerate every
    /// KMD device.
    pub fn initialize(&self) -> Result<()> {
        if self.guard.state() != LifecycleState::Invalid {
            return Err(CslError::InvalidState(format!(
                "instance already in state {:?}",
                self.guard.state()
            )));
        }
        let entities = self.kernel.entities()?;
        if let Err(e) = self.bring_up(&entities) {
            error!("initialization failed: {e}");
            self.tear_down();
            return Err(e);
        }

        *self.owner_lock() = Some(process::id());
        self.guard.set_state(LifecycleState::Valid);
        info!(
            "CSL initialized with {} KMD devices",
            self.read_registry().len()
        );
        Ok(())
    }

    fn bring_up(&self, entities: &[MediaEntity]) -> Result<()> {
        let rm_entity = find_private(entities, DeviceType::RequestManager)?;
        let request_manager = Arc::new(KmdDevice::open(
            self.kernel.clone(),
            rm_entity.clone(),
            DeviceType::RequestManager,
            0,
            &self.config,
        )?);
        *self.request_manager.write().unwrap_or_else(PoisonError::into_inner) =
            Some(request_manager.clone());
        for kind in [EventKind::Sof, EventKind::SofBootTimestamp, EventKind::Error] {
            self.kernel.subscribe(request_manager.fd(), kind)?;
        }

        let sessions = self.sessions.clone();
        let dispatcher = EventDispatcher::start(
            self.kernel.clone(),
            self.config.max_kmd_devices + 2,
            Box::new(move |event| sessions.route(event)),
        )?;
        dispatcher.add_fd(request_manager.fd())?;
        self.private_lock().dispatcher = Some(dispatcher);

        let cpas_entity = find_private(entities, DeviceType::CpasTop)?;
        let cpas = Arc::new(KmdDevice::open(
            self.kernel.clone(),
            cpas_entity.clone(),
            DeviceType::CpasTop,
            0,
            &self.config,
        )?);
        let mut private = self.private_lock();
        private.cpas = Some(cpas.clone());
        if let Some(dispatcher) = &private.dispatcher {
            dispatcher.add_fd(cpas.fd())?;
        }
        match cpas.query_platform() {
            Ok(platform) => {
                info!(
                    "camera family {} platform {} cpas {}",
                    platform.family, platform.platform_version, platform.cpas_version
                );
                private.platform = Some(platform);
            }
            Err(e) => warn!("platform query failed: {e}"),
        }

        let mut registry = self.write_registry();
        registry.enumerate(&self.kernel, entities, &self.config);
        if let Some(dispatcher) = &private.dispatcher {
            for device in registry.iter() {
                dispatcher.add_fd(device.fd())?;
            }
        }
        Ok(())
    }

    /// Close every device in reverse order of opening and stop dispatch.
    fn tear_down(&self) {
        let devices = self.write_registry().drain_reverse();
        let mut private = std::mem::take(&mut *self.private_lock());

        let forget = |device: &KmdDevice| {
            let removed = private
                .dispatcher
                .as_ref()
                .map(|dispatcher| dispatcher.remove_fd(device.fd()));
            if let Some(Err(e)) = removed {
                warn!("failed to stop polling {}: {e}", device.name());
            }
            device.close();
        };

        for device in &devices {
            forget(device);
        }
        if let Some(cpas) = &private.cpas {
            forget(cpas);
        }
        let request_manager = self
            .request_manager
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(request_manager) = &request_manager {
            forget(request_manager);
        }
        if let Some(dispatcher) = private.dispatcher.as_mut() {
            dispatcher.stop();
        }
        *self.owner_lock() = None;
        debug!("instance torn down");
    }

    /// Tear the instance down. Only the initializing process may do this.
    ///
    /// Sessions still open are destroyed and in-flight operations are
    /// waited for before any device is closed.
    pub fn uninitialize(&self) -> Result<()> {
        if self.guard.state() != LifecycleState::Valid {
            return Err(CslError::InvalidState("instance not initialized".to_string()));
        }
        let owner = *self.owner_lock();
        if owner != Some(process::id()) {
            return Err(CslError::InvalidState(format!(
                "caller {} is not the owner {owner:?}",
                process::id()
            )));
        }
        if !self.guard.begin_destroy() {
            return Err(CslError::InvalidState(
                "instance already being torn down".to_string(),
            ));
        }

        let abandoned = self.sessions.take_all();
        if !abandoned.is_empty() {
            warn!(
                "uninitializing with {} session(s) still open",
                abandoned.len()
            );
        }
        for session in &abandoned {
            self.abandon_session(session);
        }
        self.guard.wait_drained();

        self.tear_down();
        self.guard.set_state(LifecycleState::Invalid);
        self.guard.reset();
        info!("CSL uninitialized");
        Ok(())
    }

    // ========================================================================
    // Platform and Devices
    // ========================================================================

    pub fn query_platform(&self) -> Result<PlatformInfo> {
        let _instance = self.instance_ref()?;
        self.private_lock()
            .platform
            .ok_or_else(|| CslError::Failed("platform version unknown".to_string()))
    }

    /// Describe the KMD device at `index`; [`CslError::NoMore`] past the
    /// last one.
    pub fn enumerate_devices(&self, index: i32) -> Result<DeviceDescriptor> {
        let slot = usize::try_from(index)
            .map_err(|_| CslError::InvalidArgument(format!("device index {index}")))?;
        let _instance = self.instance_ref()?;
        self.read_registry()
            .get(slot)
            .map(|device| DeviceDescriptor::from(device.as_ref()))
            .ok_or(CslError::NoMore)
    }

    pub fn device_count(&self) -> usize {
        self.read_registry().len()
    }

    pub fn query_device_capabilities(&self, index: i32) -> Result<Capabilities> {
        let _instance = self.instance_ref()?;
        Ok(self.read_registry().lookup(index)?.capabilities().clone())
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    pub(crate) fn instance_ref(&self) -> Result<RefHold<'_>> {
        RefHold::acquire(&self.guard)
            .ok_or_else(|| CslError::InvalidState("instance not valid".to_string()))
    }

    pub(crate) fn read_registry(&self) -> RwLockReadGuard<'_, DeviceRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, DeviceRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn private_lock(&self) -> MutexGuard<'_, PrivateDevices> {
        self.private.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owner_lock(&self) -> MutexGuard<'_, Option<u32>> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a KMD device by caller index.
    pub(crate) fn kmd_device(&self, index: i32) -> Result<Arc<KmdDevice>> {
        self.read_registry().lookup(index)
    }

    /// Issue a request on the request manager node.
    pub(crate) fn request(&self, op: &ControlOp) -> Result<ControlReply> {
        let request_manager = self
            .request_manager
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| CslError::InvalidState("request manager not open".to_string()))?;
        Ok(request_manager.context().control(op)?)
    }

    /// Report corrupted shared state.
    pub(crate) fn fatal(&self, message: String) -> CslError {
        error!("fatal: {message}");
        if self.config.abort_on_fatal {
            process::abort();
        }
        CslError::Fatal(message)
    }

    /// Report a failure the debug policy may want a crash dump for.
    pub(crate) fn critical_failure(&self, message: &str) {
        error!("critical failure: {message}");
        if self.config.abort_on_critical_failure {
            process::abort();
        }
    }
}

impl Drop for Csl {
    fn drop(&mut self) {
        if !self.is_initialized() {
            return;
        }
        if let Err(e) = self.uninitialize() {
            error!("shutdown on drop failed: {e}");
        }
    }
}

fn find_private(entities: &[MediaEntity], device_type: DeviceType) -> Result<&MediaEntity> {
    entities
        .iter()
        .find(|entity| DeviceType::from_group_id(entity.group_id) == Some(device_type))
        .ok_or_else(|| CslError::Failed(format!("no {device_type} node")))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use kmd::SimKernel;

    use super::*;

    fn instance() -> (Arc<SimKernel>, Csl) {
        let sim = Arc::new(SimKernel::with_camera_topology());
        let csl = Csl::new(sim.clone(), CslConfig::for_testing()).unwrap();
        (sim, csl)
    }

    #[test]
    fn test_initialize_and_uninitialize() {
        let (sim, csl) = instance();
        csl.initialize().unwrap();
        assert!(csl.is_initialized());
        assert_eq!(csl.device_count(), 11);
        // 11 devices, request manager and CPAS
        assert_eq!(sim.open_fd_count(), 13);

        csl.uninitialize().unwrap();
        assert_eq!(csl.state(), LifecycleState::Invalid);
        assert_eq!(sim.open_fd_count(), 0);
    }

    #[test]
    fn test_double_initialize_rejected() {
        let (_sim, csl) = instance();
        csl.initialize().unwrap();
        assert!(matches!(csl.initialize(), Err(CslError::InvalidState(_))));
    }

    #[test]
    fn test_reinitialize_after_shutdown() {
        let (_sim, csl) = instance();
        csl.initialize().unwrap();
        csl.uninitialize().unwrap();
        csl.initialize().unwrap();
        assert_eq!(csl.device_count(), 11);
    }

    #[test]
    fn test_uninitialize_destroys_open_sessions() {
        let (sim, csl) = instance();
        csl.initialize().unwrap();
        let session = csl.open().unwrap();
        csl.acquire_device(session, 0, &[], &[], "ife").unwrap();

        csl.uninitialize().unwrap();
        assert!(csl.sessions().is_empty());
        assert_eq!(csl.guard.refcount(), 0);
        assert_eq!(sim.call_count("destroy_session"), 1);
        assert_eq!(sim.open_fd_count(), 0);

        csl.initialize().unwrap();
        assert!(matches!(
            csl.close(session),
            Err(CslError::InvalidArgument(_))
        ));
        let fresh = csl.open().unwrap();
        assert_eq!(csl.guard.refcount(), 1);
        csl.close(fresh).unwrap();
        assert_eq!(csl.guard.refcount(), 0);
    }

    #[test]
    fn test_uninitialize_waits_for_in_flight_operations() {
        let (sim, csl) = instance();
        csl.initialize().unwrap();
        let finished = AtomicBool::new(false);

        thread::scope(|scope| {
            let hold = csl.instance_ref().unwrap();
            scope.spawn(|| {
                let _hold = hold;
                thread::sleep(Duration::from_millis(20));
                assert_eq!(sim.open_fd_count(), 13);
                finished.store(true, Ordering::SeqCst);
            });
            csl.uninitialize().unwrap();
            assert!(finished.load(Ordering::SeqCst));
        });
        assert_eq!(sim.open_fd_count(), 0);
    }

    #[test]
    fn test_uninitialize_requires_initialize() {
        let (_sim, csl) = instance();
        assert!(matches!(csl.uninitialize(), Err(CslError::InvalidState(_))));
    }

    #[test]
    fn test_missing_request_manager_unwinds() {
        let sim = Arc::new(SimKernel::new(Vec::new()));
        let csl = Csl::new(sim.clone(), CslConfig::for_testing()).unwrap();
        assert!(matches!(csl.initialize(), Err(CslError::Failed(_))));
        assert_eq!(csl.state(), LifecycleState::Invalid);
        assert_eq!(sim.open_fd_count(), 0);
    }

    #[test]
    fn test_enumerate_devices_until_no_more() {
        let (_sim, csl) = instance();
        csl.initialize().unwrap();
        let first = csl.enumerate_devices(0).unwrap();
        assert_eq!(first.device_type, DeviceType::Ife);
        assert_eq!(first.refcount, 0);
        assert!(matches!(csl.enumerate_devices(11), Err(CslError::NoMore)));
        assert!(matches!(
            csl.enumerate_devices(-1),
            Err(CslError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_query_platform() {
        let (_sim, csl) = instance();
        assert!(matches!(
            csl.query_platform(),
            Err(CslError::InvalidState(_))
        ));
        csl.initialize().unwrap();
        let platform = csl.query_platform().unwrap();
        assert_eq!(platform.cpas_version.major, 1);
    }

    #[test]
    fn test_drop_shuts_down() {
        let (sim, csl) = instance();
        csl.initialize().unwrap();
        drop(csl);
        assert_eq!(sim.open_fd_count(), 0);
    }
}
