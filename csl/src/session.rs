// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sessions
//!
//! A session groups the devices one client acquired, the realtime links
//! built over them and the handlers that receive their notifications.
//! Sessions live in a fixed table indexed by the low byte of their kernel
//! handle. Acquired devices live in a per-session arena indexed the same
//! way; the realtime and non-realtime lists hold arena slots and are
//! sorted on demand by the stream-on or stream-off key. Every table spans
//! the whole handle index range; the configured limits cap how many slots
//! may be occupied at once.
//!
//! Locks are taken in the order instance, session, acquired device. Handlers
//! are cloned out of the session and run with no lock held.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::{process, thread};

use kmd::{
    ControlOp, DeactivateMode, DeviceAttribute, DeviceHandle, DeviceResource, DeviceType,
    KernelEvent, LinkHandle, MAX_HANDLES, OperationMode, SessionHandle, SyncMode,
};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::guard::{GuardKind, LifecycleState, RefGuard, RefHold};
use crate::instance::Csl;
use crate::message::{CslMessage, MessageHandler, SessionMessageHandler};
use crate::registry::KmdDevice;
use crate::request::FlushInfo;
use crate::{CslError, Result};

// ============================================================================
// Acquired devices and links
// ============================================================================

/// A device acquired by a session.
pub(crate) struct AcquiredDevice {
    pub(crate) handle: DeviceHandle,
    pub(crate) kmd: Arc<KmdDevice>,
    pub(crate) device_type: DeviceType,
    pub(crate) mode: OperationMode,
    pub(crate) name: String,
    pub(crate) activation: i32,
    pub(crate) deactivation: i32,
    pub(crate) guard: RefGuard,
}

/// Introspection view of an acquired device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AcquiredDeviceInfo {
    pub handle: DeviceHandle,
    pub kmd_index: usize,
    pub device_type: DeviceType,
    pub mode: OperationMode,
    pub name: String,
}

impl From<&AcquiredDevice> for AcquiredDeviceInfo {
    fn from(device: &AcquiredDevice) -> Self {
        AcquiredDeviceInfo {
            handle: device.handle,
            kmd_index: device.kmd.index(),
            device_type: device.device_type,
            mode: device.mode,
            name: device.name.clone(),
        }
    }
}

/// A realtime link between acquired devices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LinkInfo {
    pub handle: LinkHandle,
    pub devices: Vec<DeviceHandle>,
    pub active: bool,
    pub mode: DeactivateMode,
}

pub(crate) struct LinkHandlerEntry {
    pub(crate) link: LinkHandle,
    pub(crate) handler: MessageHandler,
}

// ============================================================================
// Session
// ============================================================================

/// Mutable session state, guarded by the session lock.
pub(crate) struct SessionInner {
    pub(crate) client_refcount: i32,
    /// Arena of acquired devices by handle index.
    pub(crate) devices: Vec<Option<Arc<AcquiredDevice>>>,
    device_count: usize,
    device_limit: usize,
    pub(crate) rt: Vec<usize>,
    pub(crate) nrt: Vec<usize>,
    pub(crate) links: Vec<Option<LinkInfo>>,
    pub(crate) link_count: usize,
    pub(crate) master_link: LinkHandle,
    pub(crate) link_handlers: Vec<LinkHandlerEntry>,
    pub(crate) session_handler: Option<SessionMessageHandler>,
    pub(crate) stream_on: bool,
    pub(crate) in_flush: bool,
    pub(crate) flush: Option<FlushInfo>,
}

impl SessionInner {
    pub(crate) fn device(&self, handle: DeviceHandle) -> Option<&Arc<AcquiredDevice>> {
        self.devices
            .get(handle.index())
            .and_then(Option::as_ref)
            .filter(|device| device.handle == handle)
    }

    pub(crate) fn link_slot(&self, handle: LinkHandle) -> Result<usize> {
        let slot = handle.index();
        match self.links.get(slot) {
            Some(Some(link)) if link.handle == handle => Ok(slot),
            Some(_) => Err(CslError::InvalidArgument(format!("unknown link {handle}"))),
            None => Err(CslError::OutOfBounds {
                index: slot,
                limit: self.links.len(),
            }),
        }
    }

    /// Sort the realtime list by stream-on key.
    pub(crate) fn sort_rt_for_activation(&mut self) {
        let devices = &self.devices;
        self.rt.sort_by_key(|slot| {
            devices[*slot]
                .as_ref()
                .map_or(i32::MAX, |device| device.activation)
        });
    }

    /// Sort the realtime list by stream-off key.
    pub(crate) fn sort_rt_for_deactivation(&mut self) {
        let devices = &self.devices;
        self.rt.sort_by_key(|slot| {
            devices[*slot]
                .as_ref()
                .map_or(i32::MAX, |device| device.deactivation)
        });
    }

    /// Devices at `slots`, in list order.
    pub(crate) fn listed(&self, slots: &[usize]) -> Vec<Arc<AcquiredDevice>> {
        slots
            .iter()
            .filter_map(|slot| self.devices[*slot].clone())
            .collect()
    }

    fn insert_device(&mut self, device: Arc<AcquiredDevice>) -> Result<()> {
        if self.device_count >= self.device_limit {
            return Err(CslError::ResourceExhausted(format!(
                "{} devices already acquired",
                self.device_count
            )));
        }
        let slot = device.handle.index();
        let limit = self.devices.len();
        let entry = self
            .devices
            .get_mut(slot)
            .ok_or(CslError::OutOfBounds { index: slot, limit })?;
        if let Some(existing) = entry {
            return Err(CslError::Failed(format!(
                "device slot {slot} already holds {}",
                existing.handle
            )));
        }
        match device.mode {
            OperationMode::Realtime => self.rt.push(slot),
            OperationMode::NonRealtime => self.nrt.push(slot),
        }
        *entry = Some(device);
        self.device_count += 1;
        Ok(())
    }

    fn remove_device(&mut self, handle: DeviceHandle) -> Option<Arc<AcquiredDevice>> {
        self.device(handle)?;
        let slot = handle.index();
        self.rt.retain(|listed| *listed != slot);
        self.nrt.retain(|listed| *listed != slot);
        self.device_count -= 1;
        self.devices[slot].take()
    }

    /// Empty the arena, returning whatever was still acquired.
    fn take_devices(&mut self) -> Vec<Arc<AcquiredDevice>> {
        self.rt.clear();
        self.nrt.clear();
        self.device_count = 0;
        self.devices.iter_mut().filter_map(Option::take).collect()
    }
}

pub(crate) struct Session {
    pub(crate) handle: SessionHandle,
    pub(crate) guard: RefGuard,
    owner_pid: u32,
    owner_thread: String,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn new(handle: SessionHandle, max_devices: usize) -> Self {
        Session {
            handle,
            guard: RefGuard::new(GuardKind::Session),
            owner_pid: process::id(),
            owner_thread: format!("{:?}", thread::current().id()),
            inner: Mutex::new(SessionInner {
                client_refcount: 1,
                devices: vec![None; MAX_HANDLES],
                device_count: 0,
                device_limit: max_devices,
                rt: Vec::new(),
                nrt: Vec::new(),
                links: vec![None; MAX_HANDLES],
                link_count: 0,
                master_link: LinkHandle::INVALID,
                link_handlers: Vec::new(),
                session_handler: None,
                stream_on: false,
                in_flush: false,
                flush: None,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold a reference for the duration of an operation.
    pub(crate) fn hold(&self) -> Result<RefHold<'_>> {
        RefHold::acquire(&self.guard).ok_or_else(|| {
            CslError::InvalidState(format!(
                "session {} in state {:?}",
                self.handle,
                self.guard.state()
            ))
        })
    }

    /// Log every device still acquired. Returns how many there are.
    fn log_acquired(&self, inner: &SessionInner) -> usize {
        let mut count = 0;
        for device in inner.devices.iter().flatten() {
            warn!(
                "session {} still holds {} {} ({}) on kmd [{}]",
                self.handle,
                device.device_type,
                device.handle,
                device.name,
                device.kmd.index()
            );
            count += 1;
        }
        count
    }

    fn deliver(&self, event: &KernelEvent) {
        let link = event.link();
        let (link_handler, session_handler, known_link) = {
            let inner = self.lock();
            (
                inner
                    .link_handlers
                    .iter()
                    .find(|entry| entry.link == link)
                    .map(|entry| entry.handler.clone()),
                inner.session_handler.clone(),
                inner.link_slot(link).is_ok(),
            )
        };

        let message = match event {
            KernelEvent::SofBootTimestamp(frame) => CslMessage::boot_frame(frame),
            KernelEvent::Sof(frame) => CslMessage::frame(frame),
            KernelEvent::Error(error) => CslMessage::error(error),
        };

        match (link_handler, event) {
            (Some(handler), _) => handler(&message),
            (None, KernelEvent::Error(_)) => match session_handler {
                Some(handler) => handler(&message),
                None => error!(
                    "session {} has no handler for error on link {link}",
                    self.handle
                ),
            },
            (None, _) if known_link => {
                error!("session {} message handler missing for link {link}", self.handle);
            }
            (None, _) => warn!(
                "session {} unexpected {:?} event on link {link}",
                self.handle,
                event.kind()
            ),
        }
    }
}

/// Introspection view of a session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub handle: SessionHandle,
    pub state: LifecycleState,
    pub refcount: u32,
    pub client_refcount: i32,
    pub owner_pid: u32,
    pub owner_thread: String,
    pub devices: Vec<AcquiredDeviceInfo>,
    pub links: Vec<LinkInfo>,
    pub master_link: LinkHandle,
    pub stream_on: bool,
    pub in_flush: bool,
}

// ============================================================================
// Session table
// ============================================================================

/// Sessions by handle index.
pub(crate) struct SessionTable {
    slots: RwLock<Vec<Option<Arc<Session>>>>,
    limit: usize,
}

impl SessionTable {
    /// A table holding at most `limit` open sessions.
    pub(crate) fn new(limit: usize) -> Self {
        SessionTable {
            slots: RwLock::new(vec![None; MAX_HANDLES]),
            limit,
        }
    }

    /// Resolve a caller handle. Stale handles are rejected.
    pub(crate) fn get(&self, handle: SessionHandle) -> Result<Arc<Session>> {
        if !handle.is_valid() {
            return Err(CslError::InvalidArgument(format!("session handle {handle}")));
        }
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let index = handle.index();
        match slots.get(index) {
            None => Err(CslError::OutOfBounds {
                index,
                limit: slots.len(),
            }),
            Some(Some(session)) if session.handle == handle => Ok(session.clone()),
            Some(_) => Err(CslError::InvalidArgument(format!("unknown session {handle}"))),
        }
    }

    fn insert(&self, session: Arc<Session>) -> Result<()> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let open = slots.iter().flatten().count();
        if open >= self.limit {
            return Err(CslError::ResourceExhausted(format!(
                "{open} sessions already open"
            )));
        }
        let index = session.handle.index();
        let limit = slots.len();
        let slot = slots
            .get_mut(index)
            .ok_or(CslError::OutOfBounds { index, limit })?;
        if slot.is_some() {
            return Err(CslError::Failed(format!("session slot {index} in use")));
        }
        *slot = Some(session);
        Ok(())
    }

    fn remove(&self, handle: SessionHandle) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let slot = slots
            .get_mut(handle.index())
            .filter(|slot| matches!(slot, Some(session) if session.handle == handle));
        if let Some(slot) = slot {
            *slot = None;
        }
    }

    /// Empty the table, returning every session still in it.
    pub(crate) fn take_all(&self) -> Vec<Arc<Session>> {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
            .filter_map(Option::take)
            .collect()
    }

    /// Number of open sessions.
    pub(crate) fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
            .count()
    }

    fn handles(&self) -> Vec<SessionHandle> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
            .map(|session| session.handle)
            .collect()
    }

    /// Route a kernel event to the handler registered for its link.
    pub(crate) fn route(&self, event: &KernelEvent) {
        if event.request_id() == 0 && matches!(event, KernelEvent::SofBootTimestamp(_)) {
            return;
        }
        let handle = event.session();
        let session = match self.get(handle) {
            Ok(session) => session,
            Err(e) => {
                warn!("dropping {:?} event for session {handle}: {e}", event.kind());
                return;
            }
        };
        session.deliver(event);
    }
}

// ============================================================================
// Session operations
// ============================================================================

impl Csl {
    /// Open a session. The instance stays referenced until it closes.
    pub fn open(&self) -> Result<SessionHandle> {
        if !self.guard.get_ref() {
            return Err(CslError::InvalidState("instance not valid".to_string()));
        }
        self.create_session().inspect_err(|_| self.guard.put_ref())
    }

    fn create_session(&self) -> Result<SessionHandle> {
        let handle = self.request(&ControlOp::CreateSession)?.into_session()?;
        if !handle.is_valid() {
            error!("kernel created session with invalid handle {handle}");
            self.destroy_kernel_session(handle);
            return Err(CslError::Failed(format!("invalid session handle {handle}")));
        }

        let session = Arc::new(Session::new(handle, self.config.max_acquired_devices));
        session.guard.set_state(LifecycleState::Valid);
        if let Err(e) = self.sessions.insert(session) {
            error!("cannot track session {handle}: {e}");
            self.destroy_kernel_session(handle);
            return Err(e);
        }
        info!("opened session {handle}");
        Ok(handle)
    }

    fn destroy_kernel_session(&self, handle: SessionHandle) {
        if let Err(e) = self.request(&ControlOp::DestroySession { session: handle }) {
            warn!("destroying kernel session {handle} failed: {e}");
        }
    }

    /// Drop one client reference; the last one destroys the session.
    pub fn close(&self, handle: SessionHandle) -> Result<()> {
        let _instance = self.instance_ref()?;
        let session = self.sessions.get(handle)?;

        let remaining = {
            let mut inner = session.lock();
            inner.client_refcount -= 1;
            inner.client_refcount
        };
        match remaining {
            0 => self.destroy_session(&session),
            n if n < 0 => {
                error!("session {handle} client refcount underflow ({n})");
                Err(CslError::InvalidState(format!(
                    "session {handle} client refcount {n}"
                )))
            }
            n => {
                if session.guard.state() == LifecycleState::Flush {
                    session.guard.set_state(LifecycleState::Valid);
                }
                debug!("session {handle} still has {n} client reference(s)");
                Ok(())
            }
        }
    }

    fn destroy_session(&self, session: &Session) -> Result<()> {
        let handle = session.handle;
        if !session.guard.wait_for_zero() {
            return Err(self.fatal(format!("session {handle} destroyed twice")));
        }

        let (orphans, destroyed) = self.retire_session(session);
        if orphans > self.config.orphan_tolerance {
            return Err(self.fatal(format!(
                "session {handle} closed with {orphans} devices still acquired"
            )));
        }
        destroyed?;
        info!("closed session {handle}");
        Ok(())
    }

    /// Drop whatever a draining session still holds, destroy it in the
    /// kernel and give back its instance reference. Returns the number of
    /// orphaned devices and the kernel's answer.
    fn retire_session(&self, session: &Session) -> (usize, Result<()>) {
        let handle = session.handle;
        let orphans = {
            let mut inner = session.lock();
            session.log_acquired(&inner);
            inner.take_devices()
        };
        for orphan in &orphans {
            orphan.kmd.clear_acquired(orphan.handle);
            orphan.kmd.guard.put_ref();
        }

        let destroyed = self
            .request(&ControlOp::DestroySession { session: handle })
            .map(|_| ());
        self.sessions.remove(handle);
        session.guard.reset();
        self.guard.put_ref();
        (orphans.len(), destroyed)
    }

    /// Destroy a session the client never closed. Used at shutdown after
    /// the session has left the table.
    pub(crate) fn abandon_session(&self, session: &Session) {
        let handle = session.handle;
        if !session.guard.wait_for_zero() {
            warn!("session {handle} already being destroyed at shutdown");
            return;
        }
        let (orphans, destroyed) = self.retire_session(session);
        if let Err(e) = destroyed {
            warn!("destroying kernel session {handle} failed: {e}");
        }
        info!("destroyed abandoned session {handle} with {orphans} device(s) still acquired");
    }

    /// Add a client reference to an open session.
    pub fn add_reference(&self, handle: SessionHandle) -> Result<()> {
        let session = self.sessions.get(handle)?;
        let _session = session.hold()?;
        let mut inner = session.lock();
        inner.client_refcount += 1;
        if inner.client_refcount <= 1 {
            error!(
                "session {handle} client refcount {} after add",
                inner.client_refcount
            );
            return Err(CslError::InvalidState(format!(
                "session {handle} had no client references"
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Devices
    // ========================================================================

    /// Acquire the KMD device at `index` for a session.
    pub fn acquire_device(
        &self,
        handle: SessionHandle,
        index: i32,
        resources: &[DeviceResource],
        attributes: &[DeviceAttribute],
        name: &str,
    ) -> Result<DeviceHandle> {
        let _instance = self.instance_ref()?;
        let session = self.sessions.get(handle)?;
        let _session = session.hold()?;
        let kmd = self.kmd_device(index)?;
        if !kmd.guard.get_ref() {
            return Err(CslError::InvalidState(format!(
                "{} [{index}] not available",
                kmd.device_type()
            )));
        }

        let result = kmd
            .ops()
            .acquire(&kmd.context(), handle, resources)
            .map_err(CslError::from)
            .and_then(|device| {
                self.track_acquired(&session, &kmd, device, attributes, name)
                    .inspect_err(|_| {
                        if let Err(e) = kmd.ops().release(&kmd.context(), handle, device) {
                            warn!("releasing untracked device {device} failed: {e}");
                        }
                    })
            });
        match result {
            Ok(device) => {
                info!(
                    "session {handle} acquired {} [{index}] as {device} ({name})",
                    kmd.device_type()
                );
                Ok(device)
            }
            Err(e) => {
                error!("session {handle} failed to acquire kmd [{index}]: {e}");
                kmd.guard.put_ref();
                session.log_acquired(&session.lock());
                Err(e)
            }
        }
    }

    fn track_acquired(
        &self,
        session: &Session,
        kmd: &Arc<KmdDevice>,
        device: DeviceHandle,
        attributes: &[DeviceAttribute],
        name: &str,
    ) -> Result<DeviceHandle> {
        kmd.record_acquired(device)?;
        let device_type = kmd.device_type();
        let acquired = Arc::new(AcquiredDevice {
            handle: device,
            kmd: kmd.clone(),
            device_type,
            mode: OperationMode::resolve(device_type, attributes),
            name: name.to_string(),
            activation: device_type.activation_order(),
            deactivation: device_type.deactivation_order(),
            guard: RefGuard::new(GuardKind::AcquiredDevice),
        });
        acquired.guard.set_state(LifecycleState::Valid);
        session
            .lock()
            .insert_device(acquired)
            .inspect_err(|_| kmd.clear_acquired(device))?;
        Ok(device)
    }

    /// Release a device acquired by a session.
    ///
    /// Waits for in-flight operations on the device before releasing it.
    pub fn release_device(&self, handle: SessionHandle, device: DeviceHandle) -> Result<()> {
        let _instance = self.instance_ref()?;
        let session = self.sessions.get(handle)?;
        let _session = session.hold()?;
        let acquired = session.lock().remove_device(device).ok_or_else(|| {
            CslError::InvalidArgument(format!("device {device} not acquired by {handle}"))
        })?;

        if !acquired.guard.wait_for_zero() {
            warn!("device {device} was not valid at release");
        }
        let kmd = &acquired.kmd;
        kmd.clear_acquired(device);
        if let Err(e) = kmd.ops().release(&kmd.context(), handle, device) {
            error!(
                "session {handle} release of {} {device} failed: {e}",
                acquired.device_type
            );
        }
        acquired.guard.reset();
        kmd.guard.put_ref();
        info!("session {handle} released {device}");
        Ok(())
    }

    fn acquired(&self, session: &Session, device: DeviceHandle) -> Result<Arc<AcquiredDevice>> {
        session.lock().device(device).cloned().ok_or_else(|| {
            CslError::InvalidArgument(format!(
                "device {device} not acquired by {}",
                session.handle
            ))
        })
    }

    /// Reserve hardware for an acquired device. Returns the driver's
    /// hardware info blob for version 2 requests.
    pub fn acquire_hardware(
        &self,
        handle: SessionHandle,
        device: DeviceHandle,
        resources: &[DeviceResource],
        version: u32,
    ) -> Result<Vec<u8>> {
        let _instance = self.instance_ref()?;
        let session = self.sessions.get(handle)?;
        let _session = session.hold()?;
        let acquired = self.acquired(&session, device)?;
        let _device = RefHold::acquire(&acquired.guard)
            .ok_or_else(|| CslError::InvalidState(format!("device {device} not valid")))?;

        let kmd = &acquired.kmd;
        match kmd
            .ops()
            .acquire_hardware(&kmd.context(), handle, device, version, resources)
        {
            Ok(info) => Ok(info),
            Err(e) => {
                session.log_acquired(&session.lock());
                self.critical_failure(&format!(
                    "session {handle} hardware acquire v{version} on {} failed: {e}",
                    acquired.device_type
                ));
                Err(e.into())
            }
        }
    }

    pub fn release_hardware(&self, handle: SessionHandle, device: DeviceHandle) -> Result<()> {
        let _instance = self.instance_ref()?;
        let session = self.sessions.get(handle)?;
        let _session = session.hold()?;
        let acquired = self.acquired(&session, device)?;
        let _device = RefHold::acquire(&acquired.guard)
            .ok_or_else(|| CslError::InvalidState(format!("device {device} not valid")))?;

        let kmd = &acquired.kmd;
        kmd.ops()
            .release_hardware(&kmd.context(), handle, device)
            .map_err(|e| {
                error!("session {handle} hardware release on {device} failed: {e}");
                e.into()
            })
    }

    // ========================================================================
    // Links
    // ========================================================================

    /// Link the realtime devices among `devices`. CSIPHY devices are never
    /// link members.
    pub fn link(&self, handle: SessionHandle, devices: &[DeviceHandle]) -> Result<LinkHandle> {
        if devices.is_empty() {
            return Err(CslError::InvalidArgument("no devices to link".to_string()));
        }
        let _instance = self.instance_ref()?;
        let session = self.sessions.get(handle)?;
        let _session = session.hold()?;
        let mut inner = session.lock();

        if inner.link_count >= self.config.max_links_per_session {
            return Err(CslError::ResourceExhausted(format!(
                "session {handle} link table full"
            )));
        }
        inner.sort_rt_for_activation();
        let members: Vec<DeviceHandle> = inner
            .listed(&inner.rt)
            .iter()
            .filter(|device| device.device_type != DeviceType::Csiphy)
            .map(|device| device.handle)
            .filter(|device| devices.contains(device))
            .collect();
        if members.is_empty() {
            return Err(CslError::ResourceExhausted(
                "no realtime devices to link".to_string(),
            ));
        }

        let link = self
            .request(&ControlOp::Link {
                session: handle,
                devices: members.clone(),
            })?
            .into_link()?;
        let slot = link.index();
        if !link.is_valid() || slot >= inner.links.len() || inner.links[slot].is_some() {
            error!("kernel returned unusable link {link}");
            if let Err(e) = self.request(&ControlOp::Unlink {
                session: handle,
                link,
            }) {
                warn!("unlinking {link} failed: {e}");
            }
            return Err(CslError::Failed(format!("unusable link handle {link}")));
        }

        inner.links[slot] = Some(LinkInfo {
            handle: link,
            devices: members,
            active: false,
            mode: DeactivateMode::empty(),
        });
        inner.link_count += 1;
        inner.master_link = link;
        info!("session {handle} created link {link}");
        Ok(link)
    }

    pub fn unlink(&self, handle: SessionHandle, link: LinkHandle) -> Result<()> {
        let _instance = self.instance_ref()?;
        let session = self.sessions.get(handle)?;
        let _session = session.hold()?;
        let mut inner = session.lock();
        let slot = inner.link_slot(link)?;

        self.request(&ControlOp::Unlink {
            session: handle,
            link,
        })?;
        inner.links[slot] = None;
        inner.link_count -= 1;
        inner.link_handlers.retain(|entry| entry.link != link);
        if inner.master_link == link {
            inner.master_link = LinkHandle::INVALID;
        }
        info!("session {handle} removed link {link}");
        Ok(())
    }

    /// Synchronize `links` under `master`.
    pub fn sync_links(
        &self,
        handle: SessionHandle,
        links: &[LinkHandle],
        master: LinkHandle,
        mode: SyncMode,
    ) -> Result<()> {
        if links.is_empty() || links.len() >= kmd::MAX_HANDLES {
            return Err(CslError::InvalidArgument(format!(
                "cannot sync {} links",
                links.len()
            )));
        }
        if !master.is_valid() {
            return Err(CslError::InvalidArgument(format!("master link {master}")));
        }
        let _instance = self.instance_ref()?;
        let session = self.sessions.get(handle)?;
        let _session = session.hold()?;
        let mut inner = session.lock();
        inner.master_link = master;
        self.request(&ControlOp::SyncLinks {
            session: handle,
            links: links.to_vec(),
            master,
            mode,
        })?;
        Ok(())
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Register the handler for notifications on `link`. A later
    /// registration for the same link replaces the earlier one.
    pub fn register_message_handler(
        &self,
        handle: SessionHandle,
        link: LinkHandle,
        handler: MessageHandler,
    ) -> Result<()> {
        if !link.is_valid() {
            return Err(CslError::InvalidArgument(format!("link handle {link}")));
        }
        let session = self.sessions.get(handle)?;
        let _session = session.hold()?;
        let mut inner = session.lock();
        if let Some(entry) = inner
            .link_handlers
            .iter_mut()
            .find(|entry| entry.link == link)
        {
            entry.handler = handler;
            return Ok(());
        }
        if inner.link_handlers.len() >= self.config.max_links_per_session {
            return Err(CslError::ResourceExhausted(format!(
                "session {handle} handler table full"
            )));
        }
        inner.link_handlers.push(LinkHandlerEntry { link, handler });
        Ok(())
    }

    /// Register the session-wide handler for errors on links without one.
    pub fn register_session_message_handler(
        &self,
        handle: SessionHandle,
        handler: SessionMessageHandler,
    ) -> Result<()> {
        let session = self.sessions.get(handle)?;
        let _session = session.hold()?;
        session.lock().session_handler = Some(handler);
        Ok(())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Log the devices a session still holds and return their count.
    pub fn log_acquired_devices(&self, handle: SessionHandle) -> Result<usize> {
        let session = self.sessions.get(handle)?;
        let inner = session.lock();
        Ok(session.log_acquired(&inner))
    }

    pub fn session_info(&self, handle: SessionHandle) -> Result<SessionInfo> {
        let session = self.sessions.get(handle)?;
        let inner = session.lock();
        Ok(SessionInfo {
            handle,
            state: session.guard.state(),
            refcount: session.guard.refcount(),
            client_refcount: inner.client_refcount,
            owner_pid: session.owner_pid,
            owner_thread: session.owner_thread.clone(),
            devices: inner
                .devices
                .iter()
                .flatten()
                .map(|device| AcquiredDeviceInfo::from(device.as_ref()))
                .collect(),
            links: inner.links.iter().flatten().cloned().collect(),
            master_link: inner.master_link,
            stream_on: inner.stream_on,
            in_flush: inner.in_flush,
        })
    }

    pub fn link_info(&self, handle: SessionHandle, link: LinkHandle) -> Result<LinkInfo> {
        let session = self.sessions.get(handle)?;
        let inner = session.lock();
        let slot = inner.link_slot(link)?;
        inner.links[slot]
            .clone()
            .ok_or_else(|| CslError::InvalidArgument(format!("unknown link {link}")))
    }

    /// Handles of every open session.
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.sessions.handles()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use kmd::{ErrorEvent, FailureRule, FrameEvent, SimKernel};

    use super::*;
    use crate::config::CslConfig;
    use crate::message::TimestampType;

    fn instance() -> (Arc<SimKernel>, Csl) {
        let sim = Arc::new(SimKernel::with_camera_topology());
        let csl = Csl::new(sim.clone(), CslConfig::for_testing()).unwrap();
        csl.initialize().unwrap();
        (sim, csl)
    }

    fn recorder() -> (MessageHandler, Arc<Mutex<Vec<CslMessage>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: MessageHandler = Arc::new(move |message: &CslMessage| {
            sink.lock().unwrap().push(*message);
        });
        (handler, seen)
    }

    #[test]
    fn test_open_and_close_session() {
        let (_sim, csl) = instance();
        let session = csl.open().unwrap();
        assert!(session.is_valid());
        assert_eq!(csl.guard.refcount(), 1);
        assert_eq!(csl.sessions(), vec![session]);

        csl.close(session).unwrap();
        assert_eq!(csl.guard.refcount(), 0);
        assert!(csl.sessions().is_empty());
    }

    #[test]
    fn test_invalid_kernel_session_handle_rejected() {
        let (sim, csl) = instance();
        sim.hand_out_invalid_sessions(true);
        assert!(matches!(csl.open(), Err(CslError::Failed(_))));
        assert_eq!(csl.guard.refcount(), 0);
    }

    #[test]
    fn test_add_reference_defers_destroy() {
        let (_sim, csl) = instance();
        let session = csl.open().unwrap();
        csl.add_reference(session).unwrap();
        assert_eq!(csl.session_info(session).unwrap().client_refcount, 2);

        csl.close(session).unwrap();
        assert_eq!(csl.sessions(), vec![session]);
        csl.close(session).unwrap();
        assert!(csl.sessions().is_empty());
    }

    #[test]
    fn test_close_of_closed_session_rejected() {
        let (_sim, csl) = instance();
        let session = csl.open().unwrap();
        csl.close(session).unwrap();
        assert!(matches!(
            csl.close(session),
            Err(CslError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_acquire_and_release_restores_refcount() {
        let (_sim, csl) = instance();
        let session = csl.open().unwrap();
        let before = csl.enumerate_devices(0).unwrap().refcount;

        let device = csl.acquire_device(session, 0, &[], &[], "ife").unwrap();
        let kmd = csl.kmd_device(0).unwrap();
        assert_eq!(kmd.guard.refcount(), before + 1);
        assert_eq!(kmd.acquired_handles(), vec![device]);

        csl.release_device(session, device).unwrap();
        assert_eq!(kmd.guard.refcount(), before);
        assert!(kmd.acquired_handles().is_empty());
        assert_eq!(csl.log_acquired_devices(session).unwrap(), 0);
    }

    #[test]
    fn test_failed_acquire_restores_refcount() {
        let (sim, csl) = instance();
        let session = csl.open().unwrap();
        sim.inject(FailureRule::once("acquire_device"));
        assert!(matches!(
            csl.acquire_device(session, 1, &[], &[], "csiphy"),
            Err(CslError::Kernel(_))
        ));
        assert_eq!(csl.kmd_device(1).unwrap().guard.refcount(), 0);
    }

    #[test]
    fn test_release_unknown_device_rejected() {
        let (_sim, csl) = instance();
        let session = csl.open().unwrap();
        assert!(matches!(
            csl.release_device(session, DeviceHandle(0x1234)),
            Err(CslError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_attributes_override_realtime_classification() {
        let (_sim, csl) = instance();
        let session = csl.open().unwrap();
        let icp = csl
            .acquire_device(
                session,
                5,
                &[],
                &[DeviceAttribute::RealtimeOperation],
                "icp",
            )
            .unwrap();
        let info = csl.session_info(session).unwrap();
        let device = info.devices.iter().find(|d| d.handle == icp).unwrap();
        assert_eq!(device.mode, OperationMode::Realtime);
    }

    #[test]
    fn test_link_excludes_csiphy_and_orders_members() {
        let (_sim, csl) = instance();
        let session = csl.open().unwrap();
        let sensor = csl.acquire_device(session, 2, &[], &[], "sensor").unwrap();
        let csiphy = csl.acquire_device(session, 1, &[], &[], "csiphy").unwrap();
        let ife = csl.acquire_device(session, 0, &[], &[], "ife").unwrap();

        let link = csl.link(session, &[sensor, csiphy, ife]).unwrap();
        let info = csl.link_info(session, link).unwrap();
        assert_eq!(info.devices, vec![ife, sensor]);
        assert_eq!(csl.session_info(session).unwrap().master_link, link);
    }

    #[test]
    fn test_link_without_realtime_devices_rejected() {
        let (_sim, csl) = instance();
        let session = csl.open().unwrap();
        let jpeg = csl.acquire_device(session, 6, &[], &[], "jpeg").unwrap();
        assert!(matches!(
            csl.link(session, &[jpeg]),
            Err(CslError::ResourceExhausted(_))
        ));
        assert!(matches!(
            csl.link(session, &[]),
            Err(CslError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_unlink_clears_link_and_handler() {
        let (_sim, csl) = instance();
        let session = csl.open().unwrap();
        let ife = csl.acquire_device(session, 0, &[], &[], "ife").unwrap();
        let link = csl.link(session, &[ife]).unwrap();
        let (handler, _) = recorder();
        csl.register_message_handler(session, link, handler).unwrap();

        csl.unlink(session, link).unwrap();
        let info = csl.session_info(session).unwrap();
        assert!(info.links.is_empty());
        assert_eq!(info.master_link, LinkHandle::INVALID);
        assert!(matches!(
            csl.unlink(session, link),
            Err(CslError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_sync_links_validates_arguments() {
        let (_sim, csl) = instance();
        let session = csl.open().unwrap();
        let ife = csl.acquire_device(session, 0, &[], &[], "ife").unwrap();
        let link = csl.link(session, &[ife]).unwrap();

        assert!(matches!(
            csl.sync_links(session, &[], link, SyncMode::Sync),
            Err(CslError::InvalidArgument(_))
        ));
        assert!(matches!(
            csl.sync_links(session, &[link], LinkHandle::INVALID, SyncMode::Sync),
            Err(CslError::InvalidArgument(_))
        ));
        csl.sync_links(session, &[link], link, SyncMode::Sync)
            .unwrap();
    }

    #[test]
    fn test_route_frame_to_link_handler() {
        let (_sim, csl) = instance();
        let session = csl.open().unwrap();
        let ife = csl.acquire_device(session, 0, &[], &[], "ife").unwrap();
        let link = csl.link(session, &[ife]).unwrap();
        let (handler, seen) = recorder();
        csl.register_message_handler(session, link, handler).unwrap();

        let frame = FrameEvent {
            session,
            link,
            request_id: 7,
            frame_id: 3,
            timestamp: 1000,
        };
        csl.sessions.route(&KernelEvent::SofBootTimestamp(frame));
        csl.sessions.route(&KernelEvent::Sof(frame));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        match (&seen[0], &seen[1]) {
            (CslMessage::Frame(boot), CslMessage::Frame(sof)) => {
                assert_eq!(boot.timestamp_type, TimestampType::Mono);
                assert!(boot.notify);
                assert_eq!(boot.frame_count, 3);
                assert_eq!(sof.timestamp_type, TimestampType::Qtimer);
                assert!(!sof.notify);
            }
            other => panic!("unexpected messages {other:?}"),
        }
    }

    #[test]
    fn test_boot_frame_without_request_ignored() {
        let (_sim, csl) = instance();
        let session = csl.open().unwrap();
        let link = LinkHandle(0x101);
        let (handler, seen) = recorder();
        csl.register_message_handler(session, link, handler).unwrap();

        csl.sessions.route(&KernelEvent::SofBootTimestamp(FrameEvent {
            session,
            link,
            ..Default::default()
        }));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unclaimed_error_goes_to_session_handler() {
        let (_sim, csl) = instance();
        let session = csl.open().unwrap();
        let (handler, seen) = recorder();
        csl.register_session_message_handler(session, handler)
            .unwrap();

        csl.sessions.route(&KernelEvent::Error(ErrorEvent {
            session,
            link: LinkHandle(0x5),
            error_type: 2,
            request_id: 0,
            device: DeviceHandle(0x100),
            resource_index: 4,
        }));
        csl.sessions.route(&KernelEvent::Sof(FrameEvent {
            session,
            link: LinkHandle(0x5),
            request_id: 1,
            ..Default::default()
        }));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        match seen[0] {
            CslMessage::Error(error) => {
                assert_eq!(error.error_type, 2);
                assert_eq!(error.resource_index, 4);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_handler_registration_replaces_existing() {
        let (_sim, csl) = instance();
        let session = csl.open().unwrap();
        let link = LinkHandle(0x101);
        let (first, first_seen) = recorder();
        let (second, second_seen) = recorder();
        csl.register_message_handler(session, link, first).unwrap();
        csl.register_message_handler(session, link, second).unwrap();

        csl.sessions.route(&KernelEvent::Sof(FrameEvent {
            session,
            link,
            request_id: 1,
            ..Default::default()
        }));
        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(second_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_close_tolerates_one_orphan() {
        let (_sim, csl) = instance();
        let session = csl.open().unwrap();
        csl.acquire_device(session, 0, &[], &[], "ife").unwrap();
        csl.close(session).unwrap();
        assert_eq!(csl.kmd_device(0).unwrap().guard.refcount(), 0);
    }

    #[test]
    fn test_close_with_many_orphans_is_fatal() {
        let (_sim, csl) = instance();
        let session = csl.open().unwrap();
        csl.acquire_device(session, 0, &[], &[], "ife").unwrap();
        csl.acquire_device(session, 2, &[], &[], "sensor").unwrap();
        assert!(matches!(csl.close(session), Err(CslError::Fatal(_))));

        assert!(csl.sessions().is_empty());
        assert_eq!(csl.guard.refcount(), 0);
        assert_eq!(csl.kmd_device(0).unwrap().guard.refcount(), 0);
        assert_eq!(csl.kmd_device(2).unwrap().guard.refcount(), 0);
    }

    fn limited(config: CslConfig) -> (Arc<SimKernel>, Csl) {
        let sim = Arc::new(SimKernel::with_camera_topology());
        let csl = Csl::new(sim.clone(), config).unwrap();
        csl.initialize().unwrap();
        (sim, csl)
    }

    #[test]
    fn test_session_limit_counts_open_sessions() {
        let (_sim, csl) = limited(CslConfig {
            max_sessions: 2,
            ..CslConfig::for_testing()
        });
        for _ in 0..5 {
            let session = csl.open().unwrap();
            csl.close(session).unwrap();
        }

        let first = csl.open().unwrap();
        let second = csl.open().unwrap();
        assert!(matches!(csl.open(), Err(CslError::ResourceExhausted(_))));
        assert_eq!(csl.guard.refcount(), 2);
        csl.close(first).unwrap();
        csl.close(second).unwrap();
    }

    #[test]
    fn test_link_limit_counts_live_links() {
        let (_sim, csl) = limited(CslConfig {
            max_links_per_session: 1,
            ..CslConfig::for_testing()
        });
        for _ in 0..3 {
            let session = csl.open().unwrap();
            let ife = csl.acquire_device(session, 0, &[], &[], "ife").unwrap();
            let link = csl.link(session, &[ife]).unwrap();
            assert!(matches!(
                csl.link(session, &[ife]),
                Err(CslError::ResourceExhausted(_))
            ));
            csl.unlink(session, link).unwrap();
            csl.release_device(session, ife).unwrap();
            csl.close(session).unwrap();
        }
    }

    #[test]
    fn test_device_limit_counts_acquired_devices() {
        let (_sim, csl) = limited(CslConfig {
            max_acquired_devices: 1,
            ..CslConfig::for_testing()
        });
        let session = csl.open().unwrap();
        for _ in 0..3 {
            let ife = csl.acquire_device(session, 0, &[], &[], "ife").unwrap();
            assert!(matches!(
                csl.acquire_device(session, 5, &[], &[], "icp"),
                Err(CslError::ResourceExhausted(_))
            ));
            assert_eq!(csl.kmd_device(5).unwrap().guard.refcount(), 0);
            csl.release_device(session, ife).unwrap();
        }
        csl.close(session).unwrap();
    }
}
