// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Requests, submission and flush
//!
//! While a flush window is open on a session, scheduling and submission are
//! gated against it: requests on the flushed sync link and packets for the
//! flushed devices are cancelled, and sync requests at or below the last
//! synced id are downgraded to unsynced.

use kmd::{
    ControlOp, DeviceFlush, DeviceHandle, LinkHandle, PacketHandle, SessionFlush, SessionHandle,
    SyncMode,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::guard::{LifecycleState, RefHold};
use crate::instance::Csl;
use crate::session::SessionInner;
use crate::{CslError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushType {
    /// Flush everything pending.
    All,
    /// Cancel requests up to the given ids.
    Request,
}

/// Scope of a flush. With neither devices nor a sync link the whole
/// session is flushed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushInfo {
    pub flush_type: FlushType,
    pub devices: Option<Vec<DeviceHandle>>,
    /// At most one link.
    pub sync_links: Option<Vec<LinkHandle>>,
    pub last_sync_id: u64,
    pub last_request_id: u64,
}

impl FlushInfo {
    /// Flush of the whole session.
    pub fn all(flush_type: FlushType, last_sync_id: u64, last_request_id: u64) -> Self {
        FlushInfo {
            flush_type,
            devices: None,
            sync_links: None,
            last_sync_id,
            last_request_id,
        }
    }

    fn is_session_wide(&self) -> bool {
        self.devices.is_none() && self.sync_links.is_none()
    }

    fn sync_link(&self) -> Option<LinkHandle> {
        self.sync_links
            .as_ref()
            .and_then(|links| links.first().copied())
    }

    fn covers_device(&self, device: DeviceHandle) -> bool {
        self.devices
            .as_ref()
            .is_some_and(|devices| devices.contains(&device))
    }

    fn validate(&self) -> Result<()> {
        match &self.sync_links {
            Some(links) if links.len() > 1 => Err(CslError::InvalidArgument(format!(
                "flush names {} sync links",
                links.len()
            ))),
            _ => Ok(()),
        }
    }
}

impl Csl {
    /// Schedule a request on a link.
    ///
    /// `exposure_hint` is extra time the kernel should allow for the frame.
    pub fn open_request(
        &self,
        handle: SessionHandle,
        link: LinkHandle,
        request_id: u64,
        bubble: bool,
        sync: SyncMode,
        exposure_hint: u32,
    ) -> Result<()> {
        let _instance = self.instance_ref()?;
        let session = self.sessions.get(handle)?;

        match session.guard.state() {
            LifecycleState::Valid => {}
            LifecycleState::Flush => return Err(CslError::CancelledRequest),
            state => {
                return Err(CslError::InvalidState(format!(
                    "session {handle} in state {state:?}"
                )));
            }
        }

        let inner = session.lock();
        let mut sync = sync;
        if let Some(window) = inner.flush.as_ref().filter(|_| inner.in_flush) {
            if window.is_session_wide() || window.sync_link() == Some(link) {
                debug!("request {request_id} on link {link} cancelled by flush");
                return Err(CslError::CancelledRequest);
            }
            if sync == SyncMode::Sync && request_id <= window.last_sync_id {
                info!(
                    "request {request_id} at or below last sync id {}, scheduling unsynced",
                    window.last_sync_id
                );
                sync = SyncMode::NoSync;
            }
        }

        self.request(&ControlOp::ScheduleRequest {
            session: handle,
            link,
            request_id,
            sync,
            bubble,
            additional_timeout: exposure_hint,
        })?;
        Ok(())
    }

    /// Cancel pending work described by `info`.
    pub fn cancel_request(&self, handle: SessionHandle, info: &FlushInfo) -> Result<()> {
        info.validate()?;
        let _instance = self.instance_ref()?;
        let session = self.sessions.get(handle)?;
        let _session = session.hold()?;
        let inner = session.lock();
        self.cancel(handle, &inner, info)
    }

    fn cancel(&self, handle: SessionHandle, inner: &SessionInner, info: &FlushInfo) -> Result<()> {
        let (session_flush, device_flush) = match info.flush_type {
            FlushType::All => (SessionFlush::All, DeviceFlush::All),
            FlushType::Request => (SessionFlush::CancelRequest, DeviceFlush::Request),
        };
        let session_wide = info.is_session_wide();
        let sync_link = info.sync_link();

        if session_wide || sync_link.is_some() {
            for link in inner.links.iter().flatten() {
                if !link.active || !(session_wide || sync_link == Some(link.handle)) {
                    continue;
                }
                self.request(&ControlOp::FlushSession {
                    session: handle,
                    link: link.handle,
                    flush: session_flush,
                    request_id: info.last_sync_id,
                })?;
            }
        }

        if session_wide || info.devices.is_some() {
            for device in inner.listed(&inner.nrt) {
                if !(session_wide || info.covers_device(device.handle)) || !device.kmd.is_active() {
                    continue;
                }
                let kmd = &device.kmd;
                if let Err(e) = kmd.ops().flush(
                    &kmd.context(),
                    handle,
                    device.handle,
                    device_flush,
                    info.last_request_id,
                ) {
                    warn!(
                        "flush of {} {} failed: {e}",
                        device.device_type, device.handle
                    );
                }
            }
        }
        Ok(())
    }

    /// Open a flush window and cancel the work it covers.
    pub fn flush_lock(&self, handle: SessionHandle, info: &FlushInfo) -> Result<()> {
        info.validate()?;
        let _instance = self.instance_ref()?;
        let session = self.sessions.get(handle)?;
        let _session = session.hold()?;
        let mut inner = session.lock();
        inner.in_flush = true;
        inner.flush = Some(info.clone());
        debug!("session {handle} flush window opened");
        self.cancel(handle, &inner, info)
    }

    /// Close the flush window.
    pub fn flush_unlock(&self, handle: SessionHandle) -> Result<()> {
        let _instance = self.instance_ref()?;
        let session = self.sessions.get(handle)?;
        let mut inner = session.lock();
        inner.in_flush = false;
        inner.flush = None;
        debug!("session {handle} flush window closed");
        Ok(())
    }

    /// Submit a command packet to an acquired device.
    pub fn submit(
        &self,
        handle: SessionHandle,
        device: DeviceHandle,
        packet: PacketHandle,
        offset: u64,
    ) -> Result<()> {
        let _instance = self.instance_ref()?;
        let session = self.sessions.get(handle)?;
        let _session = session.hold()?;

        let acquired = {
            let inner = session.lock();
            let flushed = inner
                .flush
                .as_ref()
                .filter(|_| inner.in_flush)
                .is_some_and(|window| window.is_session_wide() || window.covers_device(device));
            if flushed {
                debug!("packet for {device} cancelled by flush");
                return Err(CslError::CancelledRequest);
            }
            inner.device(device).cloned().ok_or_else(|| {
                CslError::InvalidArgument(format!("device {device} not acquired by {handle}"))
            })?
        };

        let _device = RefHold::acquire(&acquired.guard)
            .ok_or_else(|| CslError::InvalidState(format!("device {device} not valid")))?;
        let kmd = &acquired.kmd;
        let _kmd = RefHold::acquire(&kmd.guard).ok_or_else(|| {
            CslError::InvalidState(format!("{} [{}] not valid", kmd.device_type(), kmd.index()))
        })?;
        kmd.ops()
            .submit(&kmd.context(), handle, device, packet, offset)?;
        Ok(())
    }
}
