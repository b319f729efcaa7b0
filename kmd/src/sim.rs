// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Simulated request-manager kernel
//!
//! [`SimKernel`] implements [`Kernel`] in process. Every opened node is
//! backed by a non-blocking `EventFd`, so the fds it hands out can be
//! polled like the real device nodes: an eventfd is readable exactly while
//! its event queue is non-empty.
//!
//! Besides answering requests it records every control call (a spy for
//! call counts and ordering) and can be told to fail chosen calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use vmm_sys_util::eventfd::EventFd;

use crate::device_type::{Version, group_id};
use crate::handle::{DeviceHandle, LinkHandle, MAX_HANDLES, SessionHandle, compose};
use crate::kernel::{
    Capabilities, ControlOp, ControlReply, EventKind, FrameEvent, Kernel, KernelEvent,
    MediaEntity, PlatformInfo,
};

/// One recorded control call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimCall {
    pub fd: RawFd,
    pub op: ControlOp,
}

/// Makes matching control calls fail.
#[derive(Clone, Debug)]
pub struct FailureRule {
    /// Operation name as reported by [`ControlOp::name`].
    pub op: &'static str,
    /// Only calls targeting this device, if set.
    pub device: Option<DeviceHandle>,
    /// Matching calls to let through before failing.
    pub skip: usize,
    pub errno: i32,
    /// Keep failing after the first hit.
    pub persistent: bool,
}

impl FailureRule {
    /// Fail the next `op` call once with `EIO`.
    pub fn once(op: &'static str) -> Self {
        FailureRule {
            op,
            device: None,
            skip: 0,
            errno: libc::EIO,
            persistent: false,
        }
    }

    pub fn on_device(mut self, device: DeviceHandle) -> Self {
        self.device = Some(device);
        self
    }

    pub fn after(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn errno(mut self, errno: i32) -> Self {
        self.errno = errno;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

struct SimNode {
    entity: MediaEntity,
    event_fd: EventFd,
    queue: VecDeque<KernelEvent>,
    subscriptions: HashSet<EventKind>,
}

#[derive(Default)]
struct HandleAllocator {
    issued: u32,
    live: HashSet<i32>,
}

impl HandleAllocator {
    fn allocate(&mut self) -> i32 {
        let index = self.issued as usize % MAX_HANDLES;
        let generation = self.issued / MAX_HANDLES as u32 + 1;
        self.issued += 1;
        let handle = compose(generation, index);
        self.live.insert(handle);
        handle
    }

    fn free(&mut self, handle: i32) -> io::Result<()> {
        if self.live.remove(&handle) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        }
    }

    fn check(&self, handle: i32) -> io::Result<()> {
        if self.live.contains(&handle) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        }
    }
}

#[derive(Default)]
struct SimState {
    entities: Vec<MediaEntity>,
    nodes: HashMap<RawFd, SimNode>,
    sessions: HandleAllocator,
    devices: HandleAllocator,
    links: HandleAllocator,
    calls: Vec<SimCall>,
    rules: Vec<FailureRule>,
    busy_opens: HashMap<String, u32>,
    invalid_session_handles: bool,
}

impl SimState {
    fn injected_failure(&mut self, op: &ControlOp) -> Option<io::Error> {
        let name = op.name();
        let device = op.device();
        let position = self.rules.iter().position(|rule| {
            rule.op == name && (rule.device.is_none() || rule.device == device)
        })?;
        let rule = &mut self.rules[position];
        if rule.skip > 0 {
            rule.skip -= 1;
            return None;
        }
        let errno = rule.errno;
        if !rule.persistent {
            self.rules.remove(position);
        }
        Some(io::Error::from_raw_os_error(errno))
    }

    fn answer(&mut self, fd: RawFd, op: &ControlOp) -> io::Result<ControlReply> {
        let reply = match op {
            ControlOp::QueryCap => {
                let node = self
                    .nodes
                    .get(&fd)
                    .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
                ControlReply::Caps(Capabilities {
                    driver_version: Version {
                        major: 1,
                        minor: 0,
                        revision: 0,
                    },
                    hw_version: Version {
                        major: 1,
                        minor: node.entity.id,
                        revision: 0,
                    },
                    data: node.entity.name.as_bytes().to_vec(),
                })
            }
            ControlOp::QueryPlatform => ControlReply::Platform(PlatformInfo {
                family: 1,
                platform_version: Version {
                    major: 1,
                    minor: 5,
                    revision: 0,
                },
                cpas_version: Version {
                    major: 1,
                    minor: 2,
                    revision: 0,
                },
            }),
            ControlOp::CreateSession => {
                if self.invalid_session_handles {
                    // Kernel claims success but hands back a dead handle.
                    let handle = self.sessions.allocate();
                    self.sessions.free(handle)?;
                    ControlReply::Session(SessionHandle::INVALID)
                } else {
                    ControlReply::Session(SessionHandle(self.sessions.allocate()))
                }
            }
            ControlOp::DestroySession { session } => {
                self.sessions.free(session.raw())?;
                ControlReply::Done
            }
            ControlOp::AcquireDevice { session, .. } => {
                self.sessions.check(session.raw())?;
                ControlReply::Device(DeviceHandle(self.devices.allocate()))
            }
            ControlOp::ReleaseDevice { device, .. } => {
                self.devices.free(device.raw())?;
                ControlReply::Done
            }
            ControlOp::AcquireHardware {
                device, version, ..
            } => {
                self.devices.check(device.raw())?;
                let mut info = device.raw().to_le_bytes().to_vec();
                info.extend_from_slice(&version.to_le_bytes());
                ControlReply::HardwareInfo(info)
            }
            ControlOp::ReleaseHardware { device, .. }
            | ControlOp::StartDevice { device, .. }
            | ControlOp::StopDevice { device, .. }
            | ControlOp::ConfigDevice { device, .. }
            | ControlOp::FlushDevice { device, .. } => {
                self.devices.check(device.raw())?;
                ControlReply::Done
            }
            ControlOp::Link { session, devices } => {
                self.sessions.check(session.raw())?;
                for device in devices {
                    self.devices.check(device.raw())?;
                }
                ControlReply::Link(LinkHandle(self.links.allocate()))
            }
            ControlOp::Unlink { link, .. } => {
                self.links.free(link.raw())?;
                ControlReply::Done
            }
            ControlOp::SyncLinks { links, .. } => {
                for link in links {
                    self.links.check(link.raw())?;
                }
                ControlReply::Done
            }
            ControlOp::LinkControl { link, .. }
            | ControlOp::ScheduleRequest { link, .. }
            | ControlOp::FlushSession { link, .. } => {
                self.links.check(link.raw())?;
                ControlReply::Done
            }
        };
        Ok(reply)
    }
}

/// In-process kernel used by tests and the CLI simulation mode.
pub struct SimKernel {
    state: Mutex<SimState>,
}

impl SimKernel {
    pub fn new(entities: Vec<MediaEntity>) -> Self {
        SimKernel {
            state: Mutex::new(SimState {
                entities,
                ..Default::default()
            }),
        }
    }

    /// Request manager, CPAS, one realtime chain, the offline engines,
    /// two peripherals and a CCI master the layer does not manage.
    pub fn with_camera_topology() -> Self {
        let groups = [
            ("video0", group_id::VNODE),
            ("v4l-subdev0", group_id::CPAS),
            ("v4l-subdev1", group_id::IFE),
            ("v4l-subdev2", group_id::CSIPHY),
            ("v4l-subdev3", group_id::SENSOR),
            ("v4l-subdev4", group_id::ACTUATOR),
            ("v4l-subdev5", group_id::FLASH),
            ("v4l-subdev6", group_id::ICP),
            ("v4l-subdev7", group_id::JPEG),
            ("v4l-subdev8", group_id::FD),
            ("v4l-subdev9", group_id::LRME),
            ("v4l-subdev10", group_id::EEPROM),
            ("v4l-subdev11", group_id::OIS),
            ("v4l-subdev12", group_id::CCI),
        ];
        let entities = groups
            .iter()
            .enumerate()
            .map(|(id, (name, group_id))| MediaEntity {
                id: id as u32,
                name: (*name).to_string(),
                group_id: *group_id,
            })
            .collect();
        Self::new(entities)
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn inject(&self, rule: FailureRule) {
        self.state().rules.push(rule);
    }

    pub fn clear_failures(&self) {
        self.state().rules.clear();
    }

    /// Fail the next `count` opens of `name` with `EBUSY`.
    pub fn busy_on_open(&self, name: &str, count: u32) {
        self.state().busy_opens.insert(name.to_string(), count);
    }

    /// Make session creation succeed with an invalid handle.
    pub fn hand_out_invalid_sessions(&self, enabled: bool) {
        self.state().invalid_session_handles = enabled;
    }

    /// Every control call seen so far, in order.
    pub fn calls(&self) -> Vec<SimCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.op.name() == op)
            .count()
    }

    /// Calls of `op` targeting `device`.
    pub fn device_call_count(&self, op: &str, device: DeviceHandle) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.op.name() == op && call.op.device() == Some(device))
            .count()
    }

    pub fn open_fd_count(&self) -> usize {
        self.state().nodes.len()
    }

    /// Queue an event on a node and make it readable.
    pub fn push_event(&self, fd: RawFd, event: KernelEvent) -> io::Result<()> {
        let mut state = self.state();
        let node = state
            .nodes
            .get_mut(&fd)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        node.queue.push_back(event);
        node.event_fd.write(1)
    }

    /// Deliver an event to every node subscribed to its kind. Returns the
    /// number of nodes it was queued on.
    pub fn emit(&self, event: KernelEvent) -> io::Result<usize> {
        let mut state = self.state();
        let mut delivered = 0;
        for node in state.nodes.values_mut() {
            if node.subscriptions.contains(&event.kind()) {
                node.queue.push_back(event);
                node.event_fd.write(1)?;
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Emit a start-of-frame with a boot timestamp.
    pub fn emit_frame(
        &self,
        session: SessionHandle,
        link: LinkHandle,
        request_id: u64,
        frame_id: u64,
        timestamp: u64,
    ) -> io::Result<usize> {
        self.emit(KernelEvent::SofBootTimestamp(FrameEvent {
            session,
            link,
            request_id,
            frame_id,
            timestamp,
        }))
    }
}

impl Kernel for SimKernel {
    fn entities(&self) -> io::Result<Vec<MediaEntity>> {
        Ok(self.state().entities.clone())
    }

    fn open(&self, entity: &MediaEntity) -> io::Result<RawFd> {
        let mut state = self.state();
        if let Some(remaining) = state
            .busy_opens
            .get_mut(&entity.name)
            .filter(|remaining| **remaining > 0)
        {
            *remaining -= 1;
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        if !state.entities.contains(entity) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        let event_fd = EventFd::new(libc::EFD_NONBLOCK)?;
        let fd = event_fd.as_raw_fd();
        debug!("sim: opened {} as fd {fd}", entity.name);
        state.nodes.insert(
            fd,
            SimNode {
                entity: entity.clone(),
                event_fd,
                queue: VecDeque::new(),
                subscriptions: HashSet::new(),
            },
        );
        Ok(fd)
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        self.state()
            .nodes
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn control(&self, fd: RawFd, op: &ControlOp) -> io::Result<ControlReply> {
        let mut state = self.state();
        if !state.nodes.contains_key(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        state.calls.push(SimCall { fd, op: op.clone() });
        if let Some(e) = state.injected_failure(op) {
            return Err(e);
        }
        state.answer(fd, op)
    }

    fn subscribe(&self, fd: RawFd, kind: EventKind) -> io::Result<()> {
        let mut state = self.state();
        let node = state
            .nodes
            .get_mut(&fd)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        node.subscriptions.insert(kind);
        Ok(())
    }

    fn dequeue_event(&self, fd: RawFd) -> io::Result<Option<KernelEvent>> {
        let mut state = self.state();
        let node = state
            .nodes
            .get_mut(&fd)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        let event = node.queue.pop_front();
        if node.queue.is_empty() {
            // Drain the counter so the fd stops polling readable.
            match node.event_fd.read() {
                Err(e) if e.kind() != io::ErrorKind::WouldBlock => return Err(e),
                _ => {}
            }
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rm_entity(kernel: &SimKernel) -> MediaEntity {
        kernel.entities().unwrap().remove(0)
    }

    #[test]
    fn test_open_busy_retries_exhaust() {
        let kernel = SimKernel::with_camera_topology();
        let entity = rm_entity(&kernel);
        kernel.busy_on_open(&entity.name, 1);
        let err = kernel.open(&entity).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
        let fd = kernel.open(&entity).unwrap();
        kernel.close(fd).unwrap();
        assert_eq!(kernel.open_fd_count(), 0);
    }

    #[test]
    fn test_events_are_fifo_per_fd() {
        let kernel = SimKernel::with_camera_topology();
        let fd = kernel.open(&rm_entity(&kernel)).unwrap();
        for request_id in [1, 2] {
            kernel
                .push_event(
                    fd,
                    KernelEvent::Sof(FrameEvent {
                        request_id,
                        ..Default::default()
                    }),
                )
                .unwrap();
        }
        assert_eq!(kernel.dequeue_event(fd).unwrap().unwrap().request_id(), 1);
        assert_eq!(kernel.dequeue_event(fd).unwrap().unwrap().request_id(), 2);
        assert!(kernel.dequeue_event(fd).unwrap().is_none());
    }

    #[test]
    fn test_emit_respects_subscriptions() {
        let kernel = SimKernel::with_camera_topology();
        let fd = kernel.open(&rm_entity(&kernel)).unwrap();
        let event = KernelEvent::Sof(FrameEvent::default());
        assert_eq!(kernel.emit(event).unwrap(), 0);
        kernel.subscribe(fd, EventKind::Sof).unwrap();
        assert_eq!(kernel.emit(event).unwrap(), 1);
    }

    #[test]
    fn test_failure_rule_skips_then_fails_once() {
        let kernel = SimKernel::with_camera_topology();
        let fd = kernel.open(&rm_entity(&kernel)).unwrap();
        kernel.inject(FailureRule::once("create_session").after(1).errno(libc::ENOMEM));
        kernel.control(fd, &ControlOp::CreateSession).unwrap();
        let err = kernel.control(fd, &ControlOp::CreateSession).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));
        kernel.control(fd, &ControlOp::CreateSession).unwrap();
        assert_eq!(kernel.call_count("create_session"), 3);
    }

    #[test]
    fn test_stale_handles_rejected() {
        let kernel = SimKernel::with_camera_topology();
        let fd = kernel.open(&rm_entity(&kernel)).unwrap();
        let session = kernel
            .control(fd, &ControlOp::CreateSession)
            .unwrap()
            .into_session()
            .unwrap();
        kernel
            .control(fd, &ControlOp::DestroySession { session })
            .unwrap();
        let err = kernel
            .control(fd, &ControlOp::DestroySession { session })
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }
}
