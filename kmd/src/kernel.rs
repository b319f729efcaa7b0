// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Kernel request-manager RPC substrate
//!
//! Everything the lifecycle manager asks of the camera kernel driver goes
//! through [`Kernel`]: device node discovery, open/close, the typed camera
//! control call, event subscription and event dequeue. Control requests
//! are carried as [`ControlOp`] values; how they are encoded for a given
//! driver is the implementor's business.

use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::device_type::Version;
use crate::handle::{DeviceHandle, LinkHandle, PacketHandle, SessionHandle};

/// One entity of the camera media topology.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaEntity {
    /// Entity id within the media device.
    pub id: u32,
    /// Kernel device node name, e.g. `v4l-subdev3`.
    pub name: String,
    /// Camera group id of the entity.
    pub group_id: u32,
}

impl MediaEntity {
    pub fn device_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}", self.name))
    }
}

bitflags! {
    /// Deactivation mode recorded at stream off and honored at stream on.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DeactivateMode: u32 {
        /// Leave sensors streaming; device stream calls become no-ops.
        const SENSOR_STANDBY = 1 << 0;
        /// Keep hardware resources reserved across the stop.
        const RELEASE_BUFFERS = 1 << 1;
    }
}

/// Synchronization of a request with the other links of its sync group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    #[default]
    NoSync,
    Sync,
}

/// Link control operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkOp {
    Activate,
    Deactivate,
}

/// Session-scope flush type understood by the request manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionFlush {
    All,
    CancelRequest,
}

/// Device-scope flush type understood by device drivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceFlush {
    All,
    Request,
}

/// Opaque resource descriptor passed through at acquire time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceResource {
    pub resource_id: u32,
    pub data: Vec<u8>,
}

/// Capabilities reported by a device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub driver_version: Version,
    pub hw_version: Version,
    /// Device-specific capability blob.
    pub data: Vec<u8>,
}

/// Platform information reported by the CPAS device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub family: u32,
    pub platform_version: Version,
    pub cpas_version: Version,
}

/// A typed camera control request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlOp {
    QueryCap,
    QueryPlatform,
    CreateSession,
    DestroySession {
        session: SessionHandle,
    },
    AcquireDevice {
        session: SessionHandle,
        resources: Vec<DeviceResource>,
    },
    ReleaseDevice {
        session: SessionHandle,
        device: DeviceHandle,
    },
    AcquireHardware {
        session: SessionHandle,
        device: DeviceHandle,
        version: u32,
        resources: Vec<DeviceResource>,
    },
    ReleaseHardware {
        session: SessionHandle,
        device: DeviceHandle,
    },
    StartDevice {
        session: SessionHandle,
        device: DeviceHandle,
    },
    StopDevice {
        session: SessionHandle,
        device: DeviceHandle,
    },
    ConfigDevice {
        session: SessionHandle,
        device: DeviceHandle,
        packet: PacketHandle,
        offset: u64,
    },
    FlushDevice {
        session: SessionHandle,
        device: DeviceHandle,
        flush: DeviceFlush,
        request_id: u64,
    },
    Link {
        session: SessionHandle,
        devices: Vec<DeviceHandle>,
    },
    Unlink {
        session: SessionHandle,
        link: LinkHandle,
    },
    SyncLinks {
        session: SessionHandle,
        links: Vec<LinkHandle>,
        master: LinkHandle,
        mode: SyncMode,
    },
    LinkControl {
        session: SessionHandle,
        link: LinkHandle,
        op: LinkOp,
    },
    ScheduleRequest {
        session: SessionHandle,
        link: LinkHandle,
        request_id: u64,
        sync: SyncMode,
        bubble: bool,
        additional_timeout: u32,
    },
    FlushSession {
        session: SessionHandle,
        link: LinkHandle,
        flush: SessionFlush,
        request_id: u64,
    },
}

impl ControlOp {
    /// Short operation name used in logs and spies.
    pub fn name(&self) -> &'static str {
        match self {
            Self::QueryCap => "query_cap",
            Self::QueryPlatform => "query_platform",
            Self::CreateSession => "create_session",
            Self::DestroySession { .. } => "destroy_session",
            Self::AcquireDevice { .. } => "acquire_device",
            Self::ReleaseDevice { .. } => "release_device",
            Self::AcquireHardware { .. } => "acquire_hardware",
            Self::ReleaseHardware { .. } => "release_hardware",
            Self::StartDevice { .. } => "start_device",
            Self::StopDevice { .. } => "stop_device",
            Self::ConfigDevice { .. } => "config_device",
            Self::FlushDevice { .. } => "flush_device",
            Self::Link { .. } => "link",
            Self::Unlink { .. } => "unlink",
            Self::SyncLinks { .. } => "sync_links",
            Self::LinkControl { .. } => "link_control",
            Self::ScheduleRequest { .. } => "schedule_request",
            Self::FlushSession { .. } => "flush_session",
        }
    }

    /// Device handle the request targets, if any.
    pub fn device(&self) -> Option<DeviceHandle> {
        match self {
            Self::ReleaseDevice { device, .. }
            | Self::AcquireHardware { device, .. }
            | Self::ReleaseHardware { device, .. }
            | Self::StartDevice { device, .. }
            | Self::StopDevice { device, .. }
            | Self::ConfigDevice { device, .. }
            | Self::FlushDevice { device, .. } => Some(*device),
            _ => None,
        }
    }
}

/// Reply to a [`ControlOp`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlReply {
    Done,
    Session(SessionHandle),
    Device(DeviceHandle),
    Link(LinkHandle),
    Caps(Capabilities),
    Platform(PlatformInfo),
    HardwareInfo(Vec<u8>),
}

fn protocol_error(expected: &str, reply: &ControlReply) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("expected {expected} reply, got {reply:?}"),
    )
}

impl ControlReply {
    pub fn into_session(self) -> io::Result<SessionHandle> {
        match self {
            Self::Session(handle) => Ok(handle),
            other => Err(protocol_error("session", &other)),
        }
    }

    pub fn into_device(self) -> io::Result<DeviceHandle> {
        match self {
            Self::Device(handle) => Ok(handle),
            other => Err(protocol_error("device", &other)),
        }
    }

    pub fn into_link(self) -> io::Result<LinkHandle> {
        match self {
            Self::Link(handle) => Ok(handle),
            other => Err(protocol_error("link", &other)),
        }
    }

    pub fn into_caps(self) -> io::Result<Capabilities> {
        match self {
            Self::Caps(caps) => Ok(caps),
            other => Err(protocol_error("capabilities", &other)),
        }
    }

    pub fn into_platform(self) -> io::Result<PlatformInfo> {
        match self {
            Self::Platform(info) => Ok(info),
            other => Err(protocol_error("platform", &other)),
        }
    }

    /// Hardware info blob; an empty blob when the driver only acknowledged.
    pub fn into_hardware_info(self) -> io::Result<Vec<u8>> {
        match self {
            Self::HardwareInfo(info) => Ok(info),
            Self::Done => Ok(Vec::new()),
            other => Err(protocol_error("hardware info", &other)),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Request-manager event ids a session can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Sof,
    SofBootTimestamp,
    Error,
}

/// Start-of-frame payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameEvent {
    pub session: SessionHandle,
    pub link: LinkHandle,
    pub request_id: u64,
    pub frame_id: u64,
    pub timestamp: u64,
}

/// Error payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub session: SessionHandle,
    pub link: LinkHandle,
    pub error_type: u32,
    pub request_id: u64,
    pub device: DeviceHandle,
    pub resource_index: u32,
}

/// An event dequeued from a kernel device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelEvent {
    Sof(FrameEvent),
    SofBootTimestamp(FrameEvent),
    Error(ErrorEvent),
}

impl KernelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Sof(_) => EventKind::Sof,
            Self::SofBootTimestamp(_) => EventKind::SofBootTimestamp,
            Self::Error(_) => EventKind::Error,
        }
    }

    pub fn session(&self) -> SessionHandle {
        match self {
            Self::Sof(frame) | Self::SofBootTimestamp(frame) => frame.session,
            Self::Error(error) => error.session,
        }
    }

    pub fn link(&self) -> LinkHandle {
        match self {
            Self::Sof(frame) | Self::SofBootTimestamp(frame) => frame.link,
            Self::Error(error) => error.link,
        }
    }

    pub fn request_id(&self) -> u64 {
        match self {
            Self::Sof(frame) | Self::SofBootTimestamp(frame) => frame.request_id,
            Self::Error(error) => error.request_id,
        }
    }
}

// ============================================================================
// Kernel Trait
// ============================================================================

/// The kernel request-manager substrate.
///
/// Implementations must be usable from the event dispatch thread and from
/// any number of caller threads at once.
pub trait Kernel: Send + Sync {
    /// Camera media entities, in enumeration order.
    fn entities(&self) -> io::Result<Vec<MediaEntity>>;

    /// Open a device node non-blocking.
    fn open(&self, entity: &MediaEntity) -> io::Result<RawFd>;

    fn close(&self, fd: RawFd) -> io::Result<()>;

    /// Issue one camera control request on `fd`.
    fn control(&self, fd: RawFd, op: &ControlOp) -> io::Result<ControlReply>;

    fn subscribe(&self, fd: RawFd, kind: EventKind) -> io::Result<()>;

    /// Dequeue the next pending event on `fd`, `None` once drained.
    fn dequeue_event(&self, fd: RawFd) -> io::Result<Option<KernelEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_conversion_mismatch() {
        let err = ControlReply::Done.into_session().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(ControlReply::Done.into_hardware_info().unwrap().is_empty());
    }

    #[test]
    fn test_event_accessors() {
        let event = KernelEvent::Error(ErrorEvent {
            session: SessionHandle(0x101),
            link: LinkHandle(0x202),
            request_id: 9,
            ..Default::default()
        });
        assert_eq!(event.kind(), EventKind::Error);
        assert_eq!(event.session(), SessionHandle(0x101));
        assert_eq!(event.link(), LinkHandle(0x202));
        assert_eq!(event.request_id(), 9);
    }

    #[test]
    fn test_control_op_device() {
        let op = ControlOp::StartDevice {
            session: SessionHandle(1),
            device: DeviceHandle(0x305),
        };
        assert_eq!(op.device(), Some(DeviceHandle(0x305)));
        assert_eq!(op.name(), "start_device");
        assert_eq!(ControlOp::CreateSession.device(), None);
    }

    #[test]
    fn test_entity_device_path() {
        let entity = MediaEntity {
            id: 1,
            name: "v4l-subdev4".to_string(),
            group_id: 0,
        };
        assert_eq!(entity.device_path(), PathBuf::from("/dev/v4l-subdev4"));
    }
}
