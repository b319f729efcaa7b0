// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device Operations
//!
//! Each KMD device gets an operations object chosen by its device type at
//! enumeration time. The trait carries the common kernel behavior as
//! default methods; variants declare what they support through
//! [`OpsCapabilities`] and override only what differs.
//!
//! # Overview
//!
//! - **Realtime front end**: sensor, CSIPHY, ISP, flash, actuator
//! - **Offline engines**: ICP, JPEG, FD, LRME
//! - **Peripherals**: EEPROM, OIS
//! - **Private**: CPAS answers platform queries only
//!
//! Types without a dedicated variant get [`DefaultOps`], which can stream
//! and acquire hardware but cannot acquire the device itself.

use std::io;
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};

use crate::device_type::DeviceType;
use crate::handle::{DeviceHandle, PacketHandle, SessionHandle};
use crate::kernel::{
    Capabilities, ControlOp, ControlReply, DeactivateMode, DeviceFlush, DeviceResource, Kernel,
    MediaEntity, PlatformInfo,
};

/// The KMD device an operation runs against.
#[derive(Clone, Copy)]
pub struct DeviceContext<'a> {
    pub kernel: &'a dyn Kernel,
    pub fd: RawFd,
    /// Slot of the device in the registry.
    pub index: usize,
    pub device_type: DeviceType,
}

impl DeviceContext<'_> {
    /// Issue a control request on the device fd.
    pub fn control(&self, op: &ControlOp) -> io::Result<ControlReply> {
        match self.kernel.control(self.fd, op) {
            Ok(reply) => {
                debug!(
                    "{} ok for fd={} {} [{}]",
                    op.name(),
                    self.fd,
                    self.device_type,
                    self.index
                );
                Ok(reply)
            }
            Err(e) => {
                warn!(
                    "{} failed for fd={} {} [{}]: {e}",
                    op.name(),
                    self.fd,
                    self.device_type,
                    self.index
                );
                Err(e)
            }
        }
    }
}

/// What a device operations variant supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpsCapabilities {
    /// Variant name used in logs.
    pub name: &'static str,
    /// Device can be acquired and released by a session.
    pub acquire: bool,
    /// Device accepts command packets.
    pub submit: bool,
    /// Device answers a kernel capability query.
    pub query_caps: bool,
    /// Device can be started and stopped.
    pub stream: bool,
    /// Highest acquire-hardware structure version, 0 if unsupported.
    pub hardware_version: u32,
}

fn unsupported(ops: &OpsCapabilities, what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{what} not supported by {} ops", ops.name),
    )
}

/// Type-specific device operations.
pub trait DeviceOps: Send + Sync {
    fn capabilities(&self) -> OpsCapabilities;

    /// Query device capabilities from the driver.
    fn query_caps(&self, dev: &DeviceContext<'_>) -> io::Result<Capabilities> {
        let caps = self.capabilities();
        if !caps.query_caps {
            return Err(unsupported(&caps, "capability query"));
        }
        dev.control(&ControlOp::QueryCap)?.into_caps()
    }

    /// Query platform versions. Only the CPAS device answers.
    fn query_platform(&self, _dev: &DeviceContext<'_>) -> io::Result<PlatformInfo> {
        Err(unsupported(&self.capabilities(), "platform query"))
    }

    fn acquire(
        &self,
        dev: &DeviceContext<'_>,
        session: SessionHandle,
        resources: &[DeviceResource],
    ) -> io::Result<DeviceHandle> {
        let caps = self.capabilities();
        if !caps.acquire {
            return Err(unsupported(&caps, "acquire"));
        }
        dev.control(&ControlOp::AcquireDevice {
            session,
            resources: resources.to_vec(),
        })?
        .into_device()
    }

    fn release(
        &self,
        dev: &DeviceContext<'_>,
        session: SessionHandle,
        device: DeviceHandle,
    ) -> io::Result<()> {
        let caps = self.capabilities();
        if !caps.acquire {
            return Err(unsupported(&caps, "release"));
        }
        dev.control(&ControlOp::ReleaseDevice { session, device })
            .map(|_| ())
    }

    /// Reserve hardware resources for an acquired device. Version 2 returns
    /// the driver's hardware info blob, version 1 an empty one.
    fn acquire_hardware(
        &self,
        dev: &DeviceContext<'_>,
        session: SessionHandle,
        device: DeviceHandle,
        version: u32,
        resources: &[DeviceResource],
    ) -> io::Result<Vec<u8>> {
        let caps = self.capabilities();
        if version == 0 || version > caps.hardware_version {
            return Err(unsupported(&caps, "acquire hardware"));
        }
        let info = dev
            .control(&ControlOp::AcquireHardware {
                session,
                device,
                version,
                resources: resources.to_vec(),
            })?
            .into_hardware_info()?;
        Ok(if version >= 2 { info } else { Vec::new() })
    }

    fn release_hardware(
        &self,
        dev: &DeviceContext<'_>,
        session: SessionHandle,
        device: DeviceHandle,
    ) -> io::Result<()> {
        let caps = self.capabilities();
        if caps.hardware_version == 0 {
            return Err(unsupported(&caps, "release hardware"));
        }
        dev.control(&ControlOp::ReleaseHardware { session, device })
            .map(|_| ())
    }

    /// Start the device. A no-op under sensor standby.
    fn stream_on(
        &self,
        dev: &DeviceContext<'_>,
        session: SessionHandle,
        device: DeviceHandle,
        mode: DeactivateMode,
    ) -> io::Result<()> {
        let caps = self.capabilities();
        if !caps.stream {
            return Err(unsupported(&caps, "stream on"));
        }
        if mode.contains(DeactivateMode::SENSOR_STANDBY) {
            return Ok(());
        }
        dev.control(&ControlOp::StartDevice { session, device })
            .map(|_| ())
            .inspect_err(|e| {
                error!(
                    "device fd {} stream on failed index {}: {e}",
                    dev.fd, dev.index
                );
            })
    }

    /// Stop the device. A no-op under sensor standby.
    fn stream_off(
        &self,
        dev: &DeviceContext<'_>,
        session: SessionHandle,
        device: DeviceHandle,
        mode: DeactivateMode,
    ) -> io::Result<()> {
        let caps = self.capabilities();
        if !caps.stream {
            return Err(unsupported(&caps, "stream off"));
        }
        if mode.contains(DeactivateMode::SENSOR_STANDBY) {
            return Ok(());
        }
        dev.control(&ControlOp::StopDevice { session, device })
            .map(|_| ())
            .inspect_err(|e| {
                error!(
                    "device fd {} stream off failed index {}: {e}",
                    dev.fd, dev.index
                );
            })
    }

    /// Hand a command packet to the device.
    fn submit(
        &self,
        dev: &DeviceContext<'_>,
        session: SessionHandle,
        device: DeviceHandle,
        packet: PacketHandle,
        offset: u64,
    ) -> io::Result<()> {
        let caps = self.capabilities();
        if !caps.submit {
            return Err(unsupported(&caps, "submit"));
        }
        dev.control(&ControlOp::ConfigDevice {
            session,
            device,
            packet,
            offset,
        })
        .map(|_| ())
    }

    fn flush(
        &self,
        dev: &DeviceContext<'_>,
        session: SessionHandle,
        device: DeviceHandle,
        flush: DeviceFlush,
        request_id: u64,
    ) -> io::Result<()> {
        dev.control(&ControlOp::FlushDevice {
            session,
            device,
            flush,
            request_id,
        })
        .map(|_| ())
    }
}

// ============================================================================
// Variants
// ============================================================================

/// Operations for types without a dedicated driver interface.
///
/// The capability answer comes from user space; the device itself cannot
/// be acquired or fed packets.
pub struct DefaultOps;

impl DeviceOps for DefaultOps {
    fn capabilities(&self) -> OpsCapabilities {
        OpsCapabilities {
            name: "default",
            acquire: false,
            submit: false,
            query_caps: true,
            stream: true,
            hardware_version: 2,
        }
    }

    fn query_caps(&self, _dev: &DeviceContext<'_>) -> io::Result<Capabilities> {
        Ok(Capabilities::default())
    }
}

/// Image sensor slot.
pub struct SensorOps;

impl DeviceOps for SensorOps {
    fn capabilities(&self) -> OpsCapabilities {
        OpsCapabilities {
            name: "sensor",
            acquire: true,
            submit: true,
            query_caps: true,
            stream: true,
            hardware_version: 0,
        }
    }
}

pub struct CsiphyOps;

impl DeviceOps for CsiphyOps {
    fn capabilities(&self) -> OpsCapabilities {
        OpsCapabilities {
            name: "csiphy",
            acquire: true,
            submit: true,
            query_caps: true,
            stream: true,
            hardware_version: 0,
        }
    }
}

/// IFE and VFE front ends.
pub struct IspOps;

impl DeviceOps for IspOps {
    fn capabilities(&self) -> OpsCapabilities {
        OpsCapabilities {
            name: "isp",
            acquire: true,
            submit: true,
            query_caps: true,
            stream: true,
            hardware_version: 2,
        }
    }
}

pub struct IcpOps;

impl DeviceOps for IcpOps {
    fn capabilities(&self) -> OpsCapabilities {
        OpsCapabilities {
            name: "icp",
            acquire: true,
            submit: true,
            query_caps: true,
            stream: true,
            hardware_version: 1,
        }
    }
}

pub struct JpegOps;

impl DeviceOps for JpegOps {
    fn capabilities(&self) -> OpsCapabilities {
        OpsCapabilities {
            name: "jpeg",
            acquire: true,
            submit: true,
            query_caps: true,
            stream: true,
            hardware_version: 1,
        }
    }
}

pub struct FdOps;

impl DeviceOps for FdOps {
    fn capabilities(&self) -> OpsCapabilities {
        OpsCapabilities {
            name: "fd",
            acquire: true,
            submit: true,
            query_caps: true,
            stream: true,
            hardware_version: 1,
        }
    }
}

/// LRME has no kernel capability query.
pub struct LrmeOps;

impl DeviceOps for LrmeOps {
    fn capabilities(&self) -> OpsCapabilities {
        OpsCapabilities {
            name: "lrme",
            acquire: true,
            submit: true,
            query_caps: false,
            stream: true,
            hardware_version: 1,
        }
    }
}

pub struct FlashOps;

impl DeviceOps for FlashOps {
    fn capabilities(&self) -> OpsCapabilities {
        OpsCapabilities {
            name: "flash",
            acquire: true,
            submit: true,
            query_caps: true,
            stream: true,
            hardware_version: 0,
        }
    }
}

pub struct ActuatorOps;

impl DeviceOps for ActuatorOps {
    fn capabilities(&self) -> OpsCapabilities {
        OpsCapabilities {
            name: "actuator",
            acquire: true,
            submit: true,
            query_caps: true,
            stream: true,
            hardware_version: 0,
        }
    }
}

pub struct EepromOps;

impl DeviceOps for EepromOps {
    fn capabilities(&self) -> OpsCapabilities {
        OpsCapabilities {
            name: "eeprom",
            acquire: true,
            submit: true,
            query_caps: true,
            stream: true,
            hardware_version: 0,
        }
    }
}

pub struct OisOps;

impl DeviceOps for OisOps {
    fn capabilities(&self) -> OpsCapabilities {
        OpsCapabilities {
            name: "ois",
            acquire: true,
            submit: true,
            query_caps: true,
            stream: true,
            hardware_version: 0,
        }
    }
}

/// Camera power and bandwidth controller.
pub struct CpasOps;

impl DeviceOps for CpasOps {
    fn capabilities(&self) -> OpsCapabilities {
        OpsCapabilities {
            name: "cpas",
            acquire: false,
            submit: false,
            query_caps: true,
            stream: false,
            hardware_version: 0,
        }
    }

    fn query_platform(&self, dev: &DeviceContext<'_>) -> io::Result<PlatformInfo> {
        dev.control(&ControlOp::QueryPlatform)?.into_platform()
    }
}

pub struct CustomOps;

impl DeviceOps for CustomOps {
    fn capabilities(&self) -> OpsCapabilities {
        OpsCapabilities {
            name: "custom",
            acquire: true,
            submit: true,
            query_caps: true,
            stream: true,
            hardware_version: 2,
        }
    }
}

/// Select the operations for a device type.
pub fn ops_for(device_type: DeviceType) -> Box<dyn DeviceOps> {
    match device_type {
        DeviceType::ImageSensor => Box::new(SensorOps),
        DeviceType::Csiphy => Box::new(CsiphyOps),
        DeviceType::Ife | DeviceType::Vfe => Box::new(IspOps),
        DeviceType::Icp => Box::new(IcpOps),
        DeviceType::Jpege => Box::new(JpegOps),
        DeviceType::Fd => Box::new(FdOps),
        DeviceType::Lrme => Box::new(LrmeOps),
        DeviceType::Flash => Box::new(FlashOps),
        DeviceType::LensActuator => Box::new(ActuatorOps),
        DeviceType::Eeprom => Box::new(EepromOps),
        DeviceType::Ois => Box::new(OisOps),
        DeviceType::CpasTop => Box::new(CpasOps),
        DeviceType::Custom => Box::new(CustomOps),
        DeviceType::Companion
        | DeviceType::Jpegd
        | DeviceType::Cpp
        | DeviceType::Csid
        | DeviceType::Ispif
        | DeviceType::RequestManager => Box::new(DefaultOps),
    }
}

/// Open a device node, retrying while another process is still tearing
/// it down.
pub fn open_with_retry(
    kernel: &dyn Kernel,
    entity: &MediaEntity,
    max_attempts: u32,
    sleep: Duration,
) -> io::Result<RawFd> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match kernel.open(entity) {
            Ok(fd) => return Ok(fd),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt < max_attempts => {
                warn!(
                    "{} busy, retry {attempt}/{max_attempts}",
                    entity.device_path().display()
                );
                thread::sleep(sleep);
            }
            Err(e) => {
                error!(
                    "open {} failed after {attempt} attempt(s): {e}",
                    entity.device_path().display()
                );
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_selects_variant() {
        assert_eq!(ops_for(DeviceType::Ife).capabilities().name, "isp");
        assert_eq!(ops_for(DeviceType::Vfe).capabilities().name, "isp");
        assert_eq!(ops_for(DeviceType::Csid).capabilities().name, "default");
        assert_eq!(ops_for(DeviceType::CpasTop).capabilities().name, "cpas");
    }

    #[test]
    fn test_default_ops_cannot_acquire() {
        let caps = DefaultOps.capabilities();
        assert!(!caps.acquire);
        assert!(!caps.submit);
        assert!(caps.stream);
    }

    #[test]
    fn test_lrme_has_no_capability_query() {
        assert!(!ops_for(DeviceType::Lrme).capabilities().query_caps);
    }
}
