// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stream on and off
//!
//! Stream-on activates the link, then starts realtime devices sorted by
//! activation key and non-realtime devices in acquisition order. A failure
//! stops everything this call started, in reverse, and deactivates the link.
//! Stream-off walks the realtime list sorted by deactivation key and keeps
//! going past failures.

use std::sync::Arc;

use kmd::{ControlOp, DeactivateMode, DeviceHandle, DeviceType, LinkHandle, LinkOp, SessionHandle};
use log::{debug, error, info, warn};

use crate::instance::Csl;
use crate::session::AcquiredDevice;
use crate::{CslError, Result};

fn selected(filter: Option<&[DeviceHandle]>, device: &AcquiredDevice) -> bool {
    filter.is_none_or(|handles| handles.contains(&device.handle))
}

/// Stream-off also matches a CSIPHY named by its KMD index.
fn selected_for_stop(filter: Option<&[DeviceHandle]>, device: &AcquiredDevice) -> bool {
    selected(filter, device)
        || (device.device_type == DeviceType::Csiphy
            && filter.is_some_and(|handles| {
                handles
                    .iter()
                    .any(|handle| usize::try_from(handle.raw()) == Ok(device.kmd.index()))
            }))
}

fn stop_device(session: SessionHandle, device: &AcquiredDevice, mode: DeactivateMode) -> Result<()> {
    let kmd = &device.kmd;
    kmd.ops()
        .stream_off(&kmd.context(), session, device.handle, mode)?;
    kmd.set_active(false);
    Ok(())
}

/// Start `devices` in order. On failure stop the ones this walk started.
fn start_all(
    session: SessionHandle,
    devices: &[Arc<AcquiredDevice>],
    filter: Option<&[DeviceHandle]>,
    mode: DeactivateMode,
) -> Result<()> {
    let mut started: Vec<&Arc<AcquiredDevice>> = Vec::new();
    for device in devices.iter().filter(|device| selected(filter, device)) {
        let kmd = &device.kmd;
        match kmd
            .ops()
            .stream_on(&kmd.context(), session, device.handle, mode)
        {
            Ok(()) => {
                kmd.set_active(true);
                started.push(device);
            }
            Err(e) => {
                error!(
                    "stream on of {} {} failed: {e}",
                    device.device_type, device.handle
                );
                for previous in started.iter().rev() {
                    if let Err(e) = stop_device(session, previous, mode) {
                        warn!("rollback of {} failed: {e}", previous.handle);
                    }
                }
                return Err(e.into());
            }
        }
    }
    Ok(())
}

/// Stop `devices` in order, returning the last failure.
fn stop_all(
    session: SessionHandle,
    devices: &[Arc<AcquiredDevice>],
    filter: Option<&[DeviceHandle]>,
    mode: DeactivateMode,
) -> Result<()> {
    let mut result = Ok(());
    for device in devices
        .iter()
        .filter(|device| selected_for_stop(filter, device))
    {
        if let Err(e) = stop_device(session, device, mode) {
            error!(
                "stream off of {} {} failed: {e}",
                device.device_type, device.handle
            );
            result = Err(e);
        }
    }
    result
}

impl Csl {
    fn link_control(&self, session: SessionHandle, link: LinkHandle, op: LinkOp) -> Result<()> {
        self.request(&ControlOp::LinkControl { session, link, op })?;
        Ok(())
    }

    /// Start streaming on a link. `devices` restricts which acquired devices
    /// are started; `None` starts all of them.
    pub fn stream_on(
        &self,
        handle: SessionHandle,
        link: LinkHandle,
        devices: Option<&[DeviceHandle]>,
    ) -> Result<()> {
        let _instance = self.instance_ref()?;
        let session = self.sessions.get(handle)?;
        let _session = session.hold()?;
        let mut inner = session.lock();
        let slot = inner.link_slot(link)?;
        let mode = inner.links[slot]
            .as_ref()
            .map_or(DeactivateMode::empty(), |link| link.mode);

        self.link_control(handle, link, LinkOp::Activate)?;
        if let Some(info) = inner.links[slot].as_mut() {
            info.active = true;
        }

        inner.sort_rt_for_activation();
        let rt = inner.listed(&inner.rt);
        let nrt = inner.listed(&inner.nrt);
        let mut result = start_all(handle, &rt, devices, mode);
        if result.is_ok() && nrt.iter().any(|device| selected(devices, device)) {
            result = start_all(handle, &nrt, devices, mode);
            if result.is_err() {
                let stopped = stop_all(handle, &rt, devices, mode);
                if let Err(e) = stopped {
                    warn!("stopping realtime devices after failure: {e}");
                }
            }
        }

        if let Err(e) = result {
            error!("session {handle} stream on of link {link} failed: {e}");
            if let Err(e) = self.link_control(handle, link, LinkOp::Deactivate) {
                warn!("deactivating link {link} failed: {e}");
            }
            if let Some(info) = inner.links[slot].as_mut() {
                info.active = false;
            }
            inner.stream_on = false;
            return Err(e);
        }
        inner.stream_on = true;
        info!("session {handle} link {link} streaming");
        Ok(())
    }

    /// Stop streaming. With a valid `link` the realtime devices stop and the
    /// link is deactivated; non-realtime devices stop either way.
    pub fn stream_off(
        &self,
        handle: SessionHandle,
        link: LinkHandle,
        devices: Option<&[DeviceHandle]>,
        mode: DeactivateMode,
    ) -> Result<()> {
        let _instance = self.instance_ref()?;
        let session = self.sessions.get(handle)?;
        let _session = session.hold()?;
        let mut inner = session.lock();
        let slot = if link.is_valid() {
            Some(inner.link_slot(link)?)
        } else {
            None
        };

        let mut result = Ok(());
        if let Some(slot) = slot {
            inner.sort_rt_for_deactivation();
            let rt = inner.listed(&inner.rt);
            if let Err(e) = stop_all(handle, &rt, devices, mode) {
                result = Err(e);
            }
            if let Err(e) = self.link_control(handle, link, LinkOp::Deactivate) {
                error!("deactivating link {link} failed: {e}");
                result = Err(e);
            }
            if let Some(info) = inner.links[slot].as_mut() {
                info.active = false;
                info.mode = mode;
            }
        }

        let nrt = inner.listed(&inner.nrt);
        if let Err(e) = stop_all(handle, &nrt, devices, mode) {
            result = Err(e);
        }
        inner.stream_on = false;
        debug!("session {handle} stream off with {mode:?}");
        result
    }

    /// Start one device outside of any link.
    pub fn single_device_stream_on(
        &self,
        handle: SessionHandle,
        index: i32,
        device: DeviceHandle,
    ) -> Result<()> {
        let _instance = self.instance_ref()?;
        let kmd = self.kmd_device(index)?;
        kmd.ops()
            .stream_on(&kmd.context(), handle, device, DeactivateMode::empty())?;
        kmd.set_active(true);
        Ok(())
    }

    /// Stop one device outside of any link.
    pub fn single_device_stream_off(
        &self,
        handle: SessionHandle,
        index: i32,
        device: DeviceHandle,
    ) -> Result<()> {
        let _instance = self.instance_ref()?;
        let kmd = self.kmd_device(index)?;
        if !kmd.is_active() {
            return Err(CslError::InvalidState(format!(
                "{} [{index}] is not streaming",
                kmd.device_type()
            )));
        }
        kmd.ops()
            .stream_off(&kmd.context(), handle, device, DeactivateMode::empty())?;
        kmd.set_active(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kmd::{FailureRule, SimKernel};

    use super::*;
    use crate::config::CslConfig;

    struct Pipeline {
        sim: Arc<SimKernel>,
        csl: Csl,
        session: SessionHandle,
        ife: DeviceHandle,
        csiphy: DeviceHandle,
        sensor: DeviceHandle,
        link: LinkHandle,
    }

    fn pipeline() -> Pipeline {
        let sim = Arc::new(SimKernel::with_camera_topology());
        let csl = Csl::new(sim.clone(), CslConfig::for_testing()).unwrap();
        csl.initialize().unwrap();
        let session = csl.open().unwrap();
        let sensor = csl.acquire_device(session, 2, &[], &[], "sensor").unwrap();
        let csiphy = csl.acquire_device(session, 1, &[], &[], "csiphy").unwrap();
        let ife = csl.acquire_device(session, 0, &[], &[], "ife").unwrap();
        let link = csl.link(session, &[sensor, ife]).unwrap();
        Pipeline {
            sim,
            csl,
            session,
            ife,
            csiphy,
            sensor,
            link,
        }
    }

    fn started(sim: &SimKernel, op: &str) -> Vec<DeviceHandle> {
        sim.calls()
            .iter()
            .filter(|call| call.op.name() == op)
            .filter_map(|call| call.op.device())
            .collect()
    }

    #[test]
    fn test_stream_on_follows_activation_order() {
        let p = pipeline();
        p.csl.stream_on(p.session, p.link, None).unwrap();
        assert_eq!(started(&p.sim, "start_device"), vec![p.ife, p.csiphy, p.sensor]);
        assert!(p.csl.link_info(p.session, p.link).unwrap().active);
        assert!(p.csl.kmd_device(0).unwrap().is_active());
    }

    #[test]
    fn test_stream_off_follows_deactivation_order() {
        let p = pipeline();
        p.csl.stream_on(p.session, p.link, None).unwrap();
        p.csl
            .stream_off(p.session, p.link, None, DeactivateMode::empty())
            .unwrap();
        assert_eq!(started(&p.sim, "stop_device"), vec![p.ife, p.sensor, p.csiphy]);
        assert!(!p.csl.link_info(p.session, p.link).unwrap().active);
    }

    #[test]
    fn test_stream_on_failure_rolls_back() {
        let p = pipeline();
        p.sim
            .inject(FailureRule::once("start_device").on_device(p.sensor));

        assert!(matches!(
            p.csl.stream_on(p.session, p.link, None),
            Err(CslError::Kernel(_))
        ));
        assert_eq!(started(&p.sim, "stop_device"), vec![p.csiphy, p.ife]);
        for index in 0..3 {
            assert!(!p.csl.kmd_device(index).unwrap().is_active());
        }
        assert!(!p.csl.link_info(p.session, p.link).unwrap().active);
        assert_eq!(p.sim.call_count("link_control"), 2);
    }

    #[test]
    fn test_stream_off_continues_past_failures() {
        let p = pipeline();
        p.csl.stream_on(p.session, p.link, None).unwrap();
        p.sim
            .inject(FailureRule::once("stop_device").on_device(p.ife));

        assert!(matches!(
            p.csl
                .stream_off(p.session, p.link, None, DeactivateMode::empty()),
            Err(CslError::Kernel(_))
        ));
        assert_eq!(p.sim.call_count("stop_device"), 3);
        assert!(p.csl.kmd_device(0).unwrap().is_active());
        assert!(!p.csl.kmd_device(2).unwrap().is_active());
    }

    #[test]
    fn test_sensor_standby_skips_kernel() {
        let p = pipeline();
        p.csl.stream_on(p.session, p.link, None).unwrap();
        p.csl
            .stream_off(
                p.session,
                p.link,
                Some(&[p.sensor]),
                DeactivateMode::SENSOR_STANDBY,
            )
            .unwrap();
        assert_eq!(p.sim.call_count("stop_device"), 0);
        let link = p.csl.link_info(p.session, p.link).unwrap();
        assert_eq!(link.mode, DeactivateMode::SENSOR_STANDBY);
    }

    #[test]
    fn test_stream_off_matches_csiphy_by_kmd_index() {
        let p = pipeline();
        p.csl.stream_on(p.session, p.link, None).unwrap();
        p.csl
            .stream_off(
                p.session,
                p.link,
                Some(&[DeviceHandle(1)]),
                DeactivateMode::empty(),
            )
            .unwrap();
        assert_eq!(started(&p.sim, "stop_device"), vec![p.csiphy]);
    }

    #[test]
    fn test_stream_on_unknown_link_rejected() {
        let p = pipeline();
        assert!(matches!(
            p.csl.stream_on(p.session, LinkHandle(0x3ff), None),
            Err(CslError::InvalidArgument(_))
        ));
        assert_eq!(p.sim.call_count("link_control"), 0);
    }

    #[test]
    fn test_single_device_stream() {
        let p = pipeline();
        p.csl
            .single_device_stream_on(p.session, 2, p.sensor)
            .unwrap();
        assert!(p.csl.kmd_device(2).unwrap().is_active());
        p.csl
            .single_device_stream_off(p.session, 2, p.sensor)
            .unwrap();
        assert!(matches!(
            p.csl.single_device_stream_off(p.session, 2, p.sensor),
            Err(CslError::InvalidState(_))
        ));
    }
}
