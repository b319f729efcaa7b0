// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Camera device taxonomy
//!
//! Maps kernel media-entity group ids to device types, and carries the
//! fixed per-type facts the lifecycle manager sequences on: whether the
//! device takes part in the per-frame realtime pipeline, and where it sits
//! in the activation and deactivation order.
//!
//! ```text
//!   activation (ascending key)      deactivation (ascending key)
//!   ┌──────────────────────┐        ┌──────────────────────┐
//!   │ -1 custom            │        │ -1 custom, actuator  │
//!   │  1 IFE VFE CSID ISPIF│        │  1 IFE VFE CSID ISPIF│
//!   │  2 CSIPHY            │        │  2 sensor, companion │
//!   │  3 sensor, companion,│        │  3 CSIPHY, flash     │
//!   │    flash, actuator   │        │                      │
//!   └──────────────────────┘        └──────────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Kernel Group Ids
// ============================================================================

/// Base of the camera media-entity function range.
pub const GROUP_ID_BASE: u32 = 0x0001_0000;

/// Kernel group ids reported by media-entity enumeration.
pub mod group_id {
    use super::GROUP_ID_BASE;

    pub const VNODE: u32 = GROUP_ID_BASE;
    pub const SENSOR: u32 = GROUP_ID_BASE + 1;
    pub const IFE: u32 = GROUP_ID_BASE + 2;
    pub const ICP: u32 = GROUP_ID_BASE + 3;
    pub const LRME: u32 = GROUP_ID_BASE + 4;
    pub const JPEG: u32 = GROUP_ID_BASE + 5;
    pub const FD: u32 = GROUP_ID_BASE + 6;
    pub const CPAS: u32 = GROUP_ID_BASE + 7;
    pub const CSIPHY: u32 = GROUP_ID_BASE + 8;
    pub const ACTUATOR: u32 = GROUP_ID_BASE + 9;
    pub const CCI: u32 = GROUP_ID_BASE + 10;
    pub const FLASH: u32 = GROUP_ID_BASE + 11;
    pub const EEPROM: u32 = GROUP_ID_BASE + 12;
    pub const OIS: u32 = GROUP_ID_BASE + 13;
    pub const CUSTOM: u32 = GROUP_ID_BASE + 14;
}

// ============================================================================
// Device Type
// ============================================================================

/// Type of a KMD device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    ImageSensor,
    LensActuator,
    Companion,
    Eeprom,
    Csiphy,
    Ois,
    Flash,
    Fd,
    Jpege,
    Jpegd,
    Vfe,
    Cpp,
    Csid,
    Ispif,
    Ife,
    Icp,
    Lrme,
    Custom,
    /// Private request-manager video node.
    RequestManager,
    /// Private camera power and bandwidth controller.
    CpasTop,
}

impl DeviceType {
    /// Classify a kernel group id. `None` for groups the layer ignores.
    pub fn from_group_id(group: u32) -> Option<Self> {
        let device_type = match group {
            group_id::FD => Self::Fd,
            group_id::LRME => Self::Lrme,
            group_id::IFE => Self::Ife,
            group_id::JPEG => Self::Jpege,
            group_id::ICP => Self::Icp,
            group_id::VNODE => Self::RequestManager,
            group_id::CPAS => Self::CpasTop,
            group_id::SENSOR => Self::ImageSensor,
            group_id::CSIPHY => Self::Csiphy,
            group_id::ACTUATOR => Self::LensActuator,
            group_id::EEPROM => Self::Eeprom,
            group_id::FLASH => Self::Flash,
            group_id::OIS => Self::Ois,
            group_id::CUSTOM => Self::Custom,
            _ => return None,
        };
        Some(device_type)
    }

    /// Devices owned by the instance itself rather than by sessions.
    pub fn is_private(self) -> bool {
        matches!(self, Self::RequestManager | Self::CpasTop)
    }

    /// Whether the group id names a private device.
    pub fn is_private_group(group: u32) -> bool {
        matches!(group, group_id::VNODE | group_id::CPAS)
    }

    /// Default realtime classification before device attributes apply.
    pub fn is_realtime(self) -> bool {
        matches!(
            self,
            Self::ImageSensor
                | Self::Companion
                | Self::Csiphy
                | Self::Vfe
                | Self::Csid
                | Self::Ispif
                | Self::Ife
                | Self::Flash
                | Self::LensActuator
                | Self::Custom
        )
    }

    /// Stream-on order key. Lower keys start first.
    pub fn activation_order(self) -> i32 {
        match self {
            Self::Vfe | Self::Csid | Self::Ispif | Self::Ife => 1,
            Self::Csiphy => 2,
            Self::ImageSensor | Self::Companion | Self::Flash | Self::LensActuator => 3,
            _ => -1,
        }
    }

    /// Stream-off order key. Lower keys stop first.
    pub fn deactivation_order(self) -> i32 {
        match self {
            Self::Vfe | Self::Csid | Self::Ispif | Self::Ife => 1,
            Self::ImageSensor | Self::Companion => 2,
            Self::Csiphy | Self::Flash => 3,
            _ => -1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ImageSensor => "ImageSensor",
            Self::LensActuator => "LensActuator",
            Self::Companion => "Companion",
            Self::Eeprom => "EEPROM",
            Self::Csiphy => "CSIPHY",
            Self::Ois => "OIS",
            Self::Flash => "Flash",
            Self::Fd => "FD",
            Self::Jpege => "JPEGE",
            Self::Jpegd => "JPEGD",
            Self::Vfe => "VFE",
            Self::Cpp => "CPP",
            Self::Csid => "CSID",
            Self::Ispif => "ISPIF",
            Self::Ife => "IFE",
            Self::Icp => "ICP",
            Self::Lrme => "LRME",
            Self::Custom => "Custom",
            Self::RequestManager => "RequestManager",
            Self::CpasTop => "CPAS_TOP",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether an acquired device joins the realtime or non-realtime list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationMode {
    Realtime,
    NonRealtime,
}

/// Attribute passed at acquire time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceAttribute {
    RealtimeOperation,
    NonRealtimeOperation,
}

impl OperationMode {
    /// Resolve the mode of a device from its type and acquire attributes.
    /// Later attributes override earlier ones.
    pub fn resolve(device_type: DeviceType, attributes: &[DeviceAttribute]) -> Self {
        let default = if device_type.is_realtime() {
            Self::Realtime
        } else {
            Self::NonRealtime
        };
        attributes.iter().fold(default, |_, attribute| match attribute {
            DeviceAttribute::RealtimeOperation => Self::Realtime,
            DeviceAttribute::NonRealtimeOperation => Self::NonRealtime,
        })
    }
}

/// Version triple reported by drivers and hardware.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_id_mapping() {
        assert_eq!(DeviceType::from_group_id(group_id::IFE), Some(DeviceType::Ife));
        assert_eq!(DeviceType::from_group_id(group_id::VNODE), Some(DeviceType::RequestManager));
        assert_eq!(DeviceType::from_group_id(group_id::CCI), None);
        assert_eq!(DeviceType::from_group_id(0), None);
    }

    #[test]
    fn test_private_groups() {
        assert!(DeviceType::is_private_group(group_id::CPAS));
        assert!(!DeviceType::is_private_group(group_id::SENSOR));
        assert!(DeviceType::CpasTop.is_private());
    }

    #[test]
    fn test_csiphy_starts_after_isp_and_before_sensor() {
        let ife = DeviceType::Ife.activation_order();
        let phy = DeviceType::Csiphy.activation_order();
        let sensor = DeviceType::ImageSensor.activation_order();
        assert!(ife < phy && phy < sensor);
    }

    #[test]
    fn test_deactivation_keys() {
        assert_eq!(DeviceType::Ife.deactivation_order(), 1);
        assert_eq!(DeviceType::ImageSensor.deactivation_order(), 2);
        assert_eq!(DeviceType::Csiphy.deactivation_order(), 3);
        assert_eq!(DeviceType::LensActuator.deactivation_order(), -1);
    }

    #[test]
    fn test_operation_mode_attributes_override() {
        assert_eq!(OperationMode::resolve(DeviceType::Icp, &[]), OperationMode::NonRealtime);
        assert_eq!(
            OperationMode::resolve(DeviceType::Icp, &[DeviceAttribute::RealtimeOperation]),
            OperationMode::Realtime
        );
        assert_eq!(
            OperationMode::resolve(DeviceType::Ife, &[DeviceAttribute::NonRealtimeOperation]),
            OperationMode::NonRealtime
        );
    }
}
