// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Kernel substrate for the CSL camera hardware layer.
//!
//! This crate is the seam between the session and device lifecycle manager
//! and the camera kernel drivers:
//!
//! - [`handle`]: session, device and link handles with their slot indices
//! - [`device_type`]: group-id classification and per-type ordering facts
//! - [`kernel`]: the [`Kernel`] trait and its request/event vocabulary
//! - [`ops`]: per-type [`DeviceOps`] strategies and their factory
//! - [`sim`]: [`SimKernel`], an in-process kernel with spies

pub mod device_type;
pub mod handle;
pub mod kernel;
pub mod ops;
pub mod sim;

pub use device_type::{DeviceAttribute, DeviceType, OperationMode, Version};
pub use handle::{DeviceHandle, LinkHandle, MAX_HANDLES, PacketHandle, SessionHandle};
pub use kernel::{
    Capabilities, ControlOp, ControlReply, DeactivateMode, DeviceFlush, DeviceResource,
    ErrorEvent, EventKind, FrameEvent, Kernel, KernelEvent, LinkOp, MediaEntity, PlatformInfo,
    SessionFlush, SyncMode,
};
pub use ops::{DeviceContext, DeviceOps, OpsCapabilities, open_with_retry, ops_for};
pub use sim::{FailureRule, SimCall, SimKernel};
