// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Camera hardware session and device lifecycle manager
//!
//! A user-space layer between camera pipeline clients and the camera kernel
//! drivers. It enumerates the kernel devices once, hands out sessions, and
//! inside each session tracks acquired devices, realtime links, request
//! scheduling, flush windows and the routing of kernel notifications to
//! registered handlers.
//!
//! ```text
//!        clients (any thread)
//!   open / acquire / link / stream_on / open_request / submit / flush
//!                         │
//!                         ▼
//!   ┌────────────────────────────────────────────┐
//!   │ Csl                                        │
//!   │   SessionTable ── Session ── AcquiredDevice│
//!   │   DeviceRegistry ── KmdDevice ── DeviceOps │
//!   │   request manager, CPAS                    │
//!   └──────────────┬───────────────────▲─────────┘
//!                  │ ControlOp         │ KernelEvent
//!                  ▼                   │
//!              kmd::Kernel ──► EventDispatcher ("csl_poll")
//! ```
//!
//! Every object carries a [`RefGuard`]; teardown waits for in-flight users.

mod config;
mod dispatch;
mod error;
mod guard;
mod instance;
mod message;
mod registry;
mod request;
mod session;
mod stream;

pub use config::{CslConfig, OpenRetryConfig};
pub use dispatch::{EventDispatcher, EventRouter, PollControl};
pub use error::CslError;
pub use guard::{GuardKind, LifecycleState, RefGuard, RefHold};
pub use instance::Csl;
pub use message::{
    CslMessage, ErrorMessage, FrameMessage, MessageHandler, SessionMessageHandler, TimestampType,
};
pub use registry::{DeviceDescriptor, DeviceRegistry, KmdDevice};
pub use request::{FlushInfo, FlushType};
pub use session::{AcquiredDeviceInfo, LinkInfo, SessionInfo};

pub type Result<T> = std::result::Result<T, CslError>;
