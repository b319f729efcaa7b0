// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Messages delivered to registered handlers.

use std::sync::Arc;

use kmd::{DeviceHandle, ErrorEvent, FrameEvent, LinkHandle};
use serde::Serialize;

/// Clock domain of a frame timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TimestampType {
    /// Boot-time monotonic clock.
    Mono,
    /// Hardware timer.
    Qtimer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FrameMessage {
    pub request_id: u64,
    pub frame_count: u64,
    pub timestamp: u64,
    pub timestamp_type: TimestampType,
    pub link: LinkHandle,
    /// Whether the pipeline should act on this frame notification.
    pub notify: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorMessage {
    pub error_type: u32,
    pub request_id: u64,
    pub device: DeviceHandle,
    pub resource_index: u32,
}

/// A normalized kernel notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CslMessage {
    Frame(FrameMessage),
    Error(ErrorMessage),
}

impl CslMessage {
    pub(crate) fn boot_frame(event: &FrameEvent) -> Self {
        CslMessage::Frame(FrameMessage {
            request_id: event.request_id,
            frame_count: event.frame_id,
            timestamp: event.timestamp,
            timestamp_type: TimestampType::Mono,
            link: event.link,
            notify: true,
        })
    }

    pub(crate) fn frame(event: &FrameEvent) -> Self {
        CslMessage::Frame(FrameMessage {
            request_id: event.request_id,
            frame_count: event.frame_id,
            timestamp: event.timestamp,
            timestamp_type: TimestampType::Qtimer,
            link: event.link,
            notify: false,
        })
    }

    pub(crate) fn error(event: &ErrorEvent) -> Self {
        CslMessage::Error(ErrorMessage {
            error_type: event.error_type,
            request_id: event.request_id,
            device: event.device,
            resource_index: event.resource_index,
        })
    }

    pub fn request_id(&self) -> u64 {
        match self {
            CslMessage::Frame(frame) => frame.request_id,
            CslMessage::Error(error) => error.request_id,
        }
    }
}

/// Link-scoped handler. Runs on the event dispatch thread.
pub type MessageHandler = Arc<dyn Fn(&CslMessage) + Send + Sync>;

/// Session-scoped fallback handler for errors no link handler claimed.
pub type SessionMessageHandler = Arc<dyn Fn(&CslMessage) + Send + Sync>;
