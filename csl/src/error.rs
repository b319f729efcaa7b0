// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io;

use thiserror::Error;

/// Errors returned by the lifecycle manager.
#[derive(Debug, Error)]
pub enum CslError {
    /// A caller-supplied argument was rejected before any side effect.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A handle index lies outside its table.
    #[error("Handle index {index} out of bounds (limit {limit})")]
    OutOfBounds { index: usize, limit: usize },

    /// The request was rejected by the session's flush window.
    ///
    /// Expected while a flush is in progress; callers retry or drop the
    /// request.
    #[error("Request cancelled by flush")]
    CancelledRequest,

    /// A bounded table is full, or there is nothing to act on.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An operation failed without a more specific cause.
    #[error("Operation failed: {0}")]
    Failed(String),

    /// The object is not in a state that allows the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Enumeration ran past the last device.
    #[error("No more devices")]
    NoMore,

    /// Shared state is corrupted; returned instead of aborting when aborts
    /// are disabled.
    #[error("Fatal: {0}")]
    Fatal(String),

    /// The kernel rejected a request.
    #[error("Kernel request failed: {0}")]
    Kernel(#[source] io::Error),
}

impl From<io::Error> for CslError {
    fn from(e: io::Error) -> Self {
        if e.raw_os_error() == Some(libc::EBADR) {
            CslError::CancelledRequest
        } else {
            CslError::Kernel(e)
        }
    }
}

impl CslError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CslError::CancelledRequest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ebadr_maps_to_cancelled() {
        let err = CslError::from(io::Error::from_raw_os_error(libc::EBADR));
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_other_errno_is_kernel_error() {
        let err = CslError::from(io::Error::from_raw_os_error(libc::EIO));
        assert!(matches!(err, CslError::Kernel(_)));
    }
}
