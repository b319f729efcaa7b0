// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle manager configuration

use std::fs;
use std::path::Path;
use std::time::Duration;

use kmd::MAX_HANDLES;
use serde::{Deserialize, Serialize};

use crate::{CslError, Result};

/// Retry policy for opening device nodes that are still being torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenRetryConfig {
    pub max_attempts: u32,
    /// Sleep between attempts, in microseconds.
    pub sleep_us: u64,
}

impl Default for OpenRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            sleep_us: 100_000,
        }
    }
}

impl OpenRetryConfig {
    pub fn sleep(&self) -> Duration {
        Duration::from_micros(self.sleep_us)
    }
}

/// Lifecycle manager configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CslConfig {
    /// Sessions open at once.
    pub max_sessions: usize,
    /// Live links in one session.
    pub max_links_per_session: usize,
    /// Devices acquired by one session at once.
    pub max_acquired_devices: usize,
    pub max_kmd_devices: usize,
    pub open_retry: OpenRetryConfig,
    /// Abort the process on corrupted shared state instead of returning
    /// [`CslError::Fatal`].
    pub abort_on_fatal: bool,
    /// Abort the process when hardware acquisition fails.
    pub abort_on_critical_failure: bool,
    /// Orphaned devices tolerated at session close before it is fatal.
    pub orphan_tolerance: usize,
}

impl Default for CslConfig {
    fn default() -> Self {
        Self {
            max_sessions: MAX_HANDLES,
            max_links_per_session: MAX_HANDLES,
            max_acquired_devices: MAX_HANDLES,
            max_kmd_devices: MAX_HANDLES,
            open_retry: OpenRetryConfig::default(),
            abort_on_fatal: true,
            abort_on_critical_failure: false,
            orphan_tolerance: 1,
        }
    }
}

impl CslConfig {
    /// Configuration for debugging builds: critical failures abort.
    pub fn debug() -> Self {
        Self {
            abort_on_critical_failure: true,
            ..Default::default()
        }
    }

    /// Configuration for tests: nothing aborts and retries are fast.
    pub fn for_testing() -> Self {
        Self {
            open_retry: OpenRetryConfig {
                max_attempts: 5,
                sleep_us: 1_000,
            },
            abort_on_fatal: false,
            abort_on_critical_failure: false,
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CslError::InvalidArgument(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| {
            CslError::InvalidArgument(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Limits are bounded by the handle index width.
    pub fn validate(&self) -> Result<()> {
        let tables = [
            ("max_sessions", self.max_sessions),
            ("max_links_per_session", self.max_links_per_session),
            ("max_acquired_devices", self.max_acquired_devices),
            ("max_kmd_devices", self.max_kmd_devices),
        ];
        for (name, value) in tables {
            if value == 0 || value > MAX_HANDLES {
                return Err(CslError::InvalidArgument(format!(
                    "{name} must be in 1..={MAX_HANDLES}, got {value}"
                )));
            }
        }
        if self.open_retry.max_attempts == 0 {
            return Err(CslError::InvalidArgument(
                "open_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CslConfig::default();
        assert_eq!(config.max_sessions, 256);
        assert_eq!(config.open_retry.max_attempts, 5);
        assert_eq!(config.open_retry.sleep(), Duration::from_millis(100));
        assert_eq!(config.orphan_tolerance, 1);
        assert!(config.abort_on_fatal);
        assert!(!config.abort_on_critical_failure);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CslConfig::from_json(r#"{"max_links_per_session": 8}"#).unwrap();
        assert_eq!(config.max_links_per_session, 8);
        assert_eq!(config.max_sessions, 256);
    }

    #[test]
    fn test_oversized_table_rejected() {
        let err = CslConfig::from_json(r#"{"max_sessions": 1024}"#).unwrap_err();
        assert!(matches!(err, CslError::InvalidArgument(_)));
    }
}
