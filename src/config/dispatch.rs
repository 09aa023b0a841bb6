//! Dispatcher and target configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::message::wait_from_secs;

/// Dispatcher defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Step timeout when a step does not set its own. Default: 12s.
    pub default_step_timeout_secs: f64,
    /// How often the file queue checks for a response. Default: 100ms.
    pub poll_interval_ms: u64,
    /// Connect timeout for the network transport. Default: 500ms.
    pub connect_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: 12.0,
            poll_interval_ms: 100,
            connect_timeout_ms: 500,
        }
    }
}

impl DispatchConfig {
    pub fn default_step_timeout(&self) -> Duration {
        wait_from_secs(self.default_step_timeout_secs).unwrap_or_default()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Where one target's worker reads requests and writes responses.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Directory the worker scans for requests.
    pub inbox: PathBuf,
    /// Directory the worker writes responses to.
    pub outbox: PathBuf,
    /// Optional `POST` URL of the worker's HTTP endpoint. When set, calls try
    /// it first and fall back to the queue directories.
    pub url: Option<String>,
}
