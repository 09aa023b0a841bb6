//! Worker process configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// What the worker process drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// Robotic arm endpoint.
    #[default]
    Arm,
    /// Serial device endpoint.
    Serial,
    /// Workflow service: runs workflow definitions dropped into its inbox.
    Workflow,
}

/// Settings for a worker loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub kind: WorkerKind,
    /// Target name this worker serves (used in logs and request decoding).
    pub target: String,
    pub inbox: PathBuf,
    pub outbox: PathBuf,
    /// Inbox scan interval. Default: 200ms.
    pub scan_interval_ms: u64,
    /// Socket address for the HTTP endpoint. None = file queue only.
    pub listen: Option<String>,
    /// Base directory for resolving relative upload paths.
    pub base_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            kind: WorkerKind::Arm,
            target: "arm".to_string(),
            inbox: PathBuf::from("./inbox"),
            outbox: PathBuf::from("./outbox"),
            scan_interval_ms: 200,
            listen: None,
            base_dir: PathBuf::from("."),
        }
    }
}

impl WorkerConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms.max(1))
    }
}
