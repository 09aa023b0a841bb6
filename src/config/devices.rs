//! Device endpoint configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::message::wait_from_secs;

// ============================================================================
// Arm
// ============================================================================

/// Arm endpoint settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArmConfig {
    /// Controller-side directory programs are loaded from. Default: "/fruser".
    pub program_dir: String,
    /// Completion wait when a run request sets no timeout. Default: 8s.
    pub default_wait_secs: f64,
    /// Local directory searched first for bare upload file names.
    pub scripts_dir: String,
    /// Local directory searched second for bare upload file names.
    pub point_table_dir: String,
    /// Pause between a point table upload and its activation. Default: 500ms.
    pub activation_delay_ms: u64,
    pub tracker: TrackerConfig,
    pub simulation: SimulationConfig,
}

impl Default for ArmConfig {
    fn default() -> Self {
        Self {
            program_dir: "/fruser".to_string(),
            default_wait_secs: 8.0,
            scripts_dir: "lua_scripts".to_string(),
            point_table_dir: "TechPoint_db".to_string(),
            activation_delay_ms: 500,
            tracker: TrackerConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl ArmConfig {
    pub fn default_wait(&self) -> Duration {
        wait_from_secs(self.default_wait_secs).unwrap_or_default()
    }

    pub fn activation_delay(&self) -> Duration {
        Duration::from_millis(self.activation_delay_ms)
    }
}

/// Completion tracker timings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Upper bound on start detection. Default: 500ms.
    pub prewait_ms: u64,
    /// Interval between telemetry samples. Default: 100ms.
    pub poll_interval_ms: u64,
    /// Upper bound on a single telemetry call. Default: 1000ms.
    pub call_timeout_ms: u64,
    /// Digital-output confirmation bits.
    pub aux: AuxBitsConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            prewait_ms: 500,
            poll_interval_ms: 100,
            call_timeout_ms: 1000,
            aux: AuxBitsConfig::default(),
        }
    }
}

impl TrackerConfig {
    pub fn prewait(&self) -> Duration {
        Duration::from_millis(self.prewait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.max(1))
    }
}

/// Bit indices (0..=15, low byte first) of the busy/done digital outputs.
/// Unset bits disable the auxiliary confirmation.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct AuxBitsConfig {
    pub busy_bit: Option<u8>,
    pub done_bit: Option<u8>,
}

/// Simulated arm used when no vendor binding is linked in.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// How long a simulated program runs. Default: 1500ms.
    pub run_duration_ms: u64,
    /// Telemetry calls the simulated controller answers. Others report
    /// "unsupported". Names: status_packet, motion_done, queue_length,
    /// program_state, digital_outputs.
    pub capabilities: Vec<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            run_duration_ms: 1500,
            capabilities: vec![
                "motion_done".to_string(),
                "queue_length".to_string(),
                "program_state".to_string(),
            ],
        }
    }
}

impl SimulationConfig {
    pub fn run_duration(&self) -> Duration {
        Duration::from_millis(self.run_duration_ms)
    }
}

// ============================================================================
// Serial
// ============================================================================

/// Serial endpoint settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Baud rate when neither request nor device table sets one.
    pub default_baud: u32,
    /// Read timeout for opened ports. Default: 1s.
    pub default_timeout_secs: f64,
    /// Named devices (e.g. "IceMake") and their ports.
    pub devices: BTreeMap<String, SerialDeviceConfig>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            default_baud: 115_200,
            default_timeout_secs: 1.0,
            devices: BTreeMap::new(),
        }
    }
}

impl SerialConfig {
    pub fn default_timeout(&self) -> Duration {
        wait_from_secs(self.default_timeout_secs).unwrap_or_default()
    }
}

/// Port binding for a named serial device.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SerialDeviceConfig {
    pub port: String,
    pub baud: Option<u32>,
}
