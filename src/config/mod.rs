//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod devices;
mod dispatch;
mod worker;

pub use devices::{
    ArmConfig, AuxBitsConfig, SerialConfig, SerialDeviceConfig, SimulationConfig, TrackerConfig,
};
pub use dispatch::{DispatchConfig, TargetConfig};
pub use worker::{WorkerConfig, WorkerKind};

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::message::Target;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "labcell.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "LABCELL_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "LABCELL";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "LABCELL_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dispatcher defaults.
    pub dispatch: DispatchConfig,
    /// Queue directories and optional URLs per target.
    pub targets: BTreeMap<String, TargetConfig>,
    /// Settings for this process when it runs as a worker.
    pub worker: WorkerConfig,
    /// Arm endpoint settings.
    pub arm: ArmConfig,
    /// Serial endpoint settings.
    pub serial: SerialConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `labcell.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Target table keyed by normalized name.
    pub fn target_table(&self) -> BTreeMap<Target, TargetConfig> {
        self.targets
            .iter()
            .map(|(name, target)| (Target::new(name), target.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.targets.is_empty());
        assert_eq!(
            config.dispatch.default_step_timeout(),
            Duration::from_secs(12)
        );
        assert_eq!(config.worker.scan_interval(), Duration::from_millis(200));
        assert_eq!(config.arm.program_dir, "/fruser");
        assert_eq!(config.serial.default_baud, 115_200);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
dispatch:
  default_step_timeout_secs: 5.5
  poll_interval_ms: 50

targets:
  Arm:
    inbox: /tmp/arm/inbox
    outbox: /tmp/arm/outbox
    url: http://127.0.0.1:8001/command_json
  iot:
    inbox: /tmp/iot/inbox
    outbox: /tmp/iot/outbox

worker:
  kind: serial
  scan_interval_ms: 100
  listen: 127.0.0.1:8002

arm:
  tracker:
    prewait_ms: 250
    aux:
      busy_bit: 3
      done_bit: 4

serial:
  devices:
    IceMake:
      port: /dev/ttyUSB0
      baud: 9600
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(
            config.dispatch.default_step_timeout(),
            Duration::from_millis(5500)
        );
        let targets = config.target_table();
        let arm = &targets[&Target::new("arm")];
        assert_eq!(
            arm.url.as_deref(),
            Some("http://127.0.0.1:8001/command_json")
        );
        assert!(targets[&Target::new("iot")].url.is_none());
        assert_eq!(config.worker.kind, WorkerKind::Serial);
        assert_eq!(config.worker.listen.as_deref(), Some("127.0.0.1:8002"));
        assert_eq!(config.arm.tracker.prewait(), Duration::from_millis(250));
        assert_eq!(config.arm.tracker.aux.busy_bit, Some(3));
        assert_eq!(config.serial.devices["IceMake"].baud, Some(9600));
    }
}
