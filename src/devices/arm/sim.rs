//! Simulated arm controller.
//!
//! Programs "run" for a fixed duration after `run_program`. Telemetry calls
//! outside the configured capability set answer unsupported, which makes the
//! simulator useful for exercising probe fallback.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ArmLink, POINT_TABLE_ALREADY_ACTIVE};
use crate::config::{AuxBitsConfig, SimulationConfig};
use crate::devices::LinkError;
use crate::telemetry::{
    self, Capability, DigitalOutputs, ProgramState, StatusPacket, TelemetryError,
    TelemetrySource,
};

/// Result code for a run without a loaded program.
const NO_PROGRAM_LOADED: i32 = 2;
/// Result code for switching to a table that was never uploaded.
const UNKNOWN_POINT_TABLE: i32 = 1;

#[derive(Debug, Default)]
struct SimState {
    loaded: Option<String>,
    started: Option<Instant>,
    uploaded: HashSet<String>,
    active_table: Option<String>,
}

/// In-process stand-in for an arm controller.
#[derive(Debug)]
pub struct SimulatedArm {
    run_duration: Duration,
    capabilities: HashSet<Capability>,
    aux: AuxBitsConfig,
    load_code: i32,
    state: Mutex<SimState>,
}

impl SimulatedArm {
    pub fn new(config: &SimulationConfig) -> Self {
        let capabilities = config
            .capabilities
            .iter()
            .filter_map(|name| match name.parse::<Capability>() {
                Ok(capability) => Some(capability),
                Err(e) => {
                    warn!(error = %e, "Ignoring simulated capability");
                    None
                }
            })
            .collect();

        Self {
            run_duration: config.run_duration(),
            capabilities,
            aux: AuxBitsConfig::default(),
            load_code: 0,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Connect to the simulated controller.
    pub async fn connect(config: &SimulationConfig) -> Result<Self, LinkError> {
        Ok(Self::new(config))
    }

    /// Drive these digital outputs while running (busy) and after (done).
    pub fn with_aux_bits(mut self, aux: AuxBitsConfig) -> Self {
        self.aux = aux;
        self
    }

    /// Answer `load_program` with this code.
    pub fn with_load_code(mut self, code: i32) -> Self {
        self.load_code = code;
        self
    }

    pub async fn loaded(&self) -> Option<String> {
        self.state.lock().await.loaded.clone()
    }

    pub async fn active_point_table(&self) -> Option<String> {
        self.state.lock().await.active_table.clone()
    }

    fn require(&self, capability: Capability) -> telemetry::Result<()> {
        if self.capabilities.contains(&capability) {
            Ok(())
        } else {
            Err(TelemetryError::Unsupported(capability))
        }
    }

    /// (ever started, still running)
    async fn run_status(&self) -> (bool, bool) {
        match self.state.lock().await.started {
            Some(started) => (true, started.elapsed() < self.run_duration),
            None => (false, false),
        }
    }

    async fn record_upload(&self, local_path: &Path) -> Result<i32, LinkError> {
        let bytes = tokio::fs::read(local_path).await?;
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| LinkError::InvalidArgument(local_path.display().to_string()))?;
        debug!(file = %name, size = bytes.len(), "Simulated upload");
        self.state.lock().await.uploaded.insert(name);
        Ok(0)
    }
}

#[async_trait]
impl TelemetrySource for SimulatedArm {
    async fn status_packet(&self) -> telemetry::Result<StatusPacket> {
        self.require(Capability::StatusPacket)?;
        let (_, running) = self.run_status().await;
        Ok(StatusPacket {
            motion_done: !running,
            queue_length: u32::from(running),
            program_state: Some(if running {
                ProgramState::Running
            } else {
                ProgramState::Idle
            }),
            robot_state: Some(if running { 2 } else { 1 }),
        })
    }

    async fn motion_done(&self) -> telemetry::Result<bool> {
        self.require(Capability::MotionDone)?;
        Ok(!self.run_status().await.1)
    }

    async fn queue_length(&self) -> telemetry::Result<u32> {
        self.require(Capability::QueueLength)?;
        Ok(u32::from(self.run_status().await.1))
    }

    async fn program_state(&self) -> telemetry::Result<ProgramState> {
        self.require(Capability::ProgramState)?;
        Ok(if self.run_status().await.1 {
            ProgramState::Running
        } else {
            ProgramState::Idle
        })
    }

    async fn digital_outputs(&self) -> telemetry::Result<DigitalOutputs> {
        self.require(Capability::DigitalOutputs)?;
        let (started, running) = self.run_status().await;
        let mut bits = 0u16;
        if let Some(bit) = self.aux.busy_bit.filter(|b| *b < 16) {
            if running {
                bits |= 1 << bit;
            }
        }
        if let Some(bit) = self.aux.done_bit.filter(|b| *b < 16) {
            if started && !running {
                bits |= 1 << bit;
            }
        }
        Ok(DigitalOutputs::from_bits(bits))
    }
}

#[async_trait]
impl ArmLink for SimulatedArm {
    fn telemetry(&self) -> &dyn TelemetrySource {
        self
    }

    async fn load_program(&self, remote_path: &str) -> Result<i32, LinkError> {
        if self.load_code != 0 {
            return Ok(self.load_code);
        }
        let mut state = self.state.lock().await;
        state.loaded = Some(remote_path.to_string());
        state.started = None;
        Ok(0)
    }

    async fn run_program(&self) -> Result<i32, LinkError> {
        let mut state = self.state.lock().await;
        if state.loaded.is_none() {
            return Ok(NO_PROGRAM_LOADED);
        }
        state.started = Some(Instant::now());
        Ok(0)
    }

    async fn upload_program(&self, local_path: &Path) -> Result<i32, LinkError> {
        self.record_upload(local_path).await
    }

    async fn upload_point_table(&self, local_path: &Path, legacy: bool) -> Result<i32, LinkError> {
        debug!(legacy, "Simulated point table upload");
        self.record_upload(local_path).await
    }

    async fn switch_point_table(&self, name: &str) -> Result<i32, LinkError> {
        let mut state = self.state.lock().await;
        if !state.uploaded.contains(name) {
            return Ok(UNKNOWN_POINT_TABLE);
        }
        if state.active_table.as_deref() == Some(name) {
            return Ok(POINT_TABLE_ALREADY_ACTIVE);
        }
        state.active_table = Some(name.to_string());
        Ok(0)
    }
}
