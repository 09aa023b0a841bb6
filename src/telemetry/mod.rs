//! Device status queries and their normalized form.
//!
//! A [`TelemetrySource`] exposes whichever raw status calls a controller
//! implements. Every call defaults to [`TelemetryError::Unsupported`], so an
//! adapter only overrides what its device answers. [`Probe`] strategies turn
//! raw answers into one [`Observation`] shape; the completion tracker never
//! looks at raw answers.

pub mod mock;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;

pub use mock::ScriptedTelemetry;

/// Result type for telemetry calls.
pub type Result<T> = std::result::Result<T, TelemetryError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TelemetryError {
    /// The controller does not implement this call. Permanent.
    #[error("capability not supported: {0}")]
    Unsupported(Capability),

    /// The call failed this time (vendor error code, dropped link).
    #[error("transient telemetry failure: {0}")]
    Transient(String),

    /// The call did not return within its bound.
    #[error("telemetry call exceeded {0:?}")]
    CallTimeout(Duration),
}

impl TelemetryError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

// ============================================================================
// Capabilities and raw shapes
// ============================================================================

/// Individual status calls a controller may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Combined real-time status packet.
    StatusPacket,
    /// Discrete motion-done flag.
    MotionDone,
    /// Discrete motion queue length.
    QueueLength,
    /// Coarse program run state.
    ProgramState,
    /// Digital-output bitmask.
    DigitalOutputs,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Self::StatusPacket,
        Self::MotionDone,
        Self::QueueLength,
        Self::ProgramState,
        Self::DigitalOutputs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusPacket => "status_packet",
            Self::MotionDone => "motion_done",
            Self::QueueLength => "queue_length",
            Self::ProgramState => "program_state",
            Self::DigitalOutputs => "digital_outputs",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown capability '{s}'"))
    }
}

/// Program run state. Vendor codes: 1 stopped, 2 running, 3 paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramState {
    Idle,
    Running,
    Paused,
}

impl ProgramState {
    /// Map a vendor code. Unknown codes read as running so they never
    /// complete a wait.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 | 1 => Self::Idle,
            3 => Self::Paused,
            _ => Self::Running,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Combined status query answer.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusPacket {
    pub motion_done: bool,
    pub queue_length: u32,
    pub program_state: Option<ProgramState>,
    /// Raw vendor motion state, carried for logs only.
    pub robot_state: Option<i64>,
}

/// Digital-output bitmask, low byte holds bits 0..=7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DigitalOutputs {
    pub high: u8,
    pub low: u8,
}

impl DigitalOutputs {
    pub fn from_bits(bits: u16) -> Self {
        let [high, low] = bits.to_be_bytes();
        Self { high, low }
    }

    pub fn bits(&self) -> u16 {
        u16::from_be_bytes([self.high, self.low])
    }

    /// Level of bit `index`. Indices past 15 read low.
    pub fn bit(&self, index: u8) -> bool {
        index < 16 && self.bits() & (1 << index) != 0
    }
}

/// Raw status calls of a device endpoint.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn status_packet(&self) -> Result<StatusPacket> {
        Err(TelemetryError::Unsupported(Capability::StatusPacket))
    }

    async fn motion_done(&self) -> Result<bool> {
        Err(TelemetryError::Unsupported(Capability::MotionDone))
    }

    async fn queue_length(&self) -> Result<u32> {
        Err(TelemetryError::Unsupported(Capability::QueueLength))
    }

    async fn program_state(&self) -> Result<ProgramState> {
        Err(TelemetryError::Unsupported(Capability::ProgramState))
    }

    async fn digital_outputs(&self) -> Result<DigitalOutputs> {
        Err(TelemetryError::Unsupported(Capability::DigitalOutputs))
    }
}

// ============================================================================
// Probes
// ============================================================================

/// Completion-detection strategy, ranked by fidelity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Probe {
    StatusPacket,
    MotionQueue,
    ProgramState,
}

impl Probe {
    /// Highest fidelity first.
    pub const RANKED: [Probe; 3] = [Self::StatusPacket, Self::MotionQueue, Self::ProgramState];

    /// Calls this probe makes. All must be available for it to run.
    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            Self::StatusPacket => &[Capability::StatusPacket],
            Self::MotionQueue => &[Capability::MotionDone, Capability::QueueLength],
            Self::ProgramState => &[Capability::ProgramState],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusPacket => "status_packet",
            Self::MotionQueue => "motion_queue",
            Self::ProgramState => "program_state",
        }
    }

    /// Take one sample, bounding each call by `call_timeout`.
    pub async fn observe(
        &self,
        source: &dyn TelemetrySource,
        call_timeout: Duration,
    ) -> Result<Observation> {
        let observation = match self {
            Self::StatusPacket => {
                let packet = bounded(call_timeout, source.status_packet()).await?;
                Observation {
                    probe: *self,
                    motion_done: Some(packet.motion_done),
                    queue_length: Some(packet.queue_length),
                    program_state: packet.program_state,
                }
            }
            Self::MotionQueue => {
                let motion_done = bounded(call_timeout, source.motion_done()).await?;
                let queue_length = bounded(call_timeout, source.queue_length()).await?;
                Observation {
                    probe: *self,
                    motion_done: Some(motion_done),
                    queue_length: Some(queue_length),
                    program_state: None,
                }
            }
            Self::ProgramState => Observation {
                probe: *self,
                motion_done: None,
                queue_length: None,
                program_state: Some(bounded(call_timeout, source.program_state()).await?),
            },
        };
        Ok(observation)
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run a telemetry call with an upper bound.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| TelemetryError::CallTimeout(limit))?
}

/// What a sample says about the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Busy,
    Finished,
}

/// One normalized telemetry sample. Indicators a probe does not read are
/// `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub probe: Probe,
    pub motion_done: Option<bool>,
    pub queue_length: Option<u32>,
    pub program_state: Option<ProgramState>,
}

impl Observation {
    /// Finished only when every indicator present says so.
    pub fn activity(&self) -> Activity {
        let motion_idle = self.motion_done.unwrap_or(true);
        let queue_empty = self.queue_length.map_or(true, |n| n == 0);
        let program_idle = self.program_state.map_or(true, |s| s.is_idle());

        if motion_idle && queue_empty && program_idle {
            Activity::Finished
        } else {
            Activity::Busy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ProgramOnly(ProgramState);

    #[async_trait]
    impl TelemetrySource for ProgramOnly {
        async fn program_state(&self) -> Result<ProgramState> {
            Ok(self.0)
        }
    }

    struct Stalled;

    #[async_trait]
    impl TelemetrySource for Stalled {
        async fn status_packet(&self) -> Result<StatusPacket> {
            std::future::pending().await
        }
    }

    #[test]
    fn test_capability_names_roundtrip() {
        for capability in Capability::ALL {
            assert_eq!(capability.as_str().parse::<Capability>(), Ok(capability));
        }
        assert!("teleport".parse::<Capability>().is_err());
    }

    #[test]
    fn test_program_state_codes() {
        assert_eq!(ProgramState::from_code(1), ProgramState::Idle);
        assert_eq!(ProgramState::from_code(2), ProgramState::Running);
        assert_eq!(ProgramState::from_code(3), ProgramState::Paused);
        assert_eq!(ProgramState::from_code(99), ProgramState::Running);
    }

    #[test]
    fn test_digital_output_bits() {
        let outputs = DigitalOutputs { high: 0b0000_0001, low: 0b1000_0100 };
        assert!(outputs.bit(2));
        assert!(outputs.bit(7));
        assert!(outputs.bit(8));
        assert!(!outputs.bit(0));
        assert!(!outputs.bit(16));
        assert_eq!(DigitalOutputs::from_bits(outputs.bits()), outputs);
    }

    #[test]
    fn test_activity_requires_all_indicators() {
        let mut observation = Observation {
            probe: Probe::StatusPacket,
            motion_done: Some(true),
            queue_length: Some(0),
            program_state: Some(ProgramState::Idle),
        };
        assert_eq!(observation.activity(), Activity::Finished);

        observation.queue_length = Some(2);
        assert_eq!(observation.activity(), Activity::Busy);

        observation.queue_length = Some(0);
        observation.program_state = Some(ProgramState::Paused);
        assert_eq!(observation.activity(), Activity::Busy);
    }

    #[tokio::test]
    async fn test_default_calls_are_unsupported() {
        let source = ProgramOnly(ProgramState::Running);
        let err = Probe::StatusPacket
            .observe(&source, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, TelemetryError::Unsupported(Capability::StatusPacket));

        let observation = Probe::ProgramState
            .observe(&source, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(observation.activity(), Activity::Busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_call_is_bounded() {
        let err = Probe::StatusPacket
            .observe(&Stalled, Duration::from_millis(250))
            .await
            .unwrap_err();
        assert_eq!(err, TelemetryError::CallTimeout(Duration::from_millis(250)));
    }
}
