//! Completion tracking for long-running device actions.
//!
//! ```text
//! INIT -> PREWAIT -> POLLING -> DONE
//!                            \-> TIMEOUT
//! ```
//!
//! A wait never reports DONE before at least one sample showed the action
//! busy. A sample taken before the action visibly starts looks exactly like
//! one taken after it finished.
//!
//! Probes are tried in rank order each tick. A probe whose call answers
//! "unsupported" is disabled for the lifetime of the tracker; transient
//! failures are retried on the next tick.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{AuxBitsConfig, TrackerConfig};
use crate::message::Payload;
use crate::telemetry::{
    bounded, Activity, Capability, Observation, Probe, ProgramState, TelemetryError,
    TelemetrySource,
};

// ============================================================================
// Capability table
// ============================================================================

/// What is known about one telemetry call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapabilityStatus {
    #[default]
    Unknown,
    Supported,
    Unsupported,
}

/// Discovered support per capability. Unsupported is sticky.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    statuses: HashMap<Capability, CapabilityStatus>,
}

impl CapabilityTable {
    pub fn status(&self, capability: Capability) -> CapabilityStatus {
        self.statuses.get(&capability).copied().unwrap_or_default()
    }

    pub fn is_unsupported(&self, capability: Capability) -> bool {
        self.status(capability) == CapabilityStatus::Unsupported
    }

    /// True unless one of the probe's calls is known unsupported.
    pub fn allows(&self, probe: Probe) -> bool {
        probe
            .capabilities()
            .iter()
            .all(|capability| !self.is_unsupported(*capability))
    }

    pub fn mark_supported(&mut self, capability: Capability) {
        let status = self.statuses.entry(capability).or_default();
        if *status != CapabilityStatus::Unsupported {
            *status = CapabilityStatus::Supported;
        }
    }

    pub fn mark_unsupported(&mut self, capability: Capability) {
        self.statuses
            .insert(capability, CapabilityStatus::Unsupported);
    }
}

// ============================================================================
// Wait outcome
// ============================================================================

/// Tracker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Prewait,
    Polling,
    Done,
    Timeout,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Prewait => "prewait",
            Self::Polling => "polling",
            Self::Done => "done",
            Self::Timeout => "timeout",
        }
    }
}

/// State of the auxiliary digital-output witness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxStatus {
    /// No busy/done bits configured.
    NotConfigured,
    /// Bits configured but the controller cannot report outputs.
    Unavailable,
    /// Outputs do not yet confirm completion.
    Pending,
    Confirmed,
}

impl AuxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotConfigured => "not_configured",
            Self::Unavailable => "unavailable",
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
        }
    }

    /// Whether this status lets a primary completion stand.
    fn accepts(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Progress of one wait, updated every sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionState {
    pub seen_busy: bool,
    pub motion_done: Option<bool>,
    pub queue_length: Option<u32>,
    pub program_state: Option<ProgramState>,
    pub last_strategy: Option<Probe>,
    pub elapsed: Duration,
}

impl CompletionState {
    fn record(&mut self, observation: &Observation) {
        self.last_strategy = Some(observation.probe);
        self.motion_done = observation.motion_done.or(self.motion_done);
        self.queue_length = observation.queue_length.or(self.queue_length);
        self.program_state = observation.program_state.or(self.program_state);
    }
}

/// Terminal result of a wait.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub phase: Phase,
    pub state: CompletionState,
    /// Ticks taken, including ticks that yielded no observation.
    pub samples: u32,
    pub aux: AuxStatus,
}

impl Completion {
    pub fn completed(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Summary for response envelopes.
    pub fn to_extra(&self) -> Payload {
        let mut extra = Payload::new();
        extra.insert("seen_busy".into(), Value::Bool(self.state.seen_busy));
        extra.insert(
            "strategy".into(),
            self.state
                .last_strategy
                .map_or(Value::Null, |probe| json!(probe.as_str())),
        );
        extra.insert("samples".into(), json!(self.samples));
        extra.insert(
            "elapsed_ms".into(),
            json!(self.state.elapsed.as_millis() as u64),
        );
        extra.insert("aux".into(), json!(self.aux.as_str()));
        extra
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Decides when a dispatched action has finished.
///
/// The capability table lives as long as the tracker, so a device worker
/// holding one tracker probes each call at most once per process.
#[derive(Debug, Clone)]
pub struct CompletionTracker {
    prewait: Duration,
    poll_interval: Duration,
    call_timeout: Duration,
    aux: AuxBitsConfig,
    capabilities: CapabilityTable,
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::from_config(&TrackerConfig::default())
    }
}

impl CompletionTracker {
    pub fn new(prewait: Duration, poll_interval: Duration, call_timeout: Duration) -> Self {
        Self {
            prewait,
            poll_interval,
            call_timeout,
            aux: AuxBitsConfig::default(),
            capabilities: CapabilityTable::default(),
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(config.prewait(), config.poll_interval(), config.call_timeout())
            .with_aux_bits(config.aux)
    }

    /// Require digital-output confirmation on the given bits.
    pub fn with_aux_bits(mut self, aux: AuxBitsConfig) -> Self {
        self.aux = aux;
        self
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    /// Forget discovered capabilities so the next wait re-probes them.
    pub fn reset_capabilities(&mut self) {
        self.capabilities = CapabilityTable::default();
    }

    fn aux_configured(&self) -> bool {
        self.aux.busy_bit.is_some() || self.aux.done_bit.is_some()
    }

    /// Wait for the action behind `source` to finish.
    ///
    /// `timeout` of `None` or zero waits indefinitely; the caller's own
    /// budget bounds the wait. Expiry returns [`Phase::Timeout`]; the
    /// physical action is left running.
    pub async fn wait(
        &mut self,
        source: &dyn TelemetrySource,
        timeout: Option<Duration>,
    ) -> Completion {
        let started = Instant::now();
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .and_then(|t| started.checked_add(t));
        let prewait_until = started.checked_add(self.prewait);

        let mut phase = Phase::Init;
        let mut state = CompletionState::default();
        let mut samples = 0u32;
        let mut aux = if self.aux_configured() {
            AuxStatus::Pending
        } else {
            AuxStatus::NotConfigured
        };
        let mut warned_blind = false;

        loop {
            if phase == Phase::Init {
                phase = Phase::Prewait;
            }

            samples += 1;
            let observation = self.sample(source).await;

            match &observation {
                Some(observation) => {
                    state.record(observation);
                    let activity = observation.activity();
                    if activity == Activity::Busy && !state.seen_busy {
                        state.seen_busy = true;
                        debug!(strategy = %observation.probe, samples, "Action started");
                    }

                    if state.seen_busy && activity == Activity::Finished {
                        aux = self.confirm_aux(source, aux).await;
                        if aux.accepts() {
                            phase = Phase::Done;
                        }
                    }
                }
                None if !warned_blind && self.telemetry_unavailable() => {
                    warned_blind = true;
                    warn!("No supported telemetry; waiting for timeout");
                }
                None => {}
            }

            let now = Instant::now();
            state.elapsed = now - started;

            if phase == Phase::Done {
                debug!(
                    samples,
                    elapsed_ms = state.elapsed.as_millis() as u64,
                    aux = aux.as_str(),
                    "Action completed"
                );
                break;
            }

            let prewait_over = prewait_until.map_or(false, |until| now >= until);
            if phase == Phase::Prewait && (state.seen_busy || prewait_over) {
                if !state.seen_busy {
                    debug!(samples, "Start not observed within prewait, polling anyway");
                }
                phase = Phase::Polling;
            }

            if let Some(deadline) = deadline {
                if now >= deadline {
                    phase = Phase::Timeout;
                    break;
                }
                tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            } else {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        Completion {
            phase,
            state,
            samples,
            aux,
        }
    }

    /// True once every strategy has a call known to be unsupported.
    pub fn telemetry_unavailable(&self) -> bool {
        !Probe::RANKED
            .iter()
            .any(|probe| self.capabilities.allows(*probe))
    }

    /// One observation from the best available probe.
    async fn sample(&mut self, source: &dyn TelemetrySource) -> Option<Observation> {
        for probe in Probe::RANKED {
            if !self.capabilities.allows(probe) {
                continue;
            }

            match probe.observe(source, self.call_timeout).await {
                Ok(observation) => {
                    for capability in probe.capabilities() {
                        self.capabilities.mark_supported(*capability);
                    }
                    return Some(observation);
                }
                Err(TelemetryError::Unsupported(capability)) => {
                    warn!(
                        strategy = %probe,
                        %capability,
                        "Telemetry call unsupported, disabling"
                    );
                    self.capabilities.mark_unsupported(capability);
                }
                Err(e) => {
                    debug!(strategy = %probe, error = %e, "Telemetry sample failed, retrying next tick");
                    return None;
                }
            }
        }
        None
    }

    /// Check the digital-output witness once primary telemetry says done.
    async fn confirm_aux(&mut self, source: &dyn TelemetrySource, current: AuxStatus) -> AuxStatus {
        if matches!(current, AuxStatus::NotConfigured | AuxStatus::Unavailable) {
            return current;
        }
        if self.capabilities.is_unsupported(Capability::DigitalOutputs) {
            return AuxStatus::Unavailable;
        }

        match bounded(self.call_timeout, source.digital_outputs()).await {
            Ok(outputs) => {
                self.capabilities.mark_supported(Capability::DigitalOutputs);
                let done = self.aux.done_bit.map_or(true, |bit| outputs.bit(bit));
                let idle = self.aux.busy_bit.map_or(true, |bit| !outputs.bit(bit));
                if done && idle {
                    AuxStatus::Confirmed
                } else {
                    debug!(bits = outputs.bits(), "Digital outputs do not confirm completion yet");
                    AuxStatus::Pending
                }
            }
            Err(TelemetryError::Unsupported(_)) => {
                warn!("Digital outputs unsupported, completing without auxiliary confirmation");
                self.capabilities
                    .mark_unsupported(Capability::DigitalOutputs);
                AuxStatus::Unavailable
            }
            Err(e) => {
                debug!(error = %e, "Digital output read failed, retrying next tick");
                AuxStatus::Pending
            }
        }
    }
}
