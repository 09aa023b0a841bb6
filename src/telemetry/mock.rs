//! Scripted telemetry source for tests.
//!
//! Each capability replays a script of answers, one per call, repeating the
//! last answer once the script runs out. A capability without a script
//! answers "unsupported".

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    Capability, DigitalOutputs, ProgramState, Result, StatusPacket, TelemetryError,
    TelemetrySource,
};

#[derive(Debug, Clone)]
enum Answer {
    StatusPacket(StatusPacket),
    MotionDone(bool),
    QueueLength(u32),
    ProgramState(ProgramState),
    DigitalOutputs(DigitalOutputs),
}

#[derive(Debug, Default)]
struct Script {
    answers: Vec<Answer>,
    cursor: usize,
    transient_failures: usize,
    calls: usize,
}

impl Script {
    fn next(&mut self, capability: Capability) -> Result<Answer> {
        self.calls += 1;
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(TelemetryError::Transient(format!("scripted {capability} failure")));
        }
        let Some(last) = self.answers.len().checked_sub(1) else {
            return Err(TelemetryError::Unsupported(capability));
        };
        let answer = self.answers[self.cursor.min(last)].clone();
        self.cursor += 1;
        Ok(answer)
    }
}

/// Telemetry source answering from per-capability scripts.
#[derive(Debug, Default)]
pub struct ScriptedTelemetry {
    scripts: Mutex<HashMap<Capability, Script>>,
}

impl ScriptedTelemetry {
    /// A source that supports nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Program state reports running `busy_samples` times, then idle.
    pub fn busy_then_done(busy_samples: usize) -> Self {
        let mut states = vec![ProgramState::Running; busy_samples];
        states.push(ProgramState::Idle);
        Self::new().with_program_states(states)
    }

    pub fn with_status_packets(self, packets: Vec<StatusPacket>) -> Self {
        self.script(
            Capability::StatusPacket,
            packets.into_iter().map(Answer::StatusPacket),
        )
    }

    pub fn with_motion_done(self, values: Vec<bool>) -> Self {
        self.script(
            Capability::MotionDone,
            values.into_iter().map(Answer::MotionDone),
        )
    }

    pub fn with_queue_length(self, values: Vec<u32>) -> Self {
        self.script(
            Capability::QueueLength,
            values.into_iter().map(Answer::QueueLength),
        )
    }

    pub fn with_program_states(self, states: Vec<ProgramState>) -> Self {
        self.script(
            Capability::ProgramState,
            states.into_iter().map(Answer::ProgramState),
        )
    }

    pub fn with_digital_outputs(self, outputs: Vec<DigitalOutputs>) -> Self {
        self.script(
            Capability::DigitalOutputs,
            outputs.into_iter().map(Answer::DigitalOutputs),
        )
    }

    /// The next `count` calls to `capability` fail transiently.
    pub fn with_transient_failures(mut self, capability: Capability, count: usize) -> Self {
        self.scripts
            .get_mut()
            .entry(capability)
            .or_default()
            .transient_failures = count;
        self
    }

    /// Number of calls made to `capability`, including failed ones.
    pub async fn calls(&self, capability: Capability) -> usize {
        self.scripts
            .lock()
            .await
            .get(&capability)
            .map_or(0, |script| script.calls)
    }

    fn script(mut self, capability: Capability, answers: impl Iterator<Item = Answer>) -> Self {
        self.scripts
            .get_mut()
            .entry(capability)
            .or_default()
            .answers
            .extend(answers);
        self
    }

    async fn answer(&self, capability: Capability) -> Result<Answer> {
        self.scripts
            .lock()
            .await
            .entry(capability)
            .or_default()
            .next(capability)
    }
}

fn mismatch(capability: Capability) -> TelemetryError {
    TelemetryError::Transient(format!("scripted answer has wrong shape for {capability}"))
}

#[async_trait]
impl TelemetrySource for ScriptedTelemetry {
    async fn status_packet(&self) -> Result<StatusPacket> {
        match self.answer(Capability::StatusPacket).await? {
            Answer::StatusPacket(packet) => Ok(packet),
            _ => Err(mismatch(Capability::StatusPacket)),
        }
    }

    async fn motion_done(&self) -> Result<bool> {
        match self.answer(Capability::MotionDone).await? {
            Answer::MotionDone(done) => Ok(done),
            _ => Err(mismatch(Capability::MotionDone)),
        }
    }

    async fn queue_length(&self) -> Result<u32> {
        match self.answer(Capability::QueueLength).await? {
            Answer::QueueLength(length) => Ok(length),
            _ => Err(mismatch(Capability::QueueLength)),
        }
    }

    async fn program_state(&self) -> Result<ProgramState> {
        match self.answer(Capability::ProgramState).await? {
            Answer::ProgramState(state) => Ok(state),
            _ => Err(mismatch(Capability::ProgramState)),
        }
    }

    async fn digital_outputs(&self) -> Result<DigitalOutputs> {
        match self.answer(Capability::DigitalOutputs).await? {
            Answer::DigitalOutputs(outputs) => Ok(outputs),
            _ => Err(mismatch(Capability::DigitalOutputs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_replays_then_repeats_last() {
        let source = ScriptedTelemetry::busy_then_done(2);
        let mut states = Vec::new();
        for _ in 0..4 {
            states.push(source.program_state().await.unwrap());
        }
        assert_eq!(
            states,
            vec![
                ProgramState::Running,
                ProgramState::Running,
                ProgramState::Idle,
                ProgramState::Idle
            ]
        );
        assert_eq!(source.calls(Capability::ProgramState).await, 4);
    }

    #[tokio::test]
    async fn test_unscripted_capability_is_unsupported() {
        let source = ScriptedTelemetry::new();
        assert_eq!(
            source.motion_done().await.unwrap_err(),
            TelemetryError::Unsupported(Capability::MotionDone)
        );
        assert_eq!(source.calls(Capability::MotionDone).await, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_come_first() {
        let source = ScriptedTelemetry::new()
            .with_queue_length(vec![0])
            .with_transient_failures(Capability::QueueLength, 1);
        assert!(matches!(
            source.queue_length().await,
            Err(TelemetryError::Transient(_))
        ));
        assert_eq!(source.queue_length().await.unwrap(), 0);
    }
}
