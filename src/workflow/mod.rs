//! Workflow engine.
//!
//! A workflow is an ordered list of steps, each one call against a device
//! target. Steps run strictly in sequence and the first response that is
//! not ok stops the run. The engine never retries; whoever submitted the
//! workflow decides whether to submit it again.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::dispatch::{step_correlation_id, CorrelatedDispatcher};
use crate::error::LabcellError;
use crate::message::{wait_from_secs, Payload, Request, Response, Target, ID_FIELD};
use crate::worker::CommandHandler;

/// Message of a workflow response when every step succeeded.
pub const COMPLETED_MESSAGE: &str = "completed";

// ============================================================================
// Definitions
// ============================================================================

/// Named, ordered sequence of steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Generated when empty.
    #[serde(default)]
    pub id: String,
    /// Defaults to the id when empty.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl WorkflowDefinition {
    /// Parse a definition from JSON.
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice::<Self>(bytes).map(Self::normalized)
    }

    /// Fill in a missing id (UUID v4) and name.
    pub fn normalized(mut self) -> Self {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        if self.name.is_empty() {
            self.name = self.id.clone();
        }
        self
    }
}

/// One call in a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Defaults to the step's 1-based position.
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    #[serde(alias = "system", default)]
    pub target: Target,
    #[serde(alias = "request", default)]
    pub request_body: Payload,
    /// Falls back to the engine's default step timeout.
    #[serde(alias = "timeout", default)]
    pub timeout_seconds: Option<f64>,
}

impl Step {
    pub fn new(id: impl Into<String>, target: impl Into<Target>, request_body: Payload) -> Self {
        Self {
            id: Some(id.into()),
            target: target.into(),
            request_body,
            timeout_seconds: None,
        }
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Id of the step at 1-based `position`.
    pub fn effective_id(&self, position: usize) -> String {
        self.id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| position.to_string())
    }

    fn timeout(&self, default: Duration) -> Duration {
        self.timeout_seconds
            .and_then(wait_from_secs)
            .unwrap_or(default)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// ============================================================================
// Results
// ============================================================================

/// Response recorded for one attempted step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub response: Response,
}

/// Outcome of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub id: String,
    pub name: String,
    pub ok: bool,
    /// 1-based index of the failing step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<usize>,
    /// One entry per attempted step, in order.
    pub results: Vec<StepResult>,
}

impl WorkflowResult {
    /// Response of the failing step, if any.
    pub fn failure(&self) -> Option<&Response> {
        self.failed_at
            .and_then(|index| self.results.get(index - 1))
            .map(|result| &result.response)
    }

    /// Response envelope carrying this result.
    pub fn into_response(self) -> Response {
        let message = if self.ok {
            COMPLETED_MESSAGE.to_string()
        } else {
            self.failure()
                .map(|response| response.message.clone())
                .unwrap_or_else(|| "failed".to_string())
        };

        let mut response = Response::new(self.id, self.ok, message)
            .with_extra("name", self.name);
        if let Some(index) = self.failed_at {
            response = response.with_extra("failed_at", index);
        }
        let results = serde_json::to_value(&self.results).unwrap_or(Value::Array(Vec::new()));
        response.with_extra("results", results)
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Runs workflow definitions through a dispatcher.
#[derive(Clone)]
pub struct WorkflowEngine {
    dispatcher: CorrelatedDispatcher,
    default_step_timeout: Duration,
}

impl WorkflowEngine {
    pub fn new(dispatcher: CorrelatedDispatcher, default_step_timeout: Duration) -> Self {
        Self {
            dispatcher,
            default_step_timeout,
        }
    }

    pub fn dispatcher(&self) -> &CorrelatedDispatcher {
        &self.dispatcher
    }

    /// Run every step in order, stopping at the first failure.
    pub async fn run(&self, definition: &WorkflowDefinition) -> WorkflowResult {
        let definition = definition.clone().normalized();
        let mut results = Vec::with_capacity(definition.steps.len());

        info!(
            workflow_id = %definition.id,
            name = %definition.name,
            steps = definition.steps.len(),
            "Workflow started"
        );

        for (index, step) in definition.steps.iter().enumerate() {
            let position = index + 1;
            let step_id = step.effective_id(position);
            let correlation_id = match step.request_body.get(ID_FIELD) {
                Some(Value::String(id)) if !id.is_empty() => id.clone(),
                _ => step_correlation_id(&definition.id, &step_id),
            };
            let timeout = step.timeout(self.default_step_timeout);

            info!(
                workflow_id = %definition.id,
                %step_id,
                target = %step.target,
                ?timeout,
                "Dispatching step"
            );

            let response = self
                .dispatcher
                .call_with_id(
                    correlation_id,
                    &step.target,
                    step.request_body.clone(),
                    timeout,
                )
                .await;
            let ok = response.ok;
            results.push(StepResult { step_id: step_id.clone(), response });

            if !ok {
                warn!(
                    workflow_id = %definition.id,
                    %step_id,
                    failed_at = position,
                    "Workflow failed"
                );
                return WorkflowResult {
                    id: definition.id,
                    name: definition.name,
                    ok: false,
                    failed_at: Some(position),
                    results,
                };
            }
        }

        info!(workflow_id = %definition.id, "Workflow completed");
        WorkflowResult {
            id: definition.id,
            name: definition.name,
            ok: true,
            failed_at: None,
            results,
        }
    }
}

/// Runs workflow definitions arriving as requests.
///
/// The request's correlation id is the workflow id.
pub struct WorkflowCommandHandler {
    engine: WorkflowEngine,
}

impl WorkflowCommandHandler {
    pub fn new(engine: WorkflowEngine) -> Self {
        Self { engine }
    }

    fn definition(request: &Request) -> Result<WorkflowDefinition, LabcellError> {
        if !matches!(request.payload.get("steps"), Some(Value::Array(_))) {
            return Err(LabcellError::InvalidRequest("missing steps".into()));
        }
        let mut definition: WorkflowDefinition =
            serde_json::from_value(Value::Object(request.payload.clone()))
                .map_err(|e| LabcellError::InvalidRequest(e.to_string()))?;
        definition.id = request.correlation_id.clone();
        Ok(definition.normalized())
    }
}

#[async_trait]
impl CommandHandler for WorkflowCommandHandler {
    async fn handle(&mut self, request: Request) -> Response {
        match Self::definition(&request) {
            Ok(definition) => self.engine.run(&definition).await.into_response(),
            Err(e) => {
                warn!(correlation_id = %request.correlation_id, error = %e, "Rejected workflow");
                let mut response = e.into_response(request.correlation_id.clone());
                if request.correlation_id.is_empty() {
                    response.correlation_id = None;
                }
                response
            }
        }
    }
}
