//! Correlated dispatcher.
//!
//! Turns a queue- or network-based transport into a call that blocks until
//! the matching response arrives or the timeout elapses. Every outcome is a
//! [`Response`]: timeouts, unknown targets and transport failures become
//! `ok:false` envelopes so the workflow engine sees a single shape.

pub mod correlation;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::LabcellError;
use crate::message::{Payload, Request, Response, Target};
use crate::transport::{exchange, CommandTransport, FileQueueTransport, TransportError};

pub use correlation::{resolve_correlation_id, step_correlation_id, validate_correlation_id};

/// Message for a response whose id does not belong to the request.
pub const CORRELATION_MISMATCH_MESSAGE: &str = "correlation_mismatch";
/// Message for a transport that failed without a fallback.
pub const TRANSPORT_ERROR_MESSAGE: &str = "transport_error";

/// How to reach one target.
#[derive(Clone)]
pub struct Route {
    /// File-queue transport. Always present; the fallback for `network`.
    pub file: Arc<dyn CommandTransport>,
    /// Network transport tried first when configured.
    pub network: Option<Arc<dyn CommandTransport>>,
}

impl Route {
    pub fn file(file: Arc<dyn CommandTransport>) -> Self {
        Self {
            file,
            network: None,
        }
    }

    pub fn with_network(mut self, network: Arc<dyn CommandTransport>) -> Self {
        self.network = Some(network);
        self
    }
}

/// Dispatches requests to targets and waits for their responses.
///
/// Holds no locks across calls: concurrent calls to the same target are
/// serialized by that target's worker, not here.
#[derive(Clone, Default)]
pub struct CorrelatedDispatcher {
    routes: HashMap<Target, Route>,
}

impl CorrelatedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, target: Target, route: Route) -> Self {
        self.routes.insert(target, route);
        self
    }

    /// Build routes for every configured target.
    pub async fn from_config(config: &Config) -> Result<Self, TransportError> {
        let mut dispatcher = Self::new();

        for (target, settings) in config.target_table() {
            let file: Arc<dyn CommandTransport> = Arc::new(
                FileQueueTransport::new(
                    target.clone(),
                    &settings.inbox,
                    &settings.outbox,
                    config.dispatch.poll_interval(),
                )
                .await?,
            );
            let mut route = Route::file(file);

            if let Some(url) = &settings.url {
                #[cfg(feature = "http")]
                {
                    let network = crate::transport::HttpTransport::new(
                        target.clone(),
                        url.clone(),
                        config.dispatch.connect_timeout(),
                    )?;
                    route = route.with_network(Arc::new(network));
                }
                #[cfg(not(feature = "http"))]
                warn!(target = %target, url = %url, "HTTP support not compiled in, using file queue only");
            }

            dispatcher = dispatcher.with_route(target, route);
        }

        Ok(dispatcher)
    }

    /// Targets this dispatcher can reach.
    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.routes.keys()
    }

    pub fn has_target(&self, target: &Target) -> bool {
        self.routes.contains_key(target)
    }

    /// Dispatch `payload` to `target` and wait up to `timeout`.
    ///
    /// Uses the payload's `id` as correlation id, or generates one.
    pub async fn call(&self, target: &Target, payload: Payload, timeout: Duration) -> Response {
        match correlation::resolve_correlation_id(&payload) {
            Ok(id) => self.call_with_id(id, target, payload, timeout).await,
            Err(e) => e.into_response(String::new()),
        }
    }

    /// Dispatch with an explicit correlation id.
    pub async fn call_with_id(
        &self,
        correlation_id: impl Into<String>,
        target: &Target,
        payload: Payload,
        timeout: Duration,
    ) -> Response {
        let mut correlation_id = correlation_id.into();
        if correlation_id.is_empty() {
            correlation_id = correlation::generate_correlation_id();
        }

        match self
            .try_call(&correlation_id, target, payload, timeout)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, LabcellError::TransportTimeout(_)) {
                    warn!(
                        %correlation_id,
                        target = %target,
                        ?timeout,
                        "No response within timeout; the device may still complete the action"
                    );
                }
                e.into_response(correlation_id)
            }
        }
    }

    async fn try_call(
        &self,
        correlation_id: &str,
        target: &Target,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Response, LabcellError> {
        validate_correlation_id(correlation_id)?;
        let route = self
            .routes
            .get(target)
            .ok_or_else(|| LabcellError::UnknownTarget(target.clone()))?;

        let request = Request::new(correlation_id, target.clone(), payload);
        let started = Instant::now();
        // None when the budget runs past what the clock can represent.
        let deadline = started.checked_add(timeout);

        debug!(
            %correlation_id,
            target = %target,
            command = %request.command_type(),
            "Dispatching request"
        );

        let outcome = match &route.network {
            Some(network) => match exchange(network.as_ref(), &request, timeout).await {
                Err(e) if e.is_unreachable() => {
                    warn!(
                        %correlation_id,
                        target = %target,
                        error = %e,
                        "Network transport unreachable, falling back to file queue"
                    );
                    let remaining = deadline.map_or(timeout, |deadline| {
                        deadline.saturating_duration_since(Instant::now())
                    });
                    exchange(route.file.as_ref(), &request, remaining).await
                }
                other => other,
            },
            None => exchange(route.file.as_ref(), &request, timeout).await,
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Err(LabcellError::TransportTimeout(timeout)),
            Err(e) => {
                error!(%correlation_id, target = %target, error = %e, "Transport failed");
                return Ok(Response::failure(correlation_id, TRANSPORT_ERROR_MESSAGE)
                    .with_extra("detail", e.to_string()));
            }
        };

        debug!(
            %correlation_id,
            target = %target,
            ok = response.ok,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Received response"
        );

        Ok(verify_correlation(correlation_id, response))
    }
}

/// Ensure the response belongs to `correlation_id`.
///
/// A response without an id is adopted. One carrying a different id is
/// never passed through.
fn verify_correlation(correlation_id: &str, mut response: Response) -> Response {
    match response.correlation_id.as_deref() {
        Some(id) if id == correlation_id => response,
        None => {
            response.correlation_id = Some(correlation_id.to_string());
            response
        }
        Some(other) => {
            error!(
                expected = %correlation_id,
                received = %other,
                "Response correlation id does not match request"
            );
            Response::failure(correlation_id, CORRELATION_MISMATCH_MESSAGE)
                .with_extra("received_id", other.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockReply, MockTransport};
    use serde_json::json;

    fn arm() -> Target {
        Target::new("arm")
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn dispatcher_with(file: Arc<MockTransport>) -> CorrelatedDispatcher {
        CorrelatedDispatcher::new().with_route(arm(), Route::file(file))
    }

    #[tokio::test]
    async fn test_call_returns_matching_response() {
        let file = Arc::new(MockTransport::always_ok());
        let dispatcher = dispatcher_with(file.clone());

        let response = dispatcher
            .call_with_id(
                "wf1:s1",
                &arm(),
                payload(json!({ "type": "run_lua" })),
                Duration::from_secs(1),
            )
            .await;

        assert!(response.ok);
        assert_eq!(response.correlation_id.as_deref(), Some("wf1:s1"));
        let sent = file.submitted().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command_type(), "run_lua");
    }

    #[tokio::test]
    async fn test_call_uses_payload_id() {
        let file = Arc::new(MockTransport::always_ok());
        let dispatcher = dispatcher_with(file.clone());

        let response = dispatcher
            .call(&arm(), payload(json!({ "id": "mine" })), Duration::from_secs(1))
            .await;

        assert_eq!(response.correlation_id.as_deref(), Some("mine"));
        assert_eq!(file.submitted().await[0].correlation_id, "mine");
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let dispatcher = dispatcher_with(Arc::new(MockTransport::always_ok()));

        let response = dispatcher
            .call_with_id("x", &Target::new("Gripper"), Payload::new(), Duration::from_secs(1))
            .await;

        assert!(!response.ok);
        assert_eq!(response.message, "unknown_target:gripper");
    }

    #[tokio::test]
    async fn test_invalid_correlation_id_is_rejected() {
        let file = Arc::new(MockTransport::always_ok());
        let dispatcher = dispatcher_with(file.clone());

        let response = dispatcher
            .call_with_id("a".repeat(300), &arm(), Payload::new(), Duration::from_secs(1))
            .await;

        assert_eq!(response.message, "invalid_request");
        assert_eq!(file.submitted_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_synthesized_after_budget() {
        let dispatcher = dispatcher_with(Arc::new(MockTransport::silent()));
        let started = Instant::now();

        let response = dispatcher
            .call_with_id("wf1:s1", &arm(), Payload::new(), Duration::from_secs(5))
            .await;

        assert!(response.is_timeout());
        assert_eq!(response.correlation_id.as_deref(), Some("wf1:s1"));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_mismatched_response_is_never_returned() {
        let file = Arc::new(MockTransport::new(|_| {
            MockReply::Respond(Response::success("someone-else", "completed"))
        }));
        let dispatcher = dispatcher_with(file);

        let response = dispatcher
            .call_with_id("mine", &arm(), Payload::new(), Duration::from_secs(1))
            .await;

        assert!(!response.ok);
        assert_eq!(response.correlation_id.as_deref(), Some("mine"));
        assert_eq!(response.message, CORRELATION_MISMATCH_MESSAGE);
        assert_eq!(response.extra["received_id"], "someone-else");
    }

    #[tokio::test]
    async fn test_response_without_id_is_adopted() {
        let file = Arc::new(MockTransport::new(|_| {
            let mut response = Response::success("ignored", "done");
            response.correlation_id = None;
            MockReply::Respond(response)
        }));
        let dispatcher = dispatcher_with(file);

        let response = dispatcher
            .call_with_id("c-7", &arm(), Payload::new(), Duration::from_secs(1))
            .await;

        assert!(response.ok);
        assert_eq!(response.correlation_id.as_deref(), Some("c-7"));
    }

    #[tokio::test]
    async fn test_unreachable_network_falls_back_per_call() {
        let file = Arc::new(MockTransport::always_ok());
        let network = Arc::new(MockTransport::unreachable());
        let dispatcher = CorrelatedDispatcher::new().with_route(
            arm(),
            Route::file(file.clone()).with_network(network.clone()),
        );

        for id in ["c-1", "c-2"] {
            let response = dispatcher
                .call_with_id(id, &arm(), Payload::new(), Duration::from_secs(1))
                .await;
            assert!(response.ok);
        }

        assert_eq!(network.submitted_count().await, 2);
        assert_eq!(file.submitted_count().await, 2);
    }

    #[tokio::test]
    async fn test_reachable_network_skips_file_queue() {
        let file = Arc::new(MockTransport::always_ok());
        let network = Arc::new(MockTransport::always_ok());
        let dispatcher = CorrelatedDispatcher::new().with_route(
            arm(),
            Route::file(file.clone()).with_network(network.clone()),
        );

        let response = dispatcher
            .call_with_id("c-1", &arm(), Payload::new(), Duration::from_secs(1))
            .await;

        assert!(response.ok);
        assert_eq!(network.submitted_count().await, 1);
        assert_eq!(file.submitted_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_timeout_does_not_fall_back() {
        let file = Arc::new(MockTransport::always_ok());
        let network = Arc::new(MockTransport::silent());
        let dispatcher = CorrelatedDispatcher::new().with_route(
            arm(),
            Route::file(file.clone()).with_network(network),
        );

        let response = dispatcher
            .call_with_id("c-1", &arm(), Payload::new(), Duration::from_secs(2))
            .await;

        assert!(response.is_timeout());
        assert_eq!(file.submitted_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_budget_falls_back_and_answers() {
        let file = Arc::new(MockTransport::always_ok());
        let network = Arc::new(MockTransport::unreachable());
        let dispatcher = CorrelatedDispatcher::new().with_route(
            arm(),
            Route::file(file.clone()).with_network(network),
        );

        let response = dispatcher
            .call_with_id("c-1", &arm(), Payload::new(), Duration::MAX)
            .await;

        assert!(response.ok, "{response:?}");
        assert_eq!(response.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(file.submitted_count().await, 1);
    }
}
