//! In-memory transport for tests.
//!
//! A responder closure decides, per request, what the "worker" does.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CommandTransport, Receipt, Result, TransportError, TransportKind};
use crate::message::{Request, Response};

/// What the simulated worker does with a request.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer immediately.
    Respond(Response),
    /// Answer after a delay.
    After(Duration, Response),
    /// Never answer.
    Silent,
    /// Refuse the connection.
    Unreachable,
}

type Responder = dyn Fn(&Request) -> MockReply + Send + Sync;

/// Mock transport that records every submitted request.
pub struct MockTransport {
    responder: Arc<Responder>,
    submitted: RwLock<Vec<Request>>,
    pending: RwLock<HashMap<String, MockReply>>,
}

impl MockTransport {
    pub fn new(responder: impl Fn(&Request) -> MockReply + Send + Sync + 'static) -> Self {
        Self {
            responder: Arc::new(responder),
            submitted: RwLock::new(Vec::new()),
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Answers every request `ok:true`, echoing its id.
    pub fn always_ok() -> Self {
        Self::new(|request| MockReply::Respond(Response::reply(request, true, "completed")))
    }

    /// Never answers.
    pub fn silent() -> Self {
        Self::new(|_| MockReply::Silent)
    }

    /// Refuses every connection.
    pub fn unreachable() -> Self {
        Self::new(|_| MockReply::Unreachable)
    }

    /// Requests submitted so far, in order.
    pub async fn submitted(&self) -> Vec<Request> {
        self.submitted.read().await.clone()
    }

    pub async fn submitted_count(&self) -> usize {
        self.submitted.read().await.len()
    }
}

#[async_trait]
impl CommandTransport for MockTransport {
    async fn submit(&self, request: &Request) -> Result<Receipt> {
        self.submitted.write().await.push(request.clone());

        let reply = (self.responder)(request);
        if matches!(reply, MockReply::Unreachable) {
            return Err(TransportError::Unreachable("mock: connection refused".into()));
        }

        let key = uuid::Uuid::new_v4().to_string();
        self.pending.write().await.insert(key.clone(), reply);
        Ok(Receipt {
            correlation_id: request.correlation_id.clone(),
            key,
        })
    }

    async fn poll(&self, receipt: &Receipt, timeout: Duration) -> Result<Response> {
        let Some(reply) = self.pending.write().await.remove(&receipt.key) else {
            return Err(TransportError::UnknownReceipt(receipt.key.clone()));
        };

        let timed_out = || TransportError::Timeout {
            correlation_id: receipt.correlation_id.clone(),
            waited: timeout,
        };

        match reply {
            MockReply::Respond(response) => Ok(response),
            MockReply::After(delay, response) if delay <= timeout => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            MockReply::After(..) | MockReply::Silent => {
                tokio::time::sleep(timeout).await;
                Err(timed_out())
            }
            MockReply::Unreachable => Err(TransportError::Unreachable(
                "mock: connection refused".into(),
            )),
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Mock
    }
}
