//! HTTP transport: one `POST` round trip per request.
//!
//! `submit` starts the call in the background and `poll` waits on it, so the
//! dispatcher drives both transports through the same two-phase contract.
//! Only connection-level failures map to [`TransportError::Unreachable`]:
//! once the worker has accepted the request, a slow answer is a timeout,
//! never a reason to resend it elsewhere.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CommandTransport, Receipt, Result, TransportError, TransportKind, Withdrawal};
use crate::message::{Request, Response, Target};

/// Path the worker endpoint serves commands on.
pub const COMMAND_PATH: &str = "/command_json";

/// Network transport for one target.
pub struct HttpTransport {
    target: Target,
    url: String,
    client: Client,
    pending: Mutex<HashMap<String, JoinHandle<Result<Response>>>>,
}

impl HttpTransport {
    /// Create a transport posting to `url`.
    ///
    /// `connect_timeout` bounds connection setup only. The response wait is
    /// bounded by the `poll` timeout.
    pub fn new(target: Target, url: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Rejected(format!("client setup: {e}")))?;

        Ok(Self {
            target,
            url: url.into(),
            client,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(client: Client, url: String, body: serde_json::Value) -> Result<Response> {
        let response = client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(classify)?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(TransportError::Rejected(format!(
                "HTTP {} - {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        Ok(Response::decode(&bytes)?)
    }
}

/// Map a client error onto the transport taxonomy.
fn classify(err: reqwest::Error) -> TransportError {
    if err.is_connect() {
        TransportError::Unreachable(err.to_string())
    } else {
        TransportError::Rejected(err.to_string())
    }
}

#[async_trait]
impl CommandTransport for HttpTransport {
    async fn submit(&self, request: &Request) -> Result<Receipt> {
        let key = uuid::Uuid::new_v4().to_string();
        let call = tokio::spawn(Self::post(
            self.client.clone(),
            self.url.clone(),
            request.to_wire(),
        ));
        self.pending.lock().await.insert(key.clone(), call);

        debug!(
            target = %self.target,
            correlation_id = %request.correlation_id,
            url = %self.url,
            "Posted request"
        );

        Ok(Receipt {
            correlation_id: request.correlation_id.clone(),
            key,
        })
    }

    async fn poll(&self, receipt: &Receipt, timeout: Duration) -> Result<Response> {
        let Some(mut call) = self.pending.lock().await.remove(&receipt.key) else {
            return Err(TransportError::UnknownReceipt(receipt.key.clone()));
        };

        match tokio::time::timeout(timeout, &mut call).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(TransportError::Rejected(format!(
                "request task failed: {join_err}"
            ))),
            Err(_) => {
                call.abort();
                warn!(
                    target = %self.target,
                    correlation_id = %receipt.correlation_id,
                    "Abandoned HTTP call after timeout"
                );
                Err(TransportError::Timeout {
                    correlation_id: receipt.correlation_id.clone(),
                    waited: timeout,
                })
            }
        }
    }

    /// A posted request cannot be recalled; the endpoint may already be
    /// running it.
    async fn withdraw(&self, _receipt: &Receipt) -> Result<Withdrawal> {
        Ok(Withdrawal::Unsupported)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }
}
