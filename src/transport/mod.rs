//! Command queue transports.
//!
//! A transport carries an opaque request to one target's worker and brings
//! back the response carrying the same correlation id. Two strategies sit
//! behind the same [`CommandTransport`] contract:
//! - File queue: request/response JSON files in the target's inbox/outbox
//! - HTTP: a single `POST` round trip to the worker's endpoint
//!
//! Fallback between them is the dispatcher's job, not the transport's.

use std::time::Duration;

use async_trait::async_trait;

use crate::message::{CodecError, Request, Response};

pub mod file_queue;
#[cfg(feature = "http")]
pub mod http;
pub mod mock;

pub use file_queue::FileQueueTransport;
#[cfg(feature = "http")]
pub use http::HttpTransport;
pub use mock::{MockReply, MockTransport};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur while carrying a request.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("No response for '{correlation_id}' within {waited:?}")]
    Timeout {
        correlation_id: String,
        waited: Duration,
    },

    /// Connection refused, connect timeout, DNS failure. The request never
    /// reached the worker, so another transport may carry it.
    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),

    /// The worker answered, but not with a response envelope.
    #[error("Endpoint rejected request: {0}")]
    Rejected(String),

    #[error("No pending submission '{0}'")]
    UnknownReceipt(String),
}

impl TransportError {
    /// True when falling back to another transport is safe.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Transport strategy discriminator, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    FileQueue,
    Http,
    Mock,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::FileQueue => "file_queue",
            Self::Http => "http",
            Self::Mock => "mock",
        })
    }
}

/// Outcome of taking back a request whose wait timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Withdrawal {
    /// Removed before any worker saw it. The action will not run.
    Withdrawn,
    /// A worker already owns the request and may still act on it.
    AlreadyClaimed,
    /// Once sent, the request cannot be taken back over this transport.
    Unsupported,
}

/// Handle for a submitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Correlation id of the submitted request.
    pub correlation_id: String,
    /// Transport-specific key (file basename, pending-call key).
    pub key: String,
}

/// Store-and-forward channel to a single target's worker.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Hand the request to the channel.
    async fn submit(&self, request: &Request) -> Result<Receipt>;

    /// Wait up to `timeout` for the response to a submitted request.
    ///
    /// Returns [`TransportError::Timeout`] when nothing arrived in time.
    async fn poll(&self, receipt: &Receipt, timeout: Duration) -> Result<Response>;

    /// Take back a request the worker has not picked up yet.
    async fn withdraw(&self, _receipt: &Receipt) -> Result<Withdrawal> {
        Ok(Withdrawal::Unsupported)
    }

    fn kind(&self) -> TransportKind;
}

/// Submit then poll, withdrawing the request if the wait times out.
pub async fn exchange(
    transport: &dyn CommandTransport,
    request: &Request,
    timeout: Duration,
) -> Result<Response> {
    let receipt = transport.submit(request).await?;
    match transport.poll(&receipt, timeout).await {
        Err(e) if e.is_timeout() => {
            match transport.withdraw(&receipt).await {
                Ok(Withdrawal::Withdrawn) => tracing::info!(
                    correlation_id = %receipt.correlation_id,
                    transport = %transport.kind(),
                    "Withdrew unclaimed request after timeout"
                ),
                Ok(Withdrawal::AlreadyClaimed) => tracing::warn!(
                    correlation_id = %receipt.correlation_id,
                    transport = %transport.kind(),
                    "Timed out after worker claimed request; the action may still complete"
                ),
                Ok(Withdrawal::Unsupported) => tracing::warn!(
                    correlation_id = %receipt.correlation_id,
                    transport = %transport.kind(),
                    "Timed out; the request may have been delivered and cannot be withdrawn"
                ),
                Err(withdraw_err) => tracing::warn!(
                    correlation_id = %receipt.correlation_id,
                    error = %withdraw_err,
                    "Failed to withdraw request"
                ),
            }
            Err(e)
        }
        other => other,
    }
}
