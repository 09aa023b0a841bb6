//! Outcome taxonomy for a dispatched call.
//!
//! Transport and capability errors are handled where they occur (fallback,
//! sticky skip). Whatever survives all fallbacks is turned into an `ok:false`
//! [`Response`] here so the workflow engine sees one uniform shape.

use crate::message::{Request, Response, Target, TIMEOUT_MESSAGE};

/// Result type for call-level operations.
pub type Result<T> = std::result::Result<T, LabcellError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LabcellError {
    /// Malformed payload. Answered immediately, never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown target '{0}'")]
    UnknownTarget(Target),

    /// No response within budget. The device may still finish the action.
    #[error("no response within {0:?}")]
    TransportTimeout(std::time::Duration),

    #[error("capability not supported: {0}")]
    EndpointUnsupportedCapability(String),

    /// The device worker answered `ok:false`.
    #[error("endpoint failure: {0}")]
    EndpointFailure(String),
}

impl LabcellError {
    /// Stable wire message for this error.
    pub fn wire_message(&self) -> String {
        match self {
            Self::InvalidRequest(_) => "invalid_request".to_string(),
            Self::UnknownTarget(target) => format!("unknown_target:{target}"),
            Self::TransportTimeout(_) => TIMEOUT_MESSAGE.to_string(),
            Self::EndpointUnsupportedCapability(capability) => format!("unsupported:{capability}"),
            Self::EndpointFailure(message) => message.clone(),
        }
    }

    /// `ok:false` response for `correlation_id`.
    pub fn into_response(self, correlation_id: impl Into<String>) -> Response {
        let response = Response::failure(correlation_id, self.wire_message());
        self.annotate(response)
    }

    /// `ok:false` answer to `request`, echoing its id.
    pub fn reply_to(self, request: &Request) -> Response {
        let response = Response::reply(request, false, self.wire_message());
        self.annotate(response)
    }

    fn annotate(self, response: Response) -> Response {
        match self {
            Self::InvalidRequest(detail) => response.with_extra("detail", detail),
            _ => response,
        }
    }
}
