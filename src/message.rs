//! Request/response envelope shared by every transport.
//!
//! Wire form (file queue and HTTP alike):
//! ```text
//! Request:  { "id": <string>, "type"|"command": <string>, ...type-specific fields }
//! Response: { "id": <string>, "ok": <bool>, "message": <string>, ...extra fields }
//! ```
//!
//! The payload is opaque to transports. Only workers look inside it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Endpoint-specific request fields.
pub type Payload = Map<String, Value>;

/// Wire field carrying the correlation id.
pub const ID_FIELD: &str = "id";
/// Wire field carrying the command type.
pub const TYPE_FIELD: &str = "type";
/// Legacy alias for [`TYPE_FIELD`].
pub const LEGACY_TYPE_FIELD: &str = "command";

/// Message used when the dispatcher gives up waiting.
pub const TIMEOUT_MESSAGE: &str = "timeout";
/// Message answered for unreadable request files.
pub const INVALID_JSON_MESSAGE: &str = "invalid_json";

/// Longest wait a request may ask for. Larger values are clamped to it.
pub const MAX_WAIT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Convert a wire timeout in seconds.
///
/// Negative and NaN values are rejected. Values beyond [`MAX_WAIT`],
/// including ones no `Duration` can hold, are clamped.
pub fn wait_from_secs(secs: f64) -> Option<Duration> {
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(secs).map_or(MAX_WAIT, |wait| wait.min(MAX_WAIT)))
}

/// Errors decoding or encoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request must be a JSON object")]
    NotAnObject,

    #[error("request id must be a string")]
    InvalidId,
}

// ============================================================================
// Target
// ============================================================================

/// Name of a device endpoint ("arm", "iot", ...).
///
/// Names are trimmed and lowercased so `"Arm "` and `"arm"` route the same.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Target(String);

impl Target {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Target {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Target {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<Target> for String {
    fn from(value: Target) -> Self {
        value.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Request
// ============================================================================

/// A command addressed to one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub correlation_id: String,
    pub target: Target,
    pub payload: Payload,
}

impl Request {
    /// Build a request. Any `id` already present in the payload is replaced
    /// by `correlation_id` on the wire.
    pub fn new(correlation_id: impl Into<String>, target: Target, mut payload: Payload) -> Self {
        payload.remove(ID_FIELD);
        Self {
            correlation_id: correlation_id.into(),
            target,
            payload,
        }
    }

    /// Command type, read from `type` with `command` as the legacy fallback,
    /// trimmed and lowercased. Empty when neither is present.
    pub fn command_type(&self) -> String {
        command_type(&self.payload)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }

    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(Value::as_f64)
    }

    /// Wire object: the payload with `id` set to the correlation id.
    pub fn to_wire(&self) -> Value {
        let mut object = Map::with_capacity(self.payload.len() + 1);
        object.insert(
            ID_FIELD.to_string(),
            Value::String(self.correlation_id.clone()),
        );
        for (key, value) in &self.payload {
            object.insert(key.clone(), value.clone());
        }
        Value::Object(object)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(&self.to_wire())?)
    }

    /// Decode a wire request received by `target`'s worker.
    ///
    /// A missing `id` decodes to an empty correlation id; the worker answers
    /// it with `"id": null`.
    pub fn decode(target: Target, bytes: &[u8]) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_wire(target, value)
    }

    pub fn from_wire(target: Target, value: Value) -> Result<Self, CodecError> {
        let Value::Object(mut payload) = value else {
            return Err(CodecError::NotAnObject);
        };
        let correlation_id = match payload.remove(ID_FIELD) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(id)) => id,
            Some(_) => return Err(CodecError::InvalidId),
        };
        Ok(Self {
            correlation_id,
            target,
            payload,
        })
    }
}

/// Resolve the command type of a raw payload.
pub fn command_type(payload: &Payload) -> String {
    let raw = match payload.get(TYPE_FIELD) {
        Some(Value::Null) | None => payload.get(LEGACY_TYPE_FIELD),
        some => some,
    };
    match raw {
        Some(Value::String(s)) => s.trim().to_lowercase(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string().trim().to_lowercase(),
    }
}

// ============================================================================
// Response
// ============================================================================

/// Answer to exactly one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Echo of the request's correlation id. `None` only for requests that
    /// could not be decoded.
    #[serde(rename = "id", default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub extra: Payload,
}

impl Response {
    pub fn new(correlation_id: impl Into<String>, ok: bool, message: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ok,
            message: message.into(),
            extra: Payload::new(),
        }
    }

    pub fn success(correlation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(correlation_id, true, message)
    }

    pub fn failure(correlation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(correlation_id, false, message)
    }

    /// Synthesized when no response arrived within the caller's budget.
    pub fn timeout(correlation_id: impl Into<String>) -> Self {
        Self::failure(correlation_id, TIMEOUT_MESSAGE)
    }

    /// Fixed answer for request files that cannot be parsed.
    pub fn invalid_json() -> Self {
        Self {
            correlation_id: None,
            ok: false,
            message: INVALID_JSON_MESSAGE.to_string(),
            extra: Payload::new(),
        }
    }

    /// Answer to `request`, echoing its id (`None` when the request had none).
    pub fn reply(request: &Request, ok: bool, message: impl Into<String>) -> Self {
        Self {
            correlation_id: (!request.correlation_id.is_empty())
                .then(|| request.correlation_id.clone()),
            ok,
            message: message.into(),
            extra: Payload::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn is_timeout(&self) -> bool {
        !self.ok && self.message == TIMEOUT_MESSAGE
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
