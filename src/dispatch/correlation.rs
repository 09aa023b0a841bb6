//! Correlation id derivation and validation.
//!
//! Ids are caller-supplied or generated. Workflow steps derive theirs from
//! the workflow and step ids so a duplicate dispatch is visible in the queue
//! directories and in logs.

use serde_json::Value;

use crate::error::LabcellError;
use crate::message::{Payload, ID_FIELD};

/// Maximum correlation id length.
pub const MAX_CORRELATION_ID_LENGTH: usize = 128;

pub mod errmsg {
    pub const CORRELATION_ID_TOO_LONG: &str = "correlation_id exceeds maximum length";
    pub const CORRELATION_ID_CONTROL_CHARS: &str = "correlation_id contains control characters";
    pub const CORRELATION_ID_NOT_STRING: &str = "correlation_id must be a string";
}

/// Validate a correlation id.
///
/// Rules:
/// - Maximum 128 characters
/// - No control characters
///
/// Empty ids are valid here; callers replace them with a generated one.
pub fn validate_correlation_id(id: &str) -> Result<(), LabcellError> {
    if id.chars().count() > MAX_CORRELATION_ID_LENGTH {
        return Err(LabcellError::InvalidRequest(
            errmsg::CORRELATION_ID_TOO_LONG.to_string(),
        ));
    }
    if id.chars().any(char::is_control) {
        return Err(LabcellError::InvalidRequest(
            errmsg::CORRELATION_ID_CONTROL_CHARS.to_string(),
        ));
    }
    Ok(())
}

/// Fresh random correlation id.
pub fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Correlation id for a workflow step: `{workflow_id}:{step_id}`.
pub fn step_correlation_id(workflow_id: &str, step_id: &str) -> String {
    format!("{workflow_id}:{step_id}")
}

/// Id carried by a payload, if it sets a non-empty one.
pub fn payload_correlation_id(payload: &Payload) -> Result<Option<String>, LabcellError> {
    match payload.get(ID_FIELD) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) if id.is_empty() => Ok(None),
        Some(Value::String(id)) => {
            validate_correlation_id(id)?;
            Ok(Some(id.clone()))
        }
        Some(_) => Err(LabcellError::InvalidRequest(
            errmsg::CORRELATION_ID_NOT_STRING.to_string(),
        )),
    }
}

/// The payload's own id, or a generated one.
pub fn resolve_correlation_id(payload: &Payload) -> Result<String, LabcellError> {
    Ok(payload_correlation_id(payload)?.unwrap_or_else(generate_correlation_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_step_correlation_id() {
        assert_eq!(step_correlation_id("wf1", "s1"), "wf1:s1");
    }

    #[test]
    fn test_resolve_keeps_supplied_id() {
        let id = resolve_correlation_id(&payload(json!({ "id": "abc-123" }))).unwrap();
        assert_eq!(id, "abc-123");
    }

    #[test]
    fn test_resolve_generates_when_missing_or_empty() {
        let generated = resolve_correlation_id(&Payload::new()).unwrap();
        assert!(uuid::Uuid::parse_str(&generated).is_ok());

        let generated = resolve_correlation_id(&payload(json!({ "id": "" }))).unwrap();
        assert!(uuid::Uuid::parse_str(&generated).is_ok());
    }

    #[test]
    fn test_rejects_non_string_id() {
        let err = resolve_correlation_id(&payload(json!({ "id": 42 }))).unwrap_err();
        assert!(matches!(err, LabcellError::InvalidRequest(_)));
    }

    #[test]
    fn test_validate_limits() {
        assert!(validate_correlation_id("").is_ok());
        assert!(validate_correlation_id("wf:step-1").is_ok());
        assert!(validate_correlation_id(&"a".repeat(MAX_CORRELATION_ID_LENGTH)).is_ok());
        assert!(validate_correlation_id(&"a".repeat(MAX_CORRELATION_ID_LENGTH + 1)).is_err());
        assert!(validate_correlation_id("bad\nid").is_err());
    }
}
