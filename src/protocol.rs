//! Request and response envelopes for the capability wire protocol.
//!
//! Both transports exchange the same envelopes:
//!
//! - **Request**: `{ "capability": string, "arguments": object, "id": token }`
//! - **Response**: `{ "id": token, "ok": bool, "output"?: value,
//!   "error"?: { "message": string, "kind": string } }`
//!
//! Every response carries the id of the request it answers. When a frame is
//! so malformed that no id can be recovered, the protocol error response
//! carries a null id.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DispatchFailure, ErrorKind};

/// An opaque request correlation token.
///
/// Tokens are strings or integers, never null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric token.
    Number(i64),
    /// String token.
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// A decoded request envelope.
///
/// One instance exists per invocation, owned by the dispatcher until the
/// response is written.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    /// Name of the capability to invoke.
    pub capability: String,

    /// Raw arguments, validated against the capability's input schema.
    #[serde(default = "default_arguments")]
    pub arguments: Value,

    /// Correlation token echoed back on the response.
    pub id: RequestId,
}

fn default_arguments() -> Value {
    Value::Object(Map::new())
}

/// Structured error payload on a failure response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable description.
    pub message: String,
    /// Stable failure classification.
    pub kind: ErrorKind,
}

/// A response envelope, always well-formed regardless of outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Correlation token of the request, null when it could not be decoded.
    pub id: Option<RequestId>,

    /// Whether the invocation produced an output.
    pub ok: bool,

    /// Structured output, present iff `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Error details, present iff not `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl ResponseEnvelope {
    /// Creates a success response.
    #[must_use]
    pub fn success(id: RequestId, output: Value) -> Self {
        Self {
            id: Some(id),
            ok: true,
            output: Some(output),
            error: None,
        }
    }

    /// Creates a failure response from a classified dispatch failure.
    #[must_use]
    pub fn failure(id: RequestId, failure: &DispatchFailure) -> Self {
        Self {
            id: Some(id),
            ok: false,
            output: None,
            error: Some(ErrorPayload {
                message: failure.message.clone(),
                kind: failure.kind,
            }),
        }
    }

    /// Creates a protocol error response.
    ///
    /// The id is null when the offending frame was too malformed to recover
    /// one.
    #[must_use]
    pub fn protocol_error(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            output: None,
            error: Some(ErrorPayload {
                message: message.into(),
                kind: ErrorKind::Protocol,
            }),
        }
    }
}

/// A malformed envelope.
///
/// Carries the request id when one could be recovered, so the final error
/// response still correlates.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ProtocolViolation {
    /// Description of the violation.
    pub message: String,
    /// Recovered correlation token, if any.
    pub id: Option<RequestId>,
}

/// Parses a raw frame into a request envelope.
///
/// # Errors
///
/// Returns a [`ProtocolViolation`] if the frame is not a JSON object, is
/// missing required fields, or names an empty capability.
pub fn parse_envelope(raw: &str) -> Result<RequestEnvelope, ProtocolViolation> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ProtocolViolation {
        message: format!("malformed JSON: {e}"),
        id: None,
    })?;

    let Some(object) = value.as_object() else {
        return Err(ProtocolViolation {
            message: "envelope must be a JSON object".to_string(),
            id: None,
        });
    };

    // Recover the id early so even a rejected frame can be correlated.
    let id = object
        .get("id")
        .cloned()
        .and_then(|raw_id| serde_json::from_value::<RequestId>(raw_id).ok());

    let envelope: RequestEnvelope =
        serde_json::from_value(value).map_err(|e| ProtocolViolation {
            message: format!("invalid envelope: {e}"),
            id: id.clone(),
        })?;

    if envelope.capability.is_empty() {
        return Err(ProtocolViolation {
            message: "capability name cannot be empty".to_string(),
            id: Some(envelope.id),
        });
    }

    Ok(envelope)
}
