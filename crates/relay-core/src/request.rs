//! Inbound call requests and the outbound response shapes that settle them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reason sent back when the wallet operator declines a request.
pub const CANCELLED_MESSAGE: &str = "cancelled";

/// Reason sent back when a request id is already pending and the duplicate
/// policy is `reject`.
pub const DUPLICATE_MESSAGE: &str = "duplicate request id";

/// Session-scoped request identifier.
///
/// Kept as the raw JSON value so it is echoed back to the peer verbatim,
/// whether the peer used a number or a string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Value);

impl RequestId {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{other}"),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(Value::String(s.to_owned()))
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self(Value::from(n))
    }
}

/// What to do with a request whose id is already pending.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Queue it anyway; both entries are resolved independently.
    #[default]
    Append,
    /// Drop the newcomer without answering it.
    Ignore,
    /// Answer the newcomer with [`DUPLICATE_MESSAGE`] and do not queue it.
    Reject,
}

/// One JSON-RPC shaped request awaiting a wallet decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl CallRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// `{ message }` body of a rejection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

/// Outbound `{ id, result }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovedResponse {
    pub id: RequestId,
    pub result: Value,
}

/// Outbound `{ id, error: { message } }`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedResponse {
    pub id: RequestId,
    pub error: ErrorBody,
}

impl RejectedResponse {
    pub fn new(id: RequestId, message: impl Into<String>) -> Self {
        Self {
            id,
            error: ErrorBody {
                message: message.into(),
            },
        }
    }

    pub fn cancelled(id: RequestId) -> Self {
        Self::new(id, CANCELLED_MESSAGE)
    }
}

/// Outcome of resolving one queued request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "value", rename_all = "snake_case")]
pub enum Decision {
    Approved(Value),
    Rejected(String),
}

impl Decision {
    /// Classify a resolver result. A result object carrying a non-null
    /// `error` member is an application-level rejection.
    pub fn from_result(result: Value) -> Self {
        match embedded_error(&result) {
            Some(message) => Self::Rejected(message),
            None => Self::Approved(result),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved(_))
    }
}

/// Extract the message of an embedded `{ error: ... }` member, if any.
pub fn embedded_error(result: &Value) -> Option<String> {
    let error = result.get("error")?;
    match error {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => Some(match map.get("message") {
            Some(Value::String(m)) => m.clone(),
            _ => error.to_string(),
        }),
        other => Some(other.to_string()),
    }
}
