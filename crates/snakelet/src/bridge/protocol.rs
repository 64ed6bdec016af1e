//! Wire protocol types for engine-worker communication.
//!
//! One duplex channel (worker stdin/stdout) carries both directions:
//! - **Requests** (engine → worker): `{"id", "command", "args"}`
//! - **Responses** (worker → engine): `{"id", "success", "result" | "error"}`
//!
//! Responses may arrive in any order; the correlation id is the only link
//! back to the request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier tagging one request/response pair.
///
/// Assigned from a monotonically increasing 64-bit counter, so ids are never
/// reused within the lifetime of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for CorrelationId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request sent from engine to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: CorrelationId,
    pub command: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// Response sent from worker to engine.
///
/// `success` distinguishes a handled command (`result` present) from a
/// command the worker could not run at all (`error` present). Application
/// level failures still arrive with `success: true` and a `status: "error"`
/// inside `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: CorrelationId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl ResponseFrame {
    pub fn success(id: CorrelationId, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
            timestamp: None,
        }
    }

    pub fn failure(id: CorrelationId, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(Value::String(error.into())),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A decoded inbound frame, keyed by correlation id.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Success { id: CorrelationId, payload: Value },
    Failure { id: CorrelationId, error: Value },
}

impl Inbound {
    pub fn id(&self) -> CorrelationId {
        match self {
            Self::Success { id, .. } | Self::Failure { id, .. } => *id,
        }
    }
}

/// Application-level status discriminator carried inside every result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}
