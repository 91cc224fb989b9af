//! Transport seam.
//!
//! The engine never performs I/O itself. Every execution goes through a
//! [`Transport`] which receives the endpoint's derived arguments and a
//! cancellation signal.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Pluggable executor for endpoint requests.
///
/// Implementations should observe [`TransportContext::signal`] and stop early
/// when it fires; the engine discards results of cancelled executions either way.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Internal arguments produced by an endpoint's `query` mapping.
    type Args: Send + 'static;

    async fn execute(&self, args: Self::Args, ctx: TransportContext)
    -> Result<Value, TransportError>;
}

/// Per-execution context handed to the transport.
#[derive(Debug, Clone)]
pub struct TransportContext {
    endpoint: String,
    signal: CancellationToken,
}

impl TransportContext {
    pub fn new(endpoint: impl Into<String>, signal: CancellationToken) -> Self {
        Self {
            endpoint: endpoint.into(),
            signal,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    /// Reject with a structured payload rather than an unexpected failure.
    pub fn reject_with_value(&self, value: Value) -> TransportError {
        TransportError::Rejected(value)
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport rejected the request: {0}")]
    Rejected(Value),
    #[error("transport failed: {0}")]
    Unexpected(String),
}

impl TransportError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

/// Origin of a recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The transport rejected with a structured value.
    Rejected,
    /// The transport failed in a way it did not describe.
    Unexpected,
    /// An entity tag named an undeclared type.
    Validation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Rejected => "rejected",
            ErrorKind::Unexpected => "unexpected",
            ErrorKind::Validation => "validation",
        }
    }
}

/// Error value stored on a rejected cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub value: Value,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, value: Value) -> Self {
        Self { kind, value }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, Value::String(message.into()))
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unexpected, Value::String(message.into()))
    }
}

impl From<TransportError> for ErrorPayload {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Rejected(value) => Self::new(ErrorKind::Rejected, value),
            TransportError::Unexpected(message) => {
                Self::new(ErrorKind::Unexpected, Value::String(message))
            }
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.value)
    }
}
