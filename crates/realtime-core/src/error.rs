use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ChannelState;

/// Error codes the backend uses when a procedure, table or column is missing.
pub const SCHEMA_ERROR_CODES: &[&str] = &["PGRST202", "PGRST204", "42883", "42703", "42P01"];

/// Error codes produced on the client side for transport-level failures.
pub const NETWORK_ERROR_CODES: &[&str] = &["NETWORK_ERROR", "TIMEOUT", "ABORTED", "FETCH_ERROR"];

const SCHEMA_PHRASES: &[&str] = &["does not exist", "schema", "could not find"];
const NETWORK_PHRASES: &[&str] = &["abort", "fetch", "network", "timeout", "timed out", "connection"];

/// Broad error category used to decide whether retrying can help.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CallErrorCategory {
    /// The backend's callable surface does not match what the client expects.
    Schema,
    /// Transient transport failure (timeouts, cancellations, connectivity).
    Network,
    /// Anything else, for example permission or validation errors.
    Unknown,
}

/// Structured failure returned inside a `CallResult`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct CallError {
    /// Backend or client-generated error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional remediation hint supplied by the backend.
    pub hint: Option<String>,
    /// Classification derived from `code` and `message`.
    pub category: CallErrorCategory,
}

impl CallError {
    /// Build an error and classify it from its code and message.
    pub fn classified(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        let category = classify_error(&code, &message);
        Self {
            code,
            message,
            hint: None,
            category,
        }
    }

    /// Build an error with an explicit category.
    pub fn new(
        category: CallErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            hint: None,
            category,
        }
    }

    /// The call did not complete within its deadline.
    pub fn timeout(procedure: &str, timeout_ms: u64) -> Self {
        Self::new(
            CallErrorCategory::Network,
            "TIMEOUT",
            format!("call to '{procedure}' timed out after {timeout_ms}ms"),
        )
    }

    /// The caller cancelled the call before it completed.
    pub fn aborted(procedure: &str) -> Self {
        Self::new(
            CallErrorCategory::Network,
            "ABORTED",
            format!("call to '{procedure}' was aborted"),
        )
    }

    /// The backend answered but its payload did not match the expected shape.
    pub fn decode(procedure: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(
            CallErrorCategory::Unknown,
            "DECODE_ERROR",
            format!("failed to decode response of '{procedure}': {reason}"),
        )
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn is_schema_error(&self) -> bool {
        self.category == CallErrorCategory::Schema
    }

    pub fn is_network_error(&self) -> bool {
        self.category == CallErrorCategory::Network
    }
}

/// Classify a backend failure by its code and message.
///
/// Schema signals win over network signals: a missing procedure reported
/// through a flaky proxy is still a missing procedure.
pub fn classify_error(code: &str, message: &str) -> CallErrorCategory {
    let lowered = message.to_ascii_lowercase();

    if SCHEMA_ERROR_CODES.contains(&code)
        || SCHEMA_PHRASES.iter().any(|phrase| lowered.contains(phrase))
    {
        return CallErrorCategory::Schema;
    }

    if NETWORK_ERROR_CODES.contains(&code)
        || NETWORK_PHRASES.iter().any(|phrase| lowered.contains(phrase))
    {
        return CallErrorCategory::Network;
    }

    CallErrorCategory::Unknown
}

/// Error returned by caller-supplied channel handlers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failures reported by a change-feed transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport could not open the requested channel.
    #[error("failed to open channel '{channel}': {reason}")]
    Open { channel: String, reason: String },
    /// The transport has been shut down.
    #[error("transport is closed")]
    Closed,
}

/// Errors surfaced by channel registrations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Reconnection stopped after the configured number of attempts.
    #[error("channel '{channel}' gave up after {attempts} reconnect attempts: {last_reason}")]
    RetriesExhausted {
        channel: String,
        attempts: u32,
        last_reason: String,
    },
    /// A lifecycle transition that the state machine does not allow.
    #[error("channel cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: ChannelState, to: ChannelState },
}
