use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CallError;

/// Outcome of a remote procedure call.
///
/// When `succeeded == false`, `error` is always present and `data` absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallResult<T> {
    /// Decoded response payload. Absent for procedures that return null.
    pub data: Option<T>,
    /// Failure details when the call did not succeed.
    pub error: Option<CallError>,
    /// `true` when the backend answered without an error.
    pub succeeded: bool,
    /// `true` when `data` was substituted by the caller rather than the backend.
    pub used_fallback: bool,
}

impl<T> CallResult<T> {
    /// Successful call with an optional payload.
    pub fn success(data: Option<T>) -> Self {
        Self {
            data,
            error: None,
            succeeded: true,
            used_fallback: false,
        }
    }

    /// Failed call.
    pub fn failure(error: CallError) -> Self {
        Self {
            data: None,
            error: Some(error),
            succeeded: false,
            used_fallback: false,
        }
    }

    /// Replace the payload of a failed call with a caller-supplied default.
    ///
    /// The error is kept so the UI can still show a retry affordance.
    pub fn or_fallback(mut self, fallback: T) -> Self {
        if !self.succeeded {
            self.data = Some(fallback);
            self.used_fallback = true;
        }
        self
    }

    pub fn is_schema_error(&self) -> bool {
        self.error.as_ref().is_some_and(CallError::is_schema_error)
    }

    pub fn is_network_error(&self) -> bool {
        self.error.as_ref().is_some_and(CallError::is_network_error)
    }

    /// Convert into a plain `Result`, treating a null payload as `None`.
    pub fn into_result(self) -> Result<Option<T>, CallError> {
        match self.error {
            Some(error) if !self.succeeded => Err(error),
            _ => Ok(self.data),
        }
    }
}

/// Row-level change kinds a channel can be filtered on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ChangeEvent {
    /// Every change kind.
    #[default]
    All,
    Insert,
    Update,
    Delete,
}

impl ChangeEvent {
    /// Wire name used by the change-feed transport.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeEvent::All => "*",
            ChangeEvent::Insert => "INSERT",
            ChangeEvent::Update => "UPDATE",
            ChangeEvent::Delete => "DELETE",
        }
    }
}

/// Row filter for one change-feed subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeFilter {
    /// Database schema, usually `public`.
    pub schema: String,
    /// Table name.
    pub table: String,
    /// Change kinds to deliver.
    pub event: ChangeEvent,
    /// Optional row filter, for example `conversation_id=eq.42`.
    pub filter: Option<String>,
}

/// One row-level change delivered by the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangePayload {
    /// Schema of the changed table.
    pub schema: String,
    /// Changed table.
    pub table: String,
    /// Kind of change (never `All`).
    pub event: ChangeEvent,
    /// Row after the change (inserts and updates).
    pub new: Option<Value>,
    /// Row before the change (updates and deletes, when replicated).
    pub old: Option<Value>,
    /// Commit timestamp as reported by the backend.
    pub commit_timestamp: Option<String>,
}

/// Status signals emitted by the change-feed transport for one channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportStatus {
    Subscribed,
    Closed,
    ChannelError,
}

/// Lifecycle of a channel registration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelState {
    /// Opening the transport subscription.
    Connecting,
    /// The transport confirmed the subscription.
    Connected,
    /// The transport dropped the subscription; a reconnect may be pending.
    Disconnected,
    /// Reconnect attempts were exhausted.
    Failed,
    /// Explicitly unsubscribed.
    Closed,
}

/// Immutable snapshot produced by one diagnostics probe run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticsReport {
    /// Overall verdict of the schema-health procedure.
    pub schema_healthy: bool,
    /// Per-component flags reported by the schema-health procedure.
    pub per_feature_flags: BTreeMap<String, bool>,
    /// `false` only when the RPC surface itself is missing.
    pub rpc_available: bool,
    /// `true` when at least one channel is connected.
    pub realtime_connected: bool,
    /// Most relevant failure observed while probing.
    pub last_error: Option<CallError>,
    /// Probe time in milliseconds since Unix epoch.
    pub checked_at_ms: u64,
}

/// Observability events published by the channel registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RealtimeEvent {
    /// A channel moved to a new lifecycle state.
    ChannelState {
        /// Channel name.
        channel: String,
        /// New state.
        state: ChannelState,
    },
    /// A channel gave up reconnecting.
    ChannelFailed {
        /// Channel name.
        channel: String,
        /// Human-readable failure description.
        message: String,
    },
}
