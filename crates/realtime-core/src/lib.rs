//! Core types shared by the realtime coordination layer.
//!
//! This crate defines call results and error classification, the linear
//! retry policy, change-feed payload types, the channel lifecycle model and
//! the registry event stream.

/// Broadcast stream of registry events.
pub mod channel;
/// Call errors and schema/network classification.
pub mod error;
/// Linear backoff policy used by call retries and channel reconnects.
pub mod retry;
/// Channel lifecycle state machine.
pub mod state_machine;
/// Call results, change-feed payloads and diagnostics snapshots.
pub mod types;

pub use channel::{EventStream, RealtimeEvents};
pub use error::{
    CallError, CallErrorCategory, ChannelError, HandlerError, TransportError, classify_error,
};
pub use retry::RetryPolicy;
pub use state_machine::ChannelStateMachine;
pub use types::{
    CallResult, ChangeEvent, ChangeFilter, ChangePayload, ChannelState, DiagnosticsReport,
    RealtimeEvent, TransportStatus,
};
