use async_trait::async_trait;
use realtime_core::{ChangeFilter, ChangePayload, TransportError, TransportStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Error payload as returned by the remote procedure backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcErrorPayload {
    pub code: String,
    pub message: String,
    pub hint: Option<String>,
}

impl RpcErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            hint: None,
        }
    }
}

/// Raw response of one remote procedure invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RpcResponse {
    pub data: Option<Value>,
    pub error: Option<RpcErrorPayload>,
}

impl RpcResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: RpcErrorPayload) -> Self {
        Self {
            data: None,
            error: Some(error),
        }
    }
}

/// Remote procedure backend.
///
/// Implementations report every failure inside the response; dropping the
/// returned future cancels the in-flight request.
#[async_trait]
pub trait RpcBackend: Send + Sync + 'static {
    async fn invoke(&self, procedure: &str, params: Value) -> RpcResponse;
}

/// Opaque identifier of one open transport subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportHandle(pub u64);

/// Message delivered on an open transport subscription, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    Status(TransportStatus),
    Change(ChangePayload),
}

/// An open transport subscription.
///
/// The transport ending the `messages` stream is treated as `Closed`.
#[derive(Debug)]
pub struct TransportChannel {
    pub handle: TransportHandle,
    pub messages: mpsc::Receiver<TransportMessage>,
}

/// Publish/subscribe change-feed transport keyed by channel name and filter.
#[async_trait]
pub trait ChangeFeedTransport: Send + Sync + 'static {
    async fn open_channel(
        &self,
        name: &str,
        filter: &ChangeFilter,
    ) -> Result<TransportChannel, TransportError>;

    /// Tear down a subscription. Must be safe to call on a handle the
    /// transport already considers closed.
    async fn close_channel(&self, handle: TransportHandle);
}

/// Transport with no change feed, for tools that only need RPC.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisconnectedTransport;

#[async_trait]
impl ChangeFeedTransport for DisconnectedTransport {
    async fn open_channel(
        &self,
        name: &str,
        _filter: &ChangeFilter,
    ) -> Result<TransportChannel, TransportError> {
        Err(TransportError::Open {
            channel: name.to_owned(),
            reason: "no change-feed transport configured".to_owned(),
        })
    }

    async fn close_channel(&self, _handle: TransportHandle) {}
}
