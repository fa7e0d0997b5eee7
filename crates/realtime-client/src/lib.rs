//! Resilient coordination layer between a messaging UI and its backend.
//!
//! The crate wraps remote procedure calls so they never fail past their
//! boundary, keeps realtime change-feed channels alive with bounded
//! reconnects, coalesces high-frequency presence and read-receipt writes and
//! probes backend health on demand.

/// Backend and change-feed transport contracts.
pub mod backend;
/// Keyed debounce writers for presence and read receipts.
pub mod coalesce;
/// Environment-backed client configuration.
pub mod config;
/// On-demand schema and connectivity diagnostics.
pub mod diagnostics;
/// PostgREST-style HTTP implementation of the backend contract.
pub mod http;
/// Named realtime channels with reconnect and handler isolation.
pub mod registry;
/// Non-throwing remote calls with timeout, cancellation and retry.
pub mod safe_call;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use realtime_core::{EventStream, RealtimeEvents};
use tracing::info;

pub use backend::{
    ChangeFeedTransport, DisconnectedTransport, RpcBackend, RpcErrorPayload, RpcResponse,
    TransportChannel, TransportHandle, TransportMessage,
};
pub use coalesce::{
    CoalesceSink, CoalescedWriter, FailurePolicy, PresenceSink, PresenceUpdate, PresenceWriter,
    ReadReceipt, ReadReceiptSink, ReadReceiptWriter,
};
pub use config::{ClientConfig, ConfigError};
pub use diagnostics::{DiagnosticsProbe, format_report};
pub use http::{HttpBackendError, HttpRpcBackend};
pub use registry::{ChannelHandler, ChannelRegistry, SubscribeOptions, Subscription};
pub use safe_call::{CallOptions, SafeCaller};

/// Root object owning every coordination service of one session.
pub struct RealtimeClient {
    config: ClientConfig,
    caller: SafeCaller,
    channels: ChannelRegistry,
    presence: PresenceWriter,
    read_receipts: ReadReceiptWriter,
    diagnostics: DiagnosticsProbe,
}

impl RealtimeClient {
    pub fn new(
        config: ClientConfig,
        backend: Arc<dyn RpcBackend>,
        transport: Arc<dyn ChangeFeedTransport>,
    ) -> Self {
        let caller = SafeCaller::with_default_timeout(backend, config.rpc_timeout);
        let channels = ChannelRegistry::new(transport, RealtimeEvents::default());

        let presence = PresenceWriter::presence(
            PresenceSink::new(caller.clone(), config.presence_procedure.clone()),
            config.presence_debounce,
        );
        let read_receipts = ReadReceiptWriter::read_receipts(
            ReadReceiptSink::new(
                caller.clone(),
                config.mark_read_procedure.clone(),
                config.rpc_retry,
            ),
            config.read_receipt_debounce,
        );
        let diagnostics = DiagnosticsProbe::new(caller.clone(), channels.clone()).with_procedures(
            config.schema_health_procedure.clone(),
            config.overview_procedure.clone(),
        );

        Self {
            config,
            caller,
            channels,
            presence,
            read_receipts,
            diagnostics,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn caller(&self) -> &SafeCaller {
        &self.caller
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn presence(&self) -> &PresenceWriter {
        &self.presence
    }

    pub fn read_receipts(&self) -> &ReadReceiptWriter {
        &self.read_receipts
    }

    pub fn diagnostics(&self) -> &DiagnosticsProbe {
        &self.diagnostics
    }

    pub fn events(&self) -> EventStream {
        self.channels.events()
    }

    /// Subscription options for `table` using the configured reconnect policy.
    pub fn subscribe_options(&self, table: impl Into<String>) -> SubscribeOptions {
        SubscribeOptions::new(table).with_retry(self.config.channel_retry)
    }

    /// Flush pending writes, then close every channel.
    pub async fn shutdown(&self) {
        self.presence.flush().await;
        self.read_receipts.flush().await;
        self.channels.unsubscribe_all().await;
        info!("realtime client shut down");
    }
}
