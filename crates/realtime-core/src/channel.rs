use tokio::sync::broadcast;

use crate::types::RealtimeEvent;

/// Broadcast stream type used by realtime event subscribers.
pub type EventStream = broadcast::Receiver<RealtimeEvent>;

/// Fan-out of registry events to any number of observers.
#[derive(Clone, Debug)]
pub struct RealtimeEvents {
    event_tx: broadcast::Sender<RealtimeEvent>,
}

impl RealtimeEvents {
    pub fn new(event_buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to emitted events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: RealtimeEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Default for RealtimeEvents {
    fn default() -> Self {
        Self::new(256)
    }
}
