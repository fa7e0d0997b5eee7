use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use realtime_core::{CallError, CallErrorCategory, CallResult, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{sync::oneshot, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::safe_call::{CallOptions, SafeCaller};

pub const PRESENCE_DEBOUNCE: Duration = Duration::from_millis(5_000);
pub const READ_RECEIPT_DEBOUNCE: Duration = Duration::from_millis(2_000);

/// Destination of coalesced writes.
#[async_trait]
pub trait CoalesceSink: Send + Sync + 'static {
    type Value: Send + 'static;

    async fn write(&self, key: &str, value: Self::Value) -> Result<(), CallError>;
}

/// How a writer treats failed writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Failures are logged at debug level and never observable by callers.
    BestEffort,
    /// Failures are logged and reported through acks.
    Report,
}

struct PendingEntry<V> {
    generation: u64,
    value: V,
    scheduled_at: Instant,
    ack: Option<oneshot::Sender<bool>>,
    cancel: CancellationToken,
}

struct WriterInner<S: CoalesceSink> {
    name: &'static str,
    sink: S,
    window: Duration,
    policy: FailurePolicy,
    pending: Mutex<HashMap<String, PendingEntry<S::Value>>>,
    next_generation: AtomicU64,
}

impl<S: CoalesceSink> WriterInner<S> {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingEntry<S::Value>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the entry for `key` if it still belongs to `generation`.
    fn claim(&self, key: &str, generation: u64) -> Option<PendingEntry<S::Value>> {
        let mut pending = self.pending();
        match pending.get(key) {
            Some(entry) if entry.generation == generation => pending.remove(key),
            _ => None,
        }
    }

    async fn write(&self, key: String, entry: PendingEntry<S::Value>) {
        let waited_ms = entry.scheduled_at.elapsed().as_millis() as u64;
        let written = match self.sink.write(&key, entry.value).await {
            Ok(()) => {
                trace!(writer = self.name, %key, waited_ms, "coalesced write done");
                true
            }
            Err(err) => {
                match self.policy {
                    FailurePolicy::BestEffort => {
                        debug!(writer = self.name, %key, error = %err, "best-effort write failed")
                    }
                    FailurePolicy::Report => {
                        warn!(writer = self.name, %key, error = %err, "coalesced write failed")
                    }
                }
                false
            }
        };

        if let Some(ack) = entry.ack {
            let outcome = match self.policy {
                FailurePolicy::BestEffort => true,
                FailurePolicy::Report => written,
            };
            let _ = ack.send(outcome);
        }
    }
}

/// Debounces writes per key: only the latest value scheduled within the
/// window is written, once, when the window elapses.
///
/// Scheduling spawns a timer task and therefore needs a Tokio runtime.
pub struct CoalescedWriter<S: CoalesceSink> {
    inner: Arc<WriterInner<S>>,
}

impl<S: CoalesceSink> Clone for CoalescedWriter<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: CoalesceSink> CoalescedWriter<S> {
    pub fn new(name: &'static str, sink: S, window: Duration, policy: FailurePolicy) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                name,
                sink,
                window,
                policy,
                pending: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    pub fn policy(&self) -> FailurePolicy {
        self.inner.policy
    }

    /// Schedule `value` for `key`, replacing any pending value for it.
    pub fn schedule(&self, key: impl Into<String>, value: S::Value) {
        self.enqueue(key.into(), value, None);
    }

    /// Like `schedule`, returning a receiver for the write outcome.
    ///
    /// The receiver errors if a newer value for the same key supersedes
    /// this one before it is written.
    pub fn schedule_with_ack(
        &self,
        key: impl Into<String>,
        value: S::Value,
    ) -> oneshot::Receiver<bool> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(key.into(), value, Some(ack_tx));
        ack_rx
    }

    fn enqueue(&self, key: String, value: S::Value, ack: Option<oneshot::Sender<bool>>) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let entry = PendingEntry {
            generation,
            value,
            scheduled_at: Instant::now(),
            ack,
            cancel: cancel.clone(),
        };
        if let Some(previous) = self.inner.pending().insert(key.clone(), entry) {
            previous.cancel.cancel();
            trace!(writer = self.inner.name, %key, "superseded pending write");
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(inner.window) => {}
            }
            if let Some(entry) = inner.claim(&key, generation) {
                inner.write(key, entry).await;
            }
        });
    }

    /// Write every pending entry now and wait for the writes to finish.
    ///
    /// Entries are written in the order they were scheduled.
    pub async fn flush(&self) {
        let mut drained: Vec<_> = self.inner.pending().drain().collect();
        if drained.is_empty() {
            return;
        }
        debug!(writer = self.inner.name, count = drained.len(), "flushing pending writes");

        drained.sort_by_key(|(_, entry)| (entry.scheduled_at, entry.generation));
        for (_, entry) in &drained {
            entry.cancel.cancel();
        }
        for (key, entry) in drained {
            self.inner.write(key, entry).await;
        }
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending().len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.inner.pending().contains_key(key)
    }
}

/// "User is viewing this conversation" signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub conversation_id: String,
    pub user_id: String,
    pub is_viewing: bool,
}

/// "User has read up to this message" acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadReceipt {
    pub conversation_id: String,
    pub user_id: String,
    pub last_read_message_id: Option<String>,
}

/// Writes presence with a single call and no retry.
pub struct PresenceSink {
    caller: SafeCaller,
    procedure: String,
}

impl PresenceSink {
    pub fn new(caller: SafeCaller, procedure: impl Into<String>) -> Self {
        Self {
            caller,
            procedure: procedure.into(),
        }
    }
}

#[async_trait]
impl CoalesceSink for PresenceSink {
    type Value = PresenceUpdate;

    async fn write(&self, _key: &str, value: PresenceUpdate) -> Result<(), CallError> {
        let params = encode_params(&self.procedure, &value)?;
        let result: CallResult<Value> = self
            .caller
            .call(&self.procedure, params, &CallOptions::default())
            .await;
        result.into_result().map(|_| ())
    }
}

/// Writes read receipts through the retrying call path.
pub struct ReadReceiptSink {
    caller: SafeCaller,
    procedure: String,
    retry: RetryPolicy,
}

impl ReadReceiptSink {
    pub fn new(caller: SafeCaller, procedure: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            caller,
            procedure: procedure.into(),
            retry,
        }
    }
}

#[async_trait]
impl CoalesceSink for ReadReceiptSink {
    type Value = ReadReceipt;

    async fn write(&self, _key: &str, value: ReadReceipt) -> Result<(), CallError> {
        let params = encode_params(&self.procedure, &value)?;
        let result: CallResult<Value> = self
            .caller
            .call_with_retry(&self.procedure, params, self.retry, &CallOptions::default())
            .await;
        result.into_result().map(|_| ())
    }
}

pub type PresenceWriter = CoalescedWriter<PresenceSink>;
pub type ReadReceiptWriter = CoalescedWriter<ReadReceiptSink>;

impl PresenceWriter {
    /// Best-effort presence writer keyed by conversation.
    pub fn presence(sink: PresenceSink, window: Duration) -> Self {
        Self::new("presence", sink, window, FailurePolicy::BestEffort)
    }

    pub fn update(&self, update: PresenceUpdate) {
        self.schedule(update.conversation_id.clone(), update);
    }
}

impl ReadReceiptWriter {
    /// Reported read-receipt writer keyed by conversation.
    pub fn read_receipts(sink: ReadReceiptSink, window: Duration) -> Self {
        Self::new("read_receipts", sink, window, FailurePolicy::Report)
    }

    pub fn mark_read(&self, receipt: ReadReceipt) -> oneshot::Receiver<bool> {
        self.schedule_with_ack(receipt.conversation_id.clone(), receipt)
    }
}

fn encode_params<T: Serialize>(procedure: &str, value: &T) -> Result<Value, CallError> {
    serde_json::to_value(value).map_err(|err| {
        CallError::new(
            CallErrorCategory::Unknown,
            "ENCODE_ERROR",
            format!("failed to encode parameters of '{procedure}': {err}"),
        )
    })
}
