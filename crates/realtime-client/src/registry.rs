use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use realtime_core::{
    ChangeEvent, ChangeFilter, ChangePayload, ChannelError, ChannelState, ChannelStateMachine,
    EventStream, HandlerError, RealtimeEvent, RealtimeEvents, RetryPolicy, TransportStatus,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{ChangeFeedTransport, TransportChannel, TransportMessage};

/// Receiver of events for one channel.
///
/// Callbacks run on the channel's driver task and must return quickly.
/// Errors and panics are logged and never end the subscription.
pub trait ChannelHandler: Send + Sync + 'static {
    fn on_payload(&self, payload: ChangePayload) -> Result<(), HandlerError>;

    fn on_connect(&self) {}

    fn on_disconnect(&self) {}

    /// Called once when reconnection is abandoned.
    fn on_error(&self, _error: &ChannelError) {}
}

/// Filter and reconnect settings for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub schema: String,
    pub table: String,
    pub event: ChangeEvent,
    pub filter: Option<String>,
    pub retry: RetryPolicy,
}

impl SubscribeOptions {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            schema: "public".to_owned(),
            table: table.into(),
            event: ChangeEvent::All,
            filter: None,
            retry: RetryPolicy::for_channels(),
        }
    }

    pub fn with_event(mut self, event: ChangeEvent) -> Self {
        self.event = event;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn change_filter(&self) -> ChangeFilter {
        ChangeFilter {
            schema: self.schema.clone(),
            table: self.table.clone(),
            event: self.event,
            filter: self.filter.clone(),
        }
    }
}

struct Registration {
    id: u64,
    name: String,
    connected: AtomicBool,
    lifecycle: Mutex<ChannelStateMachine>,
    stop: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    events: RealtimeEvents,
}

impl Registration {
    fn state(&self) -> ChannelState {
        lock(&self.lifecycle).state()
    }

    fn set_state(&self, next: ChannelState) {
        let accepted = lock(&self.lifecycle).transition(next);
        match accepted {
            Ok(state) => self.events.emit(RealtimeEvent::ChannelState {
                channel: self.name.clone(),
                state,
            }),
            Err(err) => debug!(channel = %self.name, error = %err, "ignored channel transition"),
        }
    }

    /// Stop the driver and wait until its transport subscription is closed.
    async fn shutdown(&self) {
        self.stop.cancel();

        let mut task = self.task.lock().await;
        if let Some(handle) = task.take()
            && let Err(err) = handle.await
        {
            error!(channel = %self.name, error = %err, "channel driver ended abnormally");
        }

        self.connected.store(false, Ordering::SeqCst);
        if self.state() != ChannelState::Closed {
            self.set_state(ChannelState::Closed);
        }
    }
}

struct RegistryInner {
    transport: Arc<dyn ChangeFeedTransport>,
    entries: Mutex<HashMap<String, Arc<Registration>>>,
    subscribe_lock: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
    events: RealtimeEvents,
}

impl RegistryInner {
    fn remove_if_current(&self, name: &str, id: u64) -> bool {
        let mut entries = lock(&self.entries);
        if entries.get(name).is_some_and(|reg| reg.id == id) {
            entries.remove(name);
            true
        } else {
            false
        }
    }
}

/// Owner of every change-feed subscription, at most one per channel name.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl ChannelRegistry {
    pub fn new(transport: Arc<dyn ChangeFeedTransport>, events: RealtimeEvents) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                transport,
                entries: Mutex::new(HashMap::new()),
                subscribe_lock: tokio::sync::Mutex::new(()),
                next_id: AtomicU64::new(1),
                events,
            }),
        }
    }

    /// Subscribe `handler` to `name`, replacing any existing registration.
    ///
    /// The previous registration is fully torn down before the new one
    /// opens its transport subscription.
    pub async fn subscribe(
        &self,
        name: impl Into<String>,
        options: SubscribeOptions,
        handler: Arc<dyn ChannelHandler>,
    ) -> Subscription {
        let name = name.into();
        let _guard = self.inner.subscribe_lock.lock().await;

        let previous = lock(&self.inner.entries).remove(&name);
        if let Some(previous) = previous {
            debug!(channel = %name, "replacing existing channel registration");
            previous.shutdown().await;
        }

        let registration = Arc::new(Registration {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.clone(),
            connected: AtomicBool::new(false),
            lifecycle: Mutex::new(ChannelStateMachine::default()),
            stop: CancellationToken::new(),
            task: tokio::sync::Mutex::new(None),
            events: self.inner.events.clone(),
        });
        self.inner.events.emit(RealtimeEvent::ChannelState {
            channel: name.clone(),
            state: ChannelState::Connecting,
        });

        let driver = ChannelDriver {
            registration: registration.clone(),
            transport: self.inner.transport.clone(),
            filter: options.change_filter(),
            retry: options.retry,
            handler,
        };
        let task = tokio::spawn(driver.run());
        *registration.task.lock().await = Some(task);

        lock(&self.inner.entries).insert(name, registration.clone());

        Subscription {
            registration,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Tear down the registration under `name`. Returns `false` if none existed.
    pub async fn unsubscribe(&self, name: &str) -> bool {
        let removed = lock(&self.inner.entries).remove(name);
        match removed {
            Some(registration) => {
                registration.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Tear down every registration.
    pub async fn unsubscribe_all(&self) {
        let _guard = self.inner.subscribe_lock.lock().await;
        let drained: Vec<_> = lock(&self.inner.entries).drain().map(|(_, reg)| reg).collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "closing all channels");
        }
        for registration in drained {
            registration.shutdown().await;
        }
    }

    /// `true` when at least one registration is connected.
    pub fn any_connected(&self) -> bool {
        lock(&self.inner.entries)
            .values()
            .any(|reg| reg.connected.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self, name: &str) -> bool {
        lock(&self.inner.entries)
            .get(name)
            .is_some_and(|reg| reg.connected.load(Ordering::SeqCst))
    }

    pub fn state(&self, name: &str) -> Option<ChannelState> {
        lock(&self.inner.entries).get(name).map(|reg| reg.state())
    }

    /// Registered channel names, sorted.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.inner.entries).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to channel lifecycle events.
    pub fn events(&self) -> EventStream {
        self.inner.events.subscribe()
    }
}

/// Caller's handle on one channel registration.
pub struct Subscription {
    registration: Arc<Registration>,
    registry: Weak<RegistryInner>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.registration.name
    }

    pub fn is_connected(&self) -> bool {
        self.registration.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ChannelState {
        self.registration.state()
    }

    /// Close the subscription. Idempotent.
    ///
    /// Returns once the transport subscription is closed. A registration
    /// that was already replaced under the same name leaves its successor
    /// untouched.
    pub async fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if_current(&self.registration.name, self.registration.id);
        }
        self.registration.shutdown().await;
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.registration.name)
            .field("state", &self.state())
            .finish()
    }
}

enum PumpEnd {
    Stopped,
    Disconnected(String),
}

struct ChannelDriver {
    registration: Arc<Registration>,
    transport: Arc<dyn ChangeFeedTransport>,
    filter: ChangeFilter,
    retry: RetryPolicy,
    handler: Arc<dyn ChannelHandler>,
}

impl ChannelDriver {
    async fn run(self) {
        let name = self.registration.name.clone();
        let stop = self.registration.stop.clone();
        let mut attempt: u32 = 0;

        loop {
            let opened = tokio::select! {
                _ = stop.cancelled() => return,
                opened = self.transport.open_channel(&name, &self.filter) => opened,
            };

            let reason = match opened {
                Ok(channel) => match self.pump(channel, &mut attempt).await {
                    PumpEnd::Stopped => return,
                    PumpEnd::Disconnected(reason) => reason,
                },
                Err(err) => err.to_string(),
            };

            self.registration.connected.store(false, Ordering::SeqCst);
            self.registration.set_state(ChannelState::Disconnected);
            guarded(&name, "on_disconnect", || {
                self.handler.on_disconnect();
                Ok(())
            });

            if !self.retry.allows_retry(attempt) {
                let failure = ChannelError::RetriesExhausted {
                    channel: name.clone(),
                    attempts: attempt,
                    last_reason: reason,
                };
                warn!(channel = %name, error = %failure, "channel reconnection exhausted");
                self.registration.set_state(ChannelState::Failed);
                self.registration.events.emit(RealtimeEvent::ChannelFailed {
                    channel: name.clone(),
                    message: failure.to_string(),
                });
                guarded(&name, "on_error", || {
                    self.handler.on_error(&failure);
                    Ok(())
                });
                return;
            }

            attempt += 1;
            let delay = self.retry.delay_for_attempt(attempt);
            info!(
                channel = %name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                %reason,
                "channel disconnected, scheduling reconnect"
            );

            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            self.registration.set_state(ChannelState::Connecting);
        }
    }

    /// Deliver messages until the transport drops the channel or the
    /// registration is stopped, then close the transport subscription.
    async fn pump(&self, mut channel: TransportChannel, attempt: &mut u32) -> PumpEnd {
        let name = &self.registration.name;
        let stop = &self.registration.stop;

        let end = loop {
            let message = tokio::select! {
                _ = stop.cancelled() => break PumpEnd::Stopped,
                message = channel.messages.recv() => message,
            };

            match message {
                Some(TransportMessage::Change(payload)) => {
                    guarded(name, "on_payload", || self.handler.on_payload(payload));
                }
                Some(TransportMessage::Status(TransportStatus::Subscribed)) => {
                    *attempt = 0;
                    self.registration.connected.store(true, Ordering::SeqCst);
                    self.registration.set_state(ChannelState::Connected);
                    debug!(channel = %name, "channel connected");
                    guarded(name, "on_connect", || {
                        self.handler.on_connect();
                        Ok(())
                    });
                }
                Some(TransportMessage::Status(TransportStatus::Closed)) => {
                    break PumpEnd::Disconnected("transport closed the channel".to_owned());
                }
                Some(TransportMessage::Status(TransportStatus::ChannelError)) => {
                    break PumpEnd::Disconnected("transport reported a channel error".to_owned());
                }
                None => break PumpEnd::Disconnected("transport stream ended".to_owned()),
            }
        };

        self.transport.close_channel(channel.handle).await;
        end
    }
}

/// Run a handler callback, containing both returned errors and panics.
fn guarded<F>(channel: &str, hook: &'static str, callback: F)
where
    F: FnOnce() -> Result<(), HandlerError>,
{
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(channel, hook, error = %err, "channel handler failed"),
        Err(_) => error!(channel, hook, "channel handler panicked"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
