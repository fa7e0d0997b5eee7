//! In-crate fakes of the backend and the change-feed transport.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use realtime_core::{
    ChangeEvent, ChangeFilter, ChangePayload, ChannelError, HandlerError, TransportError,
    TransportStatus,
};
use serde_json::{Value, json};
use tokio::{sync::mpsc, time::Instant};

use crate::{
    backend::{
        ChangeFeedTransport, RpcBackend, RpcResponse, TransportChannel, TransportHandle,
        TransportMessage,
    },
    registry::ChannelHandler,
};

/// Backend answering from a script, one response per call.
///
/// Once the script runs out every call answers with a null payload.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<RpcResponse>>,
    calls: Mutex<Vec<(String, Value, Instant)>>,
    routes: Mutex<HashMap<String, RpcResponse>>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<RpcResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
            routes: Mutex::new(HashMap::new()),
        })
    }

    /// Backend answering by procedure name, ignoring the script.
    pub fn routed(routes: Vec<(&str, RpcResponse)>) -> Arc<Self> {
        let backend = Self::new(Vec::new());
        backend.routes.lock().expect("routes lock").extend(
            routes
                .into_iter()
                .map(|(name, response)| (name.to_owned(), response)),
        );
        backend
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(name, _, _)| name.clone())
            .collect()
    }

    pub fn params(&self) -> Vec<Value> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(_, params, _)| params.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    /// Time between consecutive calls.
    pub fn gaps(&self) -> Vec<Duration> {
        let calls = self.calls.lock().expect("calls lock");
        calls
            .windows(2)
            .map(|pair| pair[1].2.duration_since(pair[0].2))
            .collect()
    }
}

#[async_trait]
impl RpcBackend for ScriptedBackend {
    async fn invoke(&self, procedure: &str, params: Value) -> RpcResponse {
        self.calls
            .lock()
            .expect("calls lock")
            .push((procedure.to_owned(), params, Instant::now()));

        if let Some(response) = self.routes.lock().expect("routes lock").get(procedure) {
            return response.clone();
        }

        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| RpcResponse::ok(Value::Null))
    }
}

/// Backend whose calls never complete.
pub struct HangingBackend;

#[async_trait]
impl RpcBackend for HangingBackend {
    async fn invoke(&self, _procedure: &str, _params: Value) -> RpcResponse {
        std::future::pending::<()>().await;
        RpcResponse::default()
    }
}

/// What the fake transport does when a channel is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenBehavior {
    /// Open and immediately report `Subscribed`.
    Subscribe,
    /// Open and immediately report `ChannelError`.
    ChannelError,
    /// Refuse to open.
    Fail,
}

#[derive(Default)]
struct FakeTransportState {
    log: Vec<String>,
    opened_at: Vec<(String, Instant)>,
    live: HashMap<u64, (String, mpsc::Sender<TransportMessage>)>,
    script: VecDeque<OpenBehavior>,
}

/// Scriptable in-memory change-feed transport.
pub struct FakeTransport {
    state: Mutex<FakeTransportState>,
    default_behavior: OpenBehavior,
    next_handle: AtomicU64,
}

impl FakeTransport {
    pub fn new(default_behavior: OpenBehavior) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeTransportState::default()),
            default_behavior,
            next_handle: AtomicU64::new(1),
        })
    }

    /// Behaviors used for the next opens before falling back to the default.
    pub fn script(&self, behaviors: Vec<OpenBehavior>) {
        self.state
            .lock()
            .expect("transport lock")
            .script
            .extend(behaviors);
    }

    /// `open:<name>` / `close:<name>` entries in call order.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().expect("transport lock").log.clone()
    }

    pub fn open_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .expect("transport lock")
            .opened_at
            .iter()
            .filter(|(opened, _)| opened == name)
            .count()
    }

    /// Time between consecutive opens of `name`.
    pub fn open_gaps(&self, name: &str) -> Vec<Duration> {
        let state = self.state.lock().expect("transport lock");
        let times: Vec<Instant> = state
            .opened_at
            .iter()
            .filter(|(opened, _)| opened == name)
            .map(|(_, at)| *at)
            .collect();
        times
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]))
            .collect()
    }

    /// Subscriptions opened but not yet closed.
    pub fn live_count(&self) -> usize {
        self.state.lock().expect("transport lock").live.len()
    }

    /// Deliver a message on every live subscription named `name`.
    pub fn push(&self, name: &str, message: TransportMessage) {
        let senders: Vec<_> = self
            .state
            .lock()
            .expect("transport lock")
            .live
            .values()
            .filter(|(live_name, _)| live_name == name)
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in senders {
            let _ = tx.try_send(message.clone());
        }
    }
}

#[async_trait]
impl ChangeFeedTransport for FakeTransport {
    async fn open_channel(
        &self,
        name: &str,
        _filter: &ChangeFilter,
    ) -> Result<TransportChannel, TransportError> {
        let mut state = self.state.lock().expect("transport lock");
        state.log.push(format!("open:{name}"));
        state.opened_at.push((name.to_owned(), Instant::now()));
        let behavior = state.script.pop_front().unwrap_or(self.default_behavior);

        if behavior == OpenBehavior::Fail {
            return Err(TransportError::Open {
                channel: name.to_owned(),
                reason: "refused".to_owned(),
            });
        }

        let (tx, rx) = mpsc::channel(64);
        let status = match behavior {
            OpenBehavior::ChannelError => TransportStatus::ChannelError,
            _ => TransportStatus::Subscribed,
        };
        let _ = tx.try_send(TransportMessage::Status(status));

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        state.live.insert(id, (name.to_owned(), tx));
        Ok(TransportChannel {
            handle: TransportHandle(id),
            messages: rx,
        })
    }

    async fn close_channel(&self, handle: TransportHandle) {
        let mut state = self.state.lock().expect("transport lock");
        if let Some((name, _)) = state.live.remove(&handle.0) {
            state.log.push(format!("close:{name}"));
        }
    }
}

#[derive(Default)]
struct HandlerLog {
    payloads: Vec<Value>,
    connects: usize,
    disconnects: usize,
    errors: Vec<ChannelError>,
}

/// Channel handler recording every callback.
///
/// Payloads whose `new` row has `"fail": true` return an error and rows with
/// `"panic": true` panic.
#[derive(Default)]
pub struct RecordingHandler {
    log: Mutex<HandlerLog>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.log.lock().expect("handler lock").payloads.clone()
    }

    pub fn connects(&self) -> usize {
        self.log.lock().expect("handler lock").connects
    }

    pub fn disconnects(&self) -> usize {
        self.log.lock().expect("handler lock").disconnects
    }

    pub fn errors(&self) -> Vec<ChannelError> {
        self.log.lock().expect("handler lock").errors.clone()
    }
}

impl ChannelHandler for RecordingHandler {
    fn on_payload(&self, payload: ChangePayload) -> Result<(), HandlerError> {
        let row = payload.new.unwrap_or(Value::Null);
        if row.get("panic") == Some(&Value::Bool(true)) {
            panic!("handler blew up on {row}");
        }
        if row.get("fail") == Some(&Value::Bool(true)) {
            return Err(HandlerError::new("rejected row"));
        }
        self.log.lock().expect("handler lock").payloads.push(row);
        Ok(())
    }

    fn on_connect(&self) {
        self.log.lock().expect("handler lock").connects += 1;
    }

    fn on_disconnect(&self) {
        self.log.lock().expect("handler lock").disconnects += 1;
    }

    fn on_error(&self, error: &ChannelError) {
        self.log.lock().expect("handler lock").errors.push(error.clone());
    }
}

/// Insert payload on the `messages` table carrying `row`.
pub fn insert(row: Value) -> TransportMessage {
    TransportMessage::Change(ChangePayload {
        schema: "public".into(),
        table: "messages".into(),
        event: ChangeEvent::Insert,
        new: Some(row),
        old: None,
        commit_timestamp: None,
    })
}

pub fn message_row(id: u64) -> Value {
    json!({ "id": id })
}

/// Let spawned tasks run without firing timers further than `ms` away.
pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Timer deadlines round to whole milliseconds; allow for that.
pub fn approx_ms(actual: Duration, expected_ms: u64) -> bool {
    actual.as_millis().abs_diff(u128::from(expected_ms)) <= 2
}
