//! Persistent socket to the local agent backend.
//!
//! Many logical requests share one connection. Each call registers a pending
//! entry keyed by its request id; the entry is removed exactly once, either by
//! a terminal frame from the backend or by its deadline timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::connection::{ConnectionState, StateCell};
use crate::error::BridgeError;
use crate::router::AgentBackend;
use crate::stats::BridgeStats;
use crate::timing::DelayedAction;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

type Outcome = Result<String, BridgeError>;

struct PendingRequest {
    tx: oneshot::Sender<Outcome>,
    deadline: Option<DelayedAction>,
}

/// Correlation table for in-flight backend requests.
#[derive(Clone)]
pub struct PendingTable {
    inner: Arc<Mutex<HashMap<String, PendingRequest>>>,
    timeout: Duration,
}

impl PendingTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Register `request_id` and arm its deadline. Must run inside a tokio runtime.
    pub fn register(&self, request_id: &str) -> Result<oneshot::Receiver<Outcome>, BridgeError> {
        let mut table = lock(&self.inner);
        if table.contains_key(request_id) {
            return Err(BridgeError::Backend(format!(
                "request id {} is already in flight",
                request_id
            )));
        }

        let (tx, rx) = oneshot::channel();
        let weak: Weak<Mutex<HashMap<String, PendingRequest>>> = Arc::downgrade(&self.inner);
        let id = request_id.to_string();
        let timeout = self.timeout;
        let deadline = DelayedAction::schedule(timeout, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let expired = lock(&inner).remove(&id);
            if let Some(entry) = expired {
                tracing::warn!(request_id = %id, "Agent backend request timed out");
                let _ = entry.tx.send(Err(BridgeError::BackendTimeout(timeout)));
            }
        });

        table.insert(
            request_id.to_string(),
            PendingRequest {
                tx,
                deadline: Some(deadline),
            },
        );
        Ok(rx)
    }

    /// Deliver the terminal outcome for `request_id`. Returns `false` when no
    /// live entry exists (already resolved, timed out, or never issued).
    pub fn resolve(&self, request_id: &str, outcome: Outcome) -> bool {
        let Some(entry) = lock(&self.inner).remove(request_id) else {
            return false;
        };
        if let Some(deadline) = entry.deadline {
            deadline.cancel();
        }
        let _ = entry.tx.send(outcome);
        true
    }

    /// Drop an entry without delivering anything.
    pub fn cancel(&self, request_id: &str) -> bool {
        match lock(&self.inner).remove(request_id) {
            Some(entry) => {
                if let Some(deadline) = entry.deadline {
                    deadline.cancel();
                }
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, request_id: &str) -> bool {
        lock(&self.inner).contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Millisecond timestamp plus 48 random bits.
pub fn new_request_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("req-{}-{}", Utc::now().timestamp_millis(), &random[..12])
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'static str,
    request_id: &'a str,
    agent_id: &'a str,
    user_id: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundFrame {
    #[serde(default)]
    request_id: Option<String>,
    #[serde(rename = "type", default)]
    frame_type: String,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

fn value_text(value: Option<Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(Value::Object(map)) => match map.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => Value::Object(map).to_string(),
        },
        Some(other) => other.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct AgentSocketOptions {
    pub url: String,
    pub agent_id: String,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
}

pub struct AgentSocket {
    options: AgentSocketOptions,
    pending: PendingTable,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    state: StateCell,
    stats: Arc<BridgeStats>,
    running: AtomicBool,
}

impl AgentSocket {
    pub fn new(options: AgentSocketOptions, stats: Arc<BridgeStats>) -> Self {
        Self {
            pending: PendingTable::new(options.request_timeout),
            options,
            outbound: Mutex::new(None),
            state: StateCell::new("agent"),
            stats,
            running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Start the connect/reconnect loop. Returns `None` if it is already running.
    pub fn spawn(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Agent socket loop already running; ignoring second start");
            return None;
        }
        let this = self.clone();
        Some(tokio::spawn(async move { this.run_forever().await }))
    }

    async fn run_forever(&self) {
        loop {
            self.state.set(ConnectionState::Connecting);
            match self.connect_once().await {
                Ok(()) => tracing::info!("Agent socket closed by peer"),
                Err(error) => tracing::warn!("Agent socket failed: {}", error),
            }
            lock(&self.outbound).take();
            self.state.set(ConnectionState::Disconnected);

            // In-flight requests are left to their own deadlines.
            if !self.pending.is_empty() {
                tracing::info!(
                    pending = self.pending.len(),
                    "Agent socket down with requests in flight"
                );
            }
            sleep(self.options.reconnect_delay).await;
        }
    }

    async fn connect_once(&self) -> Result<(), BridgeError> {
        let (stream, _) = connect_async(self.options.url.as_str())
            .await
            .map_err(|e| BridgeError::Connection(format!("agent socket connect: {}", e)))?;
        let (mut write, mut read) = stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel();
        *lock(&self.outbound) = Some(tx);
        self.state.set(ConnectionState::Connected);
        tracing::info!(url = %self.options.url, "Agent socket connected");

        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    let Some(message) = outgoing else {
                        return Ok(());
                    };
                    write
                        .send(message)
                        .await
                        .map_err(|e| BridgeError::Connection(format!("agent socket write: {}", e)))?;
                }
                incoming = read.next() => {
                    let Some(message) = incoming else {
                        return Ok(());
                    };
                    match message
                        .map_err(|e| BridgeError::Connection(format!("agent socket read: {}", e)))?
                    {
                        Message::Text(text) => self.handle_inbound(&text),
                        Message::Binary(bytes) => {
                            if let Ok(text) = String::from_utf8(bytes) {
                                self.handle_inbound(&text);
                            }
                        }
                        Message::Close(_) => return Ok(()),
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    fn handle_inbound(&self, text: &str) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(error) => {
                self.stats.record_uncorrelated();
                tracing::debug!("Dropping unreadable agent frame: {}", error);
                return;
            }
        };

        let Some(request_id) = frame.request_id else {
            self.stats.record_uncorrelated();
            tracing::debug!(frame_type = %frame.frame_type, "Dropping agent frame without requestId");
            return;
        };

        let outcome = match frame.frame_type.as_str() {
            "response" | "complete" => Ok(value_text(frame.content)),
            "error" => {
                let message = value_text(frame.error);
                Err(BridgeError::Backend(if message.is_empty() {
                    "unknown error".to_string()
                } else {
                    message
                }))
            }
            other => {
                if !self.pending.contains(&request_id) {
                    self.stats.record_uncorrelated();
                }
                tracing::trace!(request_id = %request_id, frame_type = other, "Non-terminal agent frame");
                return;
            }
        };

        if !self.pending.resolve(&request_id, outcome) {
            self.stats.record_uncorrelated();
            tracing::debug!(request_id = %request_id, "Dropping frame for unknown or finished request");
        }
    }

    /// Send one message to the backend and wait for its reply.
    pub async fn send(&self, text: &str, user_id: &str) -> Result<String, BridgeError> {
        let sender = lock(&self.outbound)
            .clone()
            .ok_or_else(|| BridgeError::Connection("agent backend is not connected".to_string()))?;

        let request_id = new_request_id();
        let frame = serde_json::to_string(&OutboundFrame {
            frame_type: "message",
            request_id: &request_id,
            agent_id: &self.options.agent_id,
            user_id,
            content: text,
        })
        .map_err(|e| BridgeError::Backend(format!("failed to encode request: {}", e)))?;

        let rx = self.pending.register(&request_id)?;
        if sender.send(Message::Text(frame)).is_err() {
            self.pending.cancel(&request_id);
            return Err(BridgeError::Connection(
                "agent backend connection closed".to_string(),
            ));
        }
        tracing::debug!(request_id = %request_id, "Dispatched message to agent backend");

        rx.await.map_err(|_| {
            BridgeError::Connection(format!("request {} was abandoned", request_id))
        })?
    }
}

#[async_trait]
impl AgentBackend for AgentSocket {
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && lock(&self.outbound).is_some()
    }

    async fn send(&self, text: &str, user_id: &str) -> Result<String, BridgeError> {
        AgentSocket::send(self, text, user_id).await
    }
}
