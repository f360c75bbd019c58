//! Persistent event socket to the chat platform.
//!
//! The connector fetches a fresh socket URL for every attempt, acks each event
//! frame as soon as it arrives and forwards message events to the router over
//! a `flume` channel. Routing never blocks the receive loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{ConnectionState, StateCell};
use crate::error::BridgeError;
use crate::lark_api::LarkClient;
use crate::stats::BridgeStats;
use crate::timing::Backoff;

pub const MESSAGE_RECEIVE_EVENT: &str = "im.message.receive_v1";

/// Where the connector gets a socket URL for each connection attempt.
#[async_trait]
pub trait SocketUrlSource: Send + Sync {
    async fn socket_url(&self) -> Result<String, BridgeError>;
}

#[async_trait]
impl SocketUrlSource for LarkClient {
    async fn socket_url(&self) -> Result<String, BridgeError> {
        self.fetch_socket_url().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub key: String,
    pub open_id: Option<String>,
    pub name: String,
}

/// A "message received" event, built per frame and dropped after routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub event_id: String,
    pub event_type: String,
    pub message_id: String,
    pub message_type: String,
    pub raw_content: String,
    pub mentions: Vec<Mention>,
    pub sender_id: String,
    pub sender_type: String,
    pub chat_id: String,
    pub chat_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketFrame {
    Pong,
    Event {
        event_id: String,
        event_type: String,
        payload: Value,
    },
    Other,
}

#[derive(Deserialize)]
struct WireFrame {
    #[serde(rename = "type", default)]
    frame_type: Option<String>,
    #[serde(default)]
    header: Option<WireHeader>,
    #[serde(default)]
    event: Option<Value>,
}

#[derive(Deserialize)]
struct WireHeader {
    event_id: String,
    event_type: String,
}

#[derive(Deserialize)]
struct WireMessageEvent {
    #[serde(default)]
    sender: WireSender,
    message: WireMessage,
}

#[derive(Deserialize, Default)]
struct WireSender {
    #[serde(default)]
    sender_id: WireUserId,
    #[serde(default)]
    sender_type: String,
}

#[derive(Deserialize, Default)]
struct WireUserId {
    open_id: Option<String>,
    user_id: Option<String>,
    union_id: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    message_id: String,
    #[serde(default)]
    chat_id: String,
    #[serde(default)]
    chat_type: String,
    #[serde(default)]
    message_type: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    mentions: Vec<WireMention>,
}

#[derive(Deserialize)]
struct WireMention {
    key: String,
    #[serde(default)]
    id: WireUserId,
    #[serde(default)]
    name: String,
}

pub fn parse_frame(text: &str) -> Result<SocketFrame, BridgeError> {
    let frame: WireFrame = serde_json::from_str(text)
        .map_err(|e| BridgeError::Parse(format!("socket frame: {}", e)))?;

    if frame.frame_type.as_deref() == Some("pong") {
        return Ok(SocketFrame::Pong);
    }

    match frame.header {
        Some(header) => Ok(SocketFrame::Event {
            event_id: header.event_id,
            event_type: header.event_type,
            payload: frame.event.unwrap_or(Value::Null),
        }),
        None => Ok(SocketFrame::Other),
    }
}

pub fn parse_message_event(
    event_id: &str,
    event_type: &str,
    payload: Value,
) -> Result<InboundEvent, BridgeError> {
    let wire: WireMessageEvent = serde_json::from_value(payload)
        .map_err(|e| BridgeError::Parse(format!("message event {}: {}", event_id, e)))?;

    let sender_id = wire
        .sender
        .sender_id
        .open_id
        .or(wire.sender.sender_id.user_id)
        .or(wire.sender.sender_id.union_id)
        .unwrap_or_default();

    Ok(InboundEvent {
        event_id: event_id.to_string(),
        event_type: event_type.to_string(),
        message_id: wire.message.message_id,
        message_type: wire.message.message_type,
        raw_content: wire.message.content,
        mentions: wire
            .message
            .mentions
            .into_iter()
            .map(|m| Mention {
                key: m.key,
                open_id: m.id.open_id,
                name: m.name,
            })
            .collect(),
        sender_id,
        sender_type: wire.sender.sender_type,
        chat_id: wire.message.chat_id,
        chat_type: wire.message.chat_type,
    })
}

fn ack_frame(event_id: &str) -> Message {
    Message::Text(serde_json::json!({ "type": "ack", "event_id": event_id }).to_string())
}

fn ping_frame() -> Message {
    Message::Text(serde_json::json!({ "type": "ping" }).to_string())
}

#[derive(Debug, Clone)]
pub struct LarkSocketOptions {
    pub heartbeat_interval: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for LarkSocketOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
        }
    }
}

pub struct LarkSocket {
    urls: Arc<dyn SocketUrlSource>,
    events: flume::Sender<InboundEvent>,
    stats: Arc<BridgeStats>,
    options: LarkSocketOptions,
    state: StateCell,
    running: AtomicBool,
}

impl LarkSocket {
    pub fn new(
        urls: Arc<dyn SocketUrlSource>,
        events: flume::Sender<InboundEvent>,
        stats: Arc<BridgeStats>,
        options: LarkSocketOptions,
    ) -> Self {
        Self {
            urls,
            events,
            stats,
            options,
            state: StateCell::new("chat"),
            running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Start the connect/reconnect loop. Returns `None` if it is already running.
    pub fn spawn(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Chat socket loop already running; ignoring second start");
            return None;
        }
        let this = self.clone();
        Some(tokio::spawn(async move { this.run_forever().await }))
    }

    async fn run_forever(&self) {
        let mut backoff = Backoff::new(self.options.reconnect_initial, self.options.reconnect_max);
        loop {
            self.state.set(ConnectionState::Connecting);
            match self.connect_once(&mut backoff).await {
                Ok(()) => tracing::info!("Chat socket closed by peer"),
                Err(error) => tracing::warn!("Chat socket failed: {}", error),
            }
            self.state.set(ConnectionState::Disconnected);

            let delay = backoff.next_delay();
            tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting chat socket");
            sleep(delay).await;
        }
    }

    async fn connect_once(&self, backoff: &mut Backoff) -> Result<(), BridgeError> {
        let url = self.urls.socket_url().await?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| BridgeError::Connection(format!("chat socket connect: {}", e)))?;

        self.state.set(ConnectionState::Connected);
        tracing::info!("Chat socket connected");
        // Only a frame from the peer resets the backoff, not the handshake.
        let mut healthy = false;

        let (mut write, mut read) = stream.split();
        let period = self.options.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    write
                        .send(ping_frame())
                        .await
                        .map_err(|e| BridgeError::Connection(format!("chat socket ping: {}", e)))?;
                }
                message = read.next() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    let message = message
                        .map_err(|e| BridgeError::Connection(format!("chat socket read: {}", e)))?;
                    if !healthy && !matches!(message, Message::Close(_)) {
                        healthy = true;
                        backoff.reset();
                    }
                    let text = match message {
                        Message::Text(text) => text,
                        Message::Binary(bytes) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => {
                                self.stats.record_malformed();
                                continue;
                            }
                        },
                        Message::Close(_) => return Ok(()),
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    };

                    if let Some(ack) = self.handle_frame(&text) {
                        write
                            .send(ack)
                            .await
                            .map_err(|e| BridgeError::Connection(format!("chat socket ack: {}", e)))?;
                    }
                }
            }
        }
    }

    /// Classify one text frame, forward message events, and return the ack to send.
    fn handle_frame(&self, text: &str) -> Option<Message> {
        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(error) => {
                self.stats.record_malformed();
                tracing::debug!("Dropping chat socket frame: {}", error);
                return None;
            }
        };

        match frame {
            SocketFrame::Pong => {
                tracing::trace!("Chat socket pong");
                None
            }
            SocketFrame::Other => None,
            SocketFrame::Event {
                event_id,
                event_type,
                payload,
            } => {
                if event_type == MESSAGE_RECEIVE_EVENT {
                    match parse_message_event(&event_id, &event_type, payload) {
                        Ok(event) => {
                            self.stats.record_event();
                            if self.events.send(event).is_err() {
                                tracing::warn!(event_id = %event_id, "Router channel closed; event dropped");
                            }
                        }
                        Err(error) => {
                            self.stats.record_malformed();
                            tracing::debug!(event_id = %event_id, "Dropping event: {}", error);
                        }
                    }
                } else {
                    tracing::debug!(event_id = %event_id, event_type = %event_type, "Ignoring event type");
                }
                Some(ack_frame(&event_id))
            }
        }
    }
}
