//! Routes chat events to the agent backend (or the direct-call fallback) and
//! posts the answer back as a reply to the original message.
//!
//! Every event that passes the dedup and filter checks ends in a reply: the
//! agent's answer, or an error message describing why there is none.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::dedup::DedupStore;
use crate::error::BridgeError;
use crate::lark_socket::{InboundEvent, Mention};
use crate::stats::BridgeStats;

pub const NON_TEXT_REPLY: &str = "Sorry, I can only handle text messages for now.";
pub const EMPTY_AGENT_REPLY: &str = "(the agent returned an empty reply)";

// ─── Seams ───────────────────────────────────────────────────────────────────

/// Outbound chat platform calls.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn reply_text(&self, message_id: &str, text: &str) -> Result<(), BridgeError>;
    async fn add_reaction(&self, message_id: &str, emoji_type: &str) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn send(&self, text: &str, user_id: &str) -> Result<String, BridgeError>;
}

#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, text: &str) -> Result<String, BridgeError>;
}

// ─── Router ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub processing_emoji: String,
    pub bot_open_id: Option<String>,
    pub allowed_chat_ids: Vec<String>,
    pub reply_max_chars: usize,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            processing_emoji: "OnIt".to_string(),
            bot_open_id: None,
            allowed_chat_ids: Vec::new(),
            reply_max_chars: 4000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPath {
    Backend,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Duplicate,
    ChatNotAllowed,
    UnsupportedType,
    Malformed,
    Empty,
    Replied(DispatchPath),
    ErrorReplied(DispatchPath),
    ReplyFailed,
}

#[derive(Deserialize)]
struct TextContent {
    text: String,
}

pub struct MessageRouter {
    chat: Arc<dyn ChatApi>,
    backend: Arc<dyn AgentBackend>,
    fallback: Arc<dyn Completion>,
    dedup: DedupStore,
    stats: Arc<BridgeStats>,
    options: RouterOptions,
}

impl MessageRouter {
    pub fn new(
        chat: Arc<dyn ChatApi>,
        backend: Arc<dyn AgentBackend>,
        fallback: Arc<dyn Completion>,
        dedup: DedupStore,
        stats: Arc<BridgeStats>,
        options: RouterOptions,
    ) -> Self {
        Self {
            chat,
            backend,
            fallback,
            dedup,
            stats,
            options,
        }
    }

    /// Consume events until the channel closes, handling each in its own task.
    pub fn spawn(self: Arc<Self>, events: flume::Receiver<InboundEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                let router = self.clone();
                tokio::spawn(async move {
                    let message_id = event.message_id.clone();
                    let outcome = router.handle(event).await;
                    tracing::debug!(message_id = %message_id, ?outcome, "Message handled");
                });
            }
            tracing::info!("Router event channel closed");
        })
    }

    pub async fn handle(&self, event: InboundEvent) -> RouteOutcome {
        let message_id = event.message_id.as_str();

        if !self.dedup.check_and_mark(message_id) {
            self.stats.record_duplicate();
            tracing::debug!(message_id, event_id = %event.event_id, "Dropping redelivered message");
            return RouteOutcome::Duplicate;
        }

        if !self.options.allowed_chat_ids.is_empty()
            && !self.options.allowed_chat_ids.contains(&event.chat_id)
        {
            tracing::debug!(message_id, chat_id = %event.chat_id, "Ignoring message from chat outside allow-list");
            return RouteOutcome::ChatNotAllowed;
        }

        if event.message_type != "text" {
            tracing::info!(message_id, message_type = %event.message_type, "Unsupported message type");
            return match self.reply(message_id, NON_TEXT_REPLY).await {
                Ok(()) => RouteOutcome::UnsupportedType,
                Err(()) => RouteOutcome::ReplyFailed,
            };
        }

        let text = match extract_text(&event.raw_content) {
            Ok(text) => text,
            Err(error) => {
                self.stats.record_malformed();
                tracing::warn!(message_id, "Dropping message: {}", error);
                return RouteOutcome::Malformed;
            }
        };

        let text = strip_mentions(&text, &event.mentions, self.options.bot_open_id.as_deref());
        if text.is_empty() {
            tracing::debug!(message_id, "Message is empty after removing mentions");
            return RouteOutcome::Empty;
        }

        tracing::info!(
            message_id,
            sender = %event.sender_id,
            chars = text.chars().count(),
            "Routing message"
        );

        // Best effort: a failed reaction never blocks the reply.
        if let Err(error) = self
            .chat
            .add_reaction(message_id, &self.options.processing_emoji)
            .await
        {
            tracing::debug!(message_id, "Processing reaction failed: {}", error);
        }

        let (path, result) = if self.backend.is_connected() {
            self.stats.record_backend_dispatch();
            (
                DispatchPath::Backend,
                self.backend.send(&text, &event.sender_id).await,
            )
        } else {
            self.stats.record_fallback_dispatch();
            tracing::info!(message_id, "Agent backend offline; using direct-call fallback");
            (DispatchPath::Fallback, self.fallback.complete(&text).await)
        };

        let (reply, outcome) = match result {
            Ok(reply) if reply.trim().is_empty() => {
                (EMPTY_AGENT_REPLY.to_string(), RouteOutcome::Replied(path))
            }
            Ok(reply) => (reply, RouteOutcome::Replied(path)),
            Err(error) => {
                tracing::warn!(message_id, ?path, "Dispatch failed: {}", error);
                (error.user_message(), RouteOutcome::ErrorReplied(path))
            }
        };

        let reply = truncate_chars(&reply, self.options.reply_max_chars);
        match self.reply(message_id, &reply).await {
            Ok(()) => outcome,
            Err(()) => RouteOutcome::ReplyFailed,
        }
    }

    async fn reply(&self, message_id: &str, text: &str) -> Result<(), ()> {
        match self.chat.reply_text(message_id, text).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.stats.record_reply_failure();
                tracing::error!(message_id, "Failed to send reply: {}", error);
                Err(())
            }
        }
    }
}

/// Pull the text out of a text message's JSON content.
pub fn extract_text(raw_content: &str) -> Result<String, BridgeError> {
    serde_json::from_str::<TextContent>(raw_content)
        .map(|content| content.text)
        .map_err(|e| BridgeError::Parse(format!("text content: {}", e)))
}

/// Remove mentions of the bot from `text`. Without a known bot id every
/// mention is treated as addressing the bot; otherwise other mentions are
/// rendered as `@name`.
pub fn strip_mentions(text: &str, mentions: &[Mention], bot_open_id: Option<&str>) -> String {
    // Longest keys first: `@_user_1` is a prefix of `@_user_10`.
    let mut ordered: Vec<&Mention> = mentions.iter().filter(|m| !m.key.is_empty()).collect();
    ordered.sort_by(|a, b| b.key.len().cmp(&a.key.len()));

    let mut stripped = text.to_string();
    for mention in ordered {
        let is_bot = match bot_open_id {
            None => true,
            Some(bot) => mention.open_id.as_deref() == Some(bot),
        };
        let replacement = if is_bot || mention.name.is_empty() {
            String::new()
        } else {
            format!("@{}", mention.name)
        };
        stripped = stripped.replace(&mention.key, &replacement);
    }
    stripped.trim().to_string()
}

/// Cut `text` to at most `max_chars` characters. Zero disables the limit.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FALLBACK_NOT_CONFIGURED;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MockChat {
        replies: Mutex<Vec<(String, String)>>,
        reactions: Mutex<Vec<(String, String)>>,
        fail_reactions: AtomicBool,
    }

    #[async_trait]
    impl ChatApi for MockChat {
        async fn reply_text(&self, message_id: &str, text: &str) -> Result<(), BridgeError> {
            self.replies
                .lock()
                .await
                .push((message_id.to_string(), text.to_string()));
            Ok(())
        }

        async fn add_reaction(&self, message_id: &str, emoji_type: &str) -> Result<(), BridgeError> {
            if self.fail_reactions.load(Ordering::SeqCst) {
                return Err(BridgeError::Platform {
                    code: 231001,
                    message: "reaction type is invalid".to_string(),
                });
            }
            self.reactions
                .lock()
                .await
                .push((message_id.to_string(), emoji_type.to_string()));
            Ok(())
        }
    }

    enum BackendBehavior {
        Echo(Duration),
        Fail(fn() -> BridgeError),
    }

    struct MockBackend {
        connected: AtomicBool,
        calls: AtomicUsize,
        received: Mutex<Vec<(String, String)>>,
        behavior: BackendBehavior,
    }

    impl MockBackend {
        fn new(connected: bool, behavior: BackendBehavior) -> Self {
            Self {
                connected: AtomicBool::new(connected),
                calls: AtomicUsize::new(0),
                received: Mutex::new(Vec::new()),
                behavior,
            }
        }
    }

    #[async_trait]
    impl AgentBackend for MockBackend {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn send(&self, text: &str, user_id: &str) -> Result<String, BridgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.received
                .lock()
                .await
                .push((text.to_string(), user_id.to_string()));
            match &self.behavior {
                BackendBehavior::Echo(delay) => {
                    tokio::time::sleep(*delay).await;
                    Ok(format!("agent: {}", text))
                }
                BackendBehavior::Fail(make) => Err(make()),
            }
        }
    }

    struct MockFallback {
        configured: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Completion for MockFallback {
        async fn complete(&self, text: &str) -> Result<String, BridgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.configured {
                return Err(BridgeError::fallback_not_configured());
            }
            Ok(format!("fallback: {}", text))
        }
    }

    struct Harness {
        router: Arc<MessageRouter>,
        chat: Arc<MockChat>,
        backend: Arc<MockBackend>,
        fallback: Arc<MockFallback>,
        stats: Arc<BridgeStats>,
    }

    fn harness(backend: MockBackend, fallback_configured: bool, options: RouterOptions) -> Harness {
        let chat = Arc::new(MockChat::default());
        let backend = Arc::new(backend);
        let fallback = Arc::new(MockFallback {
            configured: fallback_configured,
            calls: AtomicUsize::new(0),
        });
        let stats = Arc::new(BridgeStats::new());
        let router = Arc::new(MessageRouter::new(
            chat.clone(),
            backend.clone(),
            fallback.clone(),
            DedupStore::default(),
            stats.clone(),
            options,
        ));
        Harness {
            router,
            chat,
            backend,
            fallback,
            stats,
        }
    }

    fn text_event(message_id: &str, text: &str, mentions: Vec<Mention>) -> InboundEvent {
        InboundEvent {
            event_id: format!("ev_{}", message_id),
            event_type: "im.message.receive_v1".to_string(),
            message_id: message_id.to_string(),
            message_type: "text".to_string(),
            raw_content: serde_json::json!({ "text": text }).to_string(),
            mentions,
            sender_id: "ou_user".to_string(),
            sender_type: "user".to_string(),
            chat_id: "oc_chat".to_string(),
            chat_type: "group".to_string(),
        }
    }

    fn bot_mention(key: &str) -> Mention {
        Mention {
            key: key.to_string(),
            open_id: Some("ou_bot".to_string()),
            name: "bot".to_string(),
        }
    }

    #[test]
    fn strips_bot_mention() {
        let stripped = strip_mentions("@bot hello", &[bot_mention("@bot")], None);
        assert_eq!(stripped, "hello");
    }

    #[test]
    fn keeps_other_mentions_as_names_when_bot_is_known() {
        let mentions = vec![
            bot_mention("@_user_1"),
            Mention {
                key: "@_user_2".to_string(),
                open_id: Some("ou_alice".to_string()),
                name: "Alice".to_string(),
            },
        ];
        let stripped = strip_mentions("@_user_1 ask @_user_2 about it", &mentions, Some("ou_bot"));
        assert_eq!(stripped, "ask @Alice about it");
    }

    #[test]
    fn prefix_sharing_mention_keys_are_replaced_whole() {
        let mentions: Vec<Mention> = (1..=10)
            .map(|i| Mention {
                key: format!("@_user_{}", i),
                open_id: Some(if i == 1 {
                    "ou_bot".to_string()
                } else {
                    format!("ou_u{}", i)
                }),
                name: format!("U{}", i),
            })
            .collect();

        let stripped = strip_mentions("@_user_1 ping @_user_10", &mentions, Some("ou_bot"));
        assert_eq!(stripped, "ping @U10");

        let stripped = strip_mentions("@_user_10 @_user_1 hi @_user_2", &mentions, None);
        assert_eq!(stripped, "hi");
    }

    #[test]
    fn extract_text_rejects_non_text_payloads() {
        assert_eq!(extract_text(r#"{"text":"hi"}"#).unwrap(), "hi");
        assert!(extract_text(r#"{"image_key":"img_1"}"#).is_err());
        assert!(extract_text("{oops").is_err());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        assert_eq!(truncate_chars("héllo wörld", 5), "héll…");
        assert_eq!(truncate_chars("anything", 0), "anything");
    }

    #[tokio::test]
    async fn routes_mention_stripped_text_to_backend() {
        let h = harness(
            MockBackend::new(true, BackendBehavior::Echo(Duration::from_millis(50))),
            false,
            RouterOptions::default(),
        );

        let outcome = h
            .router
            .handle(text_event("om_1", "@bot hello", vec![bot_mention("@bot")]))
            .await;
        assert_eq!(outcome, RouteOutcome::Replied(DispatchPath::Backend));

        let received = h.backend.received.lock().await;
        assert_eq!(received.as_slice(), &[("hello".to_string(), "ou_user".to_string())]);

        let replies = h.chat.replies.lock().await;
        assert_eq!(replies.as_slice(), &[("om_1".to_string(), "agent: hello".to_string())]);

        let reactions = h.chat.reactions.lock().await;
        assert_eq!(reactions.as_slice(), &[("om_1".to_string(), "OnIt".to_string())]);
    }

    #[tokio::test]
    async fn redelivered_message_dispatches_once() {
        let h = harness(
            MockBackend::new(true, BackendBehavior::Echo(Duration::ZERO)),
            false,
            RouterOptions::default(),
        );

        let event = text_event("om_1", "hello", Vec::new());
        assert_eq!(
            h.router.handle(event.clone()).await,
            RouteOutcome::Replied(DispatchPath::Backend)
        );
        assert_eq!(h.router.handle(event).await, RouteOutcome::Duplicate);

        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.chat.replies.lock().await.len(), 1);
        assert_eq!(h.stats.snapshot().duplicates_dropped, 1);
    }

    #[tokio::test]
    async fn non_text_gets_apology() {
        let h = harness(
            MockBackend::new(true, BackendBehavior::Echo(Duration::ZERO)),
            false,
            RouterOptions::default(),
        );
        let mut event = text_event("om_img", "", Vec::new());
        event.message_type = "image".to_string();
        event.raw_content = r#"{"image_key":"img_v2_1"}"#.to_string();

        assert_eq!(h.router.handle(event).await, RouteOutcome::UnsupportedType);
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
        let replies = h.chat.replies.lock().await;
        assert_eq!(replies[0].1, NON_TEXT_REPLY);
    }

    #[tokio::test]
    async fn malformed_content_is_dropped_silently() {
        let h = harness(
            MockBackend::new(true, BackendBehavior::Echo(Duration::ZERO)),
            false,
            RouterOptions::default(),
        );
        let mut event = text_event("om_bad", "", Vec::new());
        event.raw_content = "{not json".to_string();

        assert_eq!(h.router.handle(event).await, RouteOutcome::Malformed);
        assert!(h.chat.replies.lock().await.is_empty());
        assert_eq!(h.stats.snapshot().malformed_dropped, 1);
    }

    #[tokio::test]
    async fn mention_only_message_is_dropped() {
        let h = harness(
            MockBackend::new(true, BackendBehavior::Echo(Duration::ZERO)),
            false,
            RouterOptions::default(),
        );
        let outcome = h
            .router
            .handle(text_event("om_1", " @_user_1  ", vec![bot_mention("@_user_1")]))
            .await;

        assert_eq!(outcome, RouteOutcome::Empty);
        assert!(h.chat.replies.lock().await.is_empty());
        assert!(h.chat.reactions.lock().await.is_empty());
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn offline_backend_without_fallback_key_replies_with_config_message() {
        let h = harness(
            MockBackend::new(false, BackendBehavior::Echo(Duration::ZERO)),
            false,
            RouterOptions::default(),
        );

        let outcome = h.router.handle(text_event("om_1", "hello", Vec::new())).await;
        assert_eq!(outcome, RouteOutcome::ErrorReplied(DispatchPath::Fallback));
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.fallback.calls.load(Ordering::SeqCst), 1);

        let replies = h.chat.replies.lock().await;
        assert_eq!(replies[0].1, FALLBACK_NOT_CONFIGURED);
    }

    #[tokio::test]
    async fn offline_backend_uses_fallback() {
        let h = harness(
            MockBackend::new(false, BackendBehavior::Echo(Duration::ZERO)),
            true,
            RouterOptions::default(),
        );

        let outcome = h.router.handle(text_event("om_1", "hello", Vec::new())).await;
        assert_eq!(outcome, RouteOutcome::Replied(DispatchPath::Fallback));
        assert_eq!(h.chat.replies.lock().await[0].1, "fallback: hello");
        assert_eq!(h.stats.snapshot().fallback_dispatches, 1);
    }

    #[tokio::test]
    async fn backend_timeout_is_reported_to_user() {
        let h = harness(
            MockBackend::new(
                true,
                BackendBehavior::Fail(|| BridgeError::BackendTimeout(Duration::from_secs(120))),
            ),
            true,
            RouterOptions::default(),
        );

        let outcome = h.router.handle(text_event("om_1", "hello", Vec::new())).await;
        assert_eq!(outcome, RouteOutcome::ErrorReplied(DispatchPath::Backend));
        let replies = h.chat.replies.lock().await;
        assert!(replies[0].1.contains("did not answer within 120s"));
        assert_eq!(h.fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_reaction_does_not_block_reply() {
        let h = harness(
            MockBackend::new(true, BackendBehavior::Echo(Duration::ZERO)),
            false,
            RouterOptions::default(),
        );
        h.chat.fail_reactions.store(true, Ordering::SeqCst);

        let outcome = h.router.handle(text_event("om_1", "hello", Vec::new())).await;
        assert_eq!(outcome, RouteOutcome::Replied(DispatchPath::Backend));
        assert_eq!(h.chat.replies.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn chats_outside_allow_list_are_ignored() {
        let options = RouterOptions {
            allowed_chat_ids: vec!["oc_other".to_string()],
            ..RouterOptions::default()
        };
        let h = harness(
            MockBackend::new(true, BackendBehavior::Echo(Duration::ZERO)),
            false,
            options,
        );

        let outcome = h.router.handle(text_event("om_1", "hello", Vec::new())).await;
        assert_eq!(outcome, RouteOutcome::ChatNotAllowed);
        assert!(h.chat.replies.lock().await.is_empty());
    }

    #[tokio::test]
    async fn spawned_router_handles_events_from_channel() {
        let h = harness(
            MockBackend::new(true, BackendBehavior::Echo(Duration::from_millis(20))),
            false,
            RouterOptions::default(),
        );
        let (tx, rx) = flume::unbounded();
        let handle = h.router.clone().spawn(rx);

        for i in 0..5 {
            tx.send(text_event(&format!("om_{}", i), "hi", Vec::new())).unwrap();
        }
        tx.send(text_event("om_0", "hi", Vec::new())).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if h.chat.replies.lock().await.len() == 5 && h.stats.snapshot().duplicates_dropped == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 5);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
