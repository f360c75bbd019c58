use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::agent_socket::{AgentSocket, AgentSocketOptions};
use crate::auth::CredentialManager;
use crate::config::{AppIdentity, BridgeConfig};
use crate::dedup::DedupStore;
use crate::fallback::CompletionClient;
use crate::http_client::build_http_client;
use crate::lark_api::{LarkClient, TenantTokenSource};
use crate::lark_socket::{InboundEvent, LarkSocket, LarkSocketOptions};
use crate::router::{MessageRouter, RouterOptions};
use crate::stats::{BridgeStats, StatsSnapshot};

/// Every long-lived component of the bridge, wired together but not yet
/// running.
pub struct BridgeRuntime {
    pub config: BridgeConfig,
    pub lark_socket: Arc<LarkSocket>,
    pub agent_socket: Arc<AgentSocket>,
    pub router: Arc<MessageRouter>,
    pub stats: Arc<BridgeStats>,
    events_rx: flume::Receiver<InboundEvent>,
}

impl BridgeRuntime {
    /// Build the component graph. Must be called inside a tokio runtime.
    pub fn bootstrap(config: BridgeConfig, identity: AppIdentity) -> Result<Self> {
        let http = build_http_client(config.http_timeout())
            .context("failed to build HTTP client")?;
        let stats = Arc::new(BridgeStats::new());

        let token_source = Arc::new(TenantTokenSource::new(
            http.clone(),
            &config.base_url,
            identity,
        ));
        let credentials = Arc::new(CredentialManager::new(
            token_source,
            config.token_refresh_margin(),
        ));
        let lark = Arc::new(LarkClient::new(http.clone(), &config.base_url, credentials));

        let (events_tx, events_rx) = flume::unbounded();
        let lark_socket = Arc::new(LarkSocket::new(
            lark.clone(),
            events_tx,
            stats.clone(),
            LarkSocketOptions {
                heartbeat_interval: config.heartbeat_interval(),
                reconnect_initial: config.reconnect_initial(),
                reconnect_max: config.reconnect_max(),
            },
        ));

        let agent_socket = Arc::new(AgentSocket::new(
            AgentSocketOptions {
                url: config.agent_ws_url.clone(),
                agent_id: config.agent_id.clone(),
                request_timeout: config.agent_request_timeout(),
                reconnect_delay: config.agent_reconnect_delay(),
            },
            stats.clone(),
        ));

        let fallback = Arc::new(CompletionClient::new(
            http,
            &config.fallback_api_url,
            config.fallback_key().map(str::to_string),
            config.fallback_model.clone(),
            config.fallback_system_prompt.clone(),
        ));
        if !fallback.is_configured() {
            tracing::warn!(
                "No fallback API key set; messages will get a configuration notice while the agent backend is offline"
            );
        }

        let router = Arc::new(MessageRouter::new(
            lark,
            agent_socket.clone(),
            fallback,
            DedupStore::new(config.dedup_ttl()),
            stats.clone(),
            RouterOptions {
                processing_emoji: config.processing_emoji.clone(),
                bot_open_id: config.bot_open_id.clone(),
                allowed_chat_ids: config.allowed_chat_ids.clone(),
                reply_max_chars: config.reply_max_chars,
            },
        ));

        Ok(Self {
            config,
            lark_socket,
            agent_socket,
            router,
            stats,
            events_rx,
        })
    }

    /// Start both connectors and the router, then wait for Ctrl-C.
    pub async fn run_until_shutdown(self) -> Result<StatsSnapshot> {
        let tasks = self.start();

        tracing::info!(
            "Bridge running (platform: {}, agent backend: {})",
            self.config.base_url,
            self.config.agent_ws_url
        );

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::info!("Shutdown requested");

        for task in tasks {
            task.abort();
        }

        let snapshot = self.stats.snapshot();
        tracing::info!(
            events = snapshot.events_received,
            duplicates = snapshot.duplicates_dropped,
            malformed = snapshot.malformed_dropped,
            uncorrelated = snapshot.uncorrelated_frames,
            backend = snapshot.backend_dispatches,
            fallback = snapshot.fallback_dispatches,
            reply_failures = snapshot.reply_failures,
            "Bridge stopped"
        );
        Ok(snapshot)
    }

    fn start(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(4);
        tasks.extend(self.agent_socket.spawn());
        tasks.extend(self.lark_socket.spawn());
        tasks.push(self.router.clone().spawn(self.events_rx.clone()));
        tasks.push(self.watch_backend_state());
        tasks
    }

    fn watch_backend_state(&self) -> JoinHandle<()> {
        let mut rx = self.agent_socket.subscribe_state();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                tracing::info!("Agent backend is {}", state);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;

    #[tokio::test]
    async fn bootstrap_wires_components_disconnected() {
        let mut config = BridgeConfig::default();
        config.app_id = "cli_test".to_string();
        config.app_secret = Some("secret".to_string());
        let identity = config.resolve_identity().unwrap();

        let runtime = BridgeRuntime::bootstrap(config, identity).unwrap();
        assert_eq!(runtime.lark_socket.state(), ConnectionState::Disconnected);
        assert_eq!(runtime.agent_socket.state(), ConnectionState::Disconnected);
        assert_eq!(runtime.stats.snapshot(), StatsSnapshot::default());
    }
}
