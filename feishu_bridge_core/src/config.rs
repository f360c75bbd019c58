use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    // Feishu / Lark app identity
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default)]
    pub app_secret_file: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub bot_open_id: Option<String>,
    #[serde(default)]
    pub allowed_chat_ids: Vec<String>,
    #[serde(default = "default_processing_emoji")]
    pub processing_emoji: String,
    #[serde(default = "default_reply_max_chars")]
    pub reply_max_chars: usize,

    // Chat socket
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_reconnect_initial_secs")]
    pub reconnect_initial_secs: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    #[serde(default = "default_token_refresh_margin_secs")]
    pub token_refresh_margin_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,

    // Agent backend
    #[serde(default = "default_agent_ws_url")]
    pub agent_ws_url: String,
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default = "default_agent_request_timeout_secs")]
    pub agent_request_timeout_secs: u64,
    #[serde(default = "default_agent_reconnect_delay_secs")]
    pub agent_reconnect_delay_secs: u64,

    // Direct-call fallback (OpenAI-compatible)
    #[serde(default = "default_fallback_api_url")]
    pub fallback_api_url: String,
    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,
    #[serde(default)]
    pub fallback_api_key: Option<String>,
    #[serde(default)]
    pub fallback_system_prompt: Option<String>,
}

/// Mandatory chat-platform identity, validated at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub app_id: String,
    pub app_secret: String,
}

fn default_base_url() -> String {
    "https://open.feishu.cn".to_string()
}

fn default_processing_emoji() -> String {
    "OnIt".to_string()
}

fn default_reply_max_chars() -> usize {
    4000
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_reconnect_initial_secs() -> u64 {
    1
}

fn default_reconnect_max_secs() -> u64 {
    60
}

fn default_token_refresh_margin_secs() -> u64 {
    300
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_dedup_ttl_secs() -> u64 {
    300
}

fn default_agent_ws_url() -> String {
    "ws://127.0.0.1:18789".to_string()
}

fn default_agent_id() -> String {
    "main".to_string()
}

fn default_agent_request_timeout_secs() -> u64 {
    120
}

fn default_agent_reconnect_delay_secs() -> u64 {
    5
}

fn default_fallback_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_fallback_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: None,
            app_secret_file: None,
            base_url: default_base_url(),
            bot_open_id: None,
            allowed_chat_ids: Vec::new(),
            processing_emoji: default_processing_emoji(),
            reply_max_chars: default_reply_max_chars(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            reconnect_initial_secs: default_reconnect_initial_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
            token_refresh_margin_secs: default_token_refresh_margin_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            agent_ws_url: default_agent_ws_url(),
            agent_id: default_agent_id(),
            agent_request_timeout_secs: default_agent_request_timeout_secs(),
            agent_reconnect_delay_secs: default_agent_reconnect_delay_secs(),
            fallback_api_url: default_fallback_api_url(),
            fallback_model: default_fallback_model(),
            fallback_api_key: None,
            fallback_system_prompt: None,
        }
    }
}

impl BridgeConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Config file path: `FEISHU_BRIDGE_CONFIG`, else `feishu_bridge.toml` next to the executable.
    pub fn config_path() -> PathBuf {
        match env::var("FEISHU_BRIDGE_CONFIG") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path.trim()),
            _ => Self::get_base_dir().join("feishu_bridge.toml"),
        }
    }

    /// Load the config file (if any), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {:?}", path))?;
            let config = Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config {:?}", path))?;
            tracing::info!("Loaded config from {:?}", path);
            config
        } else {
            tracing::info!("No config file at {:?}, using defaults + env vars", path);
            Self::default()
        };

        config.apply_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str::<BridgeConfig>(contents).context("Invalid bridge config TOML")
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(id) = non_empty("FEISHU_APP_ID") {
            self.app_id = id;
        }

        if let Some(secret) = non_empty("FEISHU_APP_SECRET") {
            self.app_secret = Some(secret);
        }

        if let Some(path) = non_empty("FEISHU_APP_SECRET_FILE") {
            self.app_secret_file = Some(path);
        }

        if let Some(url) = non_empty("FEISHU_BASE_URL") {
            self.base_url = url;
        }

        if let Some(open_id) = non_empty("FEISHU_BOT_OPEN_ID") {
            self.bot_open_id = Some(open_id);
        }

        if let Some(chats) = non_empty("FEISHU_ALLOWED_CHAT_IDS") {
            self.allowed_chat_ids = chats
                .split(',')
                .map(str::trim)
                .filter(|chat| !chat.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(emoji) = non_empty("FEISHU_PROCESSING_EMOJI") {
            self.processing_emoji = emoji;
        }

        if let Some(url) = non_empty("AGENT_WS_URL") {
            self.agent_ws_url = url;
        }

        if let Some(agent_id) = non_empty("AGENT_ID") {
            self.agent_id = agent_id;
        }

        if let Some(secs) = non_empty("AGENT_REQUEST_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.agent_request_timeout_secs = secs;
            }
        }

        if let Some(secs) = non_empty("AGENT_RECONNECT_DELAY_SECS") {
            if let Ok(secs) = secs.parse() {
                self.agent_reconnect_delay_secs = secs;
            }
        }

        if let Some(url) = non_empty("FALLBACK_API_URL") {
            self.fallback_api_url = url;
        }

        if let Some(model) = non_empty("FALLBACK_MODEL") {
            self.fallback_model = model;
        }

        if let Some(key) = non_empty("FALLBACK_API_KEY") {
            self.fallback_api_key = Some(key);
        }

        if let Some(prompt) = non_empty("FALLBACK_SYSTEM_PROMPT") {
            self.fallback_system_prompt = Some(prompt);
        }
    }

    /// Validate the app id and secret. The inline secret wins over `app_secret_file`.
    pub fn resolve_identity(&self) -> Result<AppIdentity> {
        let app_id = self.app_id.trim();
        if app_id.is_empty() {
            bail!("FEISHU_APP_ID is not set");
        }

        let inline = self
            .app_secret
            .as_deref()
            .map(str::trim)
            .filter(|secret| !secret.is_empty());

        let app_secret = match (inline, self.app_secret_file.as_deref()) {
            (Some(secret), _) => secret.to_string(),
            (None, Some(path)) => {
                let secret = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read app secret file {}", path))?;
                let secret = secret.trim();
                if secret.is_empty() {
                    bail!("App secret file {} is empty", path);
                }
                secret.to_string()
            }
            (None, None) => bail!("FEISHU_APP_SECRET (or FEISHU_APP_SECRET_FILE) is not set"),
        };

        Ok(AppIdentity {
            app_id: app_id.to_string(),
            app_secret,
        })
    }

    pub fn fallback_key(&self) -> Option<&str> {
        self.fallback_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_secs(self.reconnect_initial_secs)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }

    pub fn token_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn agent_request_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_request_timeout_secs)
    }

    pub fn agent_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.agent_reconnect_delay_secs)
    }
}
