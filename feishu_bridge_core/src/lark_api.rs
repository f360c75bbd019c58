//! Feishu / Lark open platform REST calls used by the bridge.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{CredentialManager, IssuedToken, TokenSource};
use crate::config::AppIdentity;
use crate::error::BridgeError;
use crate::router::ChatApi;

const TOKEN_PATH: &str = "/open-apis/auth/v3/tenant_access_token/internal";
const SOCKET_ENDPOINT_PATH: &str = "/callback/ws/endpoint";

/// Platform codes meaning the bearer token was rejected.
const INVALID_TOKEN_CODES: [i64; 3] = [99991661, 99991663, 99991668];

#[derive(Debug, Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: Option<String>,
    #[serde(default)]
    expire: u64,
}

#[derive(Debug, Deserialize)]
struct PlatformEnvelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct SocketEndpoint {
    #[serde(rename = "URL", alias = "url")]
    url: String,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    app_id: &'a str,
    app_secret: &'a str,
}

/// Exchanges the app id/secret for a tenant access token.
pub struct TenantTokenSource {
    http: reqwest::Client,
    base_url: String,
    identity: AppIdentity,
}

impl TenantTokenSource {
    pub fn new(http: reqwest::Client, base_url: &str, identity: AppIdentity) -> Self {
        Self {
            http,
            base_url: normalize_base_url(base_url),
            identity,
        }
    }
}

#[async_trait]
impl TokenSource for TenantTokenSource {
    async fn exchange(&self) -> Result<IssuedToken, BridgeError> {
        let url = format!("{}{}", self.base_url, TOKEN_PATH);
        let response = self
            .http
            .post(&url)
            .json(&TokenRequest {
                app_id: &self.identity.app_id,
                app_secret: &self.identity.app_secret,
            })
            .send()
            .await
            .map_err(|e| BridgeError::Auth(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(BridgeError::Auth(format!("HTTP {}: {}", status, body)));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::Auth(format!("unreadable token response: {}", e)))?;

        if body.code != 0 {
            return Err(BridgeError::Auth(format!("code {}: {}", body.code, body.msg)));
        }

        let value = body
            .tenant_access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| BridgeError::Auth("response carried no token".to_string()))?;

        Ok(IssuedToken {
            value,
            expires_in: Duration::from_secs(body.expire),
        })
    }
}

/// Bearer-authenticated platform client.
#[derive(Clone)]
pub struct LarkClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<CredentialManager>,
}

impl LarkClient {
    pub fn new(http: reqwest::Client, base_url: &str, credentials: Arc<CredentialManager>) -> Self {
        Self {
            http,
            base_url: normalize_base_url(base_url),
            credentials,
        }
    }

    /// Ask the platform for a fresh event socket URL.
    pub async fn fetch_socket_url(&self) -> Result<String, BridgeError> {
        let data: SocketEndpoint = self
            .post_authed(SOCKET_ENDPOINT_PATH, &serde_json::json!({}))
            .await?
            .ok_or_else(|| BridgeError::Connection("socket endpoint response had no data".to_string()))?;

        if data.url.trim().is_empty() {
            return Err(BridgeError::Connection(
                "socket endpoint response had an empty URL".to_string(),
            ));
        }
        Ok(data.url)
    }

    async fn post_authed<T>(&self, path: &str, body: &Value) -> Result<Option<T>, BridgeError>
    where
        T: DeserializeOwned,
    {
        let token = self.credentials.get_token().await?;
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&token.value)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        let envelope = match serde_json::from_str::<PlatformEnvelope<T>>(&text) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(BridgeError::Connection(format!(
                    "POST {} failed: HTTP {}: {}",
                    path,
                    status,
                    text.chars().take(300).collect::<String>()
                )));
            }
            Err(e) => {
                return Err(BridgeError::Parse(format!(
                    "unreadable response from {}: {}",
                    path, e
                )));
            }
        };

        if envelope.code != 0 {
            if INVALID_TOKEN_CODES.contains(&envelope.code) {
                self.credentials.invalidate().await;
            }
            return Err(BridgeError::Platform {
                code: envelope.code,
                message: envelope.msg,
            });
        }

        Ok(envelope.data)
    }
}

#[async_trait]
impl ChatApi for LarkClient {
    async fn reply_text(&self, message_id: &str, text: &str) -> Result<(), BridgeError> {
        let content = serde_json::json!({ "text": text }).to_string();
        let body = serde_json::json!({ "msg_type": "text", "content": content });
        self.post_authed::<Value>(&format!("/open-apis/im/v1/messages/{}/reply", message_id), &body)
            .await?;
        tracing::debug!(message_id, "Sent reply");
        Ok(())
    }

    async fn add_reaction(&self, message_id: &str, emoji_type: &str) -> Result<(), BridgeError> {
        let body = serde_json::json!({ "reaction_type": { "emoji_type": emoji_type } });
        self.post_authed::<Value>(
            &format!("/open-apis/im/v1/messages/{}/reactions", message_id),
            &body,
        )
        .await?;
        Ok(())
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "https://open.feishu.cn".to_string()
    } else {
        trimmed.to_string()
    }
}
