//! Tenant access token cache for the chat platform REST API.
//!
//! The exchange itself sits behind [`TokenSource`]; [`CredentialManager`]
//! owns the cached token and makes sure overlapping callers share one refresh.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::BridgeError;

pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// A token as returned by the credential exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub value: String,
    pub expires_in: Duration,
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn exchange(&self) -> Result<IssuedToken, BridgeError>;
}

/// Cached bearer token. `expires_at` already has the refresh margin applied.
#[derive(Clone)]
pub struct Token {
    pub value: String,
    pub expires_at: Instant,
}

impl Token {
    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("value", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

pub struct CredentialManager {
    source: Arc<dyn TokenSource>,
    margin: Duration,
    // Held across the exchange: a second caller waits for the in-flight
    // refresh and then reads its result.
    cached: Mutex<Option<Token>>,
}

impl CredentialManager {
    pub fn new(source: Arc<dyn TokenSource>, margin: Duration) -> Self {
        Self {
            source,
            margin,
            cached: Mutex::new(None),
        }
    }

    /// Return a token that is not within the refresh margin of its expiry,
    /// exchanging credentials when needed.
    pub async fn get_token(&self) -> Result<Token, BridgeError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh() {
                return Ok(token.clone());
            }
        }
        *cached = None;

        let issued = self.source.exchange().await?;
        let usable_for = issued.expires_in.saturating_sub(self.margin);
        if usable_for.is_zero() {
            return Err(BridgeError::Auth(format!(
                "issued token lifetime of {}s is inside the {}s refresh margin",
                issued.expires_in.as_secs(),
                self.margin.as_secs()
            )));
        }

        let token = Token {
            value: issued.value,
            expires_at: Instant::now() + usable_for,
        };
        tracing::debug!(usable_secs = usable_for.as_secs(), "Refreshed tenant access token");
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Drop the cached token so the next call exchanges again.
    pub async fn invalidate(&self) {
        if self.cached.lock().await.take().is_some() {
            tracing::info!("Invalidated cached tenant access token");
        }
    }
}
