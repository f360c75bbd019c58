use std::time::Duration;

/// Reply sent when the agent backend is offline and the direct-call path has
/// no API key.
pub const FALLBACK_NOT_CONFIGURED: &str =
    "The agent backend is offline and no fallback API key is configured. \
     Please ask the bridge operator to set FALLBACK_API_KEY or bring the agent backend back up.";

/// Errors produced while relaying a message.
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("credential exchange failed: {0}")]
    Auth(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("agent backend did not answer within {}s", .0.as_secs())]
    BackendTimeout(Duration),
    #[error("agent backend error: {0}")]
    Backend(String),
    #[error("{0}")]
    Config(String),
    #[error("chat platform returned code {code}: {message}")]
    Platform { code: i64, message: String },
    #[error("malformed content: {0}")]
    Parse(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl BridgeError {
    pub fn fallback_not_configured() -> Self {
        BridgeError::Config(FALLBACK_NOT_CONFIGURED.to_string())
    }

    /// Text shown to the chat user when handling their message failed.
    pub fn user_message(&self) -> String {
        match self {
            BridgeError::Config(message) => message.clone(),
            other => format!("Sorry, I couldn't process your message: {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_is_shown_verbatim() {
        let err = BridgeError::fallback_not_configured();
        assert_eq!(err.user_message(), FALLBACK_NOT_CONFIGURED);
    }

    #[test]
    fn timeout_message_mentions_deadline() {
        let err = BridgeError::BackendTimeout(Duration::from_secs(120));
        let message = err.user_message();
        assert!(message.starts_with("Sorry, I couldn't process your message"));
        assert!(message.contains("120s"));
    }
}
