use std::time::Duration;

use crate::error::BridgeError;

/// Build the shared REST client. System proxy discovery is opt-in via
/// `BRIDGE_ENABLE_SYSTEM_PROXY`; otherwise requests go direct.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, BridgeError> {
    let allow_system_proxy = std::env::var("BRIDGE_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        match attempt_build(timeout, false) {
            Ok(client) => return Ok(client),
            Err(error) => {
                tracing::warn!(
                    "HTTP client initialization with system proxy discovery failed ({}); retrying with no_proxy",
                    error
                );
            }
        }
    }

    attempt_build(timeout, true).map_err(BridgeError::from)
}

fn attempt_build(timeout: Duration, no_proxy: bool) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
