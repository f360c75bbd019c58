pub mod agent_socket;
pub mod auth;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod error;
pub mod fallback;
pub mod http_client;
pub mod lark_api;
pub mod lark_socket;
pub mod router;
pub mod runtime;
pub mod stats;
pub mod timing;

pub use config::BridgeConfig;
pub use error::BridgeError;
pub use runtime::BridgeRuntime;
