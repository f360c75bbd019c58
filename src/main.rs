use anyhow::{Context, Result};
use feishu_bridge_core::config::BridgeConfig;
use feishu_bridge_core::runtime::BridgeRuntime;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,feishu_bridge=debug,feishu_bridge_core=debug")
            }),
        )
        .init();

    tracing::info!("Feishu bridge starting...");

    let config = match BridgeConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Config error: {:#}", e);
            std::process::exit(1);
        }
    };
    let identity = match config.resolve_identity() {
        Ok(identity) => identity,
        Err(e) => {
            tracing::error!("Missing app credentials: {:#}", e);
            std::process::exit(1);
        }
    };

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(async {
        let runtime = BridgeRuntime::bootstrap(config, identity)
            .context("failed to bootstrap bridge runtime")?;
        runtime.run_until_shutdown().await?;
        Ok::<(), anyhow::Error>(())
    })
}
