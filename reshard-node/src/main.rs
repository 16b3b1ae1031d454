//! Reshard Node - Main entry point

use reshard_core::ReshardConfig;
use reshard_node::Node;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Path of an optional JSON configuration file
const CONFIG_PATH_VAR: &str = "RESHARD_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Load configuration from file if given, environment otherwise
    let config = match std::env::var(CONFIG_PATH_VAR) {
        Ok(path) => {
            info!(path = %path, "Loading configuration file");
            ReshardConfig::from_json(&std::fs::read_to_string(&path)?)?
        }
        Err(_) => ReshardConfig::from_env()?,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let node = Node::start(config, shutdown_rx.clone()).await?;
    let running = tokio::spawn(node.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown_tx.send_replace(true);
    running.await?;

    Ok(())
}
