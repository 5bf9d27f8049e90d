//! nodehost-agent: out-of-process container activator.
//!
//! Registers with the node host over IPC, then serves container activation
//! requests by driving a container CLI and reports container events back.

mod agent;
mod config;
mod exec;
mod handler;
mod service;

use agent::ContainerActivatorAgent;
use config::AgentConfig;
use exec::ContainerCli;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("nodehost_agent=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting nodehost container activator agent");

    let config = AgentConfig::from_env();
    tracing::info!(?config, "Configuration loaded");
    config.validate_warn();

    let runtime = Arc::new(ContainerCli::new(
        config.container_cli.clone(),
        config.open_network_name.clone(),
    ));
    let timeout = config.request_timeout;
    let mut agent = ContainerActivatorAgent::new(config, runtime);
    agent.open(timeout).await?;

    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, cleaning up...");

    agent.close().await;
    tracing::info!("Agent shutdown complete");
    Ok(())
}
