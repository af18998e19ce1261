//! `fieldsync-agent` binary.

use anyhow::Result;
use fieldsync_agent::{Agent, AgentConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting FieldSync agent");

    let config = AgentConfig::from_env()?;
    let agent = Agent::new(config).await?;

    agent.run().await?;

    Ok(())
}
