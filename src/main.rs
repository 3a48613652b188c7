use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use redis_engine::config::EngineConfig;
use redis_engine::engine::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::from_args(std::env::args()).context("invalid configuration")?;
    info!(dir = %config.dir.display(), "starting engine");

    let engine = Arc::new(
        tokio::task::spawn_blocking(move || Engine::open(config))
            .await?
            .context("failed to load dataset")?,
    );
    let tasks = engine.start_background_tasks();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutting down");
    tasks.shutdown();
    engine.shutdown()?;
    Ok(())
}
