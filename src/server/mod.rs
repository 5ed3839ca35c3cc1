// src/server/mod.rs

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

use crate::config::Config;

mod context;
mod initialization;
mod metrics_server;
mod spawner;

pub use context::ServerContext;

/// Boots the daemon: connects the persistence pool, starts the Source
/// Manager's command loop, spawns the metrics server, then blocks until a
/// shutdown signal arrives and drains every background task.
pub async fn run(config: Config, log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>) -> Result<()> {
    let mut context = initialization::setup(config.clone(), log_reload_handle).await?;
    spawner::spawn_all(&mut context, &config);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining in-flight downloads");

    let _ = context.shutdown_tx.send(());
    context.manager.shutdown().await;
    while let Some(result) = context.background_tasks.join_next().await {
        if let Err(e) = result {
            tracing::warn!("background task panicked: {e}");
        }
    }
    info!("shutdown complete");
    Ok(())
}
