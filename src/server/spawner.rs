// src/server/spawner.rs

//! Spawns the server's background tasks (just the optional metrics server;
//! the Source Manager's own command loop is already running by the time
//! this is called — see [`super::initialization::setup`]).

use tracing::info;

use super::context::ServerContext;
use super::metrics_server;
use crate::config::Config;

/// Spawns every background task into `ctx.background_tasks`, each
/// subscribing its own shutdown receiver from `ctx.shutdown_tx`.
pub fn spawn_all(ctx: &mut ServerContext, config: &Config) {
    if config.metrics.enabled {
        let port = config.metrics.port;
        let shutdown_rx = ctx.shutdown_tx.subscribe();
        ctx.background_tasks.spawn(async move {
            metrics_server::run_metrics_server(port, shutdown_rx).await;
            Ok(())
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }
}
