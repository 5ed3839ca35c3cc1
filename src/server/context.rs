// src/server/context.rs

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing_subscriber::{filter::EnvFilter, reload};

use crate::core::manager::SourceManager;

/// Holds everything [`super::spawner::spawn_all`] and the shutdown sequence
/// in [`super::run`] need: the running Source Manager, a shutdown signal
/// every background task subscribes to independently, the `JoinSet` those
/// tasks run in, and the log-level reload handle (unused today, held for a
/// future `CONFIG`-style admin surface, same as the teacher's
/// `log_reload_handle`).
pub struct ServerContext {
    pub manager: Arc<SourceManager>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<anyhow::Result<()>>,
    #[allow(dead_code)]
    pub log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
}
