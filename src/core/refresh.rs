// src/core/refresh.rs

//! Per-feed refresh scheduling (spec §4.3, option (b)): each due feed gets a
//! deadline-bounded spawned task that fetches and parses its listing, then
//! reports discovered entries back through a channel instead of mutating the
//! catalogue itself — the manager task remains the only writer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::core::errors::SourceMgrError;
use crate::core::model::ClientIdentity;
use crate::core::ports::{DiscoveredEntry, FeedParsePort};

#[derive(Debug)]
pub enum RefreshOutcome {
    Discovered(Vec<DiscoveredEntry>),
    Failed(SourceMgrError),
    TimedOut,
}

#[derive(Debug)]
pub struct RefreshReport {
    pub source_id: i64,
    pub feed_id: i64,
    pub outcome: RefreshOutcome,
}

pub struct RefreshSpec {
    pub source_id: i64,
    pub feed_id: i64,
    pub feed_url: url::Url,
    pub rolie: bool,
    pub headers: Vec<String>,
    pub identity: Option<ClientIdentity>,
    pub insecure: bool,
    pub deadline: Duration,
}

/// Spawns a single bounded refresh task for one feed.
pub fn spawn_refresh(
    spec: RefreshSpec,
    feed_parser: Arc<dyn FeedParsePort>,
    reports: mpsc::UnboundedSender<RefreshReport>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = match timeout(
            spec.deadline,
            feed_parser.parse(
                &spec.feed_url,
                spec.rolie,
                &spec.headers,
                spec.identity.as_ref(),
                spec.insecure,
            ),
        )
        .await
        {
            Ok(Ok(entries)) => RefreshOutcome::Discovered(entries),
            Ok(Err(e)) => RefreshOutcome::Failed(e),
            Err(_) => RefreshOutcome::TimedOut,
        };
        let _ = reports.send(RefreshReport {
            source_id: spec.source_id,
            feed_id: spec.feed_id,
            outcome,
        });
    })
}
