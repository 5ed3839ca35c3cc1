// src/core/worker.rs

//! The download worker pool (spec §4.4, §5).
//!
//! A fixed set of workers drain a shared jobs channel; each waits for its
//! source's rate-limit token, then runs
//! fetch → checksum → signature-check → strict-mode parse → persist and
//! reports the outcome back to the manager's command loop. Workers never
//! touch the catalogue directly — grounded on the teacher's
//! `CacheRevalidationWorker` (mpsc-driven worker loop, completion reported
//! rather than applied in place).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::core::errors::SourceMgrError;
use crate::core::model::{ClientIdentity, RateLimiter};
use crate::core::ports::{PersistencePort, PmdPort, RemoteValidatorPort, ValidatorPort};
use crate::core::scheduler::DownloadJob;

/// How long a worker sleeps between token-bucket polls while waiting for a
/// rate-limited source to free up (spec §4.2: "Download workers consume a
/// token before issuing each HTTP request").
const RATE_LIMIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What happened to a single claimed location.
#[derive(Debug)]
pub enum JobOutcome {
    /// Downloaded, validated, and persisted.
    Stored,
    /// Checksum, signature, or strict-mode schema validation rejected the document.
    Rejected(SourceMgrError),
    /// The fetch itself failed (network, TLS, non-2xx status).
    FetchFailed(SourceMgrError),
}

/// Reported back to the manager's command loop once a job completes.
#[derive(Debug)]
pub struct JobReport {
    pub source_id: i64,
    pub feed_id: i64,
    pub url: url::Url,
    pub outcome: JobOutcome,
}

/// Everything a worker needs that does not change per-job.
#[derive(Clone)]
pub struct JobContext {
    pub headers: Vec<String>,
    pub identity: Option<ClientIdentity>,
    pub insecure: bool,
    pub strict_mode: bool,
    pub signature_check: bool,
    pub public_key: Option<Arc<Vec<u8>>>,
    pub remote_validator: Option<Arc<dyn RemoteValidatorPort>>,
    /// The owning source's token bucket, if it has a configured rate. `None`
    /// means the source is unrated and every request proceeds immediately.
    pub limiter: Option<Arc<RateLimiter>>,
}

pub struct WorkerJob {
    pub job: DownloadJob,
    pub ctx: JobContext,
}

/// Spawns `worker_count` workers draining `jobs` until the channel closes
/// (i.e. until the manager drops its sender at shutdown, letting in-flight
/// jobs finish before every worker exits — spec §8 shutdown-drain scenario).
pub fn spawn_workers(
    worker_count: usize,
    jobs: mpsc::Receiver<WorkerJob>,
    reports: mpsc::UnboundedSender<JobReport>,
    pmd_port: Arc<dyn PmdPort>,
    validator: Arc<dyn ValidatorPort>,
    persistence: Arc<dyn PersistencePort>,
) -> JoinSet<()> {
    let jobs = Arc::new(Mutex::new(jobs));
    let mut set = JoinSet::new();
    for _ in 0..worker_count.max(1) {
        let jobs = jobs.clone();
        let reports = reports.clone();
        let pmd_port = pmd_port.clone();
        let validator = validator.clone();
        let persistence = persistence.clone();
        set.spawn(async move {
            loop {
                let received = jobs.lock().await.recv().await;
                let Some(WorkerJob { job, ctx }) = received else {
                    break;
                };
                let outcome = run_job(&job, &ctx, pmd_port.as_ref(), validator.as_ref(), persistence.as_ref()).await;
                let _ = reports.send(JobReport {
                    source_id: job.source_id,
                    feed_id: job.feed_id,
                    url: job.url,
                    outcome,
                });
            }
        });
    }
    set
}

async fn run_job(
    job: &DownloadJob,
    ctx: &JobContext,
    pmd_port: &dyn PmdPort,
    validator: &dyn ValidatorPort,
    persistence: &dyn PersistencePort,
) -> JobOutcome {
    wait_for_token(ctx.limiter.as_deref()).await;

    let document = match pmd_port
        .fetch(&job.url, &ctx.headers, ctx.identity.as_ref(), ctx.insecure)
        .await
    {
        Ok(d) => d,
        Err(e) => return JobOutcome::FetchFailed(e),
    };

    if let Some(expected) = &job.hash {
        if !validator.verify_checksum(&document.body, expected) {
            return JobOutcome::Rejected(SourceMgrError::InvalidArgument("checksum mismatch".to_string()));
        }
    }

    if ctx.signature_check {
        if let Some(signature) = &job.signature {
            let public_key = ctx.public_key.as_deref().map(|v| v.as_slice());
            if !validator.verify_signature(&document.body, signature, public_key) {
                return JobOutcome::Rejected(SourceMgrError::InvalidArgument(
                    "signature verification failed".to_string(),
                ));
            }
        }
    }

    if ctx.strict_mode {
        if let Err(e) = validator.validate_schema(&document.body).await {
            return JobOutcome::Rejected(e);
        }
    }

    if let Some(remote) = &ctx.remote_validator {
        match remote.validate(&document.body).await {
            Ok(result) if !result.ok => {
                return JobOutcome::Rejected(SourceMgrError::InvalidArgument(format!(
                    "remote validation failed: {}",
                    result.messages.join("; ")
                )));
            }
            Ok(_) => {}
            Err(e) => return JobOutcome::FetchFailed(e),
        }
    }

    match persistence.store_advisory(job.feed_id, job.url.as_str(), &document.body).await {
        Ok(()) => JobOutcome::Stored,
        Err(e) => JobOutcome::Rejected(e),
    }
}

/// Blocks until the source's token bucket has a token available, polling at
/// [`RATE_LIMIT_POLL_INTERVAL`]. A `None` limiter (unrated source) returns
/// immediately.
async fn wait_for_token(limiter: Option<&RateLimiter>) {
    let Some(limiter) = limiter else {
        return;
    };
    loop {
        if limiter.check().is_ok() {
            return;
        }
        tokio::time::sleep(RATE_LIMIT_POLL_INTERVAL).await;
    }
}
