// src/core/manager.rs

//! The Source Manager itself (spec §4.1, §5): a single task owns the
//! catalogue and processes every mutation through one command channel, a
//! fixed-cadence maintenance ticker, and worker/refresh completion reports
//! via `tokio::select!`. No other task ever gets a mutable reference to the
//! catalogue — this is what lets every lookup elsewhere in the crate stay
//! lock-free.
//!
//! There is no direct teacher counterpart for this module (spineldb has no
//! single-writer actor of its own), so it is built from spec §4.1/§5 using
//! the teacher's channel vocabulary (`tokio::sync::{mpsc, oneshot,
//! broadcast}`) and `tokio::select!` idiom throughout.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::core::cache::keys::{KeysCache, DEFAULT_KEY_TTL};
use crate::core::cache::pmd::{PmdCache, DEFAULT_PMD_TTL};
use crate::core::catalogue::Catalogue;
use crate::core::errors::SourceMgrError;
use crate::core::model::{ClientIdentity, Feed, FeedLogEntry, LocationState, LogLevel, RateLimiter, Source};
use crate::core::ports::{AggregatorRecord, FeedParsePort, PersistencePort, PmdPort, RemoteValidatorPort, SqlValue, ValidatorPort};
use crate::core::refresh::{spawn_refresh, RefreshOutcome, RefreshReport, RefreshSpec};
use crate::core::scheduler::Scheduler;
use crate::core::updater::{FeedUpdater, SourceUpdater, UpdateOutcome};
use crate::core::worker::{spawn_workers, JobContext, JobOutcome, JobReport, WorkerJob};

/// Read-only snapshot of a [`Source`] returned to API callers.
#[derive(Debug, Clone)]
pub struct SourceView {
    pub id: i64,
    pub name: String,
    pub url: url::Url,
    pub active: bool,
    pub rate: Option<f64>,
    pub slots: Option<u32>,
    pub used_slots: u32,
    pub status: Vec<String>,
    pub feed_ids: Vec<i64>,
}

impl From<&Source> for SourceView {
    fn from(s: &Source) -> Self {
        SourceView {
            id: s.id,
            name: s.name.clone(),
            url: s.url.clone(),
            active: s.active,
            rate: s.rate,
            slots: s.slots,
            used_slots: s.used_slots,
            status: s.status.clone(),
            feed_ids: s.feeds.iter().map(|f| f.id).collect(),
        }
    }
}

/// Read-only snapshot of a [`Feed`] returned to API callers.
#[derive(Debug, Clone)]
pub struct FeedView {
    pub id: i64,
    pub source_id: i64,
    pub label: String,
    pub url: url::Url,
    pub rolie: bool,
    pub log_level: LogLevel,
    pub invalid: bool,
    pub next_check: Option<DateTime<Utc>>,
    pub queued: usize,
}

impl From<&Feed> for FeedView {
    fn from(f: &Feed) -> Self {
        FeedView {
            id: f.id,
            source_id: f.source_id,
            label: f.label.clone(),
            url: f.url.clone(),
            rolie: f.rolie,
            log_level: f.atomics.log_level(),
            invalid: f.atomics.is_invalid(),
            next_check: f.next_check,
            queued: f.queue.iter().filter(|l| l.state == LocationState::Waiting).count(),
        }
    }
}

/// Payload of an `AddSource` call (spec §4.5, §6).
#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub url: url::Url,
    pub rate: Option<f64>,
    pub slots: Option<u32>,
    pub age: Option<Duration>,
    pub headers: Vec<String>,
    pub strict_mode: Option<bool>,
    pub insecure: Option<bool>,
    pub signature_check: Option<bool>,
    pub ignore_patterns: Vec<String>,
    pub client_cert_public: Option<Vec<u8>>,
    pub client_cert_private: Option<Vec<u8>>,
    pub client_cert_passphrase: Option<Vec<u8>>,
}

/// Payload of an `AddFeed` call.
#[derive(Debug, Clone)]
pub struct NewFeed {
    pub label: String,
    pub url: url::Url,
    pub rolie: bool,
}

/// Payload of an `UpdateSource` call: a present-but-`None` field explicitly
/// clears it, while an absent field leaves it untouched (spec §4.5).
#[derive(Debug, Clone, Default)]
pub struct SourceUpdate {
    pub name: Option<String>,
    pub rate: Option<Option<f64>>,
    pub slots: Option<Option<u32>>,
    pub age: Option<Option<Duration>>,
    pub active: Option<bool>,
    pub headers: Option<Vec<String>>,
    pub strict_mode: Option<Option<bool>>,
    pub insecure: Option<Option<bool>>,
    pub signature_check: Option<Option<bool>>,
    pub client_cert_public: Option<Option<Vec<u8>>>,
    pub client_cert_private: Option<Option<Vec<u8>>>,
    pub client_cert_passphrase: Option<Option<Vec<u8>>>,
}

/// Payload of an `UpdateFeed` call.
#[derive(Debug, Clone, Default)]
pub struct FeedUpdate {
    pub label: Option<String>,
    pub url: Option<url::Url>,
    pub log_level: Option<LogLevel>,
}

enum ManagerCommand {
    Sources(oneshot::Sender<Vec<SourceView>>),
    Source(i64, oneshot::Sender<Result<SourceView, SourceMgrError>>),
    Feeds(i64, oneshot::Sender<Result<Vec<FeedView>, SourceMgrError>>),
    Feed(i64, oneshot::Sender<Result<FeedView, SourceMgrError>>),
    AttentionSources(oneshot::Sender<Vec<SourceView>>),
    Subscriptions(Vec<url::Url>, oneshot::Sender<Vec<FeedView>>),
    Pmd(url::Url, oneshot::Sender<Result<Arc<serde_json::Value>, SourceMgrError>>),
    AddSource(NewSource, oneshot::Sender<Result<i64, SourceMgrError>>),
    AddFeed(i64, NewFeed, oneshot::Sender<Result<i64, SourceMgrError>>),
    RemoveSource(i64, oneshot::Sender<Result<(), SourceMgrError>>),
    RemoveFeed(i64, i64, oneshot::Sender<Result<(), SourceMgrError>>),
    UpdateSource(i64, SourceUpdate, oneshot::Sender<Result<UpdateOutcome, SourceMgrError>>),
    UpdateFeed(i64, i64, FeedUpdate, oneshot::Sender<Result<UpdateOutcome, SourceMgrError>>),
    FeedLog(i64, i64, oneshot::Sender<Result<Vec<FeedLogEntry>, SourceMgrError>>),
    Aggregators(oneshot::Sender<Result<Vec<AggregatorRecord>, SourceMgrError>>),
    AcknowledgeAggregator(i64, oneshot::Sender<Result<(), SourceMgrError>>),
}

/// Defaults a source inherits from configuration when its own tri-state
/// field is unset (spec §3, §6.1).
#[derive(Debug, Clone)]
pub struct ManagerDefaults {
    pub strict_mode: bool,
    pub insecure: bool,
    pub signature_check: bool,
    pub slots_per_source: u32,
    pub global_slots: u32,
    pub refresh_interval: Duration,
    pub refresh_deadline: Duration,
    pub worker_count: usize,
    /// `Sources.MaxRatePerSource`; `0` means unlimited (spec §8 boundaries).
    pub max_rate_per_source: f64,
    /// Cutoff a source inherits when it sets no `age` override
    /// (`Sources.DefaultAge`); `0` disables age filtering.
    pub default_age: Duration,
    /// Ceiling a source's own `age` override may not exceed
    /// (`Sources.MaxAge`); `0` means unlimited.
    pub max_age: Duration,
}

struct ManagerState {
    catalogue: Catalogue,
    scheduler: Scheduler,
    crypto: crate::core::crypto::CryptoBox,
    persistence: Arc<dyn PersistencePort>,
    pmd_port: Arc<dyn PmdPort>,
    feed_parser: Arc<dyn FeedParsePort>,
    validator: Arc<dyn ValidatorPort>,
    pmd_cache: PmdCache,
    keys_cache: KeysCache,
    remote_validator: Option<Arc<dyn RemoteValidatorPort>>,
    defaults: ManagerDefaults,
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<regex::Regex>, SourceMgrError> {
    patterns.iter().map(|p| regex::Regex::new(p).map_err(SourceMgrError::from)).collect()
}

fn encrypt_opt(crypto: &crate::core::crypto::CryptoBox, value: &Option<Vec<u8>>) -> Result<Option<Vec<u8>>, SourceMgrError> {
    value.as_ref().map(|v| crypto.encrypt(v)).transpose()
}

pub(crate) fn build_limiter(rate: f64) -> Arc<RateLimiter> {
    let period = Duration::from_secs_f64((1.0 / rate.max(0.001)).max(0.001));
    let quota = governor::Quota::with_period(period)
        .unwrap_or_else(|| governor::Quota::per_second(std::num::NonZeroU32::new(1).unwrap()))
        .allow_burst(std::num::NonZeroU32::new(1).unwrap());
    Arc::new(governor::RateLimiter::direct(quota))
}

/// Parses and validates a client-certificate PEM pair, building the mTLS
/// identity workers will present (spec §4.7/§4.8). `None, None` is a valid
/// "no mTLS configured" state; any other partial combination is rejected.
fn derive_client_identity(
    public_pem: Option<&[u8]>,
    private_pem: Option<&[u8]>,
) -> Result<Option<ClientIdentity>, SourceMgrError> {
    match (public_pem, private_pem) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => {
            let mut cert_reader = std::io::BufReader::new(cert);
            let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| SourceMgrError::InvalidArgument(format!("invalid client certificate PEM: {e}")))?;
            if certs.is_empty() {
                return Err(SourceMgrError::InvalidArgument(
                    "client certificate PEM has no certificates".to_string(),
                ));
            }
            let mut key_reader = std::io::BufReader::new(key);
            let private_key = rustls_pemfile::private_key(&mut key_reader)
                .map_err(|e| SourceMgrError::InvalidArgument(format!("invalid client private key PEM: {e}")))?;
            if private_key.is_none() {
                return Err(SourceMgrError::InvalidArgument(
                    "client private key PEM has no private key".to_string(),
                ));
            }
            let mut combined = Vec::with_capacity(cert.len() + key.len());
            combined.extend_from_slice(cert);
            combined.extend_from_slice(key);
            let identity = reqwest::Identity::from_pem(&combined)
                .map_err(|e| SourceMgrError::InvalidArgument(format!("could not build TLS identity: {e}")))?;
            Ok(Some(ClientIdentity { identity }))
        }
        _ => Err(SourceMgrError::InvalidArgument(
            "client certificate and private key must both be provided".to_string(),
        )),
    }
}

/// `rate = 0`/`slots = 0` normalise to unset; a value above the configured
/// ceiling (when the ceiling is non-zero, i.e. "set") is rejected outright
/// (spec §8 boundaries).
fn normalize_rate(rate: Option<f64>, ceiling: f64) -> Result<Option<f64>, SourceMgrError> {
    let rate = rate.filter(|r| *r != 0.0);
    if let Some(r) = rate {
        if ceiling > 0.0 && r > ceiling {
            return Err(SourceMgrError::InvalidArgument(format!(
                "rate {r} exceeds the configured maximum of {ceiling}"
            )));
        }
    }
    Ok(rate)
}

fn normalize_slots(slots: Option<u32>, ceiling: u32) -> Result<Option<u32>, SourceMgrError> {
    let slots = slots.filter(|s| *s != 0);
    if let Some(s) = slots {
        if ceiling > 0 && s > ceiling {
            return Err(SourceMgrError::InvalidArgument(format!(
                "slots {s} exceeds the configured maximum of {ceiling}"
            )));
        }
    }
    Ok(slots)
}

fn validate_age(age: Option<Duration>, ceiling: Duration) -> Result<(), SourceMgrError> {
    if let Some(a) = age {
        if ceiling > Duration::ZERO && a > ceiling {
            return Err(SourceMgrError::InvalidArgument(format!(
                "age {a:?} exceeds the configured maximum of {ceiling:?}"
            )));
        }
    }
    Ok(())
}

async fn add_source(state: &mut ManagerState, mut draft: NewSource) -> Result<i64, SourceMgrError> {
    if draft.name.trim().is_empty() {
        return Err(SourceMgrError::InvalidArgument("source name must not be empty".to_string()));
    }
    draft.rate = normalize_rate(draft.rate, state.defaults.max_rate_per_source)?;
    draft.slots = normalize_slots(draft.slots, state.defaults.slots_per_source)?;
    validate_age(draft.age, state.defaults.max_age)?;
    let ignore_patterns = compile_patterns(&draft.ignore_patterns)?;
    let encrypted_public = encrypt_opt(&state.crypto, &draft.client_cert_public)?;
    let encrypted_private = encrypt_opt(&state.crypto, &draft.client_cert_private)?;
    let encrypted_passphrase = encrypt_opt(&state.crypto, &draft.client_cert_passphrase)?;

    let fields: Vec<(&'static str, SqlValue)> = vec![
        ("name", SqlValue::Text(draft.name.clone())),
        ("url", SqlValue::Text(draft.url.to_string())),
        ("rate", SqlValue::OptF64(draft.rate)),
        ("slots", SqlValue::OptI32(draft.slots.map(|v| v as i32))),
        ("age_seconds", SqlValue::OptI64(draft.age.map(|d| d.as_secs() as i64))),
        ("headers", SqlValue::StringArray(draft.headers.clone())),
        ("strict_mode", SqlValue::OptBool(draft.strict_mode)),
        ("insecure", SqlValue::OptBool(draft.insecure)),
        ("signature_check", SqlValue::OptBool(draft.signature_check)),
        ("ignore_patterns", SqlValue::StringArray(draft.ignore_patterns.clone())),
        ("client_cert_public", SqlValue::OptBytes(encrypted_public)),
        ("client_cert_private", SqlValue::OptBytes(encrypted_private)),
        ("client_cert_passphrase", SqlValue::OptBytes(encrypted_passphrase)),
    ];
    let id = state.persistence.insert_row("sources", &fields).await?;

    let mut status = Vec::new();
    let mut active = true;
    let client_identity = match derive_client_identity(draft.client_cert_public.as_deref(), draft.client_cert_private.as_deref()) {
        Ok(identity) => identity,
        Err(e) => {
            active = false;
            status.push(format!("client certificate deactivated: {e}"));
            None
        }
    };

    let source = Source {
        id,
        name: draft.name,
        url: draft.url,
        active,
        rate: draft.rate,
        slots: draft.slots,
        headers: draft.headers,
        strict_mode: draft.strict_mode,
        insecure: draft.insecure,
        signature_check: draft.signature_check,
        age: draft.age,
        ignore_pattern_sources: draft.ignore_patterns,
        ignore_patterns,
        client_cert_public: draft.client_cert_public,
        client_cert_private: draft.client_cert_private,
        client_cert_passphrase: draft.client_cert_passphrase,
        client_identity,
        status,
        used_slots: 0,
        feeds: vec![],
        limiter: draft.rate.map(build_limiter),
    };
    state.catalogue.insert_source(source);
    Ok(id)
}

async fn add_feed(state: &mut ManagerState, source_id: i64, draft: NewFeed) -> Result<i64, SourceMgrError> {
    state.catalogue.source(source_id)?;
    let fields: Vec<(&'static str, SqlValue)> = vec![
        ("source_id", SqlValue::OptI64(Some(source_id))),
        ("label", SqlValue::Text(draft.label.clone())),
        ("url", SqlValue::Text(draft.url.to_string())),
        ("rolie", SqlValue::Bool(draft.rolie)),
    ];
    let id = state.persistence.insert_row("feeds", &fields).await?;
    let feed = Feed::new(id, source_id, draft.label, draft.url, draft.rolie);
    state.catalogue.source_mut(source_id)?.feeds.push(feed);
    Ok(id)
}

async fn remove_source(state: &mut ManagerState, id: i64) -> Result<(), SourceMgrError> {
    state.persistence.delete_row("sources", id).await?;
    state
        .catalogue
        .remove_source(id)
        .ok_or_else(|| SourceMgrError::NoSuchEntry(format!("source {id}")))?;
    state.pmd_cache.invalidate(id);
    Ok(())
}

async fn remove_feed(state: &mut ManagerState, source_id: i64, feed_id: i64) -> Result<(), SourceMgrError> {
    state.persistence.delete_row("feeds", feed_id).await?;
    let source = state.catalogue.source_mut(source_id)?;
    let before = source.feeds.len();
    source.feeds.retain(|f| f.id != feed_id);
    if source.feeds.len() == before {
        return Err(SourceMgrError::NoSuchEntry(format!("feed {feed_id}")));
    }
    Ok(())
}

async fn update_source(state: &mut ManagerState, id: i64, patch: SourceUpdate) -> Result<UpdateOutcome, SourceMgrError> {
    let mut updater = SourceUpdater::new(id);
    if let Some(name) = patch.name {
        updater.set_name(name);
    }
    if let Some(rate) = patch.rate {
        updater.set_rate(normalize_rate(rate, state.defaults.max_rate_per_source)?);
    }
    if let Some(slots) = patch.slots {
        updater.set_slots(normalize_slots(slots, state.defaults.slots_per_source)?);
    }
    if let Some(age) = patch.age {
        validate_age(age, state.defaults.max_age)?;
        updater.set_age(age);
    }
    if let Some(active) = patch.active {
        updater.set_active(active);
    }
    if let Some(headers) = patch.headers {
        updater.set_headers(headers);
    }
    if let Some(strict_mode) = patch.strict_mode {
        updater.set_strict_mode(strict_mode);
    }
    if let Some(insecure) = patch.insecure {
        updater.set_insecure(insecure);
    }
    if let Some(signature_check) = patch.signature_check {
        updater.set_signature_check(signature_check);
    }
    if let Some(public) = patch.client_cert_public {
        let encrypted = encrypt_opt(&state.crypto, &public)?;
        updater.set_client_cert("client_cert_public", encrypted, public);
    }
    if let Some(private) = patch.client_cert_private {
        let encrypted = encrypt_opt(&state.crypto, &private)?;
        updater.set_client_cert("client_cert_private", encrypted, private);
    }
    if let Some(passphrase) = patch.client_cert_passphrase {
        let encrypted = encrypt_opt(&state.crypto, &passphrase)?;
        updater.set_client_cert("client_cert_passphrase", encrypted, passphrase);
    }

    let persistence = state.persistence.clone();
    let source = state.catalogue.source_mut(id)?;
    updater
        .commit(persistence.as_ref(), source, |s| {
            derive_client_identity(s.client_cert_public.as_deref(), s.client_cert_private.as_deref())
        })
        .await
}

async fn update_feed(
    state: &mut ManagerState,
    source_id: i64,
    feed_id: i64,
    patch: FeedUpdate,
) -> Result<UpdateOutcome, SourceMgrError> {
    let mut updater = FeedUpdater::new(feed_id);
    if let Some(label) = patch.label {
        updater.set_label(label);
    }
    if let Some(url) = patch.url {
        updater.set_url(url);
    }
    if let Some(level) = patch.log_level {
        updater.set_log_level(level);
    }
    let persistence = state.persistence.clone();
    let feed = state.catalogue.feed_mut(source_id, feed_id)?;
    updater.commit(persistence.as_ref(), feed).await
}

/// On-demand provider-metadata fetch for the `PMD(url)` surface (spec §6):
/// resolves the source whose own url the caller's url matches and serves its
/// (possibly cached) PMD document, rather than fetching an arbitrary URL with
/// no source context to attach headers/identity/insecure from.
async fn fetch_pmd(state: &ManagerState, url: &url::Url) -> Result<Arc<serde_json::Value>, SourceMgrError> {
    let source = state
        .catalogue
        .sources()
        .find(|s| &s.url == url)
        .ok_or_else(|| SourceMgrError::NoSuchEntry(format!("no source with provider-metadata url {url}")))?;
    state
        .pmd_cache
        .get(
            source.id,
            &source.url,
            source.headers.clone(),
            source.client_identity.clone(),
            source.insecure.unwrap_or(state.defaults.insecure),
        )
        .await
}

/// Resolves which of a caller-supplied list of feed URLs are already known
/// feeds (spec §6's `Subscriptions(urls)`): lets the HTTP front-end check a
/// batch of candidate feed URLs against the catalogue before offering to add
/// them as new feeds.
fn subscriptions(state: &ManagerState, urls: &[url::Url]) -> Vec<FeedView> {
    state
        .catalogue
        .sources()
        .flat_map(|s| s.feeds.iter())
        .filter(|f| urls.contains(&f.url))
        .map(FeedView::from)
        .collect()
}

fn dispatch_refreshes(state: &mut ManagerState, reports_tx: &mpsc::UnboundedSender<RefreshReport>) {
    let now = Utc::now();
    let deadline = state.defaults.refresh_deadline;
    let interval = chrono::Duration::from_std(state.defaults.refresh_interval).unwrap_or(chrono::Duration::zero());
    let default_insecure = state.defaults.insecure;
    let feed_parser = state.feed_parser.clone();

    for source in state.catalogue.sources_mut() {
        if !source.active {
            continue;
        }
        let headers = source.headers.clone();
        let identity = source.client_identity.clone();
        let insecure = source.insecure.unwrap_or(default_insecure);
        for feed in source.feeds.iter_mut() {
            if feed.atomics.is_invalid() {
                continue;
            }
            let due = feed.next_check.map(|t| t <= now).unwrap_or(true);
            if !due {
                continue;
            }
            feed.next_check = Some(now + interval);
            let spec = RefreshSpec {
                source_id: source.id,
                feed_id: feed.id,
                feed_url: feed.url.clone(),
                rolie: feed.rolie,
                headers: headers.clone(),
                identity: identity.clone(),
                insecure,
                deadline,
            };
            spawn_refresh(spec, feed_parser.clone(), reports_tx.clone());
        }
    }
}

fn apply_refresh_report(state: &mut ManagerState, report: RefreshReport) {
    let effective_age = state
        .catalogue
        .source(report.source_id)
        .ok()
        .map(|s| s.age.unwrap_or(state.defaults.default_age))
        .unwrap_or(state.defaults.default_age);
    let Ok(feed) = state.catalogue.feed_mut(report.source_id, report.feed_id) else {
        return;
    };
    match report.outcome {
        RefreshOutcome::Discovered(entries) => {
            let cutoff = (effective_age > Duration::ZERO)
                .then(|| chrono::Duration::from_std(effective_age).ok())
                .flatten()
                .map(|age| Utc::now() - age);
            let mut added = 0;
            let mut skipped_too_old = 0;
            for entry in entries {
                if let (Some(cutoff), Some(published)) = (cutoff, entry.published) {
                    if published < cutoff {
                        skipped_too_old += 1;
                        continue;
                    }
                }
                let already_known = feed.queue.iter().any(|l| l.url == entry.url);
                if already_known {
                    continue;
                }
                let mut location = crate::core::model::Location::new(entry.url);
                location.hash = entry.hash;
                location.signature = entry.signature;
                feed.queue.push_back(location);
                added += 1;
            }
            if added > 0 {
                feed.push_log(LogLevel::Info, format!("discovered {added} new advisories"));
            }
            if skipped_too_old > 0 {
                feed.push_log(
                    LogLevel::Debug,
                    format!("skipped {skipped_too_old} advisories older than the configured age cutoff"),
                );
            }
        }
        RefreshOutcome::Failed(e) => {
            crate::core::metrics::REFRESH_ERRORS_TOTAL.inc();
            feed.push_log(LogLevel::Error, format!("refresh failed: {e}"));
        }
        RefreshOutcome::TimedOut => {
            crate::core::metrics::REFRESH_ERRORS_TOTAL.inc();
            feed.push_log(LogLevel::Error, "refresh timed out".to_string());
        }
    }
}

async fn dispatch_downloads(state: &mut ManagerState, worker_jobs_tx: &mpsc::Sender<WorkerJob>) {
    let jobs = state.scheduler.dispatch(&mut state.catalogue);
    crate::core::metrics::GLOBAL_USED_SLOTS.set(state.scheduler.used_slots() as f64);
    for job in jobs {
        let Ok(source) = state.catalogue.source(job.source_id) else {
            continue;
        };
        let ctx = JobContext {
            headers: source.headers.clone(),
            identity: source.client_identity.clone(),
            insecure: source.insecure.unwrap_or(state.defaults.insecure),
            strict_mode: source.strict_mode.unwrap_or(state.defaults.strict_mode),
            signature_check: source.signature_check.unwrap_or(state.defaults.signature_check),
            public_key: None,
            remote_validator: state.remote_validator.clone(),
            limiter: source.limiter.clone(),
        };
        if worker_jobs_tx.send(WorkerJob { job, ctx }).await.is_err() {
            break;
        }
        crate::core::metrics::DOWNLOADS_STARTED_TOTAL.inc();
    }
}

fn apply_job_report(state: &mut ManagerState, report: JobReport) {
    state.scheduler.release_slot(&mut state.catalogue, report.source_id);
    crate::core::metrics::GLOBAL_USED_SLOTS.set(state.scheduler.used_slots() as f64);
    let Ok(feed) = state.catalogue.find_feed_mut(report.feed_id) else {
        return;
    };
    if let Some(location) = feed.queue.iter_mut().find(|l| l.url == report.url) {
        location.state = LocationState::Done;
    }
    match &report.outcome {
        JobOutcome::Stored => {
            crate::core::metrics::DOWNLOADS_SUCCEEDED_TOTAL.inc();
            feed.push_log(LogLevel::Info, format!("stored {}", report.url));
        }
        JobOutcome::Rejected(e) => {
            crate::core::metrics::DOWNLOADS_FAILED_TOTAL.inc();
            feed.push_log(LogLevel::Warn, format!("rejected {}: {e}", report.url));
        }
        JobOutcome::FetchFailed(e) => {
            crate::core::metrics::DOWNLOADS_FAILED_TOTAL.inc();
            feed.push_log(LogLevel::Error, format!("fetch failed {}: {e}", report.url));
        }
    }
}

async fn handle_command(state: &mut ManagerState, cmd: ManagerCommand) {
    match cmd {
        ManagerCommand::Sources(reply) => {
            let _ = reply.send(state.catalogue.sources().map(SourceView::from).collect());
        }
        ManagerCommand::Source(id, reply) => {
            let _ = reply.send(state.catalogue.source(id).map(SourceView::from));
        }
        ManagerCommand::Feeds(id, reply) => {
            let result = state
                .catalogue
                .source(id)
                .map(|s| s.feeds.iter().map(FeedView::from).collect());
            let _ = reply.send(result);
        }
        ManagerCommand::Feed(feed_id, reply) => {
            let _ = reply.send(state.catalogue.find_feed(feed_id).map(FeedView::from));
        }
        ManagerCommand::AttentionSources(reply) => {
            let _ = reply.send(state.catalogue.attention_sources().map(SourceView::from).collect());
        }
        ManagerCommand::Subscriptions(urls, reply) => {
            let _ = reply.send(subscriptions(state, &urls));
        }
        ManagerCommand::Pmd(url, reply) => {
            let _ = reply.send(fetch_pmd(state, &url).await);
        }
        ManagerCommand::AddSource(draft, reply) => {
            let _ = reply.send(add_source(state, draft).await);
        }
        ManagerCommand::AddFeed(source_id, draft, reply) => {
            let _ = reply.send(add_feed(state, source_id, draft).await);
        }
        ManagerCommand::RemoveSource(id, reply) => {
            let _ = reply.send(remove_source(state, id).await);
        }
        ManagerCommand::RemoveFeed(source_id, feed_id, reply) => {
            let _ = reply.send(remove_feed(state, source_id, feed_id).await);
        }
        ManagerCommand::UpdateSource(id, patch, reply) => {
            let _ = reply.send(update_source(state, id, patch).await);
        }
        ManagerCommand::UpdateFeed(source_id, feed_id, patch, reply) => {
            let _ = reply.send(update_feed(state, source_id, feed_id, patch).await);
        }
        ManagerCommand::FeedLog(source_id, feed_id, reply) => {
            let result = state
                .catalogue
                .feed(source_id, feed_id)
                .map(|f| f.log.iter().cloned().collect());
            let _ = reply.send(result);
        }
        ManagerCommand::Aggregators(reply) => {
            let _ = reply.send(state.persistence.list_aggregators().await);
        }
        ManagerCommand::AcknowledgeAggregator(id, reply) => {
            let _ = reply.send(state.persistence.acknowledge_aggregator(id).await);
        }
    }
}

/// Cadence of the command loop's own maintenance heartbeat (spec §4.1:
/// refresh-due checks, cache sweep, location compaction) — fixed,
/// independent of the per-feed `Sources.FeedRefresh` duration, which only
/// governs how often an individual feed is actually due for a refresh
/// (checked inside [`dispatch_refreshes`] regardless of how often this
/// ticker fires).
const MAINTENANCE_TICK: Duration = Duration::from_secs(60);

/// How long a `Done` location survives in a feed's queue before
/// [`sweep_and_compact`] prunes it (spec §4.1(b)).
const LOCATION_RETENTION_DAYS: i64 = 7;

async fn run_loop(
    mut state: ManagerState,
    mut cmd_rx: mpsc::UnboundedReceiver<ManagerCommand>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut maintenance_ticker = tokio::time::interval(MAINTENANCE_TICK);
    let (worker_jobs_tx, worker_jobs_rx) = mpsc::channel(256);
    let (job_reports_tx, mut job_reports_rx) = mpsc::unbounded_channel();
    let mut workers = spawn_workers(
        state.defaults.worker_count,
        worker_jobs_rx,
        job_reports_tx,
        state.pmd_port.clone(),
        state.validator.clone(),
        state.persistence.clone(),
    );
    let (refresh_reports_tx, mut refresh_reports_rx) = mpsc::unbounded_channel();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                drop(worker_jobs_tx);
                while workers.join_next().await.is_some() {}
                break;
            }
            Some(cmd) = cmd_rx.recv() => {
                handle_command(&mut state, cmd).await;
            }
            _ = maintenance_ticker.tick() => {
                dispatch_refreshes(&mut state, &refresh_reports_tx);
                sweep_and_compact(&mut state);
            }
            Some(report) = refresh_reports_rx.recv() => {
                apply_refresh_report(&mut state, report);
            }
            Some(report) = job_reports_rx.recv() => {
                apply_job_report(&mut state, report);
            }
        }
        // Every iteration, not just the maintenance tick, gives a freed slot
        // (from a job report) or a newly discovered advisory (from a refresh
        // report) a prompt chance at dispatch rather than waiting up to a
        // full maintenance-tick interval (spec §4.1's "per iteration, before
        // selecting" dispatch model).
        dispatch_downloads(&mut state, &worker_jobs_tx).await;
    }
}

/// Periodic cache eviction and location-queue compaction (spec §4.1(a)/(b)),
/// run once per maintenance tick regardless of any individual source's own
/// `FeedRefresh` cadence.
fn sweep_and_compact(state: &mut ManagerState) {
    state.pmd_cache.sweep();
    state.keys_cache.sweep();
    let now = Utc::now();
    let retain_after = chrono::Duration::days(LOCATION_RETENTION_DAYS);
    for source in state.catalogue.sources_mut() {
        for feed in source.feeds.iter_mut() {
            feed.compact_done(now, retain_after);
        }
    }
}

/// Handle to the running Source Manager. Cheaply cloneable in spirit (every
/// method just sends a command and awaits the reply), but kept non-`Clone`
/// since it also owns the loop's `JoinHandle` for a clean `shutdown`.
pub struct SourceManager {
    cmd_tx: mpsc::UnboundedSender<ManagerCommand>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SourceManager {
    /// Starts the manager's command loop as a background task.
    pub fn spawn(
        persistence: Arc<dyn PersistencePort>,
        pmd_port: Arc<dyn PmdPort>,
        feed_parser: Arc<dyn FeedParsePort>,
        validator: Arc<dyn ValidatorPort>,
        crypto: crate::core::crypto::CryptoBox,
        defaults: ManagerDefaults,
    ) -> Self {
        Self::spawn_with_remote_validator(persistence, pmd_port, feed_parser, validator, crypto, defaults, None)
    }

    /// As [`Self::spawn`], additionally wiring an optional remote validator
    /// port (spec §4, "Remote validator port") that every downloaded
    /// document must pass before it is persisted.
    pub fn spawn_with_remote_validator(
        persistence: Arc<dyn PersistencePort>,
        pmd_port: Arc<dyn PmdPort>,
        feed_parser: Arc<dyn FeedParsePort>,
        validator: Arc<dyn ValidatorPort>,
        crypto: crate::core::crypto::CryptoBox,
        defaults: ManagerDefaults,
        remote_validator: Option<Arc<dyn RemoteValidatorPort>>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        crate::core::metrics::GLOBAL_SLOTS.set(defaults.global_slots as f64);
        let state = ManagerState {
            catalogue: Catalogue::new(),
            scheduler: Scheduler::new(defaults.global_slots, defaults.slots_per_source),
            crypto,
            pmd_cache: PmdCache::new(pmd_port.clone(), DEFAULT_PMD_TTL),
            keys_cache: KeysCache::new(pmd_port.clone(), DEFAULT_KEY_TTL),
            persistence,
            pmd_port,
            feed_parser,
            validator,
            remote_validator,
            defaults,
        };
        let handle = tokio::spawn(run_loop(state, cmd_rx, shutdown_rx));
        SourceManager {
            cmd_tx,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signals the command loop to stop, let in-flight downloads drain, and
    /// waits for it to exit (spec §5, §8 shutdown-drain scenario).
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn call<T: Send + 'static>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T, SourceMgrError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .map_err(|_| SourceMgrError::Internal("manager loop has stopped".to_string()))?;
        rx.await
            .map_err(|_| SourceMgrError::Internal("manager loop has stopped".to_string()))
    }

    pub async fn sources(&self) -> Result<Vec<SourceView>, SourceMgrError> {
        self.call(ManagerCommand::Sources).await
    }

    pub async fn source(&self, id: i64) -> Result<SourceView, SourceMgrError> {
        self.call(|tx| ManagerCommand::Source(id, tx)).await?
    }

    pub async fn feeds(&self, source_id: i64) -> Result<Vec<FeedView>, SourceMgrError> {
        self.call(|tx| ManagerCommand::Feeds(source_id, tx)).await?
    }

    pub async fn feed(&self, feed_id: i64) -> Result<FeedView, SourceMgrError> {
        self.call(|tx| ManagerCommand::Feed(feed_id, tx)).await?
    }

    pub async fn attention_sources(&self) -> Result<Vec<SourceView>, SourceMgrError> {
        self.call(ManagerCommand::AttentionSources).await
    }

    /// Resolves which of `urls` are already known feeds (spec §6
    /// `Subscriptions(urls)`).
    pub async fn subscriptions(&self, urls: Vec<url::Url>) -> Result<Vec<FeedView>, SourceMgrError> {
        self.call(|tx| ManagerCommand::Subscriptions(urls, tx)).await
    }

    /// On-demand provider-metadata fetch for a known source's own url (spec
    /// §6 `PMD(url)`).
    pub async fn pmd(&self, url: url::Url) -> Result<Arc<serde_json::Value>, SourceMgrError> {
        self.call(|tx| ManagerCommand::Pmd(url, tx)).await?
    }

    pub async fn add_source(&self, draft: NewSource) -> Result<i64, SourceMgrError> {
        self.call(|tx| ManagerCommand::AddSource(draft, tx)).await?
    }

    pub async fn add_feed(&self, source_id: i64, draft: NewFeed) -> Result<i64, SourceMgrError> {
        self.call(|tx| ManagerCommand::AddFeed(source_id, draft, tx)).await?
    }

    pub async fn remove_source(&self, id: i64) -> Result<(), SourceMgrError> {
        self.call(|tx| ManagerCommand::RemoveSource(id, tx)).await?
    }

    pub async fn remove_feed(&self, source_id: i64, feed_id: i64) -> Result<(), SourceMgrError> {
        self.call(|tx| ManagerCommand::RemoveFeed(source_id, feed_id, tx)).await?
    }

    pub async fn update_source(&self, id: i64, patch: SourceUpdate) -> Result<UpdateOutcome, SourceMgrError> {
        self.call(|tx| ManagerCommand::UpdateSource(id, patch, tx)).await?
    }

    pub async fn update_feed(&self, source_id: i64, feed_id: i64, patch: FeedUpdate) -> Result<UpdateOutcome, SourceMgrError> {
        self.call(|tx| ManagerCommand::UpdateFeed(source_id, feed_id, patch, tx)).await?
    }

    pub async fn feed_log(&self, source_id: i64, feed_id: i64) -> Result<Vec<FeedLogEntry>, SourceMgrError> {
        self.call(|tx| ManagerCommand::FeedLog(source_id, feed_id, tx)).await?
    }

    pub async fn aggregators(&self) -> Result<Vec<AggregatorRecord>, SourceMgrError> {
        self.call(ManagerCommand::Aggregators).await?
    }

    pub async fn acknowledge_aggregator(&self, id: i64) -> Result<(), SourceMgrError> {
        self.call(|tx| ManagerCommand::AcknowledgeAggregator(id, tx)).await?
    }
}
