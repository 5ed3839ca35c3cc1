// src/core/model.rs

//! The catalogue's entities: [`Source`], [`Feed`], [`Location`] (spec §3).
//!
//! Nothing in this module is shared mutable state in the usual `Arc<Mutex<_>>`
//! sense: the catalogue that owns these values is single-writer (see
//! [`crate::core::manager`]), so most fields are plain and mutated directly by
//! the manager task. The two fields workers read without going through the
//! command channel ([`FeedAtomics::log_level`], [`FeedAtomics::invalid`]) are
//! carried in a small `Arc`'d side-struct instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use regex::Regex;
use url::Url;

/// A three-valued flag: `None` means "inherit the configured default",
/// `Some(true)`/`Some(false)` are explicit overrides (spec §3, tri-state fields).
pub type TriState = Option<bool>;

/// Per-source token-bucket limiter (spec §4.2/§9, `governor` pacing).
pub type RateLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Severity of a single feed log line (spec §4.6, `FeedLog`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warn => 2,
            LogLevel::Error => 3,
        }
    }
}

/// One line of a feed's activity log, as returned by `FeedLog` (spec §4.6).
#[derive(Debug, Clone)]
pub struct FeedLogEntry {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Where a single discovered advisory document currently stands in the
/// download pipeline (spec §3, Location lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationState {
    /// Discovered, not yet claimed by a worker.
    Waiting,
    /// Claimed by a worker and in flight.
    Running,
    /// Persisted (or permanently failed and logged); no longer scheduled.
    Done,
}

/// A single advisory document discovered in a feed (spec §3).
#[derive(Debug, Clone)]
pub struct Location {
    pub url: Url,
    pub discovered_at: DateTime<Utc>,
    /// Checksum published alongside the document, if any (e.g. `.sha256`).
    pub hash: Option<String>,
    /// Detached OpenPGP signature published alongside the document, if any.
    pub signature: Option<String>,
    pub state: LocationState,
}

impl Location {
    pub fn new(url: Url) -> Self {
        Location {
            url,
            discovered_at: Utc::now(),
            hash: None,
            signature: None,
            state: LocationState::Waiting,
        }
    }
}

/// Fields a worker reads directly, without going through the command channel
/// (spec §9: "atomic scalars for cross-thread-readable feed fields").
#[derive(Debug)]
pub struct FeedAtomics {
    log_level: AtomicU8,
    invalid: AtomicBool,
}

impl FeedAtomics {
    pub fn new(log_level: LogLevel, invalid: bool) -> Arc<Self> {
        Arc::new(FeedAtomics {
            log_level: AtomicU8::new(log_level.as_u8()),
            invalid: AtomicBool::new(invalid),
        })
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_u8(self.log_level.load(Ordering::Relaxed))
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.log_level.store(level.as_u8(), Ordering::Relaxed);
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Relaxed)
    }

    pub fn set_invalid(&self, invalid: bool) {
        self.invalid.store(invalid, Ordering::Relaxed);
    }
}

/// A feed belonging to a [`Source`]: one ROLIE service document or directory
/// listing to poll on a schedule (spec §3).
#[derive(Debug)]
pub struct Feed {
    pub id: i64,
    /// Non-owning back-reference, resolved through the catalogue (spec §9) —
    /// never an `Rc`/`Weak` cycle back to the owning `Source`.
    pub source_id: i64,
    pub label: String,
    pub url: Url,
    /// `true` for a ROLIE service document, `false` for a bare directory listing.
    pub rolie: bool,
    pub atomics: Arc<FeedAtomics>,
    pub next_check: Option<DateTime<Utc>>,
    pub queue: VecDeque<Location>,
    pub log: VecDeque<FeedLogEntry>,
}

/// Cap on retained feed-log lines (spec §4.6).
pub const FEED_LOG_CAPACITY: usize = 200;

impl Feed {
    pub fn new(id: i64, source_id: i64, label: String, url: Url, rolie: bool) -> Self {
        Feed {
            id,
            source_id,
            label,
            url,
            rolie,
            atomics: FeedAtomics::new(LogLevel::Info, false),
            next_check: None,
            queue: VecDeque::new(),
            log: VecDeque::new(),
        }
    }

    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.log.len() >= FEED_LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(FeedLogEntry {
            time: Utc::now(),
            level,
            message: message.into(),
        });
    }

    /// Drops `Done` locations discovered before `now - retain_after` (spec
    /// §4.1(b), location compaction). The `advisories` table's
    /// `UNIQUE (feed_id, url)` upsert makes this purely a memory-growth
    /// optimization: a URL compacted away and later rediscovered just
    /// re-enters the queue as `Waiting` and upserts over the old row.
    pub fn compact_done(&mut self, now: DateTime<Utc>, retain_after: chrono::Duration) {
        let cutoff = now - retain_after;
        self.queue
            .retain(|location| location.state != LocationState::Done || location.discovered_at > cutoff);
    }
}

/// An mTLS client identity derived from a source's certificate triple
/// (spec §4.7/§4.8). Built once per successful derivation and reused by
/// every worker downloading on behalf of the source.
#[derive(Clone)]
pub struct ClientIdentity {
    pub identity: reqwest::Identity,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity").finish_non_exhaustive()
    }
}

/// A CSAF provider: a feed source plus its operational configuration
/// (spec §3, Source fields).
#[derive(Debug)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub url: Url,
    pub active: bool,
    /// Advisories per second; `None` means unpaced.
    pub rate: Option<f64>,
    /// Download slot cap for this source alone; `None` inherits the configured default.
    pub slots: Option<u32>,
    pub headers: Vec<String>,
    pub strict_mode: TriState,
    pub insecure: TriState,
    pub signature_check: TriState,
    /// Ignore advisories discovered before this age, if set.
    pub age: Option<Duration>,
    pub ignore_pattern_sources: Vec<String>,
    pub ignore_patterns: Vec<Regex>,
    /// PEM-encoded client certificate, plaintext in memory (spec §4.8: the
    /// crypto box only protects the persisted form).
    pub client_cert_public: Option<Vec<u8>>,
    pub client_cert_private: Option<Vec<u8>>,
    pub client_cert_passphrase: Option<Vec<u8>>,
    pub client_identity: Option<ClientIdentity>,
    /// Human-readable status lines (e.g. "client certificate deactivated: ...").
    pub status: Vec<String>,
    pub used_slots: u32,
    pub feeds: Vec<Feed>,
    pub limiter: Option<Arc<RateLimiter>>,
}

impl Source {
    /// Slots this source may use concurrently right now, folding in the global
    /// cap and the per-source override (spec §4.2, two-tier admission control).
    pub fn effective_slot_cap(&self, global_default_per_source: u32, global_slots: u32) -> u32 {
        let per_source = self.slots.unwrap_or(global_default_per_source);
        per_source.min(global_slots)
    }

    pub fn available_slots(&self, global_default_per_source: u32, global_slots: u32) -> u32 {
        self.effective_slot_cap(global_default_per_source, global_slots)
            .saturating_sub(self.used_slots)
    }

    pub fn resolves(&self, strict_mode_default: bool) -> bool {
        self.strict_mode.unwrap_or(strict_mode_default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn feed_log_is_bounded() {
        let mut feed = Feed::new(1, 1, "test".into(), url("https://example.org/feed"), true);
        for i in 0..(FEED_LOG_CAPACITY + 10) {
            feed.push_log(LogLevel::Info, format!("line {i}"));
        }
        assert_eq!(feed.log.len(), FEED_LOG_CAPACITY);
        assert_eq!(feed.log.front().unwrap().message, "line 10");
    }

    #[test]
    fn compact_done_drops_only_stale_done_locations() {
        let mut feed = Feed::new(1, 1, "test".into(), url("https://example.org/feed"), true);
        let now = Utc::now();

        let mut stale_done = Location::new(url("https://example.org/a.json"));
        stale_done.state = LocationState::Done;
        stale_done.discovered_at = now - chrono::Duration::days(10);

        let mut recent_done = Location::new(url("https://example.org/b.json"));
        recent_done.state = LocationState::Done;
        recent_done.discovered_at = now;

        let waiting = Location::new(url("https://example.org/c.json"));

        feed.queue.push_back(stale_done);
        feed.queue.push_back(recent_done);
        feed.queue.push_back(waiting);

        feed.compact_done(now, chrono::Duration::days(1));

        assert_eq!(feed.queue.len(), 2);
        assert!(feed.queue.iter().any(|l| l.url.as_str().ends_with("b.json")));
        assert!(feed.queue.iter().any(|l| l.url.as_str().ends_with("c.json")));
    }

    #[test]
    fn feed_atomics_are_readable_without_a_lock() {
        let atomics = FeedAtomics::new(LogLevel::Warn, false);
        assert_eq!(atomics.log_level(), LogLevel::Warn);
        assert!(!atomics.is_invalid());
        atomics.set_invalid(true);
        assert!(atomics.is_invalid());
    }

    #[test]
    fn effective_slot_cap_is_the_tighter_of_source_and_global() {
        let mut source = Source {
            id: 1,
            name: "acme".into(),
            url: url("https://acme.example/.well-known/csaf/provider-metadata.json"),
            active: true,
            rate: None,
            slots: Some(10),
            headers: vec![],
            strict_mode: None,
            insecure: None,
            signature_check: None,
            age: None,
            ignore_pattern_sources: vec![],
            ignore_patterns: vec![],
            client_cert_public: None,
            client_cert_private: None,
            client_cert_passphrase: None,
            client_identity: None,
            status: vec![],
            used_slots: 0,
            feeds: vec![],
            limiter: None,
        };
        assert_eq!(source.effective_slot_cap(5, 3), 3);
        source.slots = Some(2);
        assert_eq!(source.effective_slot_cap(5, 3), 2);
        source.used_slots = 2;
        assert_eq!(source.available_slots(5, 3), 0);
    }
}
