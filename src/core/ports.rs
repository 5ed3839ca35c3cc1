// src/core/ports.rs

//! Named contracts onto the Source Manager's external collaborators (spec
//! §6): the relational store, the PMD fetcher, the feed parser, and the
//! advisory validator. Each is a trait so a concrete default can be swapped
//! for a test double without touching [`crate::core::manager`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::errors::SourceMgrError;
use crate::core::model::LogLevel;

/// A single bound value for a dynamic `UPDATE ... SET field = $1` statement.
/// The [`crate::core::updater`] framework builds these up field-by-field as it
/// stages a multi-field change; [`PersistencePort::update_fields`] binds them
/// positionally in the order given.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Text(String),
    OptText(Option<String>),
    Bool(bool),
    OptBool(Option<bool>),
    OptF64(Option<f64>),
    OptI32(Option<i32>),
    OptI64(Option<i64>),
    OptBytes(Option<Vec<u8>>),
    StringArray(Vec<String>),
    OptTimestamp(Option<DateTime<Utc>>),
}

/// Row shape returned by [`PersistencePort::list_aggregators`] (spec §3.1,
/// §6). `checksum_ack < checksum_updated` is the aggregator's attention flag
/// (spec GLOSSARY); `AcknowledgeAggregator` clears it by setting
/// `checksum_ack = checksum_updated`.
#[derive(Debug, Clone)]
pub struct AggregatorRecord {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub active: bool,
    pub checksum_ack: Option<DateTime<Utc>>,
    pub checksum_updated: Option<DateTime<Utc>>,
}

impl AggregatorRecord {
    /// True when the aggregator has unacknowledged changes.
    pub fn needs_attention(&self) -> bool {
        self.checksum_ack < self.checksum_updated
    }
}

/// The relational store as the manager sees it: a handful of named
/// operations rather than an arbitrary `Run(ctx, fn)` closure, since Rust has
/// no convenient way to pass "a function over a borrowed connection" across
/// an object-safe trait boundary without boxing every call site anyway —
/// naming the operations keeps each one independently testable.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn insert_row(&self, table: &'static str, fields: &[(&'static str, SqlValue)]) -> Result<i64, SourceMgrError>;

    async fn update_fields(
        &self,
        table: &'static str,
        id: i64,
        fields: &[(&'static str, SqlValue)],
    ) -> Result<u64, SourceMgrError>;

    async fn delete_row(&self, table: &'static str, id: i64) -> Result<u64, SourceMgrError>;

    async fn append_feed_log(&self, feed_id: i64, level: LogLevel, message: &str) -> Result<(), SourceMgrError>;

    /// Persists a validated advisory document discovered by `feed_id` at `url`.
    async fn store_advisory(&self, feed_id: i64, url: &str, document: &[u8]) -> Result<(), SourceMgrError>;

    async fn list_aggregators(&self) -> Result<Vec<AggregatorRecord>, SourceMgrError>;

    async fn acknowledge_aggregator(&self, id: i64) -> Result<(), SourceMgrError>;
}

/// Raw bytes and content-type of a fetched provider-metadata document
/// (spec §4.4).
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

/// Fetches provider-metadata documents over HTTP(S), honoring a source's
/// headers, TLS identity, and insecure flag (spec §6).
#[async_trait]
pub trait PmdPort: Send + Sync {
    async fn fetch(
        &self,
        url: &url::Url,
        headers: &[String],
        identity: Option<&crate::core::model::ClientIdentity>,
        insecure: bool,
    ) -> Result<FetchedDocument, SourceMgrError>;
}

/// A single entry discovered while parsing a feed: the advisory URL plus any
/// published checksum/signature siblings (spec §4.4). `published` is the
/// entry's own timestamp when the feed format carries one (ROLIE `updated`),
/// used by the `DefaultAge`/`MaxAge` cutoffs; directory listings have no
/// such metadata and always report `None`.
#[derive(Debug, Clone)]
pub struct DiscoveredEntry {
    pub url: url::Url,
    pub hash: Option<String>,
    pub signature: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

/// Classifies and parses feed documents: ROLIE service documents or bare
/// directory listings (spec §4.4, §9 Open Question 2).
#[async_trait]
pub trait FeedParsePort: Send + Sync {
    /// `true` if the PMD's `distributions[].rolie` structure names this feed.
    fn is_rolie_feed(&self, pmd: &serde_json::Value, feed_url: &url::Url) -> bool;

    async fn parse(
        &self,
        feed_url: &url::Url,
        rolie: bool,
        headers: &[String],
        identity: Option<&crate::core::model::ClientIdentity>,
        insecure: bool,
    ) -> Result<Vec<DiscoveredEntry>, SourceMgrError>;
}

/// Validates a downloaded advisory document: CSAF schema conformance in
/// strict mode, checksum and OpenPGP signature verification (spec §4.4).
#[async_trait]
pub trait ValidatorPort: Send + Sync {
    async fn validate_schema(&self, document: &[u8]) -> Result<(), SourceMgrError>;

    fn verify_checksum(&self, document: &[u8], expected: &str) -> bool;

    fn verify_signature(&self, document: &[u8], signature: &str, public_key: Option<&[u8]>) -> bool;
}

/// Outcome of a [`RemoteValidatorPort::validate`] call.
#[derive(Debug, Clone)]
pub struct RemoteValidation {
    pub ok: bool,
    pub messages: Vec<String>,
}

/// Optional external validation step (spec §4, "Remote validator port"):
/// when configured, every downloaded document is additionally checked
/// against a remote service before it is stored. Separate from
/// [`ValidatorPort`], which covers checks this core can perform itself
/// (checksum, signature, schema); a rejection here carries the remote
/// service's own diagnostic messages instead of a generic error string.
#[async_trait]
pub trait RemoteValidatorPort: Send + Sync {
    async fn validate(&self, document: &[u8]) -> Result<RemoteValidation, SourceMgrError>;
}
