// src/core/updater.rs

//! The staged update framework used by `UpdateSource`/`UpdateFeed` (spec
//! §4.5): callers stage one or more field changes, the manager persists them
//! in a single statement, and only once that succeeds are they applied to the
//! in-memory catalogue. A field set more than once in the same call keeps its
//! first value ("first-wins").

use std::collections::HashSet;

use crate::core::errors::SourceMgrError;
use crate::core::model::{ClientIdentity, Feed, Source};
use crate::core::ports::{PersistencePort, SqlValue};

/// Result of a staged update (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum UpdateOutcome {
    /// No fields were staged; nothing was persisted or applied.
    Unchanged,
    /// Fields were persisted and applied.
    Updated,
    /// Fields were persisted and applied, but a post-apply check found the
    /// source's mTLS identity unusable and soft-deactivated it.
    Deactivated,
}

/// Generic stage → persist → apply bookkeeping, shared by [`SourceUpdater`]
/// and [`FeedUpdater`]. Not exposed directly: each entity gets a thin,
/// typed wrapper with named setters instead of a stringly-typed `set` call,
/// since the field list and apply semantics differ per entity.
struct FieldStaging<T> {
    table: &'static str,
    id: i64,
    touched: HashSet<&'static str>,
    db_fields: Vec<(&'static str, SqlValue)>,
    applies: Vec<Box<dyn FnOnce(&mut T) + Send>>,
}

impl<T> FieldStaging<T> {
    fn new(table: &'static str, id: i64) -> Self {
        FieldStaging {
            table,
            id,
            touched: HashSet::new(),
            db_fields: Vec::new(),
            applies: Vec::new(),
        }
    }

    /// Stages `field`, unless it was already staged earlier in this update
    /// (first-wins, spec §4.5).
    fn set(&mut self, field: &'static str, value: SqlValue, apply: impl FnOnce(&mut T) + Send + 'static) {
        if !self.touched.insert(field) {
            return;
        }
        self.db_fields.push((field, value));
        self.applies.push(Box::new(apply));
    }

    fn is_empty(&self) -> bool {
        self.db_fields.is_empty()
    }

    async fn persist_and_apply(
        self,
        persistence: &dyn PersistencePort,
        target: &mut T,
    ) -> Result<bool, SourceMgrError> {
        if self.db_fields.is_empty() {
            return Ok(false);
        }
        persistence
            .update_fields(self.table, self.id, &self.db_fields)
            .await?;
        for apply in self.applies {
            apply(target);
        }
        Ok(true)
    }
}

/// Stages an `UpdateSource` call (spec §4.5, §6).
pub struct SourceUpdater {
    staging: FieldStaging<Source>,
    touches_client_cert: bool,
}

impl SourceUpdater {
    pub fn new(source_id: i64) -> Self {
        SourceUpdater {
            staging: FieldStaging::new("sources", source_id),
            touches_client_cert: false,
        }
    }

    pub fn set_name(&mut self, name: String) {
        let value = name.clone();
        self.staging
            .set("name", SqlValue::Text(value), move |s| s.name = name);
    }

    pub fn set_rate(&mut self, rate: Option<f64>) {
        self.staging.set("rate", SqlValue::OptF64(rate), move |s| {
            s.rate = rate;
            s.limiter = rate.map(crate::core::manager::build_limiter);
        });
    }

    pub fn set_slots(&mut self, slots: Option<u32>) {
        self.staging.set(
            "slots",
            SqlValue::OptI32(slots.map(|v| v as i32)),
            move |s| s.slots = slots,
        );
    }

    pub fn set_active(&mut self, active: bool) {
        self.staging
            .set("active", SqlValue::Bool(active), move |s| s.active = active);
    }

    pub fn set_headers(&mut self, headers: Vec<String>) {
        let value = headers.clone();
        self.staging
            .set("headers", SqlValue::StringArray(value), move |s| s.headers = headers);
    }

    pub fn set_strict_mode(&mut self, strict_mode: Option<bool>) {
        self.staging
            .set("strict_mode", SqlValue::OptBool(strict_mode), move |s| {
                s.strict_mode = strict_mode
            });
    }

    pub fn set_insecure(&mut self, insecure: Option<bool>) {
        self.staging
            .set("insecure", SqlValue::OptBool(insecure), move |s| s.insecure = insecure);
    }

    pub fn set_signature_check(&mut self, signature_check: Option<bool>) {
        self.staging
            .set("signature_check", SqlValue::OptBool(signature_check), move |s| {
                s.signature_check = signature_check
            });
    }

    pub fn set_age(&mut self, age: Option<std::time::Duration>) {
        self.staging.set(
            "age_seconds",
            SqlValue::OptI64(age.map(|d| d.as_secs() as i64)),
            move |s| s.age = age,
        );
    }

    /// Stages new client-certificate PEM material. `db_value` is the
    /// caller-encrypted-at-rest form (see [`crate::core::crypto::CryptoBox`]);
    /// `plaintext` is what lands back in memory. Marks this update for the
    /// post-commit identity re-derivation hook.
    pub fn set_client_cert(
        &mut self,
        field: &'static str,
        db_value: Option<Vec<u8>>,
        plaintext: Option<Vec<u8>>,
    ) {
        self.touches_client_cert = true;
        match field {
            "client_cert_public" => self.staging.set(field, SqlValue::OptBytes(db_value), move |s| {
                s.client_cert_public = plaintext
            }),
            "client_cert_private" => self.staging.set(field, SqlValue::OptBytes(db_value), move |s| {
                s.client_cert_private = plaintext
            }),
            "client_cert_passphrase" => self.staging.set(field, SqlValue::OptBytes(db_value), move |s| {
                s.client_cert_passphrase = plaintext
            }),
            other => unreachable!("not a client-cert field: {other}"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.staging.is_empty()
    }

    /// Persists and applies the staged fields, then — if any client-cert
    /// field was touched — attempts to re-derive the source's mTLS identity,
    /// soft-deactivating on failure (spec §4.7/§4.8).
    pub async fn commit(
        self,
        persistence: &dyn PersistencePort,
        source: &mut Source,
        derive_identity: impl FnOnce(&Source) -> Result<Option<ClientIdentity>, SourceMgrError>,
    ) -> Result<UpdateOutcome, SourceMgrError> {
        let touches_client_cert = self.touches_client_cert;
        let table = self.staging.table;
        let id = self.staging.id;
        let applied = self.staging.persist_and_apply(persistence, source).await?;
        if !applied {
            return Ok(UpdateOutcome::Unchanged);
        }
        if !touches_client_cert {
            return Ok(UpdateOutcome::Updated);
        }
        match derive_identity(source) {
            Ok(identity) => {
                source.client_identity = identity;
                Ok(UpdateOutcome::Updated)
            }
            Err(e) => {
                source.client_identity = None;
                source.active = false;
                source
                    .status
                    .push(format!("client certificate deactivated: {e}"));
                persistence
                    .update_fields(
                        table,
                        id,
                        &[
                            ("active", SqlValue::Bool(false)),
                            ("status", SqlValue::StringArray(source.status.clone())),
                        ],
                    )
                    .await?;
                Ok(UpdateOutcome::Deactivated)
            }
        }
    }
}

/// Stages an `UpdateFeed` call (spec §4.5, §6).
pub struct FeedUpdater {
    staging: FieldStaging<Feed>,
}

impl FeedUpdater {
    pub fn new(feed_id: i64) -> Self {
        FeedUpdater {
            staging: FieldStaging::new("feeds", feed_id),
        }
    }

    pub fn set_label(&mut self, label: String) {
        let value = label.clone();
        self.staging
            .set("label", SqlValue::Text(value), move |f| f.label = label);
    }

    pub fn set_url(&mut self, url: url::Url) {
        let value = url.clone();
        self.staging
            .set("url", SqlValue::Text(value.to_string()), move |f| f.url = url);
    }

    pub fn set_log_level(&mut self, level: crate::core::model::LogLevel) {
        self.staging
            .set("log_level", SqlValue::Text(level.to_string()), move |f| {
                f.atomics.set_log_level(level)
            });
    }

    pub fn is_empty(&self) -> bool {
        self.staging.is_empty()
    }

    pub async fn commit(
        self,
        persistence: &dyn PersistencePort,
        feed: &mut Feed,
    ) -> Result<UpdateOutcome, SourceMgrError> {
        if self.staging.persist_and_apply(persistence, feed).await? {
            Ok(UpdateOutcome::Updated)
        } else {
            Ok(UpdateOutcome::Unchanged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use url::Url;

    struct CountingPersistence {
        update_calls: AtomicUsize,
    }

    #[async_trait]
    impl PersistencePort for CountingPersistence {
        async fn insert_row(
            &self,
            _table: &'static str,
            _fields: &[(&'static str, SqlValue)],
        ) -> Result<i64, SourceMgrError> {
            Ok(1)
        }

        async fn update_fields(
            &self,
            _table: &'static str,
            _id: i64,
            fields: &[(&'static str, SqlValue)],
        ) -> Result<u64, SourceMgrError> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            Ok(fields.len() as u64)
        }

        async fn delete_row(&self, _table: &'static str, _id: i64) -> Result<u64, SourceMgrError> {
            Ok(1)
        }

        async fn append_feed_log(
            &self,
            _feed_id: i64,
            _level: crate::core::model::LogLevel,
            _message: &str,
        ) -> Result<(), SourceMgrError> {
            Ok(())
        }

        async fn store_advisory(&self, _feed_id: i64, _url: &str, _document: &[u8]) -> Result<(), SourceMgrError> {
            Ok(())
        }

        async fn list_aggregators(&self) -> Result<Vec<crate::core::ports::AggregatorRecord>, SourceMgrError> {
            Ok(vec![])
        }

        async fn acknowledge_aggregator(&self, _id: i64) -> Result<(), SourceMgrError> {
            Ok(())
        }
    }

    fn source(id: i64) -> Source {
        Source {
            id,
            name: "acme".into(),
            url: Url::parse("https://example.org/.well-known/csaf/provider-metadata.json").unwrap(),
            active: true,
            rate: None,
            slots: None,
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
        }
    }

    #[tokio::test]
    async fn unchanged_when_nothing_staged() {
        let persistence = CountingPersistence {
            update_calls: AtomicUsize::new(0),
        };
        let mut src = source(1);
        let updater = SourceUpdater::new(1);
        let outcome = updater.commit(&persistence, &mut src, |_| Ok(None)).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Unchanged);
        assert_eq!(persistence.update_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn first_wins_when_a_field_is_set_twice() {
        let persistence = CountingPersistence {
            update_calls: AtomicUsize::new(0),
        };
        let mut src = source(1);
        let mut updater = SourceUpdater::new(1);
        updater.set_name("first".into());
        updater.set_name("second".into());
        updater.commit(&persistence, &mut src, |_| Ok(None)).await.unwrap();
        assert_eq!(src.name, "first");
    }

    #[tokio::test]
    async fn client_cert_failure_soft_deactivates() {
        let persistence = CountingPersistence {
            update_calls: AtomicUsize::new(0),
        };
        let mut src = source(1);
        let mut updater = SourceUpdater::new(1);
        updater.set_client_cert("client_cert_public", Some(vec![1, 2, 3]), Some(vec![1, 2, 3]));
        let outcome = updater
            .commit(&persistence, &mut src, |_| {
                Err(SourceMgrError::InvalidArgument("bad PEM".into()))
            })
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Deactivated);
        assert!(!src.active);
        assert_eq!(src.status.len(), 1);
        assert_eq!(persistence.update_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn feed_updater_applies_log_level() {
        let persistence = CountingPersistence {
            update_calls: AtomicUsize::new(0),
        };
        let mut feed = Feed::new(1, 1, "main".into(), Url::parse("https://example.org/feed").unwrap(), true);
        let mut updater = FeedUpdater::new(1);
        updater.set_log_level(crate::core::model::LogLevel::Debug);
        let outcome = updater.commit(&persistence, &mut feed).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated);
        assert_eq!(feed.atomics.log_level(), crate::core::model::LogLevel::Debug);
    }
}
