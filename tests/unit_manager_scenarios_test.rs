use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;

use csaf_source_manager::core::crypto::CryptoBox;
use csaf_source_manager::core::errors::SourceMgrError;
use csaf_source_manager::core::manager::{
    ManagerDefaults, NewFeed, NewSource, SourceManager, SourceUpdate,
};
use csaf_source_manager::core::model::{ClientIdentity, LogLevel};
use csaf_source_manager::core::ports::{
    AggregatorRecord, DiscoveredEntry, FeedParsePort, FetchedDocument, PersistencePort, PmdPort,
    SqlValue, ValidatorPort,
};
use csaf_source_manager::core::updater::UpdateOutcome;

#[derive(Default)]
struct InMemoryPersistence {
    next_id: StdMutex<i64>,
}

#[async_trait]
impl PersistencePort for InMemoryPersistence {
    async fn insert_row(&self, _table: &'static str, _fields: &[(&'static str, SqlValue)]) -> Result<i64, SourceMgrError> {
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        Ok(*next_id)
    }
    async fn update_fields(&self, _table: &'static str, _id: i64, fields: &[(&'static str, SqlValue)]) -> Result<u64, SourceMgrError> {
        Ok(fields.len() as u64)
    }
    async fn delete_row(&self, _table: &'static str, _id: i64) -> Result<u64, SourceMgrError> {
        Ok(1)
    }
    async fn append_feed_log(&self, _feed_id: i64, _level: LogLevel, _message: &str) -> Result<(), SourceMgrError> {
        Ok(())
    }
    async fn store_advisory(&self, _feed_id: i64, _url: &str, _document: &[u8]) -> Result<(), SourceMgrError> {
        Ok(())
    }
    async fn list_aggregators(&self) -> Result<Vec<AggregatorRecord>, SourceMgrError> {
        Ok(vec![])
    }
    async fn acknowledge_aggregator(&self, _id: i64) -> Result<(), SourceMgrError> {
        Ok(())
    }
}

struct EmptyPmd;

#[async_trait]
impl PmdPort for EmptyPmd {
    async fn fetch(
        &self,
        _url: &url::Url,
        _headers: &[String],
        _identity: Option<&ClientIdentity>,
        _insecure: bool,
    ) -> Result<FetchedDocument, SourceMgrError> {
        Ok(FetchedDocument { body: b"{}".to_vec(), content_type: None })
    }
}

struct EmptyFeedParser;

#[async_trait]
impl FeedParsePort for EmptyFeedParser {
    fn is_rolie_feed(&self, _pmd: &serde_json::Value, _feed_url: &url::Url) -> bool {
        true
    }
    async fn parse(
        &self,
        _feed_url: &url::Url,
        _rolie: bool,
        _headers: &[String],
        _identity: Option<&ClientIdentity>,
        _insecure: bool,
    ) -> Result<Vec<DiscoveredEntry>, SourceMgrError> {
        Ok(vec![])
    }
}

struct PermissiveValidator;

#[async_trait]
impl ValidatorPort for PermissiveValidator {
    async fn validate_schema(&self, _document: &[u8]) -> Result<(), SourceMgrError> {
        Ok(())
    }
    fn verify_checksum(&self, _document: &[u8], _expected: &str) -> bool {
        true
    }
    fn verify_signature(&self, _document: &[u8], _signature: &str, _public_key: Option<&[u8]>) -> bool {
        true
    }
}

fn defaults() -> ManagerDefaults {
    ManagerDefaults {
        strict_mode: false,
        insecure: false,
        signature_check: false,
        slots_per_source: 4,
        global_slots: 16,
        refresh_interval: Duration::from_secs(3600),
        refresh_deadline: Duration::from_secs(5),
        worker_count: 2,
        max_rate_per_source: 10.0,
        default_age: Duration::from_secs(0),
        max_age: Duration::from_secs(3600 * 24 * 30),
    }
}

fn test_manager() -> SourceManager {
    SourceManager::spawn(
        std::sync::Arc::new(InMemoryPersistence::default()),
        std::sync::Arc::new(EmptyPmd),
        std::sync::Arc::new(EmptyFeedParser),
        std::sync::Arc::new(PermissiveValidator),
        CryptoBox::new("integration-test-secret"),
        defaults(),
    )
}

fn plain_source() -> NewSource {
    NewSource {
        name: "acme".into(),
        url: url::Url::parse("https://acme.example/.well-known/csaf/provider-metadata.json").unwrap(),
        rate: None,
        slots: None,
        age: None,
        headers: vec![],
        strict_mode: None,
        insecure: None,
        signature_check: None,
        ignore_patterns: vec![],
        client_cert_public: None,
        client_cert_private: None,
        client_cert_passphrase: None,
    }
}

#[tokio::test]
async fn add_source_round_trips_through_the_source_view() {
    let manager = test_manager();
    let id = manager.add_source(plain_source()).await.unwrap();

    let view = manager.source(id).await.unwrap();
    assert_eq!(view.id, id);
    assert_eq!(view.name, "acme");
    assert!(view.active);
    assert_eq!(view.rate, None);
    assert_eq!(view.slots, None);
    assert!(view.feed_ids.is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn update_source_with_no_fields_reports_unchanged() {
    let manager = test_manager();
    let id = manager.add_source(plain_source()).await.unwrap();

    let outcome = manager.update_source(id, SourceUpdate::default()).await.unwrap();
    assert_eq!(outcome, UpdateOutcome::Unchanged);

    manager.shutdown().await;
}

#[tokio::test]
async fn update_source_with_unusable_client_cert_deactivates_it() {
    let manager = test_manager();
    let id = manager.add_source(plain_source()).await.unwrap();

    let outcome = manager
        .update_source(
            id,
            SourceUpdate {
                client_cert_public: Some(Some(b"not a certificate".to_vec())),
                client_cert_private: Some(Some(b"not a private key".to_vec())),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome, UpdateOutcome::Deactivated);
    let view = manager.source(id).await.unwrap();
    assert!(!view.active);

    manager.shutdown().await;
}

#[tokio::test]
async fn add_feed_then_remove_feed_restores_the_feed_count() {
    let manager = test_manager();
    let source_id = manager.add_source(plain_source()).await.unwrap();

    let feed_id = manager
        .add_feed(
            source_id,
            NewFeed {
                label: "tlp-white".into(),
                url: url::Url::parse("https://acme.example/.well-known/csaf/white/index.json").unwrap(),
                rolie: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(manager.feeds(source_id).await.unwrap().len(), 1);

    manager.remove_feed(source_id, feed_id).await.unwrap();
    assert!(manager.feeds(source_id).await.unwrap().is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn add_source_rejects_a_rate_above_the_configured_ceiling() {
    let manager = test_manager();
    let mut draft = plain_source();
    draft.rate = Some(99.0);

    let err = manager.add_source(draft).await.unwrap_err();
    assert!(matches!(err, SourceMgrError::InvalidArgument(_)));

    manager.shutdown().await;
}

#[tokio::test]
async fn add_source_normalizes_a_zero_rate_to_unset() {
    let manager = test_manager();
    let mut draft = plain_source();
    draft.rate = Some(0.0);

    let id = manager.add_source(draft).await.unwrap();
    let view = manager.source(id).await.unwrap();
    assert_eq!(view.rate, None);

    manager.shutdown().await;
}

#[tokio::test]
async fn add_source_rejects_an_age_above_the_configured_max_age() {
    let manager = test_manager();
    let mut draft = plain_source();
    draft.age = Some(Duration::from_secs(3600 * 24 * 365));

    let err = manager.add_source(draft).await.unwrap_err();
    assert!(matches!(err, SourceMgrError::InvalidArgument(_)));

    manager.shutdown().await;
}

#[tokio::test]
async fn update_source_rejects_slots_above_the_configured_ceiling() {
    let manager = test_manager();
    let id = manager.add_source(plain_source()).await.unwrap();

    let err = manager
        .update_source(
            id,
            SourceUpdate {
                slots: Some(Some(999)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SourceMgrError::InvalidArgument(_)));

    manager.shutdown().await;
}

#[tokio::test]
async fn remove_source_then_lookup_reports_no_such_entry() {
    let manager = test_manager();
    let id = manager.add_source(plain_source()).await.unwrap();

    manager.remove_source(id).await.unwrap();
    let err = manager.source(id).await.unwrap_err();
    assert!(matches!(err, SourceMgrError::NoSuchEntry(_)));

    manager.shutdown().await;
}
