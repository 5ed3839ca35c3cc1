// src/core/catalogue.rs

//! The in-memory catalogue of sources and feeds (spec §3, §9).
//!
//! Owned exclusively by [`crate::core::manager::SourceManager`]'s command
//! loop — nothing outside that task ever holds a mutable reference to a
//! [`Catalogue`], which is what lets every other module treat `Source`/`Feed`
//! lookups as ordinary, lock-free map operations.

use indexmap::IndexMap;

use crate::core::errors::SourceMgrError;
use crate::core::model::{Feed, Source};

/// Sources keyed by id, insertion-ordered so that list operations (`Sources`,
/// `AttentionSources`) return a stable, deterministic order across calls.
#[derive(Debug, Default)]
pub struct Catalogue {
    sources: IndexMap<i64, Source>,
}

impl Catalogue {
    pub fn new() -> Self {
        Catalogue {
            sources: IndexMap::new(),
        }
    }

    pub fn insert_source(&mut self, source: Source) {
        self.sources.insert(source.id, source);
    }

    pub fn remove_source(&mut self, id: i64) -> Option<Source> {
        self.sources.shift_remove(&id)
    }

    pub fn source(&self, id: i64) -> Result<&Source, SourceMgrError> {
        self.sources
            .get(&id)
            .ok_or_else(|| SourceMgrError::NoSuchEntry(format!("source {id}")))
    }

    pub fn source_mut(&mut self, id: i64) -> Result<&mut Source, SourceMgrError> {
        self.sources
            .get_mut(&id)
            .ok_or_else(|| SourceMgrError::NoSuchEntry(format!("source {id}")))
    }

    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    pub fn sources_mut(&mut self) -> impl Iterator<Item = &mut Source> {
        self.sources.values_mut()
    }

    pub fn feed(&self, source_id: i64, feed_id: i64) -> Result<&Feed, SourceMgrError> {
        self.source(source_id)?
            .feeds
            .iter()
            .find(|f| f.id == feed_id)
            .ok_or_else(|| SourceMgrError::NoSuchEntry(format!("feed {feed_id}")))
    }

    pub fn feed_mut(&mut self, source_id: i64, feed_id: i64) -> Result<&mut Feed, SourceMgrError> {
        self.source_mut(source_id)?
            .feeds
            .iter_mut()
            .find(|f| f.id == feed_id)
            .ok_or_else(|| SourceMgrError::NoSuchEntry(format!("feed {feed_id}")))
    }

    /// Finds a feed by id alone, scanning every source. Used by the single-feed
    /// lookup API, which is handed a bare feed id with no source context.
    pub fn find_feed(&self, feed_id: i64) -> Result<&Feed, SourceMgrError> {
        self.sources
            .values()
            .find_map(|s| s.feeds.iter().find(|f| f.id == feed_id))
            .ok_or_else(|| SourceMgrError::NoSuchEntry(format!("feed {feed_id}")))
    }

    /// Finds a feed by id alone, resolving its owning source_id first. Used
    /// when a caller (e.g. a completed download job) only carries the feed id.
    pub fn find_feed_mut(&mut self, feed_id: i64) -> Result<&mut Feed, SourceMgrError> {
        let source_id = self
            .sources
            .values()
            .find(|s| s.feeds.iter().any(|f| f.id == feed_id))
            .map(|s| s.id)
            .ok_or_else(|| SourceMgrError::NoSuchEntry(format!("feed {feed_id}")))?;
        self.feed_mut(source_id, feed_id)
    }

    /// Sources with at least one `status` line set (spec §4.6, `AttentionSources`).
    pub fn attention_sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.values().filter(|s| !s.status.is_empty())
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn source(id: i64) -> Source {
        Source {
            id,
            name: format!("source-{id}"),
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

    #[test]
    fn insert_and_lookup_round_trips() {
        let mut cat = Catalogue::new();
        cat.insert_source(source(1));
        assert!(cat.source(1).is_ok());
        assert!(matches!(cat.source(2), Err(SourceMgrError::NoSuchEntry(_))));
    }

    #[test]
    fn remove_drops_the_entry() {
        let mut cat = Catalogue::new();
        cat.insert_source(source(1));
        assert!(cat.remove_source(1).is_some());
        assert!(cat.source(1).is_err());
    }

    #[test]
    fn attention_sources_filters_on_status() {
        let mut cat = Catalogue::new();
        let mut s1 = source(1);
        s1.status.push("client certificate deactivated".into());
        cat.insert_source(s1);
        cat.insert_source(source(2));
        let attention: Vec<_> = cat.attention_sources().map(|s| s.id).collect();
        assert_eq!(attention, vec![1]);
    }

    #[test]
    fn find_feed_mut_resolves_the_owning_source() {
        let mut cat = Catalogue::new();
        let mut s = source(1);
        s.feeds.push(Feed::new(10, 1, "main".into(), s.url.clone(), true));
        cat.insert_source(s);
        assert_eq!(cat.find_feed_mut(10).unwrap().id, 10);
        assert!(cat.find_feed_mut(99).is_err());
    }
}
