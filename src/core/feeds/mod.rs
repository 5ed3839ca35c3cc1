// src/core/feeds/mod.rs

//! Default [`FeedParsePort`]: classifies and parses CSAF ROLIE service
//! documents and bare directory listings (spec §4.4).

pub mod directory;
pub mod rolie;

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::errors::SourceMgrError;
use crate::core::model::ClientIdentity;
use crate::core::ports::{DiscoveredEntry, FeedParsePort, FetchedDocument, PmdPort};

pub struct DefaultFeedParser {
    pmd_port: Arc<dyn PmdPort>,
}

impl DefaultFeedParser {
    pub fn new(pmd_port: Arc<dyn PmdPort>) -> Self {
        DefaultFeedParser { pmd_port }
    }
}

#[async_trait]
impl FeedParsePort for DefaultFeedParser {
    fn is_rolie_feed(&self, pmd: &serde_json::Value, feed_url: &url::Url) -> bool {
        let Some(distributions) = pmd.get("distributions").and_then(|d| d.as_array()) else {
            return false;
        };
        distributions.iter().any(|dist| {
            dist.get("rolie")
                .and_then(|r| r.get("feeds"))
                .and_then(|f| f.as_array())
                .is_some_and(|feeds| {
                    feeds
                        .iter()
                        .filter_map(|f| f.get("url").and_then(|u| u.as_str()))
                        .any(|u| u == feed_url.as_str())
                })
        })
    }

    async fn parse(
        &self,
        feed_url: &url::Url,
        rolie: bool,
        headers: &[String],
        identity: Option<&ClientIdentity>,
        insecure: bool,
    ) -> Result<Vec<DiscoveredEntry>, SourceMgrError> {
        if rolie {
            rolie::parse_rolie(feed_url, headers, identity, insecure, self.pmd_port.as_ref()).await
        } else {
            directory::parse_directory(feed_url, headers, identity, insecure, self.pmd_port.as_ref()).await
        }
    }
}

/// Fetches the `.sha256`/`.asc` sibling of `url`, if published — the common
/// CSAF convention of a same-named checksum/detached-signature file. Shared
/// by both the ROLIE and directory parsers.
pub(crate) async fn fetch_sibling(
    url: &url::Url,
    suffix: &str,
    headers: &[String],
    identity: Option<&ClientIdentity>,
    insecure: bool,
    pmd_port: &dyn PmdPort,
) -> Option<String> {
    let sibling = format!("{}{}", url.as_str(), suffix);
    let sibling_url = url::Url::parse(&sibling).ok()?;
    let document: FetchedDocument = pmd_port.fetch(&sibling_url, headers, identity, insecure).await.ok()?;
    String::from_utf8(document.body).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use url::Url;

    struct NullPmd;

    #[async_trait]
    impl PmdPort for NullPmd {
        async fn fetch(
            &self,
            _url: &Url,
            _headers: &[String],
            _identity: Option<&ClientIdentity>,
            _insecure: bool,
        ) -> Result<FetchedDocument, SourceMgrError> {
            Err(SourceMgrError::Http("not reachable in this test".into()))
        }
    }

    #[test]
    fn classifies_a_rolie_feed_from_provider_metadata() {
        let parser = DefaultFeedParser::new(Arc::new(NullPmd));
        let feed_url = Url::parse("https://example.org/.well-known/csaf/feed-tlp-white.json").unwrap();
        let pmd = json!({
            "distributions": [
                {"rolie": {"feeds": [{"url": feed_url.as_str()}]}}
            ]
        });
        assert!(parser.is_rolie_feed(&pmd, &feed_url));

        let other_url = Url::parse("https://example.org/some-other-feed.json").unwrap();
        assert!(!parser.is_rolie_feed(&pmd, &other_url));
    }

    #[test]
    fn a_pmd_with_no_distributions_is_never_rolie() {
        let parser = DefaultFeedParser::new(Arc::new(NullPmd));
        let feed_url = Url::parse("https://example.org/feed.json").unwrap();
        assert!(!parser.is_rolie_feed(&json!({}), &feed_url));
    }
}
