// src/core/feeds/directory.rs

//! Parses a bare directory listing page by regex-matching `<a href="...">`
//! anchors (spec §9 Open Question 2: no HTML-parsing crate appears in the
//! teacher or the retrieval pack for this role, so a directory listing is
//! treated as a flat, regular structure rather than arbitrary HTML).

use lazy_static::lazy_static;
use regex::Regex;

use crate::core::errors::SourceMgrError;
use crate::core::model::ClientIdentity;
use crate::core::ports::{DiscoveredEntry, PmdPort};

use super::fetch_sibling;

lazy_static! {
    static ref HREF_RE: Regex = Regex::new(r#"href\s*=\s*"([^"]+\.json)""#).unwrap();
}

pub async fn parse_directory(
    feed_url: &url::Url,
    headers: &[String],
    identity: Option<&ClientIdentity>,
    insecure: bool,
    pmd_port: &dyn PmdPort,
) -> Result<Vec<DiscoveredEntry>, SourceMgrError> {
    let document = pmd_port.fetch(feed_url, headers, identity, insecure).await?;
    let html = String::from_utf8_lossy(&document.body);

    let mut entries = Vec::new();
    for capture in HREF_RE.captures_iter(&html) {
        let href = &capture[1];
        let Ok(advisory_url) = feed_url.join(href) else {
            continue;
        };
        let hash = fetch_sibling(&advisory_url, ".sha256", headers, identity, insecure, pmd_port).await;
        let signature = fetch_sibling(&advisory_url, ".asc", headers, identity, insecure, pmd_port).await;
        entries.push(DiscoveredEntry {
            url: advisory_url,
            hash,
            signature,
            published: None,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use url::Url;

    struct FixturePmd;

    #[async_trait]
    impl PmdPort for FixturePmd {
        async fn fetch(
            &self,
            url: &Url,
            _headers: &[String],
            _identity: Option<&ClientIdentity>,
            _insecure: bool,
        ) -> Result<crate::core::ports::FetchedDocument, SourceMgrError> {
            if url.as_str().ends_with("index.html") {
                let body = br#"<html><body>
                    <a href="a-2026-001.json">advisory 1</a>
                    <a href="a-2026-002.json">advisory 2</a>
                </body></html>"#
                    .to_vec();
                Ok(crate::core::ports::FetchedDocument { body, content_type: None })
            } else {
                Err(SourceMgrError::Http("no such sibling".into()))
            }
        }
    }

    #[tokio::test]
    async fn extracts_every_json_anchor() {
        let feed_url = Url::parse("https://example.org/advisories/index.html").unwrap();
        let entries = parse_directory(&feed_url, &[], None, false, &FixturePmd).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].url.as_str().ends_with("a-2026-001.json"));
        assert!(entries[1].url.as_str().ends_with("a-2026-002.json"));
    }
}
