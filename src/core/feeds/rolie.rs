// src/core/feeds/rolie.rs

//! Parses a CSAF ROLIE service document into discovered advisory entries.

use serde::Deserialize;

use crate::core::errors::SourceMgrError;
use crate::core::model::ClientIdentity;
use crate::core::ports::{DiscoveredEntry, PmdPort};

use super::fetch_sibling;

#[derive(Debug, Deserialize)]
struct RolieFeedDocument {
    feed: RolieFeed,
}

#[derive(Debug, Deserialize, Default)]
struct RolieFeed {
    #[serde(default)]
    entry: Vec<RolieEntry>,
}

#[derive(Debug, Deserialize)]
struct RolieEntry {
    #[serde(default)]
    link: Vec<RolieLink>,
    #[serde(default)]
    updated: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
struct RolieLink {
    rel: String,
    href: String,
}

pub async fn parse_rolie(
    feed_url: &url::Url,
    headers: &[String],
    identity: Option<&ClientIdentity>,
    insecure: bool,
    pmd_port: &dyn PmdPort,
) -> Result<Vec<DiscoveredEntry>, SourceMgrError> {
    let document = pmd_port.fetch(feed_url, headers, identity, insecure).await?;
    let parsed: RolieFeedDocument = serde_json::from_slice(&document.body)?;

    let mut entries = Vec::new();
    for entry in parsed.feed.entry {
        let Some(href) = entry
            .link
            .iter()
            .find(|l| l.rel == "self" || l.rel == "content")
            .map(|l| l.href.clone())
        else {
            continue;
        };
        let Ok(advisory_url) = feed_url.join(&href) else {
            continue;
        };
        let hash = fetch_sibling(&advisory_url, ".sha256", headers, identity, insecure, pmd_port).await;
        let signature = fetch_sibling(&advisory_url, ".asc", headers, identity, insecure, pmd_port).await;
        entries.push(DiscoveredEntry {
            url: advisory_url,
            hash,
            signature,
            published: entry.updated,
        });
    }
    Ok(entries)
}
