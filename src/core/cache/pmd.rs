// src/core/cache/pmd.rs

//! Provider-metadata cache: avoids re-fetching a source's PMD document for
//! every feed refresh that needs it within the same TTL window (spec §4.4).

use std::sync::Arc;
use std::time::Duration;

use crate::core::cache::CoalescingCache;
use crate::core::errors::SourceMgrError;
use crate::core::model::ClientIdentity;
use crate::core::ports::PmdPort;

/// Default freshness window for a cached PMD document.
pub const DEFAULT_PMD_TTL: Duration = Duration::from_secs(15 * 60);

pub struct PmdCache {
    cache: CoalescingCache<String, Arc<serde_json::Value>>,
    port: Arc<dyn PmdPort>,
}

impl PmdCache {
    pub fn new(port: Arc<dyn PmdPort>, ttl: Duration) -> Self {
        PmdCache {
            cache: CoalescingCache::new(ttl),
            port,
        }
    }

    /// Fetches and parses a source's provider-metadata document, coalescing
    /// concurrent requests for the same source.
    pub async fn get(
        &self,
        source_id: i64,
        url: &url::Url,
        headers: Vec<String>,
        identity: Option<ClientIdentity>,
        insecure: bool,
    ) -> Result<Arc<serde_json::Value>, SourceMgrError> {
        let port = self.port.clone();
        let url = url.clone();
        self.cache
            .get_or_fetch(source_id.to_string(), move || async move {
                let document = port
                    .fetch(&url, &headers, identity.as_ref(), insecure)
                    .await?;
                let value: serde_json::Value = serde_json::from_slice(&document.body)?;
                Ok(Arc::new(value))
            })
            .await
    }

    pub fn invalidate(&self, source_id: i64) {
        self.cache.invalidate(&source_id.to_string());
    }

    /// Evicts every PMD document past its TTL (spec §4.1(a)).
    pub fn sweep(&self) {
        self.cache.sweep();
    }
}
