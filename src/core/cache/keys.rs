// src/core/cache/keys.rs

//! OpenPGP public-key cache: a source's signature-verification key is
//! published alongside its PMD and is fetched far less often than advisory
//! documents themselves, so it is cached the same way as the PMD (spec §4.4).

use std::sync::Arc;
use std::time::Duration;

use crate::core::cache::CoalescingCache;
use crate::core::errors::SourceMgrError;
use crate::core::ports::PmdPort;

/// Default freshness window for a cached public key.
pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(60 * 60);

pub struct KeysCache {
    cache: CoalescingCache<String, Arc<Vec<u8>>>,
    port: Arc<dyn PmdPort>,
}

impl KeysCache {
    pub fn new(port: Arc<dyn PmdPort>, ttl: Duration) -> Self {
        KeysCache {
            cache: CoalescingCache::new(ttl),
            port,
        }
    }

    /// Fetches a public key document, coalescing concurrent requests for the
    /// same URL.
    pub async fn get(&self, url: &url::Url) -> Result<Arc<Vec<u8>>, SourceMgrError> {
        let port = self.port.clone();
        let url_owned = url.clone();
        self.cache
            .get_or_fetch(url.to_string(), move || async move {
                let document = port.fetch(&url_owned, &[], None, false).await?;
                Ok(Arc::new(document.body))
            })
            .await
    }

    pub fn invalidate(&self, url: &url::Url) {
        self.cache.invalidate(&url.to_string());
    }

    /// Evicts every cached key past its TTL (spec §4.1(a)).
    pub fn sweep(&self) {
        self.cache.sweep();
    }
}
