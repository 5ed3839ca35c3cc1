// src/core/cache/mod.rs

//! TTL caches with single-flight coalescing (spec §4.4, §9).
//!
//! Grounded directly on the teacher's cache-fetch stampede protection:
//! concurrent callers asking for the same key while a fetch is already in
//! flight all await the same [`futures::future::Shared`] future instead of
//! issuing redundant requests.

pub mod keys;
pub mod pmd;

use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::core::errors::SourceMgrError;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, SourceMgrError>>>;

struct CacheSlot<V> {
    fetch: SharedFetch<V>,
    fetched_at: Instant,
}

/// A TTL-bounded, single-flight-coalescing cache over an arbitrary fetch.
pub struct CoalescingCache<K, V> {
    ttl: Duration,
    inner: DashMap<K, CacheSlot<V>>,
}

impl<K, V> CoalescingCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        CoalescingCache {
            ttl,
            inner: DashMap::new(),
        }
    }

    /// Returns the cached value if fresh; otherwise runs `fetch` once and lets
    /// every concurrent caller for the same `key` await that single future.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V, SourceMgrError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, SourceMgrError>> + Send + 'static,
    {
        if let Some(slot) = self.inner.get(&key) {
            if slot.fetched_at.elapsed() < self.ttl {
                return slot.fetch.clone().await;
            }
        }

        let shared: SharedFetch<V> = fetch().boxed().shared();
        let to_await = match self.inner.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().fetched_at.elapsed() < self.ttl {
                    occupied.get().fetch.clone()
                } else {
                    occupied.insert(CacheSlot {
                        fetch: shared.clone(),
                        fetched_at: Instant::now(),
                    });
                    shared
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheSlot {
                    fetch: shared.clone(),
                    fetched_at: Instant::now(),
                });
                shared
            }
        };
        to_await.await
    }

    pub fn invalidate(&self, key: &K) {
        self.inner.remove(key);
    }

    /// Proactively evicts every entry past its TTL, rather than waiting for
    /// the next `get_or_fetch` to notice it's stale (spec §4.1(a)'s periodic
    /// cache sweep, run from the manager's maintenance tick).
    pub fn sweep(&self) {
        self.inner.retain(|_, slot| slot.fetched_at.elapsed() < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_callers_for_the_same_key_coalesce_into_one_fetch() {
        let cache = Arc::new(CoalescingCache::<String, i32>::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("k".to_string(), || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(42)
                        }
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entries_trigger_a_refetch() {
        let cache = CoalescingCache::<String, i32>::new(Duration::from_millis(10));
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_fetch("k".to_string(), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                }
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = cache
            .get_or_fetch("k".to_string(), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(2)
                }
            })
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_a_refetch() {
        let cache = CoalescingCache::<String, i32>::new(Duration::from_secs(60));
        let _ = cache.get_or_fetch("k".to_string(), || async { Ok(1) }).await;
        cache.invalidate(&"k".to_string());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn sweep_evicts_only_expired_entries() {
        let cache = CoalescingCache::<String, i32>::new(Duration::from_millis(10));
        let _ = cache.get_or_fetch("stale".to_string(), || async { Ok(1) }).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = cache.get_or_fetch("fresh".to_string(), || async { Ok(2) }).await;

        cache.sweep();

        assert_eq!(cache.len(), 1);
        assert!(cache.inner.contains_key("fresh"));
    }
}
