//! Content-keyed context cache with single-flight computation.
//!
//! Agent context loads are expensive; concurrent requests for the same key
//! coalesce onto one computation. Keys are digests of the input spec, so
//! equal specs share one cached blob.

use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, watch};

enum Entry {
    Ready(Arc<Value>),
    /// A computation is in flight; the receiver fires when it settles.
    Pending(watch::Receiver<()>),
}

/// Counters describing cache behavior since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
}

/// Thread-safe memoization for expensive context loads.
pub struct ContextCache {
    entries: Mutex<HashMap<String, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

impl ContextCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Return the cached value for `key`, computing it at most once across
    /// concurrent callers. The boolean is true on a cache hit (including
    /// coalesced waits).
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> Result<(Arc<Value>, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        // Fast path / leader election.
        let mut coalesced_wait = false;
        let tx = loop {
            let mut entries = self.entries.lock().await;
            match entries.get(key) {
                Some(Entry::Ready(value)) => {
                    if !coalesced_wait {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok((value.clone(), true));
                }
                Some(Entry::Pending(rx)) => {
                    if !coalesced_wait {
                        self.coalesced.fetch_add(1, Ordering::Relaxed);
                        coalesced_wait = true;
                    }
                    let mut rx = rx.clone();
                    drop(entries);
                    // The watch channel delivers the settle signal even if it
                    // fired between the clone above and this await.
                    let _ = rx.changed().await;
                    // Loop: the leader either published Ready or removed the
                    // entry on failure.
                }
                None => {
                    let (tx, rx) = watch::channel(());
                    entries.insert(key.to_string(), Entry::Pending(rx));
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    break tx;
                }
            }
        };

        match compute().await {
            Ok(value) => {
                let value = Arc::new(value);
                let mut entries = self.entries.lock().await;
                entries.insert(key.to_string(), Entry::Ready(value.clone()));
                drop(entries);
                let _ = tx.send(());
                Ok((value, false))
            }
            Err(e) => {
                let mut entries = self.entries.lock().await;
                entries.remove(key);
                drop(entries);
                let _ = tx.send(());
                Err(e)
            }
        }
    }

    /// Drop a cached entry, forcing the next request to recompute.
    pub async fn invalidate(&self, key: &str) {
        let mut entries = self.entries.lock().await;
        if matches!(entries.get(key), Some(Entry::Ready(_))) {
            entries.remove(key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

impl Default for ContextCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn test_hit_after_compute() {
        let cache = ContextCache::new();

        let (value, hit) = cache
            .get_or_compute("k1", || async { Ok(json!({"ctx": 1})) })
            .await
            .unwrap();
        assert!(!hit);
        assert_eq!(*value, json!({"ctx": 1}));

        let (value, hit) = cache
            .get_or_compute("k1", || async { Ok(json!({"ctx": 2})) })
            .await
            .unwrap();
        assert!(hit);
        assert_eq!(*value, json!({"ctx": 1}));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_compute_once() {
        let cache = Arc::new(ContextCache::new());
        let invocations = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let invocations = invocations.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("shared", move || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(json!("blob"))
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            let (value, _) = handle.await.unwrap();
            assert_eq!(*value, json!("blob"));
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits + stats.coalesced, 7);
    }

    #[tokio::test]
    async fn test_failed_compute_is_retryable() {
        let cache = ContextCache::new();

        let err = cache
            .get_or_compute("k", || async { anyhow::bail!("load failed") })
            .await;
        assert!(err.is_err());

        let (value, hit) = cache
            .get_or_compute("k", || async { Ok(json!(42)) })
            .await
            .unwrap();
        assert!(!hit);
        assert_eq!(*value, json!(42));
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let cache = ContextCache::new();
        cache
            .get_or_compute("k", || async { Ok(json!(1)) })
            .await
            .unwrap();
        cache.invalidate("k").await;

        let (value, hit) = cache
            .get_or_compute("k", || async { Ok(json!(2)) })
            .await
            .unwrap();
        assert!(!hit);
        assert_eq!(*value, json!(2));
    }

    #[tokio::test]
    async fn test_distinct_keys_compute_independently() {
        let cache = ContextCache::new();
        cache
            .get_or_compute("a", || async { Ok(json!("a")) })
            .await
            .unwrap();
        let (value, hit) = cache
            .get_or_compute("b", || async { Ok(json!("b")) })
            .await
            .unwrap();
        assert!(!hit);
        assert_eq!(*value, json!("b"));
        assert_eq!(cache.stats().misses, 2);
    }
}
