//! TTL cache with in-flight request coalescing.
//!
//! [`TtlCache`] backs both the embedding cache and the response cache.
//!
//! # Semantics
//!
//! | Operation | Behavior |
//! |-----------|----------|
//! | [`get`](TtlCache::get) | An entry older than its TTL is absent and removed (lazy expiry) |
//! | [`set`](TtlCache::set) | Insert or overwrite; overflow evicts expired, then oldest entries |
//! | [`get_or_compute`](TtlCache::get_or_compute) | One computation per key at a time, shared by all concurrent callers |
//!
//! A computation runs on its own tokio task, so callers that go away do not
//! cancel it. On success its value is cached before it leaves the in-flight
//! table; on failure every waiter receives the same error and nothing is
//! cached.
//!
//! Per-key atomicity comes from `DashMap`; there are no multi-key
//! transactions. Lock poisoning is recovered, never surfaced.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::time::Instant;

use docrag_core::{Error, Result};

type InFlight<V> = Shared<BoxFuture<'static, Result<V>>>;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    /// Insertion order, for oldest-first eviction.
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Counters reported by [`TtlCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Callers that joined a computation already in flight.
    pub coalesced: u64,
    pub expired: u64,
    pub evictions: u64,
}

struct Inner<K, V> {
    name: &'static str,
    entries: DashMap<K, CacheEntry<V>>,
    in_flight: Mutex<HashMap<K, InFlight<V>>>,
    max_entries: usize,
    next_seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    expired: AtomicU64,
    evictions: AtomicU64,
}

/// Generic TTL key/value cache. Cloning shares the same storage.
pub struct TtlCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// `name` labels log events; `max_entries` bounds memory.
    pub fn new(name: &'static str, max_entries: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                entries: DashMap::new(),
                in_flight: Mutex::new(HashMap::new()),
                max_entries: max_entries.max(1),
                next_seq: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                expired: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.inner.lookup(key);
        match value {
            Some(_) => self.inner.hits.fetch_add(1, Ordering::Relaxed),
            None => self.inner.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    pub fn set(&self, key: K, value: V, ttl: Duration) {
        self.inner.insert(key, value, ttl);
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.inner.entries.len(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
            expired: self.inner.expired.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }

    /// Return the cached value, or run `compute` once for all concurrent
    /// callers of `key` and cache its successful result for `ttl`.
    ///
    /// `compute` is only invoked by the caller that starts the computation.
    pub async fn get_or_compute<F, Fut>(&self, key: K, ttl: Duration, compute: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some(v) = self.inner.lookup(&key) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(v);
        }

        let shared = {
            let mut in_flight = self.inner.lock_in_flight();

            // A computation may have finished between the lookup and the lock.
            if let Some(v) = self.inner.lookup(&key) {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(v);
            }

            match in_flight.get(&key) {
                Some(running) => {
                    self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(cache = self.inner.name, "joined in-flight computation");
                    running.clone()
                }
                None => {
                    self.inner.misses.fetch_add(1, Ordering::Relaxed);
                    let shared = self.spawn_computation(key.clone(), ttl, compute());
                    in_flight.insert(key, shared.clone());
                    shared
                }
            }
        };

        shared.await
    }

    fn spawn_computation<Fut>(&self, key: K, ttl: Duration, fut: Fut) -> InFlight<V>
    where
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let result = fut.await;
            match &result {
                Ok(v) => inner.insert(key.clone(), v.clone(), ttl),
                Err(e) => {
                    tracing::debug!(cache = inner.name, error = %e, "computation failed, not cached")
                }
            }
            inner.lock_in_flight().remove(&key);
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::Internal(format!("cached computation aborted: {}", e))),
            }
        }
        .boxed()
        .shared()
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<K, InFlight<V>>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let stale = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if stale
            && self
                .entries
                .remove_if(key, |_, e| e.is_expired(Instant::now()))
                .is_some()
        {
            self.expired.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    fn insert(&self, key: K, value: V, ttl: Duration) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
                seq,
            },
        );
        if self.entries.len() > self.max_entries {
            self.evict();
        }
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        self.expired.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Purge expired entries, then drop the oldest tenth of the bound.
    fn evict(&self) {
        self.purge_expired();
        if self.entries.len() <= self.max_entries {
            return;
        }

        let target = self.max_entries - self.max_entries / 10;
        let mut by_age: Vec<(u64, K)> = self
            .entries
            .iter()
            .map(|e| (e.value().seq, e.key().clone()))
            .collect();
        by_age.sort_by_key(|(seq, _)| *seq);

        let excess = self.entries.len().saturating_sub(target);
        for (_, key) in by_age.into_iter().take(excess) {
            if self.entries.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        tracing::debug!(
            cache = self.name,
            entries = self.entries.len(),
            "evicted oldest entries"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_lazily() {
        let cache: TtlCache<String, u32> = TtlCache::new("test", 100);
        cache.set("k".into(), 1, Duration::from_secs(10));
        assert_eq!(cache.get(&"k".into()), Some(1));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get(&"k".into()), None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recompute_after_expiry_overwrites() {
        let cache: TtlCache<&'static str, u32> = TtlCache::new("test", 100);
        let calls = Arc::new(AtomicUsize::new(0));
        let compute = |calls: Arc<AtomicUsize>| {
            move || async move { Ok::<u32, Error>(calls.fetch_add(1, Ordering::SeqCst) as u32 + 1) }
        };
        let ttl = Duration::from_secs(5);

        assert_eq!(cache.get_or_compute("k", ttl, compute(calls.clone())).await.unwrap(), 1);
        assert_eq!(cache.get_or_compute("k", ttl, compute(calls.clone())).await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get_or_compute("k", ttl, compute(calls.clone())).await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get(&"k"), Some(2));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let cache: TtlCache<String, String> = TtlCache::new("test", 100);
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("q".to_string(), Duration::from_secs(60), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok("answer".to_string())
                    })
                    .await
            }));
        }

        // let every caller register before releasing the computation
        while cache.stats().coalesced < 7 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "answer");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&"q".to_string()), Some("answer".to_string()));
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let cache: TtlCache<u8, u8> = TtlCache::new("test", 100);
        let err = cache
            .get_or_compute(1, Duration::from_secs(60), || async {
                Err(Error::embedding_transient("boom"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Embedding { .. }));
        assert!(cache.get(&1).is_none());

        let v = cache
            .get_or_compute(1, Duration::from_secs(60), || async { Ok(9) })
            .await
            .unwrap();
        assert_eq!(v, 9);
    }

    #[tokio::test]
    async fn test_computation_survives_dropped_caller() {
        let cache: TtlCache<u8, u8> = TtlCache::new("test", 100);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let c = cache.clone();
        let caller = tokio::spawn(async move {
            c.get_or_compute(1, Duration::from_secs(60), move || async move {
                let _ = rx.await;
                Ok(5)
            })
            .await
        });
        while cache.stats().misses == 0 {
            tokio::task::yield_now().await;
        }
        caller.abort();
        let _ = tx.send(());

        let v = cache
            .get_or_compute(1, Duration::from_secs(60), || async { Ok(0) })
            .await
            .unwrap();
        assert_eq!(v, 5);
    }

    #[tokio::test]
    async fn test_eviction_bounds_memory() {
        let cache: TtlCache<u32, u32> = TtlCache::new("test", 10);
        for i in 0..25 {
            cache.set(i, i, Duration::from_secs(60));
        }
        assert!(cache.len() <= 10);
        assert!(cache.stats().evictions > 0);
        // newest entries survive
        assert_eq!(cache.get(&24), Some(24));
        assert_eq!(cache.get(&0), None);
    }
}
