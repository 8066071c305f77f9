//! Read-through cache over the resilient store.

use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::key::CacheKey;
use super::singleflight::SingleFlight;
use crate::store::{BackendMode, ResilientStore};

/// Default time-to-live for cached values.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

const NAMESPACE: &str = "cache:";

/// Memoizes expensive reads with time-based expiry.
///
/// Values are stored as JSON. A value that fails to decode is treated as a
/// miss and overwritten by the next computation.
#[derive(Debug)]
pub struct CacheStore {
    store: ResilientStore,
    flights: SingleFlight,
    default_ttl: Duration,
}

impl CacheStore {
    pub fn new(store: ResilientStore, default_ttl: Duration) -> Self {
        Self {
            store,
            flights: SingleFlight::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn mode(&self) -> BackendMode {
        self.store.mode()
    }

    fn storage_key(key: &str) -> String {
        format!("{}{}", NAMESPACE, key)
    }

    /// Return the cached value for `key`, or compute and store it for `ttl`.
    ///
    /// Concurrent callers for the same uncached key share one `compute` call.
    pub async fn get_or_compute<T, F, Fut>(&self, key: &str, compute: F, ttl: Duration) -> T
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let result = self
            .get_or_try_compute(
                key,
                move || {
                    let computation = compute();
                    async move { Ok::<T, Infallible>(computation.await) }
                },
                ttl,
            )
            .await;

        match result {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Like [`get_or_compute`](Self::get_or_compute) for fallible computations.
    ///
    /// An error is handed to every caller waiting on that computation and is
    /// never cached.
    pub async fn get_or_try_compute<T, E, F, Fut>(
        &self,
        key: &str,
        compute: F,
        ttl: Duration,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let storage_key = Self::storage_key(key);

        if let Some(value) = self.lookup::<T>(&storage_key).await {
            trace!(key = %key, "Cache hit");
            return Ok(value);
        }
        trace!(key = %key, "Cache miss");

        let store = self.store.clone();
        self.flights
            .run(key, move |ticket| {
                let computation = compute();
                async move {
                    // A previous flight may have stored the value after our miss.
                    if let Some(value) = read::<T>(&store, &storage_key).await {
                        trace!(key = %storage_key, "Stored while waiting to compute");
                        return Ok(value);
                    }

                    let result = computation.await;
                    if let Ok(value) = &result {
                        if ticket.is_current() {
                            match serde_json::to_vec(value) {
                                Ok(bytes) => {
                                    store.set(&storage_key, bytes, ttl).await;
                                    debug!(key = %storage_key, ttl_secs = ttl.as_secs(), "Cached computed value");
                                }
                                Err(e) => {
                                    warn!(key = %storage_key, error = %e, "Computed value is not serializable, not caching");
                                }
                            }
                        } else {
                            debug!(key = %storage_key, "Key invalidated during computation, not caching");
                        }
                    }
                    result
                }
            })
            .await
    }

    /// Like [`get_or_compute`](Self::get_or_compute) with the default TTL.
    pub async fn get_or_compute_default<T, F, Fut>(&self, key: &str, compute: F) -> T
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.get_or_compute(key, compute, self.default_ttl).await
    }

    async fn lookup<T: DeserializeOwned>(&self, storage_key: &str) -> Option<T> {
        read(&self.store, storage_key).await
    }

    /// Remove `key` from every tier. The next lookup recomputes, even if a
    /// computation for the key is currently running.
    pub async fn invalidate(&self, key: &str) {
        self.flights.forget(key);
        self.store.delete(&Self::storage_key(key)).await;
        debug!(key = %key, "Invalidated cache key");
    }

    /// Remove every key starting with `prefix`. Returns how many stored
    /// entries were removed.
    pub async fn invalidate_pattern(&self, prefix: &str) -> u64 {
        self.flights.forget_prefix(prefix);
        let removed = self.store.delete_prefix(&Self::storage_key(prefix)).await;
        debug!(prefix = %prefix, removed = removed, "Invalidated cache prefix");
        removed
    }

    /// Remove every key derived from `resource`.
    pub async fn invalidate_resource(&self, resource: &str) -> u64 {
        self.invalidate_pattern(&CacheKey::resource_prefix(resource))
            .await
    }
}

/// Decode a stored value. A value that fails to decode counts as absent.
async fn read<T: DeserializeOwned>(store: &ResilientStore, storage_key: &str) -> Option<T> {
    let bytes = store.get(storage_key).await?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = %storage_key, error = %e, "Corrupt cache entry, recomputing");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, MockClock};
    use crate::store::LocalStore;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Category {
        id: u32,
        name: String,
    }

    fn cache() -> (CacheStore, Arc<LocalStore>, MockClock) {
        let clock = MockClock::default();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let local = Arc::new(LocalStore::new(shared));
        let cache = CacheStore::new(ResilientStore::local(Arc::clone(&local)), DEFAULT_CACHE_TTL);
        (cache, local, clock)
    }

    fn counting(calls: &Arc<AtomicUsize>, id: u32) -> impl FnOnce() -> futures::future::Ready<Category> {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Category {
                id,
                name: format!("category-{}", id),
            })
        }
    }

    #[tokio::test]
    async fn test_second_call_hits_cache() {
        let (cache, _local, _clock) = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_secs(300);

        let first = cache.get_or_compute("cat:1", counting(&calls, 1), ttl).await;
        let second = cache.get_or_compute("cat:1", counting(&calls, 1), ttl).await;

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_recomputes() {
        let (cache, _local, clock) = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_secs(300);

        cache.get_or_compute("cat:1", counting(&calls, 1), ttl).await;
        clock.advance(Duration::from_secs(301));
        cache.get_or_compute("cat:1", counting(&calls, 1), ttl).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_misses_compute_once() {
        let (cache, _local, _clock) = cache();
        let cache = Arc::new(cache);
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_compute(
                            "cat:9",
                            move || async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                Category {
                                    id: 9,
                                    name: "boots".to_string(),
                                }
                            },
                            Duration::from_secs(60),
                        )
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().name, "boots");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let (cache, _local, _clock) = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_secs(300);

        cache.get_or_compute("cat:1", counting(&calls, 1), ttl).await;
        cache.invalidate("cat:1").await;
        cache.get_or_compute("cat:1", counting(&calls, 1), ttl).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_pattern_respects_prefix() {
        let (cache, local, _clock) = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_secs(300);

        for (key, id) in [("cat:1", 1), ("cat:2", 2), ("product:1", 3)] {
            cache.get_or_compute(key, counting(&calls, id), ttl).await;
        }

        assert_eq!(cache.invalidate_pattern("cat:").await, 2);
        assert_eq!(local.entry_count(), 1);

        cache.get_or_compute("product:1", counting(&calls, 3), ttl).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        cache.get_or_compute("cat:2", counting(&calls, 2), ttl).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_invalidate_resource_uses_derived_keys() {
        let (cache, _local, _clock) = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("catalog").param("page", 1).to_string_key();
        let other = CacheKey::new("cart").param("page", 1).to_string_key();

        cache.get_or_compute_default(&key, counting(&calls, 1)).await;
        cache.get_or_compute_default(&other, counting(&calls, 2)).await;

        assert_eq!(cache.invalidate_resource("catalog").await, 1);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let (cache, local, _clock) = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        local.set("cache:cat:1", b"{not json".to_vec(), Duration::from_secs(60));

        let value = cache
            .get_or_compute("cat:1", counting(&calls, 1), Duration::from_secs(60))
            .await;

        assert_eq!(value.id, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stored: Category = serde_json::from_slice(&local.get("cache:cat:1").unwrap()).unwrap();
        assert_eq!(stored, value);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let (cache, local, _clock) = cache();
        let ttl = Duration::from_secs(60);

        let failed: Result<u32, String> = cache
            .get_or_try_compute("flaky", || async { Err("db down".to_string()) }, ttl)
            .await;
        assert_eq!(failed, Err("db down".to_string()));
        assert_eq!(local.entry_count(), 0);

        let ok: Result<u32, String> = cache
            .get_or_try_compute("flaky", || async { Ok(3) }, ttl)
            .await;
        assert_eq!(ok, Ok(3));
    }

    #[tokio::test]
    async fn test_invalidate_during_compute_skips_write() {
        let (cache, local, _clock) = cache();
        let cache = Arc::new(cache);
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();

        let running = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute(
                        "cat:1",
                        move || async move {
                            let _ = go_rx.await;
                            1u32
                        },
                        Duration::from_secs(60),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        cache.invalidate("cat:1").await;
        go_tx.send(()).unwrap();
        assert_eq!(running.await.unwrap(), 1);
        assert_eq!(local.get("cache:cat:1"), None);
    }

    #[tokio::test]
    async fn test_panicking_compute_does_not_poison_key() {
        let (cache, _local, _clock) = cache();
        let cache = Arc::new(cache);

        let failed = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute("cat:1", || async { panic!("catalog query failed") }, Duration::from_secs(60))
                    .await
            })
        };
        let joined: std::result::Result<u32, _> = failed.await;
        assert!(joined.unwrap_err().is_panic());
        assert_eq!(cache.flights.in_flight(), 0);

        let value = cache
            .get_or_compute("cat:1", || async { 7u32 }, Duration::from_secs(60))
            .await;
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_value_stored_after_miss_is_not_recomputed() {
        let (cache, local, _clock) = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let stored = serde_json::to_vec(&Category {
            id: 1,
            name: "stored".to_string(),
        })
        .unwrap();

        let value = {
            let calls = Arc::clone(&calls);
            let local = Arc::clone(&local);
            cache
                .get_or_compute(
                    "cat:1",
                    move || {
                        // Another flight finishes between our miss and our turn.
                        local.set("cache:cat:1", stored, Duration::from_secs(60));
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Category {
                                id: 1,
                                name: "computed".to_string(),
                            }
                        }
                    },
                    Duration::from_secs(60),
                )
                .await
        };

        assert_eq!(value.name, "stored");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
