// =============================================================================
// Cache Layer — two tiers, per-category TTL, coalesced misses
// =============================================================================
//
// Lookup order: memory (LRU) → durable → fetch.  A durable hit is promoted
// into memory.  Concurrent misses on one key share a single in-flight fetch
// through a per-key `OnceCell`; distinct keys never wait on each other.
//
// Errors are handed to every waiter of that flight but never stored, so the
// next read after a failure fetches again.
// =============================================================================

pub mod durable;
pub mod memory;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::runtime_config::CacheConfig;

pub use durable::{DurableTier, InMemoryTier, JsonDirTier};
pub use memory::MemoryTier;

/// A cached value with its category and expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl<V> CacheEntry<V> {
    /// Saturates at the latest representable instant for huge TTLs.
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_ms)
            .ok()
            .and_then(chrono::TimeDelta::try_milliseconds)
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub memory_entries: usize,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

type Flight<V> = Arc<OnceCell<Result<V, ProviderError>>>;

pub struct CacheLayer<V> {
    memory: MemoryTier<V>,
    durable: Arc<dyn DurableTier<V>>,
    config: CacheConfig,
    in_flight: DashMap<String, Flight<V>>,
    counters: Counters,
}

impl<V> CacheLayer<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build both tiers from config: a JSON directory when `durable_dir` is
    /// set, otherwise an in-memory durable tier.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let durable: Arc<dyn DurableTier<V>> = match config.durable_dir.as_deref() {
            Some(dir) => Arc::new(JsonDirTier::open(dir)?),
            None => Arc::new(InMemoryTier::new()),
        };
        Ok(Self::with_durable(config, durable))
    }

    pub fn with_durable(config: &CacheConfig, durable: Arc<dyn DurableTier<V>>) -> Self {
        Self {
            memory: MemoryTier::new(config.memory_capacity),
            durable,
            config: config.clone(),
            in_flight: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Return the cached value for `key` or run `fetch_fn` exactly once for
    /// all concurrent callers of the same key.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        category: &str,
        fetch_fn: F,
    ) -> Result<V, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ProviderError>>,
    {
        if let Some(value) = self.lookup(key).await {
            return Ok(value);
        }

        let flight = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let mut led = false;
        let led_ref = &mut led;
        let result = flight
            .get_or_init(move || async move {
                *led_ref = true;
                // Another flight may have filled a tier since our first look.
                if let Some(value) = self.lookup(key).await {
                    return Ok(value);
                }
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key, category, "cache miss, fetching");
                let fetched = fetch_fn().await;
                if let Ok(value) = &fetched {
                    self.store(key, category, value.clone()).await;
                }
                fetched
            })
            .await
            .clone();

        if led {
            self.in_flight
                .remove_if(key, |_, current| Arc::ptr_eq(current, &flight));
        } else {
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Read both tiers without fetching.
    pub async fn peek(&self, key: &str) -> Option<V> {
        self.lookup(key).await
    }

    /// Drop `key` from both tiers.
    pub async fn invalidate(&self, key: &str) {
        self.memory.remove(key);
        let owned = key.to_string();
        if let Err(e) = self.durable_op(move |tier| tier.remove(&owned)).await {
            warn!(key, error = %e, "durable invalidate failed");
        }
    }

    /// Drop every entry of `category` from both tiers.
    pub async fn invalidate_category(&self, category: &str) -> usize {
        let mut removed = self.memory.remove_category(category);
        let owned = category.to_string();
        match self.durable_op(move |tier| tier.remove_category(&owned)).await {
            Ok(n) => removed += n,
            Err(e) => warn!(category, error = %e, "durable category invalidate failed"),
        }
        removed
    }

    /// Remove expired entries from both tiers.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = self.memory.purge_expired(now);
        match self.durable_op(move |tier| tier.purge_expired(now)).await {
            Ok(n) => removed += n,
            Err(e) => warn!(error = %e, "durable purge failed"),
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            durable_hits: self.counters.durable_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            memory_entries: self.memory.len(),
        }
    }

    /// Disk-backed tiers run on the blocking pool, never on a runtime worker.
    async fn durable_op<R, F>(&self, op: F) -> Result<R>
    where
        F: FnOnce(&dyn DurableTier<V>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        if !self.durable.blocks() {
            return op(self.durable.as_ref());
        }
        let tier = Arc::clone(&self.durable);
        tokio::task::spawn_blocking(move || op(tier.as_ref()))
            .await
            .context("durable tier task failed")?
    }

    async fn lookup(&self, key: &str) -> Option<V> {
        let now = Utc::now();
        if let Some(entry) = self.memory.get(key, now) {
            self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value);
        }
        let owned = key.to_string();
        match self.durable_op(move |tier| tier.get(&owned, now)).await {
            Ok(Some(entry)) => {
                self.counters.durable_hits.fetch_add(1, Ordering::Relaxed);
                let value = entry.value.clone();
                self.memory.put(entry);
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "durable tier read failed, treating as miss");
                None
            }
        }
    }

    async fn store(&self, key: &str, category: &str, value: V) {
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            category: category.to_string(),
            created_at: Utc::now(),
            ttl_ms: u64::try_from(self.config.ttl_for(category).as_millis()).unwrap_or(u64::MAX),
        };
        let durable_copy = entry.clone();
        if let Err(e) = self.durable_op(move |tier| tier.put(&durable_copy)).await {
            warn!(key, error = %e, "durable tier write failed");
        }
        self.memory.put(entry);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn layer() -> CacheLayer<f64> {
        CacheLayer::new(&CacheConfig::default()).unwrap()
    }

    #[test]
    fn huge_ttl_never_expires() {
        let entry = CacheEntry {
            key: "k".to_string(),
            value: 1.0,
            category: "price".to_string(),
            created_at: Utc::now(),
            ttl_ms: u64::MAX,
        };
        assert_eq!(entry.expires_at(), DateTime::<Utc>::MAX_UTC);
        assert!(!entry.is_expired(Utc::now()));
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let cache = layer();
        let calls = AtomicUsize::new(0);
        let fetch = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, ProviderError>(7.5)
        };
        let (a, b, c) = tokio::join!(
            cache.get_or_fetch("price:AAPL", "price", fetch),
            cache.get_or_fetch("price:AAPL", "price", fetch),
            cache.get_or_fetch("price:AAPL", "price", fetch),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), 7.5);
        assert_eq!(b.unwrap(), 7.5);
        assert_eq!(c.unwrap(), 7.5);
        assert_eq!(cache.stats().coalesced, 2);
    }

    #[tokio::test]
    async fn errors_are_shared_but_not_cached() {
        let cache = layer();
        let calls = AtomicUsize::new(0);
        let failing = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err::<f64, _>(ProviderError::unavailable("market", "down"))
        };
        let (a, b) = tokio::join!(
            cache.get_or_fetch("k", "price", failing),
            cache.get_or_fetch("k", "price", failing),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap_err(), b.unwrap_err());

        let v = cache
            .get_or_fetch("k", "price", || async { Ok(1.0) })
            .await
            .unwrap();
        assert_eq!(v, 1.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hit_skips_fetch_until_invalidated() {
        let cache = layer();
        cache
            .get_or_fetch("k", "price", || async { Ok(1.0) })
            .await
            .unwrap();
        let v = cache
            .get_or_fetch("k", "price", || async { Ok(2.0) })
            .await
            .unwrap();
        assert_eq!(v, 1.0);

        cache.invalidate("k").await;
        let v = cache
            .get_or_fetch("k", "price", || async { Ok(3.0) })
            .await
            .unwrap();
        assert_eq!(v, 3.0);
    }

    #[tokio::test]
    async fn expired_durable_entry_is_refetched() {
        let durable = Arc::new(InMemoryTier::new());
        durable
            .put(&CacheEntry {
                key: "k".into(),
                value: 1.0,
                category: "price".into(),
                created_at: Utc::now() - chrono::Duration::hours(2),
                ttl_ms: 3_600_000,
            })
            .unwrap();
        let cache = CacheLayer::with_durable(&CacheConfig::default(), durable);
        assert!(cache.peek("k").await.is_none());
        let v = cache
            .get_or_fetch("k", "price", || async { Ok(9.0) })
            .await
            .unwrap();
        assert_eq!(v, 9.0);
    }

    #[tokio::test]
    async fn durable_tier_survives_a_new_layer() {
        let dir = std::env::temp_dir().join(format!("confluence-cache-{}", uuid::Uuid::new_v4()));
        let config = CacheConfig {
            durable_dir: Some(dir.to_string_lossy().into_owned()),
            ..CacheConfig::default()
        };
        {
            let cache: CacheLayer<f64> = CacheLayer::new(&config).unwrap();
            cache
                .get_or_fetch("sector:AAPL", "reference", || async { Ok(0.4) })
                .await
                .unwrap();
        }
        let cache: CacheLayer<f64> = CacheLayer::new(&config).unwrap();
        let v = cache
            .get_or_fetch("sector:AAPL", "reference", || async {
                Err(ProviderError::unavailable("reference", "should not be called"))
            })
            .await
            .unwrap();
        assert_eq!(v, 0.4);
        assert_eq!(cache.stats().durable_hits, 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block_each_other() {
        let cache = layer();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let slow = cache.get_or_fetch("a", "price", || async move {
            rx.await.ok();
            Ok(1.0)
        });
        let fast = async {
            let v = cache
                .get_or_fetch("b", "price", || async { Ok(2.0) })
                .await
                .unwrap();
            tx.send(()).ok();
            v
        };
        let (a, b) = tokio::time::timeout(Duration::from_secs(1), async {
            tokio::join!(slow, fast)
        })
        .await
        .expect("keys must not serialise");
        assert_eq!(a.unwrap(), 1.0);
        assert_eq!(b, 2.0);
    }

    #[tokio::test]
    async fn category_invalidation() {
        let cache = layer();
        for k in ["p1", "p2"] {
            cache
                .get_or_fetch(k, "price", || async { Ok(1.0) })
                .await
                .unwrap();
        }
        cache
            .get_or_fetch("r1", "reference", || async { Ok(1.0) })
            .await
            .unwrap();
        assert!(cache.invalidate_category("price").await >= 2);
        assert!(cache.peek("p1").await.is_none());
        assert!(cache.peek("r1").await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disk_tier_serves_concurrent_keys_from_blocking_pool() {
        let dir = std::env::temp_dir().join(format!("confluence-cache-{}", uuid::Uuid::new_v4()));
        let tier: Arc<JsonDirTier<f64>> = Arc::new(JsonDirTier::open(&dir).unwrap());
        assert!(tier.blocks());
        assert!(!InMemoryTier::<f64>::new().blocks());

        let cache = Arc::new(CacheLayer::with_durable(&CacheConfig::default(), tier));
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..32 {
            let cache = cache.clone();
            tasks.spawn(async move {
                let key = format!("price:I{i}");
                cache
                    .get_or_fetch(&key, "price", || async move { Ok(i as f64) })
                    .await
                    .unwrap()
            });
        }
        let mut total = 0.0;
        while let Some(v) = tasks.join_next().await {
            total += v.unwrap();
        }
        assert_eq!(total, (0..32).sum::<i32>() as f64);
        assert_eq!(cache.purge_expired().await, 0);
        assert_eq!(cache.invalidate_category("price").await, 64);
        std::fs::remove_dir_all(&dir).ok();
    }
}
