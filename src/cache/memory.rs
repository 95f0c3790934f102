// =============================================================================
// Memory Tier — bounded in-process LRU
// =============================================================================

use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;

use super::CacheEntry;

/// Fast path: least-recently-used eviction at a fixed capacity.
///
/// Expired entries are dropped lazily on access and by `purge_expired`.
pub struct MemoryTier<V> {
    entries: Mutex<LruCache<String, CacheEntry<V>>>,
}

impl<V: Clone> MemoryTier<V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry<V>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.pop(key);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    pub fn put(&self, entry: CacheEntry<V>) {
        self.entries.lock().put(entry.key.clone(), entry);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    pub fn remove_category(&self, category: &str) -> usize {
        let mut entries = self.entries.lock();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.category == category)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn entry(key: &str, category: &str, age_secs: i64, ttl_ms: u64) -> CacheEntry<f64> {
        CacheEntry {
            key: key.to_string(),
            value: 1.0,
            category: category.to_string(),
            created_at: Utc::now() - ChronoDuration::seconds(age_secs),
            ttl_ms,
        }
    }

    #[test]
    fn evicts_least_recently_used() {
        let tier = MemoryTier::new(2);
        let now = Utc::now();
        tier.put(entry("a", "price", 0, 60_000));
        tier.put(entry("b", "price", 0, 60_000));
        assert!(tier.get("a", now).is_some());
        tier.put(entry("c", "price", 0, 60_000));
        assert!(tier.get("b", now).is_none());
        assert!(tier.get("a", now).is_some());
        assert!(tier.get("c", now).is_some());
    }

    #[test]
    fn expired_entries_are_never_returned() {
        let tier = MemoryTier::new(8);
        tier.put(entry("old", "price", 120, 60_000));
        assert!(tier.get("old", Utc::now()).is_none());
        assert!(tier.is_empty());
    }

    #[test]
    fn category_removal_and_purge() {
        let tier = MemoryTier::new(8);
        tier.put(entry("p1", "price", 0, 60_000));
        tier.put(entry("p2", "price", 0, 60_000));
        tier.put(entry("r1", "reference", 0, 60_000));
        tier.put(entry("stale", "reference", 120, 1_000));
        assert_eq!(tier.purge_expired(Utc::now()), 1);
        assert_eq!(tier.remove_category("price"), 2);
        assert_eq!(tier.len(), 1);
    }
}
