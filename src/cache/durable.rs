// =============================================================================
// Durable Tier — TTL-checked store that survives process restarts
// =============================================================================
//
// `JsonDirTier` keeps one JSON file per key, named by the SHA-256 of the key
// so arbitrary keys are safe on any filesystem.  Writes go through a `.tmp`
// sibling and a rename, the same atomic pattern the runtime config uses.
// Tiers that touch disk report `blocks()` and are driven from the blocking
// pool by `CacheLayer`.
// =============================================================================

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::CacheEntry;

/// Slow-path storage behind the memory tier.
pub trait DurableTier<V>: Send + Sync {
    /// Live entry for `key`; expired entries are removed and reported absent.
    fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry<V>>>;
    fn put(&self, entry: &CacheEntry<V>) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn remove_category(&self, category: &str) -> Result<usize>;
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Whether calls perform blocking I/O.
    fn blocks(&self) -> bool {
        true
    }
}

// =============================================================================
// In-memory implementation (tests, or no durable_dir configured)
// =============================================================================

pub struct InMemoryTier<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
}

impl<V> InMemoryTier<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> Default for InMemoryTier<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> DurableTier<V> for InMemoryTier<V> {
    fn blocks(&self) -> bool {
        false
    }

    fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry<V>>> {
        let expired = match self.entries.read().get(key) {
            Some(e) if !e.is_expired(now) => return Ok(Some(e.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.write().remove(key);
        }
        Ok(None)
    }

    fn put(&self, entry: &CacheEntry<V>) -> Result<()> {
        self.entries
            .write()
            .insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn remove_category(&self, category: &str) -> Result<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.category != category);
        Ok(before - entries.len())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok(before - entries.len())
    }
}

// =============================================================================
// JSON-file-per-key implementation
// =============================================================================

pub struct JsonDirTier<V> {
    dir: PathBuf,
    _marker: PhantomData<fn() -> V>,
}

impl<V> JsonDirTier<V> {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
        debug!(dir = %dir.display(), "durable cache tier opened");
        Ok(Self {
            dir,
            _marker: PhantomData,
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for item in std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?
        {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

impl<V: DeserializeOwned> JsonDirTier<V> {
    fn read_entry(path: &Path) -> Result<Option<CacheEntry<V>>> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let entry = serde_json::from_str(&content)
            .with_context(|| format!("corrupt cache entry {}", path.display()))?;
        Ok(Some(entry))
    }
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

impl<V> DurableTier<V> for JsonDirTier<V>
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry<V>>> {
        let path = self.path_for(key);
        match Self::read_entry(&path)? {
            Some(entry) if entry.key == key && !entry.is_expired(now) => Ok(Some(entry)),
            Some(entry) if entry.key == key => {
                remove_file_if_exists(&path)?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn put(&self, entry: &CacheEntry<V>) -> Result<()> {
        let path = self.path_for(&entry.key);
        let content =
            serde_json::to_string(entry).context("failed to serialise cache entry")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename {}", tmp_path.display()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        remove_file_if_exists(&self.path_for(key))
    }

    fn remove_category(&self, category: &str) -> Result<usize> {
        let mut removed = 0;
        for path in self.entry_files()? {
            match Self::read_entry(&path) {
                Ok(Some(entry)) if entry.category == category => {
                    remove_file_if_exists(&path)?;
                    removed += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "skipping unreadable cache entry"),
            }
        }
        Ok(removed)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for path in self.entry_files()? {
            match Self::read_entry(&path) {
                Ok(Some(entry)) if entry.is_expired(now) => {
                    remove_file_if_exists(&path)?;
                    removed += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "removing corrupt cache entry");
                    remove_file_if_exists(&path)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
