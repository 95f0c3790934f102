// =============================================================================
// Persistence — structural save/load/list contract for learning state
// =============================================================================
//
// Parameters, experiments and outcome records are the only state that must
// outlive the process.  Storage technology is pluggable:
//
//   MemoryStore   — tests and ephemeral runs
//   JsonDirStore  — one JSON document per entity under `<data_dir>/<kind>/`,
//                   named by the hex-encoded id, written atomically
//                   (tmp + rename)
//
// The contract is synchronous because writes happen under the registry's
// writer lock.  On a multi-threaded runtime, file I/O runs in
// `block_in_place` so other tasks migrate off the worker.
// =============================================================================

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

/// Run blocking file I/O without starving a multi-threaded runtime.
fn blocking_io<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Something the persistence layer can store.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection name, also the sub-directory of `JsonDirStore`.
    const KIND: &'static str;

    fn entity_id(&self) -> String;

    /// Secondary key matched by `Query::key` (parameter id, instrument…).
    fn group_key(&self) -> Option<String> {
        None
    }
}

/// Filter for `Persistence::list`.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub key: Option<String>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            limit: None,
        }
    }

    fn matches<T: Entity>(&self, entity: &T) -> bool {
        match &self.key {
            Some(key) => entity.group_key().as_deref() == Some(key.as_str()),
            None => true,
        }
    }
}

pub trait Persistence<T: Entity>: Send + Sync {
    fn save(&self, entity: &T) -> Result<()>;
    fn load(&self, entity_id: &str) -> Result<Option<T>>;
    fn list(&self, query: &Query) -> Result<Vec<T>>;
}

// =============================================================================
// MemoryStore
// =============================================================================

pub struct MemoryStore<T> {
    entities: RwLock<BTreeMap<String, T>>,
    fail_writes: AtomicBool,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(BTreeMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `save` fail, to exercise fail-closed paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Persistence<T> for MemoryStore<T> {
    fn save(&self, entity: &T) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("{} store rejected write", T::KIND);
        }
        self.entities
            .write()
            .insert(entity.entity_id(), entity.clone());
        Ok(())
    }

    fn load(&self, entity_id: &str) -> Result<Option<T>> {
        Ok(self.entities.read().get(entity_id).cloned())
    }

    fn list(&self, query: &Query) -> Result<Vec<T>> {
        let entities = self.entities.read();
        let iter = entities.values().filter(|e| query.matches(*e)).cloned();
        Ok(match query.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }
}

// =============================================================================
// JsonDirStore
// =============================================================================

pub struct JsonDirStore<T> {
    dir: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> JsonDirStore<T> {
    /// Open (creating if needed) `<root>/<T::KIND>/`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let dir = root.as_ref().join(T::KIND);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        debug!(kind = T::KIND, dir = %dir.display(), "json store opened");
        Ok(Self {
            dir,
            _marker: PhantomData,
        })
    }

    /// Hex keeps distinct ids on distinct files on every filesystem.
    fn path_for(&self, entity_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", hex::encode(entity_id.as_bytes())))
    }

    fn read(path: &Path) -> Result<T> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    fn list_blocking(&self, query: &Query) -> Result<Vec<T>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?
            .filter_map(|item| item.ok().map(|i| i.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();

        let mut out = Vec::new();
        for path in paths {
            match Self::read(&path) {
                Ok(entity) if query.matches(&entity) => out.push(entity),
                Ok(_) => {}
                Err(e) => warn!(kind = T::KIND, error = %e, "skipping unreadable record"),
            }
            if query.limit.is_some_and(|l| out.len() >= l) {
                break;
            }
        }
        Ok(out)
    }
}

impl<T: Entity> Persistence<T> for JsonDirStore<T> {
    fn save(&self, entity: &T) -> Result<()> {
        let path = self.path_for(&entity.entity_id());
        let content = serde_json::to_string_pretty(entity)
            .with_context(|| format!("failed to serialise {}", T::KIND))?;
        let tmp_path = path.with_extension("json.tmp");
        blocking_io(|| {
            std::fs::write(&tmp_path, &content)
                .with_context(|| format!("failed to write {}", tmp_path.display()))?;
            std::fs::rename(&tmp_path, &path)
                .with_context(|| format!("failed to rename {}", tmp_path.display()))
        })
    }

    fn load(&self, entity_id: &str) -> Result<Option<T>> {
        let path = self.path_for(entity_id);
        blocking_io(|| {
            if !path.exists() {
                return Ok(None);
            }
            Self::read(&path).map(Some)
        })
    }

    fn list(&self, query: &Query) -> Result<Vec<T>> {
        blocking_io(|| self.list_blocking(query))
    }
}
