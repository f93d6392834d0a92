//! Extension metadata cache
//!
//! Entries are keyed by [`cache_id`] and shared as `Arc<ExtensionConfig>`, so
//! repeated lookups hand out the same immutable configuration. Writes are
//! last-writer-wins: two threads missing on the same key compute the same
//! value from the same mapping, so no lock is held across the computation.
//!
//! An optional [`CacheStore`] persists entries across process restarts.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::BehaviorResult;
use super::extension::ExtensionConfig;
use super::registry::MappingObserver;

const KEY_SEPARATOR: char = '\0';

/// Cache key for a (class, extension) pair
pub fn cache_id(class: &str, extension: &str) -> String {
    format!("{class}{KEY_SEPARATOR}{extension}")
}

/// Split a cache key back into (class, extension)
pub fn split_cache_id(id: &str) -> Option<(&str, &str)> {
    id.split_once(KEY_SEPARATOR)
}

/// Persistent backing store for cached configurations
pub trait CacheStore: Send + Sync {
    fn fetch(&self, id: &str) -> BehaviorResult<Option<ExtensionConfig>>;

    fn save(&self, id: &str, config: &ExtensionConfig) -> BehaviorResult<()>;

    /// Drop every entry belonging to `class`
    fn delete_class(&self, class: &str) -> BehaviorResult<()>;

    fn flush(&self) -> BehaviorResult<()>;
}

/// File-backed store: one directory per class, one JSON file per extension.
///
/// Names are blake3 digests of the class and of the full key, so keys with
/// arbitrary characters map to portable file names.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> BehaviorResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn class_dir(&self, class: &str) -> PathBuf {
        self.root.join(digest(class))
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        let class = split_cache_id(id).map(|(class, _)| class).unwrap_or(id);
        self.class_dir(class).join(format!("{}.json", digest(id)))
    }
}

fn digest(input: &str) -> String {
    hex::encode(&blake3::hash(input.as_bytes()).as_bytes()[..16])
}

impl CacheStore for FileStore {
    fn fetch(&self, id: &str) -> BehaviorResult<Option<ExtensionConfig>> {
        match fs::read(self.entry_path(id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, id: &str, config: &ExtensionConfig) -> BehaviorResult<()> {
        let path = self.entry_path(id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        // readers never see a partially written entry
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(config)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete_class(&self, class: &str) -> BehaviorResult<()> {
        match fs::remove_dir_all(self.class_dir(class)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn flush(&self) -> BehaviorResult<()> {
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(path)?;
            }
        }
        Ok(())
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub entries: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

/// Process-wide extension metadata cache
#[derive(Default)]
pub struct MetadataCache {
    entries: DashMap<String, Arc<ExtensionConfig>>,
    store: Option<Box<dyn CacheStore>>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl MetadataCache {
    /// In-memory cache only
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache backed by a persistent store
    pub fn with_store(store: impl CacheStore + 'static) -> Self {
        Self {
            store: Some(Box::new(store)),
            ..Self::default()
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ExtensionConfig>> {
        self.get_checked(id, |_| true)
    }

    /// Like [`get`](Self::get), but an entry loaded from the persistent store
    /// is only served when `accept` holds for it. Rejected entries count as a
    /// miss and are left to be overwritten by the next [`put`](Self::put).
    pub fn get_checked(&self, id: &str, accept: impl Fn(&ExtensionConfig) -> bool) -> Option<Arc<ExtensionConfig>> {
        if let Some(entry) = self.entries.get(id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value().clone());
        }

        if let Some(store) = &self.store {
            match store.fetch(id) {
                Ok(Some(config)) if !accept(&config) => {
                    debug!(key = %id.replace(KEY_SEPARATOR, "/"), "stored metadata no longer matches the mapping");
                }
                Ok(Some(config)) => {
                    let config = Arc::new(config);
                    self.entries.insert(id.to_string(), config.clone());
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(config);
                }
                Ok(None) => {}
                Err(err) => warn!(key = %id.replace(KEY_SEPARATOR, "/"), error = %err, "metadata store read failed"),
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a configuration and return the shared handle
    pub fn put(&self, id: &str, config: ExtensionConfig) -> Arc<ExtensionConfig> {
        if let Some(store) = &self.store {
            if let Err(err) = store.save(id, &config) {
                warn!(key = %id.replace(KEY_SEPARATOR, "/"), error = %err, "metadata store write failed");
            }
        }

        let config = Arc::new(config);
        self.entries.insert(id.to_string(), config.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        config
    }

    /// Drop every cached extension configuration of `class`
    pub fn invalidate(&self, class: &str) {
        let prefix = format!("{class}{KEY_SEPARATOR}");
        self.entries.retain(|key, _| !key.starts_with(&prefix));

        if let Some(store) = &self.store {
            if let Err(err) = store.delete_class(class) {
                warn!(class, error = %err, "metadata store invalidation failed");
            }
        }
        debug!(class, "invalidated extension metadata");
    }

    pub fn clear(&self) {
        self.entries.clear();
        if let Some(store) = &self.store {
            if let Err(err) = store.flush() {
                warn!(error = %err, "metadata store flush failed");
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            entries: self.entries.len() as u64,
        }
    }
}

impl MappingObserver for MetadataCache {
    fn mapping_reloaded(&self, class: &str) {
        self.invalidate(class);
    }
}
