use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::models::identity::IdentityCacheEntry;

/// Persistent path -> external identity mapping.
///
/// Implementations must tolerate concurrent upserts of different entries.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Entry whose root directory is `root_dir`.
    async fn get(&self, root_dir: &Path) -> Result<Option<IdentityCacheEntry>, CacheError>;

    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<IdentityCacheEntry>, CacheError>;

    /// Insert or replace an entry. Persistent stores may defer the write
    /// until [`flush`](Self::flush).
    async fn upsert(&self, entry: IdentityCacheEntry) -> Result<(), CacheError>;

    /// Persist pending upserts.
    async fn flush(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Entries keyed by external id, with a root-directory index.
#[derive(Default)]
struct IdentityIndex {
    by_id: DashMap<String, IdentityCacheEntry>,
    by_root: DashMap<PathBuf, String>,
}

impl IdentityIndex {
    fn get(&self, root_dir: &Path) -> Option<IdentityCacheEntry> {
        let id = self.by_root.get(root_dir)?.value().clone();
        self.by_id.get(&id).map(|e| e.value().clone())
    }

    fn get_by_external_id(&self, external_id: &str) -> Option<IdentityCacheEntry> {
        self.by_id.get(external_id).map(|e| e.value().clone())
    }

    fn insert(&self, entry: IdentityCacheEntry) {
        if let Some(previous) = self.by_id.insert(entry.external_id.clone(), entry.clone()) {
            if previous.root_dir != entry.root_dir {
                self.by_root
                    .remove_if(&previous.root_dir, |_, id| *id == entry.external_id);
            }
        }
        self.by_root.insert(entry.root_dir, entry.external_id);
    }

    fn entries(&self) -> Vec<IdentityCacheEntry> {
        let mut entries: Vec<_> = self.by_id.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        entries
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }
}

/// Store kept only in memory.
#[derive(Default)]
pub struct MemoryIdentityStore {
    index: IdentityIndex,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<IdentityCacheEntry> {
        self.index.entries()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn get(&self, root_dir: &Path) -> Result<Option<IdentityCacheEntry>, CacheError> {
        Ok(self.index.get(root_dir))
    }

    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<IdentityCacheEntry>, CacheError> {
        Ok(self.index.get_by_external_id(external_id))
    }

    async fn upsert(&self, entry: IdentityCacheEntry) -> Result<(), CacheError> {
        self.index.insert(entry);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct CacheMeta {
    format_version: u32,
    saved_at: DateTime<Utc>,
    entry_count: usize,
}

const FORMAT_VERSION: u32 = 1;
const ENTRIES_FILE: &str = "identities.cache";
const META_FILE: &str = "identities.meta.json";

/// Store persisted as a bincode entry file plus a JSON meta file. Upserts
/// only touch memory; [`IdentityStore::flush`] writes the files.
pub struct FileIdentityStore {
    cache_dir: PathBuf,
    index: IdentityIndex,
    dirty: AtomicBool,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileIdentityStore {
    /// Open the store in `cache_dir`, loading any previously saved entries.
    /// A missing, stale or unreadable cache starts empty.
    pub async fn open(cache_dir: PathBuf) -> Result<Self, CacheError> {
        tokio::fs::create_dir_all(&cache_dir)
            .await
            .map_err(|source| CacheError::Io {
                path: cache_dir.clone(),
                source,
            })?;

        let store = Self {
            index: IdentityIndex::default(),
            dirty: AtomicBool::new(false),
            write_lock: tokio::sync::Mutex::new(()),
            cache_dir,
        };
        match store.load().await {
            Some(entries) => {
                debug!(entries = entries.len(), "Identity cache loaded");
                for entry in entries {
                    store.index.insert(entry);
                }
            }
            None => debug!(dir = %store.cache_dir.display(), "Starting with an empty identity cache"),
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<IdentityCacheEntry> {
        self.index.entries()
    }

    fn entries_path(&self) -> PathBuf {
        self.cache_dir.join(ENTRIES_FILE)
    }

    fn meta_path(&self) -> PathBuf {
        self.cache_dir.join(META_FILE)
    }

    async fn load(&self) -> Option<Vec<IdentityCacheEntry>> {
        let meta_bytes = tokio::fs::read(self.meta_path()).await.ok()?;
        let meta: CacheMeta = serde_json::from_slice(&meta_bytes).ok()?;
        if meta.format_version != FORMAT_VERSION {
            warn!(found = meta.format_version, "Ignoring identity cache with another format version");
            return None;
        }

        let bytes = tokio::fs::read(self.entries_path()).await.ok()?;
        let entries: Vec<IdentityCacheEntry> =
            match bincode::serde::decode_from_slice(&bytes, bincode::config::standard()) {
                Ok((entries, _)) => entries,
                Err(e) => {
                    warn!(error = %e, "Identity cache is unreadable, starting empty");
                    return None;
                }
            };
        if entries.len() != meta.entry_count {
            warn!(expected = meta.entry_count, found = entries.len(), "Identity cache is truncated");
            return None;
        }
        Some(entries)
    }

    async fn save(&self) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;

        let entries = self.index.entries();
        let meta = CacheMeta {
            format_version: FORMAT_VERSION,
            saved_at: Utc::now(),
            entry_count: entries.len(),
        };

        let entry_bytes = bincode::serde::encode_to_vec(&entries, bincode::config::standard())?;
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;

        // Atomic write: write to temp file, then rename
        write_atomic(&self.entries_path(), &entry_bytes).await?;
        write_atomic(&self.meta_path(), &meta_bytes).await?;
        Ok(())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let io_err = |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    };
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn get(&self, root_dir: &Path) -> Result<Option<IdentityCacheEntry>, CacheError> {
        Ok(self.index.get(root_dir))
    }

    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<IdentityCacheEntry>, CacheError> {
        Ok(self.index.get_by_external_id(external_id))
    }

    async fn upsert(&self, entry: IdentityCacheEntry) -> Result<(), CacheError> {
        self.index.insert(entry);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    async fn flush(&self) -> Result<(), CacheError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let saved = self.save().await;
        if saved.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        saved
    }
}
