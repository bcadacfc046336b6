//! Disk-backed snapshot of directory listings and small file contents.
//!
//! Loaded before the native engine mounts so the first enumeration after a
//! restart has something to answer with.
//!
//! Layout under the cache dir:
//! ```text
//! metadata.json
//! access_log.json
//! directories/{sha256(path)}.json
//! files/{sha256(path)}.json      (record)
//! files/{sha256(path)}.bin       (content)
//! ```
//! Every file is written atomically (temp → rename).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use filer_core::context::now_millis;
use filer_core::hash::hash_bytes;
use filer_core::DirectoryEntry;

pub const CACHE_FORMAT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub version: String,
    pub last_sync_ms: u64,
    pub total_size: u64,
    pub entry_count: usize,
    pub instance_id: String,
}

impl CacheMetadata {
    fn fresh() -> Self {
        CacheMetadata {
            version: CACHE_FORMAT_VERSION.to_string(),
            last_sync_ms: now_millis(),
            total_size: 0,
            entry_count: 0,
            instance_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DirectoryRecord {
    path: String,
    entries: Vec<DirectoryEntry>,
    cached_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub hash: String,
    pub cached_at_ms: u64,
}

// ── Access log ────────────────────────────────────────────────────────────

/// How often each path was enumerated or read; ranks hot paths for prefetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLog {
    pub counts: BTreeMap<String, u64>,
}

impl AccessLog {
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut log = AccessLog::default();
        for p in paths {
            log.record(p);
        }
        log
    }

    pub fn record(&mut self, path: impl Into<String>) {
        *self.counts.entry(path.into()).or_insert(0) += 1;
    }

    /// The `n` most frequent paths, ties broken by path.
    pub fn top(&self, n: usize) -> Vec<String> {
        let mut ranked: Vec<(&String, &u64)> = self.counts.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        ranked.into_iter().take(n).map(|(p, _)| p.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

// ── Store ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PersistStats {
    #[serde(flatten)]
    pub metadata: CacheMetadata,
    pub directories: usize,
    pub files: usize,
    pub cache_dir: PathBuf,
}

struct PersistState {
    metadata: CacheMetadata,
    directories: HashMap<String, Vec<DirectoryEntry>>,
    files: HashMap<String, FileRecord>,
    access: AccessLog,
    dirty: bool,
}

pub struct PersistentCacheStore {
    dir: PathBuf,
    state: Mutex<PersistState>,
}

impl PersistentCacheStore {
    /// Open (or initialize) the cache at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        for sub in ["directories", "files"] {
            let p = dir.join(sub);
            fs::create_dir_all(&p)
                .await
                .with_context(|| format!("creating cache dir: {}", p.display()))?;
        }

        let metadata = match read_json::<CacheMetadata>(&dir.join("metadata.json")).await {
            Some(m) if m.version == CACHE_FORMAT_VERSION => m,
            Some(m) => {
                warn!(found = %m.version, "cache format changed, starting fresh metadata");
                CacheMetadata::fresh()
            }
            None => CacheMetadata::fresh(),
        };
        let access = read_json::<AccessLog>(&dir.join("access_log.json"))
            .await
            .unwrap_or_default();

        debug!(dir = %dir.display(), entries = metadata.entry_count, "persistent cache opened");
        Ok(PersistentCacheStore {
            dir,
            state: Mutex::new(PersistState {
                metadata,
                directories: HashMap::new(),
                files: HashMap::new(),
                access,
                dirty: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PersistState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.dir
    }

    fn directory_path(&self, path: &str) -> PathBuf {
        self.dir
            .join("directories")
            .join(format!("{}.json", hash_bytes(path.as_bytes())))
    }

    fn file_paths(&self, path: &str) -> (PathBuf, PathBuf) {
        let key = hash_bytes(path.as_bytes());
        let files = self.dir.join("files");
        (
            files.join(format!("{key}.json")),
            files.join(format!("{key}.bin")),
        )
    }

    fn touch(state: &mut PersistState) {
        state.metadata.entry_count = state.directories.len() + state.files.len();
        state.metadata.last_sync_ms = now_millis();
        state.dirty = true;
    }

    /// Persist a listing. Entries with empty names are dropped.
    pub async fn cache_directory(&self, path: &str, entries: &[DirectoryEntry]) -> Result<usize> {
        let valid: Vec<DirectoryEntry> = entries
            .iter()
            .filter(|e| !e.name.is_empty())
            .cloned()
            .collect();
        if valid.len() != entries.len() {
            warn!(
                path,
                dropped = entries.len() - valid.len(),
                "dropping unnamed entries from cached listing"
            );
        }

        let record = DirectoryRecord {
            path: path.to_string(),
            entries: valid.clone(),
            cached_at_ms: now_millis(),
        };
        let json = serde_json::to_vec_pretty(&record).context("serializing directory record")?;
        write_atomic(&self.directory_path(path), &json).await?;

        let kept = valid.len();
        let mut state = self.lock();
        state.directories.insert(path.to_string(), valid);
        Self::touch(&mut state);
        Ok(kept)
    }

    pub async fn cache_file(&self, path: &str, content: &Bytes, mode: u32) -> Result<()> {
        let record = FileRecord {
            path: path.to_string(),
            size: content.len() as u64,
            mode,
            hash: hash_bytes(content),
            cached_at_ms: now_millis(),
        };
        let (json_path, bin_path) = self.file_paths(path);
        write_atomic(&bin_path, content).await?;
        let json = serde_json::to_vec_pretty(&record).context("serializing file record")?;
        write_atomic(&json_path, &json).await?;

        let mut state = self.lock();
        let previous = state.files.insert(path.to_string(), record);
        state.metadata.total_size = state
            .metadata
            .total_size
            .saturating_sub(previous.map(|r| r.size).unwrap_or(0))
            + content.len() as u64;
        Self::touch(&mut state);
        Ok(())
    }

    pub async fn get_directory(&self, path: &str) -> Option<Vec<DirectoryEntry>> {
        if let Some(entries) = self.lock().directories.get(path) {
            return Some(entries.clone());
        }
        let record = read_json::<DirectoryRecord>(&self.directory_path(path)).await?;
        let entries = record.entries;
        self.lock()
            .directories
            .insert(path.to_string(), entries.clone());
        Some(entries)
    }

    pub async fn get_file(&self, path: &str) -> Option<(FileRecord, Bytes)> {
        let (json_path, bin_path) = self.file_paths(path);
        let cached = self.lock().files.get(path).cloned();
        let record = match cached {
            Some(r) => r,
            None => read_json::<FileRecord>(&json_path).await?,
        };
        let content = match fs::read(&bin_path).await {
            Ok(c) => Bytes::from(c),
            Err(e) => {
                debug!(path, error = %e, "cached file content missing");
                return None;
            }
        };
        self.lock()
            .files
            .insert(path.to_string(), record.clone());
        Some((record, content))
    }

    /// Every persisted non-empty listing, keyed by path.
    pub async fn preload_root_directories(&self) -> Result<HashMap<String, Vec<DirectoryEntry>>> {
        let dir = self.dir.join("directories");
        let mut loaded = HashMap::new();
        let mut rd = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading cache dir: {}", dir.display()))?;
        while let Some(item) = rd.next_entry().await? {
            let p = item.path();
            if p.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<DirectoryRecord>(&p).await {
                Some(record) if !record.entries.is_empty() => {
                    loaded.insert(record.path, record.entries);
                }
                Some(_) => {}
                None => warn!(file = %p.display(), "skipping unreadable directory cache"),
            }
        }

        let mut state = self.lock();
        for (path, entries) in &loaded {
            state.directories.insert(path.clone(), entries.clone());
        }
        info!(directories = loaded.len(), "preloaded persistent directory cache");
        Ok(loaded)
    }

    pub fn record_access(&self, path: &str) {
        let mut state = self.lock();
        state.access.record(path);
        state.dirty = true;
    }

    pub fn access_log(&self) -> AccessLog {
        self.lock().access.clone()
    }

    /// Write metadata and the access log if anything changed.
    /// Returns whether a write happened.
    pub async fn save_to_disk(&self) -> Result<bool> {
        let (metadata, access) = {
            let mut state = self.lock();
            if !state.dirty {
                return Ok(false);
            }
            state.dirty = false;
            (state.metadata.clone(), state.access.clone())
        };

        let result = async {
            let meta = serde_json::to_vec_pretty(&metadata).context("serializing metadata")?;
            write_atomic(&self.dir.join("metadata.json"), &meta).await?;
            let log = serde_json::to_vec_pretty(&access).context("serializing access log")?;
            write_atomic(&self.dir.join("access_log.json"), &log).await
        }
        .await;

        if let Err(e) = result {
            self.lock().dirty = true;
            return Err(e);
        }
        debug!(entries = metadata.entry_count, "persistent cache saved");
        Ok(true)
    }

    pub fn stats(&self) -> PersistStats {
        let state = self.lock();
        PersistStats {
            metadata: state.metadata.clone(),
            directories: state.directories.len(),
            files: state.files.len(),
            cache_dir: self.dir.clone(),
        }
    }

    /// Remove everything on disk and in memory.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("removing {}", self.dir.display()));
            }
        }
        for sub in ["directories", "files"] {
            fs::create_dir_all(self.dir.join(sub)).await?;
        }

        let mut state = self.lock();
        state.directories.clear();
        state.files.clear();
        state.access = AccessLog::default();
        state.metadata = CacheMetadata::fresh();
        state.dirty = false;
        info!(dir = %self.dir.display(), "persistent cache cleared");
        Ok(())
    }

    /// Flush pending state and drop the in-memory copies.
    pub async fn shutdown(&self) -> Result<()> {
        self.save_to_disk().await?;
        let mut state = self.lock();
        state.directories.clear();
        state.files.clear();
        Ok(())
    }

    /// Save every `interval` until `cancel` fires.
    pub fn spawn_autosave(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.save_to_disk().await {
                            warn!(error = %e, "periodic cache save failed");
                        }
                    }
                }
            }
        })
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)
        .await
        .with_context(|| format!("writing cache tmp: {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming cache entry: {}", path.display()))?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let data = fs::read(path).await.ok()?;
    match serde_json::from_slice(&data) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(file = %path.display(), error = %e, "corrupt cache file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(names: &[&str]) -> Vec<DirectoryEntry> {
        names.iter().map(|n| DirectoryEntry::directory(*n)).collect()
    }

    #[tokio::test]
    async fn listings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = PersistentCacheStore::open(dir.path()).await.unwrap();
            store
                .cache_directory("/", &entries(&["chats", "objects"]))
                .await
                .unwrap();
            store
                .cache_directory("/chats", &entries(&["room"]))
                .await
                .unwrap();
            store.cache_directory("/empty", &[]).await.unwrap();
            store.shutdown().await.unwrap();
        }

        let store = PersistentCacheStore::open(dir.path()).await.unwrap();
        let loaded = store.preload_root_directories().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["/"].len(), 2);
        assert_eq!(loaded["/chats"][0].name, "room");
        assert_eq!(store.stats().metadata.entry_count, 3);
    }

    #[tokio::test]
    async fn unnamed_entries_are_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentCacheStore::open(dir.path()).await.unwrap();
        let kept = store
            .cache_directory("/", &entries(&["chats", "", "types"]))
            .await
            .unwrap();
        assert_eq!(kept, 2);
        assert_eq!(store.get_directory("/").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn file_content_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentCacheStore::open(dir.path()).await.unwrap();
        store
            .cache_file("/objects/a.txt", &Bytes::from_static(b"abc"), 0o100644)
            .await
            .unwrap();

        let reopened = PersistentCacheStore::open(dir.path()).await.unwrap();
        let (record, content) = reopened.get_file("/objects/a.txt").await.unwrap();
        assert_eq!(&content[..], b"abc");
        assert_eq!(record.size, 3);
        assert_eq!(record.hash, hash_bytes(b"abc"));
        assert!(reopened.get_file("/objects/missing").await.is_none());
        assert_eq!(store.stats().metadata.total_size, 3);
    }

    #[tokio::test]
    async fn save_only_when_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentCacheStore::open(dir.path()).await.unwrap();
        assert!(!store.save_to_disk().await.unwrap());
        store.record_access("/chats");
        store.record_access("/chats");
        store.record_access("/types");
        assert!(store.save_to_disk().await.unwrap());
        assert!(!store.save_to_disk().await.unwrap());

        let reopened = PersistentCacheStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.access_log().top(1), vec!["/chats"]);
        assert_eq!(
            reopened.stats().metadata.instance_id,
            store.stats().metadata.instance_id
        );
    }

    #[tokio::test]
    async fn clear_wipes_disk_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentCacheStore::open(dir.path()).await.unwrap();
        store.cache_directory("/", &entries(&["chats"])).await.unwrap();
        store.clear().await.unwrap();
        assert!(store.get_directory("/").await.is_none());
        assert!(store.preload_root_directories().await.unwrap().is_empty());
        assert_eq!(store.stats().directories, 0);
    }

    #[test]
    fn access_log_ranking() {
        let log = AccessLog::from_paths(["/b", "/a", "/b", "/c", "/a", "/b"]);
        assert_eq!(log.top(2), vec!["/b", "/a"]);
        assert_eq!(log.top(10).len(), 3);
    }
}
