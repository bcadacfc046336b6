//! Write buffers for files created through FUSE.
//!
//! Every `create` gets a uniquely named temp file under `temp_dir`. The
//! mapping file name → `{final_path, temp_path}` is mirrored to
//! `temp_dir/index.json` (written atomically: tmp → rename) so that a fresh
//! manager can still find and commit a buffer it did not create.
//!
//! Keys are bare file names, not paths: `release` only needs a name to find
//! the buffer when its descriptor is unknown.

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use filer_core::hash::hash_file;
use filer_core::path::file_name;
use filer_core::{FilerError, FilerResult};

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempEntry {
    pub final_path: String,
    pub temp_path: PathBuf,
}

/// Size and mode of a buffer that is still being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempStat {
    pub size: u64,
    pub mode: u32,
}

pub struct TempFileManager {
    dir: PathBuf,
    reject_hidden: bool,
    index: Mutex<BTreeMap<String, TempEntry>>,
    /// Open descriptors; a buffer loaded from the index is reopened lazily.
    files: tokio::sync::Mutex<HashMap<String, File>>,
}

impl TempFileManager {
    /// Open the buffer directory, creating it and loading any index left by
    /// a previous process.
    pub async fn open(dir: impl Into<PathBuf>, reject_hidden: bool) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating temp dir: {}", dir.display()))?;

        let index_path = dir.join(INDEX_FILE);
        let index = match fs::read(&index_path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!(path = %index_path.display(), error = %e, "temp index unreadable, starting empty");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", index_path.display()));
            }
        };

        Ok(TempFileManager {
            dir,
            reject_hidden,
            index: Mutex::new(index),
            files: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    fn index(&self) -> MutexGuard<'_, BTreeMap<String, TempEntry>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn check_name(&self, name: &str) -> FilerResult<()> {
        if self.reject_hidden && name.starts_with('.') {
            return Err(FilerError::Unsupported(format!(
                "hidden file {name} cannot be buffered"
            )));
        }
        Ok(())
    }

    fn entry(&self, name: &str) -> FilerResult<TempEntry> {
        self.index()
            .get(name)
            .cloned()
            .ok_or_else(|| FilerError::NotFound(name.to_string()))
    }

    pub fn lookup(&self, name: &str) -> Option<TempEntry> {
        self.index().get(name).cloned()
    }

    /// Buffers in flight, by file name.
    pub fn pending(&self) -> Vec<(String, TempEntry)> {
        self.index()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Start a buffer for `final_path`, replacing any earlier one for the
    /// same name.
    pub async fn create(&self, final_path: &str) -> FilerResult<TempEntry> {
        let name = file_name(final_path).to_string();
        self.check_name(&name)?;

        let temp_path = self
            .dir
            .join(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&temp_path)
            .await?;

        let entry = TempEntry {
            final_path: final_path.to_string(),
            temp_path,
        };
        let replaced = self.index().insert(name.clone(), entry.clone());
        self.files.lock().await.insert(name.clone(), file);
        if let Some(old) = replaced {
            remove_quietly(&old.temp_path).await;
        }
        self.save_index().await?;
        debug!(name = %name, temp = %entry.temp_path.display(), "write buffer created");
        Ok(entry)
    }

    /// Write `data` at `offset`. Returns the byte count written.
    pub async fn write(&self, name: &str, offset: u64, data: &[u8]) -> FilerResult<usize> {
        self.check_name(name)?;
        let entry = self.entry(name)?;
        let mut files = self.files.lock().await;
        if !files.contains_key(name) {
            let f = OpenOptions::new().write(true).open(&entry.temp_path).await?;
            files.insert(name.to_string(), f);
        }
        let file = files
            .get_mut(name)
            .ok_or_else(|| FilerError::NotFound(name.to_string()))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len())
    }

    pub async fn truncate(&self, name: &str, size: u64) -> FilerResult<()> {
        let entry = self.entry(name)?;
        let files = self.files.lock().await;
        match files.get(name) {
            Some(f) => f.set_len(size).await?,
            None => {
                let f = OpenOptions::new().write(true).open(&entry.temp_path).await?;
                f.set_len(size).await?;
            }
        }
        Ok(())
    }

    /// Current size and mode of the buffer.
    pub async fn stat(&self, name: &str) -> FilerResult<TempStat> {
        self.check_name(name)?;
        let entry = self.entry(name)?;
        let meta = fs::metadata(&entry.temp_path)
            .await
            .map_err(|_| FilerError::NotFound(entry.final_path.clone()))?;
        Ok(TempStat {
            size: meta.len(),
            mode: file_mode(&meta),
        })
    }

    /// Flush and close the buffer, then hash it. Returns the entry, the
    /// hex SHA-256 and the size.
    pub async fn seal(&self, name: &str) -> FilerResult<(TempEntry, String, u64)> {
        self.check_name(name)?;
        let entry = self.entry(name)?;
        if let Some(mut file) = self.files.lock().await.remove(name) {
            file.flush().await?;
            file.sync_all().await?;
        }
        let (hash, size) = hash_file(&entry.temp_path)
            .await
            .map_err(|_| FilerError::NotFound(entry.final_path.clone()))?;
        Ok((entry, hash, size))
    }

    /// Forget the buffer and delete its file.
    pub async fn discard(&self, name: &str) -> FilerResult<()> {
        self.files.lock().await.remove(name);
        let removed = self.index().remove(name);
        if let Some(entry) = removed {
            remove_quietly(&entry.temp_path).await;
        }
        self.save_index().await
    }

    async fn save_index(&self) -> FilerResult<()> {
        let raw = {
            let index = self.index();
            serde_json::to_vec_pretty(&*index).map_err(|e| FilerError::Other(e.into()))?
        };
        let path = self.dir.join(INDEX_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &raw).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove temp file");
        }
    }
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    filer_core::types::COMMITTED_FILE_MODE
}

#[cfg(test)]
mod tests {
    use super::*;
    use filer_core::hash::hash_bytes;

    #[tokio::test]
    async fn write_at_offsets_then_seal() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = TempFileManager::open(dir.path(), false).await.unwrap();
        mgr.create("/objects/a.txt").await.unwrap();
        mgr.write("a.txt", 0, b"abc").await.unwrap();
        mgr.write("a.txt", 3, b"def").await.unwrap();
        mgr.write("a.txt", 1, b"B").await.unwrap();
        assert_eq!(mgr.stat("a.txt").await.unwrap().size, 6);

        let (entry, hash, size) = mgr.seal("a.txt").await.unwrap();
        assert_eq!(entry.final_path, "/objects/a.txt");
        assert_eq!(hash, hash_bytes(b"aBcdef"));
        assert_eq!(size, 6);

        mgr.discard("a.txt").await.unwrap();
        assert!(!entry.temp_path.exists());
        assert!(mgr.lookup("a.txt").is_none());
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mgr = TempFileManager::open(dir.path(), false).await.unwrap();
            mgr.create("/chats/log").await.unwrap();
            mgr.write("log", 0, b"hi").await.unwrap();
        }
        let mgr = TempFileManager::open(dir.path(), false).await.unwrap();
        let entry = mgr.lookup("log").unwrap();
        assert_eq!(entry.final_path, "/chats/log");
        mgr.write("log", 2, b"!").await.unwrap();
        let (_, hash, _) = mgr.seal("log").await.unwrap();
        assert_eq!(hash, hash_bytes(b"hi!"));
    }

    #[tokio::test]
    async fn truncate_shrinks_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = TempFileManager::open(dir.path(), false).await.unwrap();
        mgr.create("/x").await.unwrap();
        mgr.write("x", 0, b"123456").await.unwrap();
        mgr.truncate("x", 2).await.unwrap();
        assert_eq!(mgr.stat("x").await.unwrap().size, 2);
    }

    #[tokio::test]
    async fn hidden_names_rejected_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = TempFileManager::open(dir.path(), true).await.unwrap();
        let err = mgr.create("/objects/.DS_Store").await.unwrap_err();
        assert!(matches!(err, FilerError::Unsupported(_)));

        let relaxed = TempFileManager::open(dir.path(), false).await.unwrap();
        relaxed.create("/objects/.hidden").await.unwrap();
    }

    #[tokio::test]
    async fn unknown_buffer_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = TempFileManager::open(dir.path(), false).await.unwrap();
        assert!(mgr.write("nope", 0, b"x").await.unwrap_err().is_not_found());
        assert!(mgr.stat("nope").await.unwrap_err().is_not_found());
    }
}
