//! WriteBufferAdapter: FUSE operations on top of a [`ContentStore`].
//!
//! Reads and metadata calls go straight to the store. Writes are buffered:
//!
//! ```text
//! create ──► temp file ──► write* ──► release ──► hash ──► put_blob ──► create_file
//!                                                                 └──► "persisted" event
//! ```
//!
//! `getattr` on a path that is still being written answers from the temp
//! file. If the temp file is already gone, it waits (bounded by
//! `persist_wait`) for the persisted event and then asks the store.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use filer_core::config::{expand_home, FuseConfig};
use filer_core::path::{file_name, normalize_path, split_parent};
use filer_core::types::{COMMITTED_FILE_MODE, MKDIR_MODE};
use filer_core::{FileStat, FilerError, FilerResult};
use filer_store::ContentStore;

use crate::tempfiles::TempFileManager;

/// Descriptors handed to the kernel start here.
pub const FIRST_DESCRIPTOR: u64 = 10;

const PERSISTED_CHANNEL: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenWrite {
    file_name: String,
    path: String,
}

/// Constant filesystem geometry reported by `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

pub const STATFS: StatFs = StatFs {
    blocks: 1_000_000,
    bfree: 1_000_000,
    bavail: 1_000_000,
    files: 1_000_000,
    ffree: 1_000_000,
    bsize: 4096,
    namelen: 255,
    frsize: 4096,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdapterStats {
    pub open_writes: usize,
    pub open_reads: usize,
    pub buffered: usize,
    pub committed: u64,
}

#[derive(Default)]
struct Handles {
    writes: HashMap<u64, OpenWrite>,
    reads: HashSet<u64>,
}

pub struct WriteBufferAdapter {
    store: Arc<dyn ContentStore>,
    temps: TempFileManager,
    handles: Mutex<Handles>,
    next_fh: AtomicU64,
    committed: AtomicU64,
    persisted: broadcast::Sender<String>,
    persist_wait: Duration,
}

impl WriteBufferAdapter {
    pub async fn new(
        store: Arc<dyn ContentStore>,
        temp_dir: impl Into<PathBuf>,
        persist_wait: Duration,
        reject_hidden: bool,
    ) -> anyhow::Result<Self> {
        let temps = TempFileManager::open(temp_dir, reject_hidden).await?;
        let (persisted, _) = broadcast::channel(PERSISTED_CHANNEL);
        Ok(WriteBufferAdapter {
            store,
            temps,
            handles: Mutex::new(Handles::default()),
            next_fh: AtomicU64::new(FIRST_DESCRIPTOR),
            committed: AtomicU64::new(0),
            persisted,
            persist_wait,
        })
    }

    pub async fn from_config(store: Arc<dyn ContentStore>, cfg: &FuseConfig) -> anyhow::Result<Self> {
        Self::new(
            store,
            expand_home(&cfg.temp_dir),
            Duration::from_secs(cfg.persist_wait_secs),
            cfg.reject_hidden,
        )
        .await
    }

    fn handles(&self) -> MutexGuard<'_, Handles> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_descriptor(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    fn write_for_path(&self, path: &str) -> Option<OpenWrite> {
        self.handles()
            .writes
            .values()
            .find(|w| w.path == path)
            .cloned()
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn temps(&self) -> &TempFileManager {
        &self.temps
    }

    /// Paths of committed files, in commit order.
    pub fn subscribe_persisted(&self) -> broadcast::Receiver<String> {
        self.persisted.subscribe()
    }

    pub fn stats(&self) -> AdapterStats {
        let handles = self.handles();
        AdapterStats {
            open_writes: handles.writes.len(),
            open_reads: handles.reads.len(),
            buffered: self.temps.pending().len(),
            committed: self.committed.load(Ordering::Relaxed),
        }
    }

    // ── Metadata ──────────────────────────────────────────────────────────

    pub async fn getattr(&self, raw_path: &str) -> FilerResult<FileStat> {
        let path = normalize_path(raw_path, None);
        // Subscribe before looking at the handle table so a commit that
        // lands in between is not missed.
        let mut persisted = self.persisted.subscribe();
        let Some(open) = self.write_for_path(&path) else {
            return self.store.stat(&path).await;
        };

        match self.temps.stat(&open.file_name).await {
            Ok(temp) => Ok(FileStat {
                size: temp.size,
                mode: temp.mode,
                ..FileStat::default()
            }),
            Err(e) => {
                debug!(path = %path, error = %e, "temp file gone, waiting for commit");
                let wait = async {
                    loop {
                        match persisted.recv().await {
                            Ok(done) if done == path => return true,
                            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => return false,
                        }
                    }
                };
                match tokio::time::timeout(self.persist_wait, wait).await {
                    Ok(true) => self.store.stat(&path).await,
                    _ => Err(FilerError::NotFound(path.clone())),
                }
            }
        }
    }

    pub async fn readdir(&self, raw_path: &str) -> FilerResult<Vec<String>> {
        self.store.read_dir(&normalize_path(raw_path, None)).await
    }

    pub fn statfs(&self) -> StatFs {
        STATFS
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    pub fn open(&self, raw_path: &str) -> u64 {
        let fh = self.next_descriptor();
        self.handles().reads.insert(fh);
        debug!(path = raw_path, fh, "opened");
        fh
    }

    pub fn opendir(&self, _raw_path: &str) -> u64 {
        self.next_descriptor()
    }

    /// `length` bytes at `offset`; fewer at end of file.
    pub async fn read(&self, raw_path: &str, length: u32, offset: u64) -> FilerResult<Bytes> {
        let path = normalize_path(raw_path, None);
        if self.store.supports_chunked_reading() {
            return self
                .store
                .read_file_chunk(&path, u64::from(length), offset)
                .await;
        }
        let content = self.store.read_file(&path).await?;
        let start = (offset as usize).min(content.len());
        let end = start.saturating_add(length as usize).min(content.len());
        Ok(content.slice(start..end))
    }

    pub async fn readlink(&self, raw_path: &str) -> FilerResult<Bytes> {
        self.store.readlink(&normalize_path(raw_path, None)).await
    }

    // ── Buffered writes ───────────────────────────────────────────────────

    /// Start a write buffer for `raw_path`. Returns the descriptor.
    pub async fn create(&self, raw_path: &str, _mode: u32) -> FilerResult<u64> {
        let path = normalize_path(raw_path, None);
        self.temps.create(&path).await?;
        let fh = self.next_descriptor();
        self.handles().writes.insert(
            fh,
            OpenWrite {
                file_name: file_name(&path).to_string(),
                path: path.clone(),
            },
        );
        debug!(path = %path, fh, "write buffer opened");
        Ok(fh)
    }

    pub async fn write(
        &self,
        raw_path: &str,
        fh: u64,
        data: &[u8],
        offset: u64,
    ) -> FilerResult<usize> {
        let path = normalize_path(raw_path, None);
        let name = self
            .handles()
            .writes
            .get(&fh)
            .map(|w| w.file_name.clone())
            .unwrap_or_else(|| file_name(&path).to_string());
        self.temps.write(&name, offset, data).await
    }

    pub async fn flush(&self, _raw_path: &str, _fh: u64) -> FilerResult<()> {
        Ok(())
    }

    /// Applies to the temp file when `raw_path` is mid-write; a no-op
    /// otherwise.
    pub async fn truncate(&self, raw_path: &str, size: u64) -> FilerResult<()> {
        let path = normalize_path(raw_path, None);
        match self.write_for_path(&path) {
            Some(open) => self.temps.truncate(&open.file_name, size).await,
            None => Ok(()),
        }
    }

    /// Commit the buffer behind `fh`, or close a read descriptor.
    ///
    /// A descriptor this adapter never issued is matched by file name
    /// against the on-disk temp index.
    pub async fn release(&self, raw_path: &str, fh: u64) -> FilerResult<()> {
        let path = normalize_path(raw_path, None);
        let open = {
            let mut handles = self.handles();
            if handles.reads.remove(&fh) {
                return Ok(());
            }
            handles.writes.get(&fh).cloned()
        };

        let open = match open {
            Some(open) => open,
            None => {
                let name = file_name(&path).to_string();
                match self.temps.lookup(&name) {
                    Some(entry) => {
                        debug!(path = %path, fh, "descriptor unknown, recovered buffer from index");
                        OpenWrite {
                            file_name: name,
                            path: entry.final_path,
                        }
                    }
                    None => return Err(FilerError::BadHandle(fh)),
                }
            }
        };

        self.commit(&open).await?;
        self.handles().writes.remove(&fh);
        let _ = self.persisted.send(open.path.clone());
        Ok(())
    }

    async fn commit(&self, open: &OpenWrite) -> FilerResult<()> {
        let (entry, hash, size) = self.temps.seal(&open.file_name).await?;
        let streamed = self.store.put_blob_from(&hash, &entry.temp_path).await?;
        if streamed != size {
            warn!(path = %open.path, size, streamed, "buffer changed while committing");
        }

        let (parent, name) = split_parent(&open.path);
        self.store
            .create_file(&parent, &hash, &name, COMMITTED_FILE_MODE)
            .await?;

        if let Err(e) = self.temps.discard(&open.file_name).await {
            warn!(path = %open.path, error = %e, "committed but temp buffer not cleaned up");
        }
        self.committed.fetch_add(1, Ordering::Relaxed);
        info!(path = %open.path, hash = %hash, size, "file committed");
        Ok(())
    }

    // ── Namespace ─────────────────────────────────────────────────────────

    pub async fn mkdir(&self, raw_path: &str, _mode: u32) -> FilerResult<()> {
        self.store
            .create_dir(&normalize_path(raw_path, None), MKDIR_MODE)
            .await
    }

    pub async fn unlink(&self, raw_path: &str) -> FilerResult<()> {
        self.store.unlink(&normalize_path(raw_path, None)).await
    }

    pub async fn rename(&self, raw_src: &str, raw_dst: &str) -> FilerResult<()> {
        self.store
            .rename(&normalize_path(raw_src, None), &normalize_path(raw_dst, None))
            .await
    }

    pub async fn rmdir(&self, raw_path: &str) -> FilerResult<()> {
        self.store.rmdir(&normalize_path(raw_path, None)).await
    }

    pub async fn chmod(&self, raw_path: &str, mode: u32) -> FilerResult<()> {
        self.store.chmod(&normalize_path(raw_path, None), mode).await
    }

    pub async fn symlink(&self, target: &str, raw_link: &str) -> FilerResult<()> {
        self.store
            .symlink(target, &normalize_path(raw_link, None))
            .await
    }

    // ── Accepted without effect ───────────────────────────────────────────

    pub fn chown(&self, _raw_path: &str, _uid: u32, _gid: u32) -> FilerResult<()> {
        Ok(())
    }

    pub fn utimens(&self, _raw_path: &str) -> FilerResult<()> {
        Ok(())
    }

    pub fn access(&self, _raw_path: &str, _mask: u32) -> FilerResult<()> {
        Ok(())
    }

    pub fn fsync(&self, _raw_path: &str, _fh: u64) -> FilerResult<()> {
        Ok(())
    }

    // ── Not supported ─────────────────────────────────────────────────────

    pub fn mknod(&self, _raw_path: &str) -> FilerResult<()> {
        Err(FilerError::Unsupported("mknod".into()))
    }

    pub fn link(&self, _src: &str, _dst: &str) -> FilerResult<()> {
        Err(FilerError::Unsupported("link".into()))
    }

    pub fn setxattr(&self, _raw_path: &str, _name: &str) -> FilerResult<()> {
        Err(FilerError::Unsupported("setxattr".into()))
    }

    pub fn removexattr(&self, _raw_path: &str, _name: &str) -> FilerResult<()> {
        Err(FilerError::Unsupported("removexattr".into()))
    }

    /// No extended attributes exist.
    pub fn getxattr(&self, _raw_path: &str, _name: &str) -> Option<Bytes> {
        None
    }

    pub fn listxattr(&self, _raw_path: &str) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filer_store::OpendalStore;

    async fn adapter(dir: &std::path::Path) -> WriteBufferAdapter {
        let store = OpendalStore::memory().unwrap();
        store.create_dir_all("/objects", MKDIR_MODE).await.unwrap();
        store.put_file("/objects/big.bin", &b"0123456789"[..]).await.unwrap();
        WriteBufferAdapter::new(Arc::new(store), dir, Duration::from_millis(200), false)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn descriptors_start_at_ten() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path()).await;
        assert_eq!(a.open("/objects/big.bin"), FIRST_DESCRIPTOR);
        assert_eq!(a.opendir("/objects"), FIRST_DESCRIPTOR + 1);
    }

    #[tokio::test]
    async fn read_slices_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path()).await;
        let fh = a.open("/objects/big.bin");
        assert_eq!(&a.read("/objects/big.bin", 4, 3).await.unwrap()[..], b"3456");
        assert!(a.read("/objects/big.bin", 4, 50).await.unwrap().is_empty());
        a.release("/objects/big.bin", fh).await.unwrap();
        assert_eq!(a.stats().open_reads, 0);
    }

    #[tokio::test]
    async fn truncate_only_touches_pending_writes() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path()).await;
        a.truncate("/objects/big.bin", 0).await.unwrap();
        assert_eq!(a.getattr("/objects/big.bin").await.unwrap().size, 10);

        let fh = a.create("/objects/new.txt", 0o644).await.unwrap();
        a.write("/objects/new.txt", fh, b"hello", 0).await.unwrap();
        a.truncate("/objects/new.txt", 2).await.unwrap();
        assert_eq!(a.getattr("/objects/new.txt").await.unwrap().size, 2);
    }

    #[tokio::test]
    async fn unknown_descriptor_without_buffer_is_ebadf() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path()).await;
        let err = a.release("/objects/ghost", 999).await.unwrap_err();
        assert!(matches!(err, FilerError::BadHandle(999)));
    }

    #[tokio::test]
    async fn unsupported_and_noop_operations() {
        let dir = tempfile::tempdir().unwrap();
        let a = adapter(dir.path()).await;
        assert!(matches!(a.mknod("/x"), Err(FilerError::Unsupported(_))));
        assert!(matches!(a.link("/a", "/b"), Err(FilerError::Unsupported(_))));
        assert!(a.chown("/x", 0, 0).is_ok());
        assert!(a.getxattr("/x", "user.a").is_none());
        assert!(a.listxattr("/x").is_empty());
        assert_eq!(a.statfs().namelen, 255);
    }
}
