//! Call counters around any [`ContentStore`].

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use filer_core::{FileStat, FilerResult};

use crate::store::ContentStore;

#[derive(Debug, Default)]
struct Counters {
    read_dir: AtomicU64,
    stat: AtomicU64,
    read_file: AtomicU64,
    read_chunk: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounters {
    pub read_dir: u64,
    pub stat: u64,
    pub read_file: u64,
    pub read_chunk: u64,
    pub writes: u64,
    pub errors: u64,
}

/// Wraps a store and counts every call by kind, plus failures.
#[derive(Debug)]
pub struct MeteredStore<S> {
    inner: S,
    counters: Arc<Counters>,
}

impl<S: ContentStore> MeteredStore<S> {
    pub fn new(inner: S) -> Self {
        MeteredStore {
            inner,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn counters(&self) -> StoreCounters {
        let c = &self.counters;
        StoreCounters {
            read_dir: c.read_dir.load(Ordering::Relaxed),
            stat: c.stat.load(Ordering::Relaxed),
            read_file: c.read_file.load(Ordering::Relaxed),
            read_chunk: c.read_chunk.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
        }
    }

    fn count<T>(&self, counter: &AtomicU64, result: FilerResult<T>) -> FilerResult<T> {
        counter.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

#[async_trait]
impl<S: ContentStore> ContentStore for MeteredStore<S> {
    async fn read_dir(&self, path: &str) -> FilerResult<Vec<String>> {
        let r = self.inner.read_dir(path).await;
        self.count(&self.counters.read_dir, r)
    }

    async fn stat(&self, path: &str) -> FilerResult<FileStat> {
        let r = self.inner.stat(path).await;
        self.count(&self.counters.stat, r)
    }

    async fn read_file(&self, path: &str) -> FilerResult<Bytes> {
        let r = self.inner.read_file(path).await;
        self.count(&self.counters.read_file, r)
    }

    async fn read_file_chunk(&self, path: &str, length: u64, offset: u64) -> FilerResult<Bytes> {
        let r = self.inner.read_file_chunk(path, length, offset).await;
        self.count(&self.counters.read_chunk, r)
    }

    fn supports_chunked_reading(&self) -> bool {
        self.inner.supports_chunked_reading()
    }

    async fn put_blob(&self, hash: &str, content: Bytes) -> FilerResult<()> {
        let r = self.inner.put_blob(hash, content).await;
        self.count(&self.counters.writes, r)
    }

    async fn put_blob_from(&self, hash: &str, file: &Path) -> FilerResult<u64> {
        let r = self.inner.put_blob_from(hash, file).await;
        self.count(&self.counters.writes, r)
    }

    async fn create_file(
        &self,
        parent: &str,
        hash: &str,
        name: &str,
        mode: u32,
    ) -> FilerResult<()> {
        let r = self.inner.create_file(parent, hash, name, mode).await;
        self.count(&self.counters.writes, r)
    }

    async fn create_dir(&self, path: &str, mode: u32) -> FilerResult<()> {
        let r = self.inner.create_dir(path, mode).await;
        self.count(&self.counters.writes, r)
    }

    async fn unlink(&self, path: &str) -> FilerResult<()> {
        let r = self.inner.unlink(path).await;
        self.count(&self.counters.writes, r)
    }

    async fn rename(&self, src: &str, dst: &str) -> FilerResult<()> {
        let r = self.inner.rename(src, dst).await;
        self.count(&self.counters.writes, r)
    }

    async fn rmdir(&self, path: &str) -> FilerResult<()> {
        let r = self.inner.rmdir(path).await;
        self.count(&self.counters.writes, r)
    }

    async fn chmod(&self, path: &str, mode: u32) -> FilerResult<()> {
        let r = self.inner.chmod(path, mode).await;
        self.count(&self.counters.writes, r)
    }

    async fn symlink(&self, target: &str, link_path: &str) -> FilerResult<()> {
        let r = self.inner.symlink(target, link_path).await;
        self.count(&self.counters.writes, r)
    }

    async fn readlink(&self, path: &str) -> FilerResult<Bytes> {
        let r = self.inner.readlink(path).await;
        self.count(&self.counters.stat, r)
    }
}
