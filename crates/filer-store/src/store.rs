//! The async content store contract the bridge is built on.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use filer_core::{FileStat, FilerResult};

/// Async file-tree access to a content-addressed backing store.
///
/// Paths are normalized virtual paths (`/`, `/chats/a`). File content is
/// committed in two steps: the bytes go in under their hash with
/// [`put_blob`](ContentStore::put_blob), then
/// [`create_file`](ContentStore::create_file) links a name to that hash.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Names of the children of a directory.
    async fn read_dir(&self, path: &str) -> FilerResult<Vec<String>>;

    async fn stat(&self, path: &str) -> FilerResult<FileStat>;

    async fn read_file(&self, path: &str) -> FilerResult<Bytes>;

    /// Up to `length` bytes starting at `offset`. Reading past the end
    /// yields fewer bytes, or none.
    async fn read_file_chunk(&self, path: &str, length: u64, offset: u64) -> FilerResult<Bytes> {
        let content = self.read_file(path).await?;
        let start = (offset as usize).min(content.len());
        let end = start.saturating_add(length as usize).min(content.len());
        Ok(content.slice(start..end))
    }

    /// Whether `read_file_chunk` avoids fetching the whole object.
    fn supports_chunked_reading(&self) -> bool {
        false
    }

    async fn put_blob(&self, hash: &str, content: Bytes) -> FilerResult<()>;

    /// Store the contents of a local file as the blob `hash`, returning the
    /// byte count. Stores that can stream should override this; the
    /// fallback reads the whole file.
    async fn put_blob_from(&self, hash: &str, file: &Path) -> FilerResult<u64> {
        let content = tokio::fs::read(file).await?;
        let len = content.len() as u64;
        self.put_blob(hash, Bytes::from(content)).await?;
        Ok(len)
    }

    async fn create_file(
        &self,
        parent: &str,
        hash: &str,
        name: &str,
        mode: u32,
    ) -> FilerResult<()>;

    async fn create_dir(&self, path: &str, mode: u32) -> FilerResult<()>;

    async fn unlink(&self, path: &str) -> FilerResult<()>;

    async fn rename(&self, src: &str, dst: &str) -> FilerResult<()>;

    async fn rmdir(&self, path: &str) -> FilerResult<()>;

    async fn chmod(&self, path: &str, mode: u32) -> FilerResult<()>;

    async fn symlink(&self, target: &str, link_path: &str) -> FilerResult<()>;

    async fn readlink(&self, path: &str) -> FilerResult<Bytes>;
}
