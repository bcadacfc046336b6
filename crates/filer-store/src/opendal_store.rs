//! [`ContentStore`] over an OpenDAL operator.
//!
//! ## Object layout
//!
//! ```text
//! blobs/{hash[0..2]}/{hash}        → raw content, addressed by SHA-256
//! tree/{path}                      → node record (file or symlink)
//! tree/{path}/.filer-dir           → node record (directory)
//! ```
//!
//! A directory exists when it has a marker or any object below it, so
//! backends without native directories (S3, memory) behave like local disk.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use opendal::{ErrorKind, Operator, Writer};
use tokio::io::AsyncReadExt;
use tracing::debug;

use filer_core::context::now_millis;
use filer_core::hash::{hash_bytes, is_content_hash};
use filer_core::path::split_parent;
use filer_core::types::{DEFAULT_FILE_MODE, S_IFMT, S_IFREG};
use filer_core::{FileStat, FilerError, FilerResult};

use crate::node::{NodeKind, NodeRecord, DIR_MARKER};
use crate::store::ContentStore;

const TREE_PREFIX: &str = "tree";
const BLOB_PREFIX: &str = "blobs";

/// Symlink hops followed by `read_file` before giving up.
const MAX_LINK_HOPS: usize = 8;

/// Read size when streaming a local file into a blob.
const BLOB_CHUNK_SIZE: usize = 1024 * 1024;

fn store_err(e: opendal::Error, path: &str) -> FilerError {
    match e.kind() {
        ErrorKind::NotFound => FilerError::NotFound(path.to_string()),
        ErrorKind::IsADirectory => FilerError::IsDirectory(path.to_string()),
        ErrorKind::NotADirectory => FilerError::NotDirectory(path.to_string()),
        ErrorKind::AlreadyExists => FilerError::AlreadyExists(path.to_string()),
        _ => FilerError::Io(format!("{path}: {e}")),
    }
}

fn rel(path: &str) -> &str {
    path.trim_matches('/')
}

fn node_key(path: &str) -> String {
    format!("{TREE_PREFIX}/{}", rel(path))
}

fn dir_key(path: &str) -> String {
    match rel(path) {
        "" => format!("{TREE_PREFIX}/"),
        r => format!("{TREE_PREFIX}/{r}/"),
    }
}

fn marker_key(path: &str) -> String {
    format!("{}{DIR_MARKER}", dir_key(path))
}

fn blob_key(hash: &str) -> String {
    let shard = if hash.len() >= 2 { &hash[..2] } else { "xx" };
    format!("{BLOB_PREFIX}/{shard}/{hash}")
}

fn validate_name(name: &str) -> FilerResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FilerError::InvalidState(format!("invalid file name: {name:?}")));
    }
    Ok(())
}

fn join(parent: &str, name: &str) -> String {
    filer_core::path::join_child(parent, name)
}

#[derive(Debug)]
pub struct OpendalStore {
    op: Operator,
}

impl OpendalStore {
    pub fn new(op: Operator) -> Self {
        OpendalStore { op }
    }

    /// In-process store backed by OpenDAL's memory service.
    pub fn memory() -> FilerResult<Self> {
        let op = Operator::new(opendal::services::Memory::default())
            .map_err(|e| FilerError::Io(format!("creating memory operator: {e}")))?
            .finish();
        Ok(Self::new(op))
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    async fn read_record(&self, key: &str, path: &str) -> FilerResult<NodeRecord> {
        let buf = self.op.read(key).await.map_err(|e| store_err(e, path))?;
        let text = String::from_utf8(buf.to_vec())
            .map_err(|_| FilerError::Io(format!("{path}: node record is not UTF-8")))?;
        NodeRecord::parse(&text)
            .map_err(|e| FilerError::Io(format!("{path}: corrupt node record: {e}")))
    }

    async fn write_record(&self, key: &str, path: &str, record: &NodeRecord) -> FilerResult<()> {
        self.op
            .write(key, record.to_record_string().into_bytes())
            .await
            .map_err(|e| store_err(e, path))?;
        Ok(())
    }

    /// Raw children keys of a directory, excluding the directory itself.
    async fn list_children(&self, path: &str) -> FilerResult<Vec<opendal::Entry>> {
        let key = dir_key(path);
        let entries = self.op.list(&key).await.map_err(|e| store_err(e, path))?;
        Ok(entries.into_iter().filter(|e| e.path() != key).collect())
    }

    async fn load_node(&self, path: &str) -> FilerResult<NodeRecord> {
        if let Ok(record) = self.read_record(&marker_key(path), path).await {
            return Ok(record);
        }
        if rel(path).is_empty() {
            return Ok(NodeRecord::implicit_dir());
        }

        match self.read_record(&node_key(path), path).await {
            Ok(record) => return Ok(record),
            Err(FilerError::IsDirectory(_)) => return Ok(NodeRecord::implicit_dir()),
            Err(FilerError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        match self.list_children(path).await {
            Ok(children) if !children.is_empty() => Ok(NodeRecord::implicit_dir()),
            _ => Err(FilerError::NotFound(path.to_string())),
        }
    }

    async fn require_dir(&self, path: &str) -> FilerResult<NodeRecord> {
        let node = self.load_node(path).await?;
        if node.kind != NodeKind::Dir {
            return Err(FilerError::NotDirectory(path.to_string()));
        }
        Ok(node)
    }

    /// Follow symlinks until a regular file record is reached.
    async fn resolve_file(&self, path: &str) -> FilerResult<NodeRecord> {
        let mut current = path.to_string();
        for _ in 0..MAX_LINK_HOPS {
            let node = self.load_node(&current).await?;
            match node.kind {
                NodeKind::File => return Ok(node),
                NodeKind::Dir => return Err(FilerError::IsDirectory(current)),
                NodeKind::Symlink => {
                    let target = node.target.unwrap_or_default();
                    current = if target.starts_with('/') {
                        target
                    } else {
                        join(&split_parent(&current).0, &target)
                    };
                }
            }
        }
        Err(FilerError::Io(format!("{path}: too many levels of symbolic links")))
    }

    async fn delete_tree(&self, path: &str) -> FilerResult<()> {
        let key = dir_key(path);
        let entries = self
            .op
            .list_with(&key)
            .recursive(true)
            .await
            .map_err(|e| store_err(e, path))?;

        let mut dirs = Vec::new();
        for entry in entries {
            if entry.metadata().mode().is_dir() {
                dirs.push(entry.path().to_string());
            } else {
                self.op
                    .delete(entry.path())
                    .await
                    .map_err(|e| store_err(e, path))?;
            }
        }
        dirs.sort_by_key(|d| std::cmp::Reverse(d.len()));
        for d in dirs.iter().filter(|d| **d != key) {
            self.op.delete(d).await.map_err(|e| store_err(e, path))?;
        }
        self.op.delete(&key).await.map_err(|e| store_err(e, path))?;
        Ok(())
    }

    /// Store `content` under its hash and link it at `path`.
    pub async fn put_file(&self, path: &str, content: impl Into<Bytes>) -> FilerResult<String> {
        let content = content.into();
        let hash = hash_bytes(&content);
        let (parent, name) = split_parent(path);
        self.put_blob(&hash, content).await?;
        self.create_file(&parent, &hash, &name, DEFAULT_FILE_MODE)
            .await?;
        Ok(hash)
    }

    /// Create `path` and any missing ancestors.
    pub async fn create_dir_all(&self, path: &str, mode: u32) -> FilerResult<()> {
        let mut current = String::from("/");
        for part in rel(path).split('/').filter(|p| !p.is_empty()) {
            current = join(&current, part);
            match self.create_dir(&current, mode).await {
                Ok(()) | Err(FilerError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for OpendalStore {
    async fn read_dir(&self, path: &str) -> FilerResult<Vec<String>> {
        self.require_dir(path).await?;
        let mut names: Vec<String> = self
            .list_children(path)
            .await?
            .iter()
            .map(|e| e.name().trim_end_matches('/').to_string())
            .filter(|n| !n.is_empty() && n != DIR_MARKER)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn stat(&self, path: &str) -> FilerResult<FileStat> {
        Ok(self.load_node(path).await?.to_stat())
    }

    async fn read_file(&self, path: &str) -> FilerResult<Bytes> {
        let node = self.resolve_file(path).await?;
        let buf = self
            .op
            .read(&blob_key(&node.hash))
            .await
            .map_err(|e| store_err(e, path))?;
        Ok(buf.to_bytes())
    }

    async fn read_file_chunk(&self, path: &str, length: u64, offset: u64) -> FilerResult<Bytes> {
        let node = self.resolve_file(path).await?;
        if offset >= node.size || length == 0 {
            return Ok(Bytes::new());
        }
        let end = offset.saturating_add(length).min(node.size);
        let buf = self
            .op
            .read_with(&blob_key(&node.hash))
            .range(offset..end)
            .await
            .map_err(|e| store_err(e, path))?;
        Ok(buf.to_bytes())
    }

    fn supports_chunked_reading(&self) -> bool {
        true
    }

    async fn put_blob(&self, hash: &str, content: Bytes) -> FilerResult<()> {
        if !is_content_hash(hash) {
            return Err(FilerError::InvalidState(format!("not a content hash: {hash}")));
        }
        debug!(hash = %hash, bytes = content.len(), "storing blob");
        self.op
            .write(&blob_key(hash), content)
            .await
            .map_err(|e| store_err(e, hash))?;
        Ok(())
    }

    async fn put_blob_from(&self, hash: &str, file: &Path) -> FilerResult<u64> {
        if !is_content_hash(hash) {
            return Err(FilerError::InvalidState(format!("not a content hash: {hash}")));
        }
        let mut src = tokio::fs::File::open(file).await?;
        let mut writer = self
            .op
            .writer(&blob_key(hash))
            .await
            .map_err(|e| store_err(e, hash))?;

        match copy_into(&mut src, &mut writer).await {
            Ok(total) => {
                writer.close().await.map_err(|e| store_err(e, hash))?;
                debug!(hash = %hash, bytes = total, "streamed blob");
                Ok(total)
            }
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    debug!(hash = %hash, error = %abort, "blob writer abort failed");
                }
                Err(e)
            }
        }
    }

    async fn create_file(
        &self,
        parent: &str,
        hash: &str,
        name: &str,
        mode: u32,
    ) -> FilerResult<()> {
        validate_name(name)?;
        self.require_dir(parent).await?;
        let path = join(parent, name);

        match self.load_node(&path).await {
            Ok(existing) if existing.kind == NodeKind::Dir => {
                return Err(FilerError::IsDirectory(path));
            }
            Ok(_) | Err(FilerError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let size = match self.op.stat(&blob_key(hash)).await {
            Ok(meta) => meta.content_length(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FilerError::InvalidState(format!(
                    "blob {hash} not found for {path}"
                )));
            }
            Err(e) => return Err(store_err(e, &path)),
        };

        let mode = if mode & S_IFMT == 0 { mode | S_IFREG } else { mode };
        let record = NodeRecord::file(hash, size, mode, now_millis());
        debug!(path = %path, hash = %hash, size, "linking file");
        self.write_record(&node_key(&path), &path, &record).await
    }

    async fn create_dir(&self, path: &str, mode: u32) -> FilerResult<()> {
        let (parent, name) = split_parent(path);
        validate_name(&name)?;
        self.require_dir(&parent).await?;
        match self.load_node(path).await {
            Ok(_) => return Err(FilerError::AlreadyExists(path.to_string())),
            Err(FilerError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        debug!(path = %path, mode = format_args!("{mode:o}"), "creating directory");
        self.write_record(&marker_key(path), path, &NodeRecord::dir(mode, now_millis()))
            .await
    }

    async fn unlink(&self, path: &str) -> FilerResult<()> {
        let node = self.load_node(path).await?;
        if node.kind == NodeKind::Dir {
            return Err(FilerError::IsDirectory(path.to_string()));
        }
        debug!(path = %path, "unlink");
        self.op
            .delete(&node_key(path))
            .await
            .map_err(|e| store_err(e, path))
    }

    async fn rename(&self, src: &str, dst: &str) -> FilerResult<()> {
        if src == dst {
            return Ok(());
        }
        if dst.starts_with(&dir_key(src)[TREE_PREFIX.len()..]) {
            return Err(FilerError::InvalidState(format!(
                "cannot move {src} into itself ({dst})"
            )));
        }
        let node = self.load_node(src).await?;
        let (dst_parent, dst_name) = split_parent(dst);
        validate_name(&dst_name)?;
        self.require_dir(&dst_parent).await?;

        match self.load_node(dst).await {
            Ok(existing) => match (node.kind, existing.kind) {
                (NodeKind::Dir, NodeKind::Dir) => {
                    if !self.read_dir(dst).await?.is_empty() {
                        return Err(FilerError::NotEmpty(dst.to_string()));
                    }
                    self.delete_tree(dst).await?;
                }
                (NodeKind::Dir, _) => return Err(FilerError::NotDirectory(dst.to_string())),
                (_, NodeKind::Dir) => return Err(FilerError::IsDirectory(dst.to_string())),
                _ => {}
            },
            Err(FilerError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        debug!(src = %src, dst = %dst, "rename");
        if node.kind != NodeKind::Dir {
            self.write_record(&node_key(dst), dst, &node).await?;
            return self
                .op
                .delete(&node_key(src))
                .await
                .map_err(|e| store_err(e, src));
        }

        let src_key = dir_key(src);
        let dst_key = dir_key(dst);
        let entries = self
            .op
            .list_with(&src_key)
            .recursive(true)
            .await
            .map_err(|e| store_err(e, src))?;
        let mut copied = 0usize;
        for entry in entries.iter().filter(|e| !e.metadata().mode().is_dir()) {
            let Some(suffix) = entry.path().strip_prefix(src_key.as_str()) else {
                continue;
            };
            let data = self
                .op
                .read(entry.path())
                .await
                .map_err(|e| store_err(e, src))?;
            self.op
                .write(&format!("{dst_key}{suffix}"), data)
                .await
                .map_err(|e| store_err(e, dst))?;
            copied += 1;
        }
        if copied == 0 {
            self.write_record(&marker_key(dst), dst, &node).await?;
        }
        self.delete_tree(src).await
    }

    async fn rmdir(&self, path: &str) -> FilerResult<()> {
        if rel(path).is_empty() {
            return Err(FilerError::InvalidState("cannot remove the root".into()));
        }
        self.require_dir(path).await?;
        if !self.read_dir(path).await?.is_empty() {
            return Err(FilerError::NotEmpty(path.to_string()));
        }
        debug!(path = %path, "rmdir");
        self.delete_tree(path).await
    }

    async fn chmod(&self, path: &str, mode: u32) -> FilerResult<()> {
        let mut node = self.load_node(path).await?;
        node.mode = (node.mode & S_IFMT) | (mode & !S_IFMT);
        let key = match node.kind {
            NodeKind::Dir => marker_key(path),
            _ => node_key(path),
        };
        self.write_record(&key, path, &node).await
    }

    async fn symlink(&self, target: &str, link_path: &str) -> FilerResult<()> {
        let (parent, name) = split_parent(link_path);
        validate_name(&name)?;
        self.require_dir(&parent).await?;
        match self.load_node(link_path).await {
            Ok(_) => return Err(FilerError::AlreadyExists(link_path.to_string())),
            Err(FilerError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let record = NodeRecord::symlink(target, now_millis());
        self.write_record(&node_key(link_path), link_path, &record)
            .await
    }

    async fn readlink(&self, path: &str) -> FilerResult<Bytes> {
        let node = self.load_node(path).await?;
        match (node.kind, node.target) {
            (NodeKind::Symlink, Some(target)) => Ok(Bytes::from(target)),
            _ => Err(FilerError::InvalidState(format!("{path} is not a symlink"))),
        }
    }
}

async fn copy_into(src: &mut tokio::fs::File, writer: &mut Writer) -> FilerResult<u64> {
    let mut total = 0u64;
    loop {
        let mut buf = vec![0u8; BLOB_CHUNK_SIZE];
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        buf.truncate(n);
        writer
            .write(buf)
            .await
            .map_err(|e| FilerError::Io(format!("blob write: {e}")))?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(node_key("/chats/a"), "tree/chats/a");
        assert_eq!(dir_key("/"), "tree/");
        assert_eq!(dir_key("/chats"), "tree/chats/");
        assert_eq!(marker_key("/chats"), "tree/chats/.filer-dir");
        assert_eq!(blob_key("abcdef"), "blobs/ab/abcdef");
    }

    #[test]
    fn names_are_validated() {
        assert!(validate_name("ok.txt").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
    }
}
