//! Turn a store `read_dir` + per-child `stat` into presentable entries.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::debug;

use filer_core::path::join_child;
use filer_core::types::{is_dir_mode, DEFAULT_DIR_MODE};
use filer_core::{DirectoryEntry, FilerResult, SourceTree};
use filer_store::ContentStore;

/// Concurrent `stat` calls per listing.
pub const STAT_CONCURRENCY: usize = 16;

/// Shared by enumeration and prefetch so both see the same entries.
#[derive(Clone)]
pub struct DirectoryResolver {
    store: Arc<dyn ContentStore>,
    structural: Arc<Vec<String>>,
}

impl DirectoryResolver {
    pub fn new(store: Arc<dyn ContentStore>, structural: Vec<String>) -> Self {
        DirectoryResolver {
            store,
            structural: Arc::new(structural),
        }
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn structural_dirs(&self) -> &[String] {
        &self.structural
    }

    pub fn is_structural(&self, parent: &str, name: &str) -> bool {
        parent == "/" && self.structural.iter().any(|s| s == name)
    }

    /// The synthesized root listing: one directory per structural name.
    pub fn seed_root(&self) -> Vec<DirectoryEntry> {
        self.structural
            .iter()
            .map(|name| {
                DirectoryEntry::directory(name.as_str())
                    .with_tree(SourceTree::of(&join_child("/", name)))
            })
            .collect()
    }

    /// List `path`, stat every child, and build entries in store order.
    ///
    /// A child whose stat fails becomes a size-0 file, except structural
    /// root directories which are always directories. The root listing is
    /// padded with any structural name the store did not return.
    pub async fn resolve(
        &self,
        path: &str,
        request_id: Option<&str>,
    ) -> FilerResult<Vec<DirectoryEntry>> {
        let names = self.store.read_dir(path).await?;

        let mut entries: Vec<DirectoryEntry> = stream::iter(names)
            .map(|name| self.resolve_child(path, name, request_id))
            .buffered(STAT_CONCURRENCY)
            .collect()
            .await;

        if path == "/" {
            for seed in self.seed_root() {
                if !entries.iter().any(|e| e.name == seed.name) {
                    entries.push(seed);
                }
            }
        }
        Ok(entries)
    }

    async fn resolve_child(
        &self,
        parent: &str,
        name: String,
        request_id: Option<&str>,
    ) -> DirectoryEntry {
        let child = join_child(parent, &name);
        let structural = self.is_structural(parent, &name);

        let mut entry = match self.store.stat(&child).await {
            Ok(stat) => DirectoryEntry::from_stat(name, &stat),
            Err(e) => {
                debug!(path = %child, error = %e, "stat failed, using placeholder");
                let placeholder = if structural {
                    DirectoryEntry::directory(name)
                } else {
                    DirectoryEntry::unknown_file(name)
                };
                placeholder.with_meta("stat_error", e.to_string())
            }
        };

        if structural && !entry.is_directory {
            entry.is_directory = true;
            entry.size = 0;
            entry.content_type = None;
            if !is_dir_mode(entry.mode) {
                entry.mode = DEFAULT_DIR_MODE;
            }
        }

        entry.source_tree = Some(SourceTree::of(&child));
        if let Some(id) = request_id {
            entry.metadata.insert("request_id".into(), id.to_string());
        }
        entry
    }
}
