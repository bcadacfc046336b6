//! The native projection engine as seen from the provider.
//!
//! Capabilities are declared once by the engine and read at construction;
//! nothing probes for methods per call.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tracing::info;

use filer_core::DirectoryEntry;

/// How an engine can be told that a directory changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationCapability {
    /// Direct "re-enumerate this directory" call.
    InvalidateDirectory,
    /// Generic "data for this path is ready" notification.
    DataReady,
    None,
}

#[async_trait]
pub trait NativeEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn mount(&self, root: &Path) -> anyhow::Result<()>;

    async fn unmount(&self) -> anyhow::Result<()>;

    fn is_running(&self) -> bool;

    /// Engine-reported counters, merged into provider stats.
    fn stats(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn invalidation(&self) -> InvalidationCapability {
        InvalidationCapability::None
    }

    fn invalidate_directory(&self, _path: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn directory_data_ready(&self, _path: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Whether the `set_cached_*` hooks do anything.
    fn supports_cache_priming(&self) -> bool {
        false
    }

    fn set_cached_directory(&self, _path: &str, _entries: &[DirectoryEntry]) {}

    fn set_cached_content(&self, _path: &str, _content: &Bytes) {}

    fn complete_pending_file_requests(&self, _path: &str) {}
}

// ── In-process engine ─────────────────────────────────────────────────────

#[derive(Default)]
struct EngineState {
    root: Option<PathBuf>,
    directories: HashMap<String, Vec<DirectoryEntry>>,
    contents: HashMap<String, Bytes>,
    invalidated: Vec<String>,
    completed: Vec<String>,
}

/// Engine that keeps its "native" caches in process memory.
///
/// Used where no OS projection engine exists: callbacks are served through
/// [`crate::bridge::SyncProvider`] directly.
pub struct InProcessEngine {
    capability: InvalidationCapability,
    running: AtomicBool,
    state: Mutex<EngineState>,
}

#[derive(Debug, Clone, Serialize)]
struct InProcessStats {
    engine: &'static str,
    running: bool,
    cached_directories: usize,
    cached_contents: usize,
    invalidations: usize,
}

impl InProcessEngine {
    pub fn new(capability: InvalidationCapability) -> Self {
        InProcessEngine {
            capability,
            running: AtomicBool::new(false),
            state: Mutex::new(EngineState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root(&self) -> Option<PathBuf> {
        self.lock().root.clone()
    }

    pub fn cached_directory(&self, path: &str) -> Option<Vec<DirectoryEntry>> {
        self.lock().directories.get(path).cloned()
    }

    pub fn cached_content(&self, path: &str) -> Option<Bytes> {
        self.lock().contents.get(path).cloned()
    }

    /// Paths signalled through either invalidation capability, in order.
    pub fn invalidations(&self) -> Vec<String> {
        self.lock().invalidated.clone()
    }

    pub fn completed_requests(&self) -> Vec<String> {
        self.lock().completed.clone()
    }
}

impl Default for InProcessEngine {
    fn default() -> Self {
        Self::new(InvalidationCapability::InvalidateDirectory)
    }
}

#[async_trait]
impl NativeEngine for InProcessEngine {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn mount(&self, root: &Path) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.running.load(Ordering::SeqCst),
            "engine already mounted"
        );
        self.lock().root = Some(root.to_path_buf());
        self.running.store(true, Ordering::SeqCst);
        info!(root = %root.display(), "in-process engine mounted");
        Ok(())
    }

    async fn unmount(&self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.lock().root = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> serde_json::Value {
        let state = self.lock();
        serde_json::to_value(InProcessStats {
            engine: "in-process",
            running: self.is_running(),
            cached_directories: state.directories.len(),
            cached_contents: state.contents.len(),
            invalidations: state.invalidated.len(),
        })
        .unwrap_or(serde_json::Value::Null)
    }

    fn invalidation(&self) -> InvalidationCapability {
        self.capability
    }

    fn invalidate_directory(&self, path: &str) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.directories.remove(path);
        state.invalidated.push(path.to_string());
        Ok(())
    }

    fn directory_data_ready(&self, path: &str) -> anyhow::Result<()> {
        self.lock().invalidated.push(path.to_string());
        Ok(())
    }

    fn supports_cache_priming(&self) -> bool {
        true
    }

    fn set_cached_directory(&self, path: &str, entries: &[DirectoryEntry]) {
        self.lock()
            .directories
            .insert(path.to_string(), entries.to_vec());
    }

    fn set_cached_content(&self, path: &str, content: &Bytes) {
        self.lock()
            .contents
            .insert(path.to_string(), content.clone());
    }

    fn complete_pending_file_requests(&self, path: &str) {
        self.lock().completed.push(path.to_string());
    }
}
