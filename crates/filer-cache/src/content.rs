//! In-memory file content cache, bounded by total bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::Serialize;

use crate::directory::{CacheEntry, CacheStats};
use crate::policy::TtlPolicy;

/// Path → file bytes, bounded by total size. Oldest insertions go first.
pub struct ContentCache {
    state: Mutex<ContentState>,
    policy: TtlPolicy,
    max_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Default)]
struct ContentState {
    files: HashMap<String, CacheEntry<Bytes>>,
    total_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ContentStats {
    #[serde(flatten)]
    pub cache: CacheStats,
    pub total_bytes: u64,
    pub max_bytes: u64,
}

impl ContentCache {
    pub fn new(policy: TtlPolicy, max_bytes: u64) -> Self {
        ContentCache {
            state: Mutex::new(ContentState::default()),
            policy,
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ContentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        let mut state = self.lock();
        match state.files.get_mut(path) {
            Some(entry) if entry.is_fresh() => {
                entry.hit_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.data.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert file bytes. Returns false when the file alone exceeds the cap.
    pub fn put(&self, path: &str, data: Bytes) -> bool {
        let size = data.len() as u64;
        if size > self.max_bytes {
            return false;
        }
        let ttl = self.policy.ttl_for(path, &[]);
        let mut state = self.lock();
        if let Some(old) = state.files.remove(path) {
            state.total_bytes -= old.data.len() as u64;
        }
        while state.total_bytes + size > self.max_bytes {
            let oldest = state
                .files
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(p, _)| p.clone());
            let Some(oldest) = oldest else { break };
            if let Some(evicted) = state.files.remove(&oldest) {
                state.total_bytes -= evicted.data.len() as u64;
            }
        }
        state.total_bytes += size;
        state
            .files
            .insert(path.to_string(), CacheEntry::new(data, ttl));
        true
    }

    pub fn invalidate(&self, path: &str) -> bool {
        let mut state = self.lock();
        match state.files.remove(path) {
            Some(old) => {
                state.total_bytes -= old.data.len() as u64;
                true
            }
            None => false,
        }
    }

    pub fn evict_expired(&self) -> usize {
        let mut state = self.lock();
        let expired: Vec<String> = state
            .files
            .iter()
            .filter(|(_, e)| !e.is_fresh())
            .map(|(p, _)| p.clone())
            .collect();
        for path in &expired {
            if let Some(old) = state.files.remove(path) {
                state.total_bytes -= old.data.len() as u64;
            }
        }
        expired.len()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.files.clear();
        state.total_bytes = 0;
    }

    pub fn stats(&self) -> ContentStats {
        let state = self.lock();
        ContentStats {
            cache: CacheStats::compute(
                state.files.len(),
                self.hits.load(Ordering::Relaxed),
                self.misses.load(Ordering::Relaxed),
            ),
            total_bytes: state.total_bytes,
            max_bytes: self.max_bytes,
        }
    }
}
