//! In-memory directory listing cache with per-entry TTL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use filer_core::DirectoryEntry;

use crate::policy::TtlPolicy;

pub type Listing = Arc<Vec<DirectoryEntry>>;

/// A cached value plus the bookkeeping needed to expire it.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub inserted_at: Instant,
    pub ttl: Duration,
    pub hit_count: u64,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, ttl: Duration) -> Self {
        CacheEntry {
            data,
            inserted_at: Instant::now(),
            ttl,
            hit_count: 0,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.inserted_at.elapsed() < self.ttl
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    pub(crate) fn compute(entries: usize, hits: u64, misses: u64) -> Self {
        let total = hits + misses;
        CacheStats {
            entries,
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

/// Path → listing. The root listing is never evicted, only replaced.
pub struct DirectoryCache {
    entries: Mutex<HashMap<String, CacheEntry<Listing>>>,
    policy: TtlPolicy,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DirectoryCache {
    pub fn new(policy: TtlPolicy) -> Self {
        DirectoryCache {
            entries: Mutex::new(HashMap::new()),
            policy,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<Listing>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    /// Fresh listing for `path`, counting a hit or a miss.
    pub fn get(&self, path: &str) -> Option<Listing> {
        let mut entries = self.lock();
        match entries.get_mut(path) {
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

    /// Listing for `path` regardless of age. Does not touch the counters.
    pub fn get_stale(&self, path: &str) -> Option<Listing> {
        self.lock().get(path).map(|e| e.data.clone())
    }

    pub fn contains_fresh(&self, path: &str) -> bool {
        self.lock().get(path).is_some_and(CacheEntry::is_fresh)
    }

    /// Store a listing with the TTL the policy assigns to `path`.
    pub fn put(&self, path: &str, entries: Vec<DirectoryEntry>) -> Listing {
        let ttl = self.policy.ttl_for(path, &entries);
        self.put_with_ttl(path, entries, ttl)
    }

    pub fn put_with_ttl(&self, path: &str, entries: Vec<DirectoryEntry>, ttl: Duration) -> Listing {
        let listing: Listing = Arc::new(entries);
        self.lock()
            .insert(path.to_string(), CacheEntry::new(listing.clone(), ttl));
        listing
    }

    pub fn invalidate(&self, path: &str) -> bool {
        self.lock().remove(path).is_some()
    }

    /// Drop expired listings; returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|path, entry| path == "/" || entry.is_fresh());
        before - entries.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats::compute(
            self.len(),
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl Default for DirectoryCache {
    fn default() -> Self {
        Self::new(TtlPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(names: &[&str]) -> Vec<DirectoryEntry> {
        names.iter().map(|n| DirectoryEntry::directory(*n)).collect()
    }

    #[test]
    fn get_counts_hits_and_misses() {
        let cache = DirectoryCache::default();
        assert!(cache.get("/objects").is_none());
        cache.put("/objects", listing(&["a", "b"]));
        assert_eq!(cache.get("/objects").unwrap().len(), 2);
        assert_eq!(cache.get("/objects").unwrap().len(), 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn expired_entries_are_misses_but_still_stale_readable() {
        let cache = DirectoryCache::default();
        cache.put_with_ttl("/debug", listing(&["x"]), Duration::ZERO);
        assert!(cache.get("/debug").is_none());
        assert!(!cache.contains_fresh("/debug"));
        assert_eq!(cache.get_stale("/debug").unwrap()[0].name, "x");
    }

    #[test]
    fn eviction_keeps_root() {
        let cache = DirectoryCache::default();
        cache.put_with_ttl("/", listing(&["chats"]), Duration::ZERO);
        cache.put_with_ttl("/debug", listing(&["x"]), Duration::ZERO);
        cache.put("/objects", listing(&["y"]));

        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 2);
        assert!(cache.get_stale("/").is_some());
        assert!(cache.get_stale("/debug").is_none());
        assert!(cache.get("/objects").is_some());
    }

    #[test]
    fn invalidate_removes() {
        let cache = DirectoryCache::default();
        cache.put("/types", listing(&["Person"]));
        assert!(cache.invalidate("/types"));
        assert!(!cache.invalidate("/types"));
        assert!(cache.is_empty());
    }
}
