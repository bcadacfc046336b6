//! Cache lifetime and admission rules per source tree.
//!
//! | tree    | TTL                                   | priority | content cached            |
//! |---------|---------------------------------------|----------|---------------------------|
//! | chat    | 5 min if changed in last hour, else 1 | high     | recent (7d) or < 1 MiB    |
//! | objects | 30 min (immutable)                    | normal   | text/image/json/xml < 5 MiB |
//! | debug   | 5 s                                   | low      | never                     |
//! | invites | 5 min                                 | normal   | < 1 MiB                   |
//! | types   | 1 h                                   | low      | < 10 MiB                  |
//! | root    | 1 min                                 | high     | never                     |

use std::time::Duration;

use filer_core::config::CacheConfig;
use filer_core::context::now_millis;
use filer_core::types::{DirectoryEntry, Priority, SourceTree};

const HOUR_MS: u64 = 60 * 60 * 1000;
const WEEK_MS: u64 = 7 * 24 * HOUR_MS;
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TtlPolicy {
    chat_recent: Duration,
    chat: Duration,
    objects: Duration,
    debug: Duration,
    invites: Duration,
    types: Duration,
    root: Duration,
    default: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl TtlPolicy {
    pub fn from_config(cfg: &CacheConfig) -> Self {
        TtlPolicy {
            chat_recent: Duration::from_secs(cfg.chat_recent_ttl_secs),
            chat: Duration::from_secs(cfg.chat_ttl_secs),
            objects: Duration::from_secs(cfg.objects_ttl_secs),
            debug: Duration::from_secs(cfg.debug_ttl_secs),
            invites: Duration::from_secs(cfg.invites_ttl_secs),
            types: Duration::from_secs(cfg.types_ttl_secs),
            root: Duration::from_secs(cfg.root_ttl_secs),
            default: Duration::from_secs(cfg.default_ttl_secs),
        }
    }

    /// TTL for a directory listing, using the newest child mtime for chat.
    pub fn ttl_for(&self, path: &str, entries: &[DirectoryEntry]) -> Duration {
        let newest = entries.iter().filter_map(|e| e.mtime).max();
        self.ttl_for_tree(SourceTree::of(path), newest)
    }

    pub fn ttl_for_tree(&self, tree: SourceTree, newest_mtime: Option<u64>) -> Duration {
        match tree {
            SourceTree::Chat => match newest_mtime {
                Some(mtime) if now_millis().saturating_sub(mtime) < HOUR_MS => self.chat_recent,
                _ => self.chat,
            },
            SourceTree::Objects => self.objects,
            SourceTree::Debug => self.debug,
            SourceTree::Invites => self.invites,
            SourceTree::Types => self.types,
            SourceTree::Root => self.root,
        }
    }

    /// TTL for anything the tree table does not cover.
    pub fn default_ttl(&self) -> Duration {
        self.default
    }

    pub fn priority_for(&self, path: &str) -> Priority {
        match SourceTree::of(path) {
            SourceTree::Chat | SourceTree::Root => Priority::High,
            SourceTree::Debug | SourceTree::Types => Priority::Low,
            SourceTree::Objects | SourceTree::Invites => Priority::Normal,
        }
    }

    pub fn max_content_size(&self, path: &str) -> u64 {
        match SourceTree::of(path) {
            SourceTree::Chat => 50 * MIB,
            SourceTree::Objects => 5 * MIB,
            SourceTree::Debug | SourceTree::Invites => MIB,
            SourceTree::Types => 10 * MIB,
            SourceTree::Root => 0,
        }
    }

    /// Whether a file's bytes should be kept in the content cache.
    pub fn should_cache_content(&self, path: &str, entry: &DirectoryEntry) -> bool {
        if entry.is_directory {
            return false;
        }
        match SourceTree::of(path) {
            SourceTree::Chat => {
                let recent = entry
                    .mtime
                    .map(|m| now_millis().saturating_sub(m) < WEEK_MS)
                    .unwrap_or(false);
                recent || entry.size < MIB
            }
            SourceTree::Objects => {
                let cacheable = entry.content_type.as_deref().is_some_and(|ct| {
                    ct.starts_with("image/")
                        || ct.starts_with("text/")
                        || ct == "application/json"
                        || ct == "application/xml"
                });
                cacheable && entry.size < self.max_content_size(path)
            }
            SourceTree::Debug | SourceTree::Root => false,
            SourceTree::Invites | SourceTree::Types => entry.size < self.max_content_size(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filer_core::types::FileStat;
    use proptest::prelude::*;

    fn file(name: &str, size: u64, mtime: Option<u64>) -> DirectoryEntry {
        let stat = FileStat {
            size,
            mode: 0o100644,
            mtime,
            ..Default::default()
        };
        DirectoryEntry::from_stat(name, &stat)
    }

    #[test]
    fn ttl_table() {
        let p = TtlPolicy::default();
        assert_eq!(p.ttl_for("/objects/ab", &[]), Duration::from_secs(1800));
        assert_eq!(p.ttl_for("/debug", &[]), Duration::from_secs(5));
        assert_eq!(p.ttl_for("/invites/x", &[]), Duration::from_secs(300));
        assert_eq!(p.ttl_for("/types", &[]), Duration::from_secs(3600));
        assert_eq!(p.ttl_for("/", &[]), Duration::from_secs(60));
        assert_eq!(p.default_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn chat_ttl_depends_on_recent_activity() {
        let p = TtlPolicy::default();
        let fresh = [file("m1", 10, Some(now_millis() - 1000))];
        let stale = [file("m1", 10, Some(now_millis() - 2 * HOUR_MS))];
        assert_eq!(p.ttl_for("/chats/room", &fresh), Duration::from_secs(300));
        assert_eq!(p.ttl_for("/chats/room", &stale), Duration::from_secs(60));
        assert_eq!(p.ttl_for("/chats/room", &[]), Duration::from_secs(60));
    }

    #[test]
    fn priorities() {
        let p = TtlPolicy::default();
        assert_eq!(p.priority_for("/chats/a"), Priority::High);
        assert_eq!(p.priority_for("/"), Priority::High);
        assert_eq!(p.priority_for("/debug/x"), Priority::Low);
        assert_eq!(p.priority_for("/types"), Priority::Low);
        assert_eq!(p.priority_for("/objects"), Priority::Normal);
    }

    #[test]
    fn content_admission() {
        let p = TtlPolicy::default();
        assert!(p.should_cache_content("/objects/a.json", &file("a.json", 100, None)));
        assert!(!p.should_cache_content("/objects/a.bin", &file("a.bin", 100, None)));
        assert!(!p.should_cache_content("/objects/a.png", &file("a.png", 6 * MIB, None)));
        assert!(!p.should_cache_content("/debug/x.txt", &file("x.txt", 1, None)));
        assert!(p.should_cache_content("/chats/big", &file("big", 2 * MIB, Some(now_millis()))));
        assert!(!p.should_cache_content("/chats/big", &file("big", 2 * MIB, None)));
        assert!(!p.should_cache_content("/types", &DirectoryEntry::directory("types")));
    }

    proptest! {
        #[test]
        fn every_path_gets_a_positive_ttl(path in "/[a-z]{0,8}(/[a-z]{1,8}){0,3}") {
            let p = TtlPolicy::default();
            prop_assert!(p.ttl_for(&path, &[]) >= Duration::from_secs(5));
        }
    }
}
