//! filer-cache: read-path caching between the native engines and the store.
//!
//! - [`policy`]: TTL, priority and content admission per source tree
//! - [`directory`] / [`content`]: in-memory listing and byte caches
//! - [`persistent`]: on-disk snapshot loaded before mount
//! - [`resolve`]: `read_dir` + `stat` → [`filer_core::DirectoryEntry`]
//! - [`prefetch`]: bounded best-effort cache warming

pub mod content;
pub mod directory;
pub mod persistent;
pub mod policy;
pub mod prefetch;
pub mod resolve;

pub use content::{ContentCache, ContentStats};
pub use directory::{CacheEntry, CacheStats, DirectoryCache, Listing};
pub use persistent::{AccessLog, PersistStats, PersistentCacheStore};
pub use policy::TtlPolicy;
pub use prefetch::{PrefetchOptions, PrefetchReport, PrefetchScheduler};
pub use resolve::DirectoryResolver;
