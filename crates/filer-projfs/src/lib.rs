//! filer-projfs: projection-engine side of filer
//!
//! A projection engine (Windows ProjFS-style) asks for directory listings and
//! file bytes on its own threads and expects answers in bounded time. This
//! crate answers from warm caches and tells the engine when a listing it
//! already showed has changed.
//!
//! ## Architecture
//!
//! ```text
//! native engine callback thread
//!       │
//!       ├── bridge::SyncProvider      → blocks on a runtime task, with a timeout
//!       │         │
//!       │         └── provider::CachingProvider
//!       │                   ├── DirectoryCache / ContentCache (filer-cache)
//!       │                   ├── PersistentCacheStore          (filer-cache)
//!       │                   ├── PrefetchScheduler             (filer-cache)
//!       │                   └── ContentStore                  (filer-store)
//!       │
//!       └── invalidate::InvalidationCoordinator → engine.invalidate_directory()
//! ```
//!
//! Platform engines implement [`engine::NativeEngine`]; the in-process engine
//! keeps its caches in memory and is what the daemon runs off Windows.

pub mod bridge;
pub mod engine;
pub mod invalidate;
pub mod provider;

pub use bridge::{BlockingBridge, ProjectionCallbacks, SyncProvider};
pub use engine::{InProcessEngine, InvalidationCapability, NativeEngine};
pub use invalidate::{InvalidationCoordinator, InvalidationStats};
pub use provider::{
    CachingProvider, CleanupReport, Performance, ProviderSettings, ProviderStats, TelemetryView,
};
