//! CachingProvider: answers projection callbacks from warm caches.
//!
//! Owns every per-mount structure (caches, persistent snapshot, prefetch,
//! invalidation, request tracking, error log); nothing is global.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use filer_cache::{
    CacheStats, ContentCache, ContentStats, DirectoryCache, DirectoryResolver, Listing,
    PersistStats, PersistentCacheStore, PrefetchOptions, PrefetchReport, PrefetchScheduler,
    TtlPolicy,
};
use filer_core::config::{expand_home, FilerConfig};
use filer_core::context::{ContextOptions, RequestStats, RequestTelemetry};
use filer_core::diagnostics::{ErrorRecord, ErrorStats};
use filer_core::path::depth;
use filer_core::hash::hash_bytes;
use filer_core::types::{RequestKind, DEFAULT_FILE_MODE};
use filer_core::{
    ContextualError, DirectoryEntry, ErrorContext, ErrorContextualizer, Failure, FilerError,
    FilerResult, RequestContext, RequestContextTracker, SourceTree, TelemetryResult,
};
use filer_store::{check_health, ContentStore};

use crate::engine::NativeEngine;
use crate::invalidate::{InvalidationCoordinator, InvalidationStats};

/// `tokio::time::interval` rejects a zero period.
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Object blobs up to this size are kept on disk across restarts.
const PERSISTED_FILE_MAX_BYTES: u64 = 1024 * 1024;

type SharedRead = Shared<BoxFuture<'static, Result<Bytes, Arc<FilerError>>>>;

/// Mount-time and runtime knobs, taken from [`FilerConfig`].
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub virtual_root: PathBuf,
    pub structural_dirs: Vec<String>,
    pub policy: TtlPolicy,
    pub content_max_bytes: u64,
    pub persist_dir: PathBuf,
    pub persist_interval: Duration,
    pub prefetch_enabled: bool,
    pub prefetch: PrefetchOptions,
    pub hot_paths: usize,
    pub debounce: Duration,
    pub cleanup_interval: Duration,
    pub telemetry_max_age: Duration,
    pub error_log_capacity: usize,
}

impl From<&FilerConfig> for ProviderSettings {
    fn from(cfg: &FilerConfig) -> Self {
        ProviderSettings {
            virtual_root: expand_home(&cfg.projection.virtual_root),
            structural_dirs: cfg.projection.structural_dirs.clone(),
            policy: TtlPolicy::from_config(&cfg.cache),
            content_max_bytes: cfg.cache.content_max_bytes,
            persist_dir: expand_home(&cfg.cache.persist_dir),
            persist_interval: Duration::from_secs(cfg.cache.persist_interval_secs.max(1)),
            prefetch_enabled: cfg.prefetch.enabled,
            prefetch: PrefetchOptions::from(&cfg.prefetch),
            hot_paths: cfg.prefetch.hot_paths,
            debounce: Duration::from_millis(cfg.invalidation.debounce_ms),
            cleanup_interval: cfg.cache.cleanup_interval(),
            telemetry_max_age: cfg.cache.telemetry_max_age(),
            error_log_capacity: cfg.cache.error_log_capacity,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub telemetry: usize,
    pub errors: usize,
    pub directories: usize,
    pub contents: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub engine: String,
    pub mounted: bool,
    pub enumerations: u64,
    pub cleanup_runs: u64,
    pub directory_cache: CacheStats,
    pub content_cache: ContentStats,
    pub persistent: PersistStats,
    pub telemetry: RequestStats,
    pub errors: ErrorStats,
    pub invalidation: InvalidationStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_prefetch: Option<PrefetchReport>,
    pub native: serde_json::Value,
    pub performance: Performance,
}

/// Headline numbers pulled out of the telemetry and cache stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Performance {
    pub cache_hit_rate: f64,
    pub average_request_duration_ms: f64,
    pub error_rate: f64,
    pub active_requests: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TelemetryView {
    Request(RequestTelemetry),
    Aggregate {
        stats: RequestStats,
        errors: Vec<ErrorRecord>,
    },
}

#[derive(Default)]
struct Lifecycle {
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
    last_prefetch: Option<PrefetchReport>,
}

pub struct CachingProvider {
    settings: ProviderSettings,
    virtual_root: String,
    store: Arc<dyn ContentStore>,
    engine: Arc<dyn NativeEngine>,
    resolver: DirectoryResolver,
    directories: Arc<DirectoryCache>,
    content: Arc<ContentCache>,
    persistent: Arc<PersistentCacheStore>,
    prefetcher: PrefetchScheduler,
    invalidation: InvalidationCoordinator,
    tracker: Arc<RequestContextTracker>,
    errors: Arc<ErrorContextualizer>,
    reads: Mutex<HashMap<String, (u64, SharedRead)>>,
    read_generation: AtomicU64,
    enumerations: AtomicU64,
    cleanup_runs: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
}

impl CachingProvider {
    /// Build a provider and open its persistent cache. Nothing is mounted.
    pub async fn open(
        settings: ProviderSettings,
        store: Arc<dyn ContentStore>,
        engine: Arc<dyn NativeEngine>,
    ) -> anyhow::Result<Self> {
        let persistent = Arc::new(PersistentCacheStore::open(&settings.persist_dir).await?);
        let resolver = DirectoryResolver::new(store.clone(), settings.structural_dirs.clone());
        let directories = Arc::new(DirectoryCache::new(settings.policy.clone()));
        let content = Arc::new(ContentCache::new(
            settings.policy.clone(),
            settings.content_max_bytes,
        ));
        let prefetcher =
            PrefetchScheduler::new(resolver.clone(), directories.clone(), content.clone());
        let invalidation = InvalidationCoordinator::new(engine.clone(), settings.debounce);
        let errors = Arc::new(ErrorContextualizer::new(settings.error_log_capacity));

        Ok(CachingProvider {
            virtual_root: settings.virtual_root.to_string_lossy().into_owned(),
            settings,
            store,
            engine,
            resolver,
            directories,
            content,
            persistent,
            prefetcher,
            invalidation,
            tracker: Arc::new(RequestContextTracker::new()),
            errors,
            reads: Mutex::new(HashMap::new()),
            read_generation: AtomicU64::new(1),
            enumerations: AtomicU64::new(0),
            cleanup_runs: AtomicU64::new(0),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reads(&self) -> MutexGuard<'_, HashMap<String, (u64, SharedRead)>> {
        self.reads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn virtual_root(&self) -> &str {
        &self.virtual_root
    }

    pub fn invalidation(&self) -> &InvalidationCoordinator {
        &self.invalidation
    }

    pub fn tracker(&self) -> &RequestContextTracker {
        &self.tracker
    }

    pub fn errors(&self) -> &ErrorContextualizer {
        &self.errors
    }

    pub fn is_mounted(&self) -> bool {
        self.lifecycle().cancel.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Last listing seen for `path`, however old.
    pub fn stale_listing(&self, path: &str) -> Option<Listing> {
        self.directories.get_stale(path)
    }

    fn new_context(&self, kind: RequestKind, path: &str, parent: Option<&RequestContext>) -> RequestContext {
        self.tracker.create_context(
            kind,
            path,
            ContextOptions {
                depth: parent.map(|p| p.depth + 1).unwrap_or(0),
                priority: Some(self.settings.policy.priority_for(path)),
                parent_request_id: parent.map(|p| p.request_id.clone()),
                source_tree: Some(SourceTree::of(path)),
            },
        )
    }

    fn error_context(&self, operation: &str, path: &str, ctx: &RequestContext) -> ErrorContext {
        ErrorContext::new(operation, path)
            .with_tree(SourceTree::of(path))
            .with_request(ctx.request_id.clone())
    }

    // ── Enumeration ───────────────────────────────────────────────────────

    /// Children of `path`. Never fails: errors become an empty listing, or
    /// the last known root listing for `/`.
    pub async fn enumerate(&self, path: &str) -> Listing {
        self.enumerate_within(path, None).await
    }

    /// Enumerate as part of a larger request, linking telemetry to `parent`.
    pub async fn enumerate_within(&self, path: &str, parent: Option<&RequestContext>) -> Listing {
        self.enumerations.fetch_add(1, Ordering::Relaxed);
        self.persistent.record_access(path);
        let ctx = self.new_context(RequestKind::Enumeration, path, parent);
        self.tracker.start_telemetry(&ctx, "enumerate");

        if let Some(hit) = self.directories.get(path) {
            self.tracker
                .end_telemetry(&ctx.request_id, "enumerate", TelemetryResult::Cached, None);
            return hit;
        }

        match self.fetch_listing(path, &ctx).await {
            Ok(listing) => {
                self.tracker
                    .end_telemetry(&ctx.request_id, "enumerate", TelemetryResult::Success, None);
                listing
            }
            Err(failure) => {
                self.tracker.end_telemetry(
                    &ctx.request_id,
                    "enumerate",
                    TelemetryResult::Error,
                    Some(failure.error().to_string()),
                );
                let fallback = if path == "/" {
                    self.directories.get_stale("/")
                } else {
                    None
                };
                failure
                    .recover_with(fallback.unwrap_or_default())
                    .unwrap_or_default()
            }
        }
    }

    /// Fetch from the store and replace the cached listing.
    async fn fetch_listing(&self, path: &str, ctx: &RequestContext) -> Result<Listing, Failure> {
        let entries = self
            .resolver
            .resolve(path, Some(&ctx.request_id))
            .await
            .map_err(|e| Failure::Recoverable(self.errors.wrap(e, self.error_context("enumerate", path, ctx))))?;

        let previous = self.directories.get_stale(path);
        let listing = self.directories.put(path, entries);

        if depth(path) <= 1 {
            if let Err(e) = self.persistent.cache_directory(path, &listing).await {
                warn!(path, error = %e, "could not persist listing");
            }
        }
        if let Some(prev) = previous {
            if !same_names(&prev, &listing) {
                self.invalidation.schedule(path);
            }
        }
        Ok(listing)
    }

    /// Re-fetch `path` ignoring the cache.
    pub async fn refresh(&self, path: &str) -> Listing {
        let ctx = self.new_context(RequestKind::Enumeration, path, None);
        self.tracker.start_telemetry(&ctx, "refresh");
        match self.fetch_listing(path, &ctx).await {
            Ok(listing) => {
                self.tracker
                    .end_telemetry(&ctx.request_id, "refresh", TelemetryResult::Success, None);
                listing
            }
            Err(failure) => {
                self.tracker.end_telemetry(
                    &ctx.request_id,
                    "refresh",
                    TelemetryResult::Error,
                    Some(failure.error().to_string()),
                );
                self.directories.get_stale(path).unwrap_or_default()
            }
        }
    }

    // ── File content ──────────────────────────────────────────────────────

    /// Bytes of `path`. Concurrent requests for one uncached path share a
    /// single store read.
    pub async fn provide_file_content(&self, path: &str) -> Result<Bytes, ContextualError> {
        self.persistent.record_access(path);
        let ctx = self.new_context(RequestKind::Read, path, None);
        self.tracker.start_telemetry(&ctx, "read");

        if let Some(hit) = self.content.get(path) {
            self.tracker
                .end_telemetry(&ctx.request_id, "read", TelemetryResult::Cached, None);
            return Ok(hit);
        }

        let (generation, shared) = self.shared_read(path);
        let result = shared.await;
        if let Ok(content) = &result {
            self.content.put(path, content.clone());
        }
        {
            let mut reads = self.reads();
            if reads.get(path).is_some_and(|(g, _)| *g == generation) {
                reads.remove(path);
            }
        }

        match result {
            Ok(content) => {
                if self.engine.supports_cache_priming() {
                    self.engine.set_cached_content(path, &content);
                    self.engine.complete_pending_file_requests(path);
                }
                self.tracker
                    .end_telemetry(&ctx.request_id, "read", TelemetryResult::Success, None);
                Ok(content)
            }
            Err(shared_err) => {
                let wrapped = self.errors.wrap(
                    FilerError::from_shared(&shared_err),
                    self.error_context("read", path, &ctx),
                );
                self.tracker.end_telemetry(
                    &ctx.request_id,
                    "read",
                    TelemetryResult::Error,
                    Some(wrapped.to_string()),
                );
                Failure::Fatal(wrapped).recover_with(Bytes::new())
            }
        }
    }

    fn shared_read(&self, path: &str) -> (u64, SharedRead) {
        let mut reads = self.reads();
        if let Some((generation, existing)) = reads.get(path) {
            debug!(path, "joining in-flight read");
            return (*generation, existing.clone());
        }
        let generation = self.read_generation.fetch_add(1, Ordering::Relaxed);
        let store = Arc::clone(&self.store);
        let persistent = Arc::clone(&self.persistent);
        let owned = path.to_string();
        let durable = SourceTree::of(path) == SourceTree::Objects;
        let fut: SharedRead = async move {
            if durable {
                if let Some(content) = read_persisted(&persistent, &owned).await {
                    return Ok(content);
                }
            }
            let content = store.read_file(&owned).await.map_err(Arc::new)?;
            if durable && content.len() as u64 <= PERSISTED_FILE_MAX_BYTES {
                if let Err(e) = persistent
                    .cache_file(&owned, &content, DEFAULT_FILE_MODE)
                    .await
                {
                    warn!(path = %owned, error = %e, "could not persist file content");
                }
            }
            Ok(content)
        }
        .boxed()
        .shared();
        reads.insert(path.to_string(), (generation, fut.clone()));
        (generation, fut)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Verify the store, warm every cache, create the mount point, then
    /// hand over to the native engine and start background upkeep.
    pub async fn mount(self: &Arc<Self>) -> FilerResult<()> {
        if self.is_mounted() {
            return Err(FilerError::InvalidState("already mounted".into()));
        }

        let root_count = check_health(self.store.as_ref())
            .await
            .map_err(|e| FilerError::Mount(format!("backing store is not ready: {e:#}")))?;
        info!(children = root_count, "backing store ready");

        self.directories.put("/", self.resolver.seed_root());
        match self.persistent.preload_root_directories().await {
            Ok(preloaded) => {
                for (path, entries) in preloaded {
                    self.directories.put(&path, entries);
                }
            }
            Err(e) => warn!(error = %e, "persistent cache preload failed"),
        }

        let ctx = self.new_context(RequestKind::Enumeration, "/", None);
        self.tracker.start_telemetry(&ctx, "mount");
        let root = match self.fetch_listing("/", &ctx).await {
            Ok(root) if !root.is_empty() => root,
            Ok(_) => {
                self.tracker
                    .end_telemetry(&ctx.request_id, "mount", TelemetryResult::Error, None);
                return Err(FilerError::Mount("root enumeration is empty".into()));
            }
            Err(failure) => {
                let msg = failure.error().to_string();
                self.tracker.end_telemetry(
                    &ctx.request_id,
                    "mount",
                    TelemetryResult::Error,
                    Some(msg.clone()),
                );
                return Err(FilerError::Mount(format!("cannot enumerate root: {msg}")));
            }
        };
        self.tracker
            .end_telemetry(&ctx.request_id, "mount", TelemetryResult::Success, None);
        debug!(entries = root.len(), "root pre-populated");

        if self.settings.prefetch_enabled {
            self.prefetch_before_mount().await;
        }

        let mountpoint = self.settings.virtual_root.clone();
        tokio::fs::create_dir_all(&mountpoint).await.map_err(|e| {
            FilerError::Mount(format!(
                "failed to create mount directory {}: {e}",
                mountpoint.display()
            ))
        })?;

        self.engine
            .mount(&mountpoint)
            .await
            .map_err(|e| FilerError::Mount(format!("{} engine: {e:#}", self.engine.name())))?;

        let cancel = CancellationToken::new();
        let mut tasks = vec![self.spawn_cleanup(cancel.clone())];
        tasks.push(
            self.persistent
                .spawn_autosave(self.settings.persist_interval, cancel.clone()),
        );
        let mut lifecycle = self.lifecycle();
        lifecycle.cancel = Some(cancel);
        lifecycle.tasks = tasks;
        drop(lifecycle);

        info!(root = %mountpoint.display(), engine = self.engine.name(), "mounted");
        Ok(())
    }

    async fn prefetch_before_mount(&self) {
        let log = self.persistent.access_log();
        let report = self
            .prefetcher
            .smart_prefetch(Some(&log), self.settings.hot_paths, &self.settings.prefetch)
            .await;
        self.lifecycle().last_prefetch = Some(report);

        let gathered = self.prefetcher.cached_entries();
        for path in self.prefetcher.standard_paths() {
            let Some(listing) = gathered.get(&path) else {
                continue;
            };
            if let Err(e) = self.persistent.cache_directory(&path, listing).await {
                warn!(path = %path, error = %e, "could not persist prefetched listing");
            }
            if self.engine.supports_cache_priming() {
                let named: Vec<DirectoryEntry> = listing
                    .iter()
                    .filter(|e| !e.name.is_empty())
                    .cloned()
                    .collect();
                if !named.is_empty() {
                    self.engine.set_cached_directory(&path, &named);
                }
            }
        }
    }

    fn spawn_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let provider = Arc::clone(self);
        let every = self.settings.cleanup_interval.max(MIN_CLEANUP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = provider.cleanup();
                        provider.cleanup_runs.fetch_add(1, Ordering::Relaxed);
                        debug!(?report, "periodic cleanup");
                    }
                }
            }
        })
    }

    /// Evict expired cache entries and age out telemetry and error records.
    pub fn cleanup(&self) -> CleanupReport {
        let age = self.settings.telemetry_max_age;
        CleanupReport {
            telemetry: self.tracker.cleanup(age),
            errors: self.errors.clear_older_than(age),
            directories: self.directories.evict_expired(),
            contents: self.content.evict_expired(),
        }
    }

    /// Stop upkeep, flush the persistent cache, stop the engine and
    /// release tracked contexts.
    pub async fn unmount(&self) -> FilerResult<()> {
        let (cancel, tasks) = {
            let mut lifecycle = self.lifecycle();
            (lifecycle.cancel.take(), std::mem::take(&mut lifecycle.tasks))
        };
        let Some(cancel) = cancel else {
            return Ok(());
        };
        cancel.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "upkeep task failed");
            }
        }

        if let Err(e) = self.persistent.shutdown().await {
            warn!(error = %e, "persistent cache flush failed");
        }
        let report = self.cleanup();
        self.invalidation.cancel_all();

        let stopped = self.engine.unmount().await;
        let released = self.tracker.release_all();
        info!(released, ?report, "unmounted");
        stopped.map_err(|e| FilerError::Mount(format!("engine unmount: {e:#}")))
    }

    // ── Diagnostics ───────────────────────────────────────────────────────

    pub fn stats(&self) -> ProviderStats {
        let telemetry = self.tracker.stats();
        let performance = Performance {
            cache_hit_rate: telemetry.cache_hit_rate,
            average_request_duration_ms: telemetry.average_duration_ms,
            error_rate: telemetry.error_rate,
            active_requests: telemetry.active_requests,
        };
        ProviderStats {
            engine: self.engine.name().to_string(),
            mounted: self.is_mounted(),
            enumerations: self.enumerations.load(Ordering::Relaxed),
            cleanup_runs: self.cleanup_runs.load(Ordering::Relaxed),
            directory_cache: self.directories.stats(),
            content_cache: self.content.stats(),
            persistent: self.persistent.stats(),
            telemetry,
            errors: self.errors.stats(),
            invalidation: self.invalidation.stats(),
            last_prefetch: self.lifecycle().last_prefetch,
            native: self.engine.stats(),
            performance,
        }
    }

    /// One request's context, telemetry and sub-tree; or aggregate stats
    /// plus recent errors when no id is given.
    pub fn telemetry(&self, request_id: Option<&str>) -> TelemetryView {
        match request_id {
            Some(id) => TelemetryView::Request(self.tracker.request_telemetry(id)),
            None => TelemetryView::Aggregate {
                stats: self.tracker.stats(),
                errors: self.errors.recent(50),
            },
        }
    }

    pub fn persist_dir(&self) -> &Path {
        self.persistent.cache_dir()
    }
}

fn same_names(a: &[DirectoryEntry], b: &[DirectoryEntry]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.name == y.name)
}

/// A persisted copy of an immutable object, if it is still intact.
async fn read_persisted(persistent: &PersistentCacheStore, path: &str) -> Option<Bytes> {
    let (record, content) = persistent.get_file(path).await?;
    if hash_bytes(&content) != record.hash {
        warn!(path, "persisted file content does not match its hash");
        return None;
    }
    debug!(path, bytes = content.len(), "served from persisted copy");
    Some(content)
}
