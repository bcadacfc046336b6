//! Integration test: CachingProvider against an in-memory store wrapped in
//! a fault-injecting layer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use filer_cache::PersistentCacheStore;
use filer_core::config::FilerConfig;
use filer_core::types::MKDIR_MODE;
use filer_core::{FileStat, FilerError, FilerResult};
use filer_projfs::{
    CachingProvider, InProcessEngine, NativeEngine, ProjectionCallbacks, ProviderSettings,
    SyncProvider, TelemetryView,
};
use filer_store::{ContentStore, OpendalStore};

/// Counts calls and injects failures or latency on demand.
struct FlakyStore {
    inner: OpendalStore,
    read_dirs: AtomicUsize,
    reads: AtomicUsize,
    fail_read_dir: AtomicBool,
    stat_failures: Mutex<HashSet<String>>,
    latency: Mutex<Duration>,
}

impl FlakyStore {
    async fn seeded() -> Arc<Self> {
        let inner = OpendalStore::memory().unwrap();
        for dir in ["/chats/general", "/objects", "/debug", "/invites", "/types"] {
            inner.create_dir_all(dir, MKDIR_MODE).await.unwrap();
        }
        inner.put_file("/objects/note.txt", &b"hello"[..]).await.unwrap();
        Arc::new(FlakyStore {
            inner,
            read_dirs: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            fail_read_dir: AtomicBool::new(false),
            stat_failures: Mutex::new(HashSet::new()),
            latency: Mutex::new(Duration::ZERO),
        })
    }

    fn latency(&self) -> Duration {
        *self.latency.lock().unwrap()
    }
}

#[async_trait]
impl ContentStore for FlakyStore {
    async fn read_dir(&self, path: &str) -> FilerResult<Vec<String>> {
        self.read_dirs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency()).await;
        if self.fail_read_dir.load(Ordering::SeqCst) {
            return Err(FilerError::Io("store offline".into()));
        }
        self.inner.read_dir(path).await
    }

    async fn stat(&self, path: &str) -> FilerResult<FileStat> {
        if self.stat_failures.lock().unwrap().contains(path) {
            return Err(FilerError::Io("stat rejected".into()));
        }
        self.inner.stat(path).await
    }

    async fn read_file(&self, path: &str) -> FilerResult<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency()).await;
        self.inner.read_file(path).await
    }

    async fn put_blob(&self, hash: &str, content: Bytes) -> FilerResult<()> {
        self.inner.put_blob(hash, content).await
    }

    async fn create_file(&self, parent: &str, hash: &str, name: &str, mode: u32) -> FilerResult<()> {
        self.inner.create_file(parent, hash, name, mode).await
    }

    async fn create_dir(&self, path: &str, mode: u32) -> FilerResult<()> {
        self.inner.create_dir(path, mode).await
    }

    async fn unlink(&self, path: &str) -> FilerResult<()> {
        self.inner.unlink(path).await
    }

    async fn rename(&self, src: &str, dst: &str) -> FilerResult<()> {
        self.inner.rename(src, dst).await
    }

    async fn rmdir(&self, path: &str) -> FilerResult<()> {
        self.inner.rmdir(path).await
    }

    async fn chmod(&self, path: &str, mode: u32) -> FilerResult<()> {
        self.inner.chmod(path, mode).await
    }

    async fn symlink(&self, target: &str, link_path: &str) -> FilerResult<()> {
        self.inner.symlink(target, link_path).await
    }

    async fn readlink(&self, path: &str) -> FilerResult<Bytes> {
        self.inner.readlink(path).await
    }
}

fn settings(dir: &std::path::Path) -> ProviderSettings {
    let mut cfg = FilerConfig::default();
    cfg.projection.virtual_root = dir.join("mnt");
    cfg.cache.persist_dir = dir.join("cache");
    cfg.prefetch.max_depth = 2;
    cfg.invalidation.debounce_ms = 20;
    ProviderSettings::from(&cfg)
}

async fn provider(
    dir: &std::path::Path,
    store: Arc<FlakyStore>,
) -> (Arc<CachingProvider>, Arc<InProcessEngine>) {
    let engine = Arc::new(InProcessEngine::default());
    let provider = CachingProvider::open(settings(dir), store, engine.clone())
        .await
        .unwrap();
    (Arc::new(provider), engine)
}

#[tokio::test]
async fn fresh_listing_skips_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = FlakyStore::seeded().await;
    let (provider, _) = provider(dir.path(), store.clone()).await;

    let first = provider.enumerate("/types").await;
    assert!(first.is_empty());
    let calls = store.read_dirs.load(Ordering::SeqCst);
    provider.enumerate("/types").await;
    assert_eq!(store.read_dirs.load(Ordering::SeqCst), calls);

    let stats = provider.stats();
    assert_eq!(stats.directory_cache.hits, 1);
    assert!(stats.performance.cache_hit_rate > 0.0);
}

#[tokio::test]
async fn structural_children_survive_stat_failures() {
    let dir = tempfile::tempdir().unwrap();
    let store = FlakyStore::seeded().await;
    store
        .stat_failures
        .lock()
        .unwrap()
        .extend(["/chats".to_string(), "/objects".to_string()]);
    let (provider, _) = provider(dir.path(), store).await;

    let root = provider.enumerate("/").await;
    let chats = root.iter().find(|e| e.name == "chats").unwrap();
    assert!(chats.is_directory);
    assert!(chats.metadata.contains_key("stat_error"));
    assert!(root.iter().all(|e| e.is_directory));
}

#[tokio::test]
async fn unstatable_plain_child_becomes_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = FlakyStore::seeded().await;
    store
        .stat_failures
        .lock()
        .unwrap()
        .insert("/objects/note.txt".to_string());
    let (provider, _) = provider(dir.path(), store).await;

    let listing = provider.enumerate("/objects").await;
    assert_eq!(listing.len(), 1);
    assert!(!listing[0].is_directory);
    assert_eq!(listing[0].size, 0);
}

#[tokio::test]
async fn store_failure_yields_empty_listing_and_logs() {
    let dir = tempfile::tempdir().unwrap();
    let store = FlakyStore::seeded().await;
    store.fail_read_dir.store(true, Ordering::SeqCst);
    let (provider, _) = provider(dir.path(), store).await;

    assert!(provider.enumerate("/").await.is_empty());
    assert!(provider.enumerate("/chats").await.is_empty());

    let errors = provider.errors().by_operation("enumerate");
    assert_eq!(errors.len(), 2);
    assert!(errors[0].message.contains("store offline"));
    match provider.telemetry(None) {
        TelemetryView::Aggregate { stats, errors } => {
            assert_eq!(stats.total_requests, 2);
            assert_eq!(errors.len(), 2);
        }
        other => panic!("expected aggregate view, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_reads_share_one_store_call() {
    let dir = tempfile::tempdir().unwrap();
    let store = FlakyStore::seeded().await;
    *store.latency.lock().unwrap() = Duration::from_millis(50);
    let (provider, engine) = provider(dir.path(), store.clone()).await;

    let reads = (0..5).map(|_| {
        let p = provider.clone();
        tokio::spawn(async move { p.provide_file_content("/objects/note.txt").await })
    });
    for out in futures::future::join_all(reads).await {
        assert_eq!(&out.unwrap().unwrap()[..], b"hello");
    }
    assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    assert_eq!(
        engine.cached_content("/objects/note.txt").as_deref(),
        Some(&b"hello"[..])
    );
    assert!(!engine.completed_requests().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_arriving_as_a_fetch_lands_reuse_it() {
    let dir = tempfile::tempdir().unwrap();
    let store = FlakyStore::seeded().await;
    *store.latency.lock().unwrap() = Duration::from_millis(30);
    let (provider, _) = provider(dir.path(), store.clone()).await;

    let first = {
        let p = provider.clone();
        tokio::spawn(async move { p.provide_file_content("/objects/note.txt").await })
    };
    let mut late = Vec::new();
    while !first.is_finished() {
        let p = provider.clone();
        late.push(tokio::spawn(async move {
            p.provide_file_content("/objects/note.txt").await
        }));
        tokio::task::yield_now().await;
    }
    assert_eq!(&first.await.unwrap().unwrap()[..], b"hello");
    for out in futures::future::join_all(late).await {
        assert_eq!(&out.unwrap().unwrap()[..], b"hello");
    }
    assert_eq!(store.reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn object_content_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = FlakyStore::seeded().await;
    store.inner.put_file("/chats/general/m1", &b"hi"[..]).await.unwrap();
    {
        let (provider, _) = provider(dir.path(), store.clone()).await;
        provider.provide_file_content("/objects/note.txt").await.unwrap();
        provider.provide_file_content("/chats/general/m1").await.unwrap();
    }
    assert_eq!(store.reads.load(Ordering::SeqCst), 2);

    let (restarted, _) = provider(dir.path(), store.clone()).await;
    let note = restarted.provide_file_content("/objects/note.txt").await.unwrap();
    assert_eq!(&note[..], b"hello");
    assert_eq!(store.reads.load(Ordering::SeqCst), 2);

    restarted.provide_file_content("/chats/general/m1").await.unwrap();
    assert_eq!(store.reads.load(Ordering::SeqCst), 3);
    assert_eq!(restarted.stats().persistent.files, 1);
}

#[tokio::test]
async fn missing_file_is_a_contextual_error() {
    let dir = tempfile::tempdir().unwrap();
    let (provider, _) = provider(dir.path(), FlakyStore::seeded().await).await;

    let err = provider
        .provide_file_content("/objects/missing.txt")
        .await
        .unwrap_err();
    assert!(err.source.is_not_found());
    assert_eq!(err.context.operation, "read");
    assert!(err.to_string().contains("Path: /objects/missing.txt"));
}

#[tokio::test]
async fn mount_warms_caches_and_unmount_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let store = FlakyStore::seeded().await;
    let (provider, engine) = provider(dir.path(), store).await;

    provider.mount().await.unwrap();
    assert!(provider.is_mounted());
    assert!(engine.is_running());
    assert!(dir.path().join("mnt").is_dir());
    assert!(engine.cached_directory("/").is_some());
    assert!(engine.cached_directory("/chats").is_some());
    assert!(provider.stats().last_prefetch.unwrap().directories >= 6);
    assert!(provider.mount().await.is_err());

    provider.unmount().await.unwrap();
    assert!(!provider.is_mounted());
    assert!(!engine.is_running());
    assert_eq!(provider.tracker().stats().active_requests, 0);
    assert!(dir.path().join("cache/metadata.json").exists());
}

#[tokio::test]
async fn zero_cleanup_interval_keeps_periodic_cleanup_alive() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    settings.cleanup_interval = Duration::ZERO;
    let engine = Arc::new(InProcessEngine::default());
    let provider = Arc::new(
        CachingProvider::open(settings, FlakyStore::seeded().await, engine)
            .await
            .unwrap(),
    );

    provider.mount().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(provider.stats().cleanup_runs >= 1);
    provider.unmount().await.unwrap();
}

#[tokio::test]
async fn mount_persists_top_level_listings() {
    let dir = tempfile::tempdir().unwrap();
    let store = FlakyStore::seeded().await;
    let (provider, _) = provider(dir.path(), store.clone()).await;
    provider.mount().await.unwrap();
    provider.unmount().await.unwrap();

    let reopened = PersistentCacheStore::open(dir.path().join("cache")).await.unwrap();
    let preloaded = reopened.preload_root_directories().await.unwrap();
    assert!(preloaded["/"].iter().any(|e| e.name == "objects"));
    assert_eq!(preloaded["/chats"][0].name, "general");
    assert!(reopened.access_log().len() >= 1);
}

#[tokio::test]
async fn unready_store_refuses_to_mount() {
    let dir = tempfile::tempdir().unwrap();
    let store = FlakyStore::seeded().await;
    store.fail_read_dir.store(true, Ordering::SeqCst);
    let (provider, engine) = provider(dir.path(), store).await;

    assert!(matches!(provider.mount().await, Err(FilerError::Mount(_))));
    assert!(!engine.is_running());
    assert!(!dir.path().join("mnt").exists());
}

#[tokio::test]
async fn empty_store_refuses_to_mount() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FlakyStore {
        inner: OpendalStore::memory().unwrap(),
        read_dirs: AtomicUsize::new(0),
        reads: AtomicUsize::new(0),
        fail_read_dir: AtomicBool::new(false),
        stat_failures: Mutex::new(HashSet::new()),
        latency: Mutex::new(Duration::ZERO),
    });
    let (provider, engine) = provider(dir.path(), store).await;

    let err = provider.mount().await.unwrap_err();
    assert!(matches!(err, FilerError::Mount(_)));
    assert!(!engine.is_running());
}

#[tokio::test]
async fn changed_listing_schedules_invalidation() {
    let dir = tempfile::tempdir().unwrap();
    let store = FlakyStore::seeded().await;
    let (provider, engine) = provider(dir.path(), store.clone()).await;

    provider.enumerate("/invites").await;
    store.inner.put_file("/invites/abc", &b"x"[..]).await.unwrap();
    let refreshed = provider.refresh("/invites").await;
    assert_eq!(refreshed.len(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(engine.invalidations(), vec!["/invites"]);
}

#[test]
fn sync_enumeration_times_out_then_invalidates() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let (store, provider, engine) = rt.block_on(async {
        let store = FlakyStore::seeded().await;
        let (provider, engine) = provider(dir.path(), store.clone()).await;
        (store, provider, engine)
    });
    let sync = SyncProvider::new(
        provider.clone(),
        rt.handle().clone(),
        Duration::from_millis(150),
        Duration::from_secs(2),
    );
    let root = dir.path().join("mnt").to_string_lossy().into_owned();

    let names: Vec<String> = sync.enumerate(&root).into_iter().map(|e| e.name).collect();
    assert!(names.contains(&"objects".to_string()));

    *store.latency.lock().unwrap() = Duration::from_millis(400);
    let content = sync.file_content(&format!("{root}/objects/note.txt")).unwrap();
    assert_eq!(&content[..], b"hello");

    // Nothing cached for /chats yet: the callback gives up and answers empty.
    assert!(sync.enumerate(&format!("{root}/chats")).is_empty());

    // The detached fetch still lands and the engine is told to re-ask.
    std::thread::sleep(Duration::from_millis(800));
    assert_eq!(engine.invalidations(), vec!["/chats"]);
    assert!(provider.stale_listing("/chats").is_some());
}
