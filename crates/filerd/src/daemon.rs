//! Daemon lifecycle: store setup, mount, diagnostics server, shutdown

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use filer_core::config::{expand_home, FilerConfig};
use filer_core::types::DEFAULT_DIR_MODE;
use filer_fuse::WriteBufferAdapter;
use filer_projfs::{
    CachingProvider, InProcessEngine, InvalidationCapability, ProjectionCallbacks, ProviderSettings,
    SyncProvider,
};
use filer_store::{build_operator, MeteredStore, OpendalStore};

use crate::metrics::{DiagnosticsState, Frontend, Metrics};
use crate::Mode;

pub async fn run(config: FilerConfig, mode: Mode, init_store: bool) -> Result<()> {
    info!("daemon starting");

    let store = open_store(&config, init_store).await?;

    let frontend = match mode {
        Mode::Projection => {
            let settings = ProviderSettings::from(&config);
            let engine = Arc::new(InProcessEngine::new(InvalidationCapability::InvalidateDirectory));
            let provider = CachingProvider::open(settings, store.clone(), engine)
                .await
                .context("opening caching provider")?;
            Frontend::Projection(Arc::new(provider))
        }
        Mode::Fuse => {
            let adapter = WriteBufferAdapter::from_config(store.clone(), &config.fuse)
                .await
                .context("opening write buffer adapter")?;
            let pending = adapter.temps().pending();
            if !pending.is_empty() {
                warn!(count = pending.len(), "write buffers left by a previous run");
            }
            Frontend::Fuse(Arc::new(adapter))
        }
    };

    // Blocking callback surface, driven the way a native engine would
    let callbacks = match &frontend {
        Frontend::Projection(provider) => Some(Arc::new(SyncProvider::new(
            provider.clone(),
            tokio::runtime::Handle::current(),
            config.projection.enumeration_wait(),
            config.prefetch.timeout(),
        )) as Arc<dyn ProjectionCallbacks>),
        Frontend::Fuse(_) => None,
    };

    // Start Prometheus metrics + diagnostics endpoint
    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let state = DiagnosticsState {
            metrics: Arc::new(Metrics::new()),
            store: store.clone(),
            frontend: frontend.clone(),
            callbacks,
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    match frontend {
        Frontend::Projection(provider) => run_projection(provider).await,
        Frontend::Fuse(adapter) => run_fuse(adapter, &config).await,
    }
}

/// Build the backing store and verify its root is populated. The store is
/// only written to when `init_store` asks for the structural directories.
async fn open_store(
    config: &FilerConfig,
    init_store: bool,
) -> Result<Arc<MeteredStore<OpendalStore>>> {
    let op = build_operator(&config.store)?;
    let store = OpendalStore::new(op);
    if init_store {
        for dir in &config.projection.structural_dirs {
            store
                .create_dir_all(&format!("/{dir}"), DEFAULT_DIR_MODE)
                .await
                .with_context(|| format!("creating structural directory /{dir}"))?;
        }
        info!(dirs = ?config.projection.structural_dirs, "store: initialized");
    }
    let children = filer_store::check_health(&store).await?;
    info!(backend = ?config.store.backend, children, "store: connected");
    Ok(Arc::new(MeteredStore::new(store)))
}

async fn run_projection(provider: Arc<CachingProvider>) -> Result<()> {
    provider
        .mount()
        .await
        .context("mounting projection provider")?;
    info!(root = %provider.virtual_root(), "projection: serving");

    notify_ready();
    shutdown_signal().await;

    provider.unmount().await.context("unmounting projection provider")?;
    let stats = provider.stats();
    info!(
        enumerations = stats.enumerations,
        errors = stats.errors.total,
        "projection: stopped"
    );
    Ok(())
}

#[cfg(feature = "fuse")]
async fn run_fuse(adapter: Arc<WriteBufferAdapter>, config: &FilerConfig) -> Result<()> {
    let mountpoint = expand_home(&config.fuse.mountpoint);
    tokio::fs::create_dir_all(&mountpoint)
        .await
        .with_context(|| format!("creating mountpoint {}", mountpoint.display()))?;

    let mount = filer_fuse::mount(filer_fuse::MountConfig {
        adapter: adapter.clone(),
        mountpoint: mountpoint.clone(),
        allow_other: config.fuse.allow_other,
    });

    notify_ready();
    tokio::select! {
        result = mount => result.with_context(|| format!("fuse mount at {}", mountpoint.display()))?,
        _ = shutdown_signal() => {
            info!(
                mountpoint = %mountpoint.display(),
                "shutdown requested; unmount with fusermount3 -u if the mount lingers"
            );
        }
    }

    let stats = adapter.stats();
    info!(committed = stats.committed, buffered = stats.buffered, "fuse: stopped");
    Ok(())
}

#[cfg(not(feature = "fuse"))]
async fn run_fuse(_adapter: Arc<WriteBufferAdapter>, config: &FilerConfig) -> Result<()> {
    anyhow::bail!(
        "fuse mode requires the fuse feature: cargo build --features fuse (mountpoint {})",
        expand_home(&config.fuse.mountpoint).display()
    )
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("ctrl-c handler failed: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn notify_ready() {
    // Send sd_notify(READY=1) to systemd if running as a service
    // Uses $NOTIFY_SOCKET env var; no-op if not set
    #[cfg(unix)]
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filer_core::config::StoreBackend;
    use filer_store::ContentStore;

    fn memory_config(dir: &std::path::Path) -> FilerConfig {
        let mut config = FilerConfig::default();
        config.store.backend = StoreBackend::Memory;
        config.daemon.metrics_addr = None;
        config.cache.persist_dir = dir.join("cache");
        config.projection.virtual_root = dir.join("mnt");
        config.fuse.temp_dir = dir.join("tmp");
        config.prefetch.enabled = false;
        config
    }

    #[tokio::test]
    async fn empty_store_is_left_untouched_and_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = memory_config(dir.path());
        let err = open_store(&config, false).await.unwrap_err();
        assert!(err.to_string().contains("store root is empty"));

        let mut config = config;
        config.store.backend = StoreBackend::Fs;
        config.store.root = dir.path().join("store").to_string_lossy().into_owned();
        std::fs::create_dir_all(dir.path().join("store")).unwrap();
        assert!(open_store(&config, false).await.is_err());
        assert_eq!(std::fs::read_dir(dir.path().join("store")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn init_store_seeds_structural_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config = memory_config(dir.path());
        let store = open_store(&config, true).await.unwrap();
        let root = store.read_dir("/").await.unwrap();
        assert_eq!(root, vec!["chats", "debug", "invites", "objects", "types"]);
        assert!(store.stat("/objects").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn projection_provider_mounts_over_seeded_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = memory_config(dir.path());
        let store = open_store(&config, true).await.unwrap();
        let engine = Arc::new(InProcessEngine::default());
        let provider = Arc::new(
            CachingProvider::open(ProviderSettings::from(&config), store, engine.clone())
                .await
                .unwrap(),
        );

        provider.mount().await.unwrap();
        assert!(provider.is_mounted());
        assert!(dir.path().join("mnt").is_dir());
        let names: Vec<String> = provider
            .enumerate("/")
            .await
            .iter()
            .map(|e| e.name.clone())
            .collect();
        assert!(names.contains(&"chats".to_string()));
        provider.unmount().await.unwrap();
        assert!(!provider.is_mounted());
    }

    #[cfg(not(feature = "fuse"))]
    #[tokio::test]
    async fn fuse_mode_needs_the_feature() {
        let dir = tempfile::tempdir().unwrap();
        let config = memory_config(dir.path());
        let err = run(config, Mode::Fuse, true).await.unwrap_err();
        assert!(err.to_string().contains("fuse feature"));
    }
}
