//! Synchronous native callbacks → async provider tasks.
//!
//! A projection engine calls back on its own worker threads and expects an
//! answer in bounded time. Each callback enqueues a task on the tokio
//! runtime and blocks its thread on a channel with a timeout. Never call
//! into the bridge from a runtime worker thread.

use std::future::Future;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tracing::debug;

use filer_core::path::normalize_path;
use filer_core::{DirectoryEntry, FilerError, FilerResult};

use crate::provider::CachingProvider;

/// The callback surface a projection engine drives.
pub trait ProjectionCallbacks: Send + Sync {
    /// Children of `raw_path`. Never fails; worst case is an empty list.
    fn enumerate(&self, raw_path: &str) -> Vec<DirectoryEntry>;

    fn file_content(&self, raw_path: &str) -> FilerResult<Bytes>;
}

#[derive(Clone)]
pub struct BlockingBridge {
    runtime: Handle,
    timeout: Duration,
}

impl BlockingBridge {
    pub fn new(runtime: Handle, timeout: Duration) -> Self {
        BlockingBridge { runtime, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `fut` on the runtime and wait for it; on timeout the task is
    /// aborted and a `Timeout` error returned.
    pub fn call<T, F>(&self, operation: &str, fut: F) -> FilerResult<T>
    where
        T: Send + 'static,
        F: Future<Output = FilerResult<T>> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let task = self.runtime.spawn(async move {
            let _ = tx.send(fut.await);
        });
        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                task.abort();
                Err(FilerError::timeout(operation, self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(FilerError::Io(format!(
                "{operation} task ended without an answer"
            ))),
        }
    }

    /// Like [`call`](Self::call) but a timed-out task keeps running; its
    /// eventual result goes to `on_late` instead of the caller.
    pub fn call_or_detach<T, F, L>(&self, operation: &str, fut: F, on_late: L) -> FilerResult<T>
    where
        T: Send + 'static,
        F: Future<Output = FilerResult<T>> + Send + 'static,
        L: FnOnce(FilerResult<T>) + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let abandoned = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&abandoned);

        self.runtime.spawn(async move {
            let result = fut.await;
            let late = {
                let gone = flag.lock().unwrap_or_else(PoisonError::into_inner);
                if *gone {
                    Some(result)
                } else {
                    let _ = tx.send(result);
                    None
                }
            };
            if let Some(result) = late {
                on_late(result);
            }
        });

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                let mut gone = abandoned.lock().unwrap_or_else(PoisonError::into_inner);
                if let Ok(result) = rx.try_recv() {
                    return result;
                }
                *gone = true;
                Err(FilerError::timeout(operation, self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(FilerError::Io(format!(
                "{operation} task ended without an answer"
            ))),
        }
    }
}

/// [`ProjectionCallbacks`] backed by a [`CachingProvider`].
pub struct SyncProvider {
    provider: Arc<CachingProvider>,
    bridge: BlockingBridge,
    file_bridge: BlockingBridge,
}

impl SyncProvider {
    /// `enumeration_wait` bounds directory callbacks; file reads get
    /// `read_wait`.
    pub fn new(
        provider: Arc<CachingProvider>,
        runtime: Handle,
        enumeration_wait: Duration,
        read_wait: Duration,
    ) -> Self {
        SyncProvider {
            provider,
            bridge: BlockingBridge::new(runtime.clone(), enumeration_wait),
            file_bridge: BlockingBridge::new(runtime, read_wait),
        }
    }

    fn normalize(&self, raw: &str) -> String {
        normalize_path(raw, Some(self.provider.virtual_root()))
    }
}

impl ProjectionCallbacks for SyncProvider {
    fn enumerate(&self, raw_path: &str) -> Vec<DirectoryEntry> {
        let path = self.normalize(raw_path);
        let provider = Arc::clone(&self.provider);
        let late_provider = Arc::clone(&self.provider);
        let late_path = path.clone();
        let task_path = path.clone();

        let answer = self.bridge.call_or_detach(
            "enumerate",
            async move { Ok(provider.enumerate(&task_path).await) },
            move |late: FilerResult<_>| {
                if late.is_ok_and(|entries| !entries.is_empty()) {
                    debug!(path = %late_path, "late enumeration result, invalidating");
                    late_provider.invalidation().schedule(&late_path);
                }
            },
        );

        match answer {
            Ok(entries) => entries.as_ref().clone(),
            Err(e) => {
                debug!(path = %path, error = %e, "enumeration wait expired");
                self.provider
                    .stale_listing(&path)
                    .map(|l| l.as_ref().clone())
                    .unwrap_or_default()
            }
        }
    }

    fn file_content(&self, raw_path: &str) -> FilerResult<Bytes> {
        let path = self.normalize(raw_path);
        let provider = Arc::clone(&self.provider);
        self.file_bridge.call("provide_file_content", async move {
            provider
                .provide_file_content(&path)
                .await
                .map_err(|e| e.source)
        })
    }
}
