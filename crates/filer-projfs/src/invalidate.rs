//! Debounced "this directory changed" signals to the native engine.
//!
//! Repeated schedules for one path inside the window collapse into a single
//! signal. Each pending timer carries a generation number; a timer that
//! wakes up after being superseded does nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::{InvalidationCapability, NativeEngine};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationStats {
    pub pending: usize,
    pub delivered: u64,
    pub delay_ms: u64,
}

struct Pending {
    generation: u64,
    timer: JoinHandle<()>,
}

struct Inner {
    engine: Arc<dyn NativeEngine>,
    capability: InvalidationCapability,
    delay_ms: AtomicU64,
    next_generation: AtomicU64,
    delivered: AtomicU64,
    pending: Mutex<HashMap<String, Pending>>,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, path: &str) {
        let result = match self.capability {
            InvalidationCapability::InvalidateDirectory => self.engine.invalidate_directory(path),
            InvalidationCapability::DataReady => self.engine.directory_data_ready(path),
            InvalidationCapability::None => {
                debug!(path, engine = self.engine.name(), "engine cannot be invalidated");
                return;
            }
        };
        match result {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(path, "directory invalidated");
            }
            Err(e) => warn!(path, error = %e, "invalidation failed"),
        }
    }
}

#[derive(Clone)]
pub struct InvalidationCoordinator {
    inner: Arc<Inner>,
}

impl InvalidationCoordinator {
    pub fn new(engine: Arc<dyn NativeEngine>, delay: Duration) -> Self {
        let capability = engine.invalidation();
        InvalidationCoordinator {
            inner: Arc::new(Inner {
                engine,
                capability,
                delay_ms: AtomicU64::new(delay.as_millis() as u64),
                next_generation: AtomicU64::new(1),
                delivered: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn capability(&self) -> InvalidationCapability {
        self.inner.capability
    }

    /// Signal `path` after the debounce window, replacing any pending timer.
    ///
    /// Outside a tokio runtime the signal is delivered immediately.
    pub fn schedule(&self, path: &str) {
        let Ok(runtime) = Handle::try_current() else {
            self.invalidate_now(path);
            return;
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let delay = self.delay();
        let inner = Arc::clone(&self.inner);
        let key = path.to_string();

        let mut pending = self.inner.pending();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let fire = {
                let mut pending = inner.pending();
                match pending.get(&key) {
                    Some(p) if p.generation == generation => {
                        pending.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if fire {
                inner.deliver(&key);
            }
        });
        if let Some(old) = pending.insert(path.to_string(), Pending { generation, timer }) {
            old.timer.abort();
        }
    }

    /// Signal `path` right away, dropping any pending timer for it.
    pub fn invalidate_now(&self, path: &str) {
        if let Some(old) = self.inner.pending().remove(path) {
            old.timer.abort();
        }
        self.inner.deliver(path);
    }

    pub fn cancel_all(&self) -> usize {
        let mut pending = self.inner.pending();
        let n = pending.len();
        for (_, p) in pending.drain() {
            p.timer.abort();
        }
        n
    }

    pub fn set_delay(&self, delay: Duration) {
        self.inner
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.inner.delay_ms.load(Ordering::Relaxed))
    }

    pub fn pending(&self) -> usize {
        self.inner.pending().len()
    }

    pub fn stats(&self) -> InvalidationStats {
        InvalidationStats {
            pending: self.pending(),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            delay_ms: self.inner.delay_ms.load(Ordering::Relaxed),
        }
    }
}
