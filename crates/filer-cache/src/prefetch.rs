//! Best-effort, bounded-concurrency warming of the directory and content caches.
//!
//! A work queue is seeded with paths; up to `parallel_limit` directory
//! fetches run at once, each raced against `timeout`. Subdirectories are
//! queued while depth remains, files are read in small batches so the
//! content cache is warm too. Nothing here ever returns an error.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info};

use filer_core::config::PrefetchConfig;
use filer_core::path::{join_child, normalize_path};

use crate::content::ContentCache;
use crate::directory::{DirectoryCache, Listing};
use crate::persistent::AccessLog;
use crate::resolve::DirectoryResolver;

#[derive(Debug, Clone)]
pub struct PrefetchOptions {
    /// Levels to walk, counting the seed path itself.
    pub max_depth: usize,
    pub parallel_limit: usize,
    pub timeout: Duration,
    pub content_batch: usize,
}

impl Default for PrefetchOptions {
    fn default() -> Self {
        PrefetchOptions::from(&PrefetchConfig::default())
    }
}

impl From<&PrefetchConfig> for PrefetchOptions {
    fn from(cfg: &PrefetchConfig) -> Self {
        PrefetchOptions {
            max_depth: cfg.max_depth,
            parallel_limit: cfg.parallel_limit,
            timeout: cfg.timeout(),
            content_batch: cfg.content_batch,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchReport {
    pub directories: usize,
    pub files_warmed: usize,
    pub failures: usize,
    pub timeouts: usize,
    pub peak_in_flight: usize,
}

#[derive(Default)]
struct FetchOutcome {
    subdirs: Vec<String>,
    files_warmed: usize,
    fetched: bool,
    failed: bool,
    timed_out: bool,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct PrefetchScheduler {
    resolver: DirectoryResolver,
    directories: Arc<DirectoryCache>,
    content: Arc<ContentCache>,
    gathered: Arc<Mutex<HashMap<String, Listing>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl PrefetchScheduler {
    pub fn new(
        resolver: DirectoryResolver,
        directories: Arc<DirectoryCache>,
        content: Arc<ContentCache>,
    ) -> Self {
        PrefetchScheduler {
            resolver,
            directories,
            content,
            gathered: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn gathered(&self) -> MutexGuard<'_, HashMap<String, Listing>> {
        self.gathered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Root plus each structural directory.
    pub fn standard_paths(&self) -> Vec<String> {
        std::iter::once("/".to_string())
            .chain(
                self.resolver
                    .structural_dirs()
                    .iter()
                    .map(|name| join_child("/", name)),
            )
            .collect()
    }

    /// Walk `paths` and warm the caches. Never fails.
    pub async fn prefetch(&self, paths: &[String], opts: &PrefetchOptions) -> PrefetchReport {
        let limit = opts.parallel_limit.max(1);
        let mut report = PrefetchReport::default();
        let mut queue: VecDeque<(String, usize)> = paths
            .iter()
            .map(|p| (normalize_path(p, None), opts.max_depth.max(1)))
            .collect();
        let mut seen: HashSet<String> = HashSet::new();
        let mut tasks: JoinSet<(usize, FetchOutcome)> = JoinSet::new();
        self.peak.store(0, Ordering::SeqCst);

        loop {
            while tasks.len() < limit {
                let Some((path, depth)) = queue.pop_front() else {
                    break;
                };
                if !seen.insert(path.clone()) {
                    continue;
                }
                let this = self.clone();
                let opts = opts.clone();
                tasks.spawn(async move {
                    let outcome = this.fetch_one(&path, &opts).await;
                    (depth, outcome)
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (depth, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    debug!(error = %e, "prefetch task aborted");
                    report.failures += 1;
                    continue;
                }
            };

            report.directories += usize::from(outcome.fetched);
            report.failures += usize::from(outcome.failed);
            report.timeouts += usize::from(outcome.timed_out);
            report.files_warmed += outcome.files_warmed;

            if depth > 1 {
                for child in outcome.subdirs {
                    if !seen.contains(&child) && !self.directories.contains_fresh(&child) {
                        queue.push_back((child, depth - 1));
                    }
                }
            }
        }

        report.peak_in_flight = self.peak.load(Ordering::SeqCst);
        info!(
            directories = report.directories,
            files = report.files_warmed,
            failures = report.failures,
            timeouts = report.timeouts,
            "prefetch finished"
        );
        report
    }

    /// Standard paths plus the most frequently accessed ones.
    pub async fn smart_prefetch(
        &self,
        access_log: Option<&AccessLog>,
        hot_paths: usize,
        opts: &PrefetchOptions,
    ) -> PrefetchReport {
        let mut paths = self.standard_paths();
        if let Some(log) = access_log {
            for hot in log.top(hot_paths) {
                if !paths.contains(&hot) {
                    paths.push(hot);
                }
            }
        }
        debug!(count = paths.len(), "smart prefetch");
        self.prefetch(&paths, opts).await
    }

    async fn fetch_one(&self, path: &str, opts: &PrefetchOptions) -> FetchOutcome {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let mut outcome = FetchOutcome::default();
        let entries = match timeout(opts.timeout, self.resolver.resolve(path, None)).await {
            Err(_) => {
                debug!(path, "prefetch timed out");
                outcome.timed_out = true;
                return outcome;
            }
            Ok(Err(e)) => {
                debug!(path, error = %e, "prefetch skipped");
                outcome.failed = true;
                return outcome;
            }
            Ok(Ok(entries)) => entries,
        };
        outcome.fetched = true;

        let listing = self.directories.put(path, entries);
        self.gathered().insert(path.to_string(), listing.clone());

        let policy = self.directories.policy();
        let mut files = Vec::new();
        for entry in listing.iter() {
            let child = join_child(path, &entry.name);
            if entry.is_directory {
                outcome.subdirs.push(child);
            } else if policy.should_cache_content(&child, entry) {
                files.push(child);
            }
        }

        let store = self.resolver.store();
        for batch in files.chunks(opts.content_batch.max(1)) {
            let reads = batch.iter().map(|child| async move {
                match timeout(opts.timeout, store.read_file(child)).await {
                    Ok(Ok(bytes)) => self.content.put(child, bytes),
                    Ok(Err(e)) => {
                        debug!(path = %child, error = %e, "content warm skipped");
                        false
                    }
                    Err(_) => {
                        debug!(path = %child, "content warm timed out");
                        false
                    }
                }
            });
            outcome.files_warmed += join_all(reads).await.into_iter().filter(|ok| *ok).count();
        }
        outcome
    }

    /// Listings gathered by prefetch, for pushing into a native cache.
    pub fn cached_entries(&self) -> HashMap<String, Listing> {
        self.gathered().clone()
    }

    pub fn clear(&self) {
        self.gathered().clear();
    }
}
