//! Error contextualization with a bounded rolling log.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use crate::context::now_millis;
use crate::error::{ContextualError, ErrorContext, FilerError};
use crate::types::SourceTree;

/// Default ring capacity.
pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 1000;

/// Window used for the recent error rate.
const RECENT_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub operation: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_tree: Option<SourceTree>,
    pub message: String,
    pub timestamp_ms: u64,
    /// Chain of underlying causes, outermost first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
    #[serde(skip)]
    recorded: Option<Instant>,
}

impl ErrorRecord {
    fn age(&self) -> Duration {
        self.recorded.map(|r| r.elapsed()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    pub total: usize,
    pub by_operation: BTreeMap<String, usize>,
    pub by_source_tree: BTreeMap<String, usize>,
    /// Errors per minute over the last five minutes.
    pub recent_rate: f64,
}

/// Wraps raw failures with operation/path/correlation context and keeps the
/// most recent ones for diagnostics.
pub struct ErrorContextualizer {
    log: Mutex<VecDeque<ErrorRecord>>,
    capacity: usize,
}

impl Default for ErrorContextualizer {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_LOG_CAPACITY)
    }
}

impl ErrorContextualizer {
    pub fn new(capacity: usize) -> Self {
        ErrorContextualizer {
            log: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ErrorRecord>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach `context` to `error`, record it and log it.
    pub fn wrap(&self, error: FilerError, context: ErrorContext) -> ContextualError {
        let wrapped = ContextualError {
            context,
            source: error,
        };

        let mut causes = Vec::new();
        let mut cur: Option<&dyn std::error::Error> = std::error::Error::source(&wrapped.source);
        while let Some(e) = cur {
            causes.push(e.to_string());
            cur = e.source();
        }

        let record = ErrorRecord {
            operation: wrapped.context.operation.clone(),
            path: wrapped.context.path.clone(),
            request_id: wrapped.context.request_id.clone(),
            source_tree: wrapped.context.source_tree,
            message: wrapped.source.to_string(),
            timestamp_ms: now_millis(),
            causes,
            recorded: Some(Instant::now()),
        };

        warn!(
            operation = %record.operation,
            path = %record.path,
            request_id = record.request_id.as_deref().unwrap_or("-"),
            "{wrapped}"
        );

        let mut log = self.lock();
        while log.len() >= self.capacity {
            log.pop_front();
        }
        log.push_back(record);
        drop(log);

        wrapped
    }

    /// The `count` most recent errors, oldest first.
    pub fn recent(&self, count: usize) -> Vec<ErrorRecord> {
        let log = self.lock();
        let skip = log.len().saturating_sub(count);
        log.iter().skip(skip).cloned().collect()
    }

    /// Errors recorded for `path` or anything below it.
    pub fn by_path(&self, path: &str) -> Vec<ErrorRecord> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.lock()
            .iter()
            .filter(|e| e.path == path || path == "/" || e.path.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn by_operation(&self, operation: &str) -> Vec<ErrorRecord> {
        self.lock()
            .iter()
            .filter(|e| e.operation == operation)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> ErrorStats {
        let log = self.lock();
        let mut stats = ErrorStats {
            total: log.len(),
            ..Default::default()
        };
        let mut recent = 0usize;
        for e in log.iter() {
            *stats.by_operation.entry(e.operation.clone()).or_default() += 1;
            if let Some(tree) = e.source_tree {
                *stats.by_source_tree.entry(tree.to_string()).or_default() += 1;
            }
            if e.age() < RECENT_WINDOW {
                recent += 1;
            }
        }
        stats.recent_rate = recent as f64 / (RECENT_WINDOW.as_secs() / 60) as f64;
        stats
    }

    /// Drop records older than `max_age`. Returns how many were removed.
    pub fn clear_older_than(&self, max_age: Duration) -> usize {
        let mut log = self.lock();
        let before = log.len();
        log.retain(|e| e.age() < max_age);
        before - log.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
