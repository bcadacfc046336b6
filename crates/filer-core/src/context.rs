//! Request correlation and telemetry.
//!
//! Every native-engine callback gets a [`RequestContext`] with a fresh id.
//! Telemetry is recorded per request and operation; a parent id links
//! recursive enumerations into a tree that can be inspected later.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::types::{Priority, RequestKind, SourceTree};

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestContext {
    pub request_id: String,
    pub kind: RequestKind,
    pub depth: u32,
    pub priority: Priority,
    pub created_at_ms: u64,
    pub virtual_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_tree: Option<SourceTree>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(skip)]
    created: Option<Instant>,
}

/// Optional fields for [`RequestContextTracker::create_context`].
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub depth: u32,
    pub priority: Option<Priority>,
    pub parent_request_id: Option<String>,
    pub source_tree: Option<SourceTree>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryResult {
    Success,
    Error,
    Cached,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRecord {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_request_id: Option<String>,
    pub operation: String,
    pub path: String,
    pub started_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
    pub result: TelemetryResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip)]
    started: Option<Instant>,
}

impl TelemetryRecord {
    pub fn is_finished(&self) -> bool {
        self.ended_at_ms.is_some()
    }

    fn age(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestStats {
    pub active_requests: usize,
    pub total_requests: usize,
    pub average_duration_ms: f64,
    pub error_rate: f64,
    pub cache_hit_rate: f64,
}

/// Everything known about one request: its context if still active, its
/// own telemetry, and the telemetry of every descendant.
#[derive(Debug, Clone, Serialize)]
pub struct RequestTelemetry {
    pub request_id: String,
    pub context: Option<RequestContext>,
    pub telemetry: Vec<TelemetryRecord>,
    pub tree: Vec<TelemetryRecord>,
}

/// Running aggregates over finished telemetry records.
#[derive(Debug, Default)]
struct Totals {
    completed: usize,
    errors: usize,
    hits: usize,
    duration_ms: u64,
}

impl Totals {
    fn add(&mut self, rec: &TelemetryRecord) {
        if !rec.is_finished() {
            return;
        }
        self.completed += 1;
        match rec.result {
            TelemetryResult::Error => self.errors += 1,
            TelemetryResult::Cached => self.hits += 1,
            TelemetryResult::Success => {}
        }
        self.duration_ms += rec.duration_ms.unwrap_or(0);
    }

    fn remove(&mut self, rec: &TelemetryRecord) {
        if !rec.is_finished() {
            return;
        }
        self.completed = self.completed.saturating_sub(1);
        match rec.result {
            TelemetryResult::Error => self.errors = self.errors.saturating_sub(1),
            TelemetryResult::Cached => self.hits = self.hits.saturating_sub(1),
            TelemetryResult::Success => {}
        }
        self.duration_ms = self
            .duration_ms
            .saturating_sub(rec.duration_ms.unwrap_or(0));
    }
}

#[derive(Default)]
struct TrackerState {
    active: HashMap<String, RequestContext>,
    /// request id → operation → record
    telemetry: HashMap<String, HashMap<String, TelemetryRecord>>,
    records: usize,
    totals: Totals,
    /// parent request id → child request ids
    hierarchy: HashMap<String, Vec<String>>,
}

/// Thread-safe registry of request contexts and telemetry.
#[derive(Default)]
pub struct RequestContextTracker {
    state: Mutex<TrackerState>,
}

impl RequestContextTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new context for an externally-triggered operation.
    pub fn create_context(
        &self,
        kind: RequestKind,
        path: &str,
        options: ContextOptions,
    ) -> RequestContext {
        let ctx = RequestContext {
            request_id: uuid::Uuid::new_v4().to_string(),
            kind,
            depth: options.depth,
            priority: options.priority.unwrap_or(Priority::Normal),
            created_at_ms: now_millis(),
            virtual_path: path.to_string(),
            parent_request_id: options.parent_request_id,
            source_tree: options.source_tree,
            metadata: BTreeMap::new(),
            created: Some(Instant::now()),
        };

        let mut state = self.lock();
        if let Some(parent) = &ctx.parent_request_id {
            state
                .hierarchy
                .entry(parent.clone())
                .or_default()
                .push(ctx.request_id.clone());
        }
        state.active.insert(ctx.request_id.clone(), ctx.clone());
        ctx
    }

    pub fn start_telemetry(&self, ctx: &RequestContext, operation: &str) {
        let record = TelemetryRecord {
            request_id: ctx.request_id.clone(),
            parent_request_id: ctx.parent_request_id.clone(),
            operation: operation.to_string(),
            path: ctx.virtual_path.clone(),
            started_at_ms: now_millis(),
            ended_at_ms: None,
            result: TelemetryResult::Success,
            error_message: None,
            duration_ms: None,
            started: Some(Instant::now()),
        };
        let mut guard = self.lock();
        let state = &mut *guard;
        let ops = state.telemetry.entry(ctx.request_id.clone()).or_default();
        match ops.insert(operation.to_string(), record) {
            Some(old) => state.totals.remove(&old),
            None => state.records += 1,
        }
    }

    /// Finalize one operation's telemetry. The context stops being active
    /// once none of its operations remain open.
    pub fn end_telemetry(
        &self,
        request_id: &str,
        operation: &str,
        result: TelemetryResult,
        error_message: Option<String>,
    ) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let still_open = match state.telemetry.get_mut(request_id) {
            Some(ops) => {
                if let Some(record) = ops.get_mut(operation) {
                    state.totals.remove(record);
                    let elapsed = record.age();
                    record.ended_at_ms = Some(now_millis());
                    record.duration_ms = Some(elapsed.as_millis() as u64);
                    record.result = result;
                    record.error_message = error_message;
                    state.totals.add(record);
                }
                ops.values().any(|rec| !rec.is_finished())
            }
            None => false,
        };
        if !still_open {
            state.active.remove(request_id);
        }
    }

    pub fn context(&self, request_id: &str) -> Option<RequestContext> {
        self.lock().active.get(request_id).cloned()
    }

    /// All telemetry records of one request, ordered by start time.
    pub fn telemetry(&self, request_id: &str) -> Vec<TelemetryRecord> {
        let state = self.lock();
        collect_for(&state, request_id)
    }

    pub fn children(&self, request_id: &str) -> Vec<String> {
        self.lock()
            .hierarchy
            .get(request_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Telemetry of a request and all of its descendants.
    pub fn request_tree(&self, request_id: &str) -> Vec<TelemetryRecord> {
        let state = self.lock();
        let mut out = Vec::new();
        let mut stack = vec![request_id.to_string()];
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            out.extend(collect_for(&state, &id));
            if let Some(children) = state.hierarchy.get(&id) {
                stack.extend(children.iter().rev().cloned());
            }
        }
        out
    }

    pub fn request_telemetry(&self, request_id: &str) -> RequestTelemetry {
        RequestTelemetry {
            request_id: request_id.to_string(),
            context: self.context(request_id),
            telemetry: self.telemetry(request_id),
            tree: self.request_tree(request_id),
        }
    }

    pub fn stats(&self) -> RequestStats {
        let state = self.lock();
        let totals = &state.totals;
        let n = totals.completed;
        if n == 0 {
            return RequestStats {
                active_requests: state.active.len(),
                total_requests: state.records,
                ..Default::default()
            };
        }

        RequestStats {
            active_requests: state.active.len(),
            total_requests: state.records,
            average_duration_ms: totals.duration_ms as f64 / n as f64,
            error_rate: totals.errors as f64 / n as f64,
            cache_hit_rate: totals.hits as f64 / n as f64,
        }
    }

    /// Drop telemetry and orphaned contexts older than `max_age`.
    /// Returns the number of telemetry records removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let mut guard = self.lock();
        let TrackerState {
            active,
            telemetry,
            records,
            totals,
            hierarchy,
        } = &mut *guard;

        let mut removed = 0;
        telemetry.retain(|id, ops| {
            let before = ops.len();
            ops.retain(|_, rec| {
                let keep = rec.age() < max_age;
                if !keep {
                    totals.remove(rec);
                }
                keep
            });
            if ops.len() < before {
                removed += before - ops.len();
                hierarchy.remove(id);
            }
            !ops.is_empty()
        });
        *records -= removed;
        active.retain(|_, ctx| ctx.created.map(|c| c.elapsed() < max_age).unwrap_or(false));

        removed
    }

    /// Forget every tracked context; used on unmount.
    pub fn release_all(&self) -> usize {
        let mut state = self.lock();
        let n = state.active.len();
        state.active.clear();
        n
    }
}

fn collect_for(state: &TrackerState, request_id: &str) -> Vec<TelemetryRecord> {
    let mut records: Vec<TelemetryRecord> = state
        .telemetry
        .get(request_id)
        .map(|ops| ops.values().cloned().collect())
        .unwrap_or_default();
    records.sort_by_key(|r| r.started);
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enumeration(tracker: &RequestContextTracker, path: &str) -> RequestContext {
        tracker.create_context(RequestKind::Enumeration, path, ContextOptions::default())
    }

    #[test]
    fn ids_are_unique() {
        let tracker = RequestContextTracker::new();
        let a = enumeration(&tracker, "/");
        let b = enumeration(&tracker, "/");
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(tracker.stats().active_requests, 2);
    }

    #[test]
    fn telemetry_per_operation() {
        let tracker = RequestContextTracker::new();
        let ctx = enumeration(&tracker, "/chats");
        tracker.start_telemetry(&ctx, "readDir");
        tracker.start_telemetry(&ctx, "stat");

        tracker.end_telemetry(&ctx.request_id, "readDir", TelemetryResult::Success, None);
        assert!(tracker.context(&ctx.request_id).is_some(), "stat still open");

        tracker.end_telemetry(
            &ctx.request_id,
            "stat",
            TelemetryResult::Error,
            Some("boom".into()),
        );
        assert!(tracker.context(&ctx.request_id).is_none());

        let records = tracker.telemetry(&ctx.request_id);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.is_finished()));

        let stats = tracker.stats();
        assert_eq!(stats.total_requests, 2);
        assert!((stats.error_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn request_tree_follows_children() {
        let tracker = RequestContextTracker::new();
        let root = enumeration(&tracker, "/");
        tracker.start_telemetry(&root, "enumerate");

        let child = tracker.create_context(
            RequestKind::Enumeration,
            "/chats",
            ContextOptions {
                depth: 1,
                parent_request_id: Some(root.request_id.clone()),
                ..Default::default()
            },
        );
        tracker.start_telemetry(&child, "enumerate");
        let grandchild = tracker.create_context(
            RequestKind::Stat,
            "/chats/a",
            ContextOptions {
                depth: 2,
                parent_request_id: Some(child.request_id.clone()),
                ..Default::default()
            },
        );
        tracker.start_telemetry(&grandchild, "stat");

        assert_eq!(tracker.children(&root.request_id), vec![child.request_id.clone()]);
        let tree = tracker.request_tree(&root.request_id);
        let paths: Vec<&str> = tree.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/", "/chats", "/chats/a"]);
    }

    #[test]
    fn cached_results_count_as_hits() {
        let tracker = RequestContextTracker::new();
        for result in [TelemetryResult::Cached, TelemetryResult::Success] {
            let ctx = enumeration(&tracker, "/");
            tracker.start_telemetry(&ctx, "enumerate");
            tracker.end_telemetry(&ctx.request_id, "enumerate", result, None);
        }
        let stats = tracker.stats();
        assert!((stats.cache_hit_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.active_requests, 0);
    }

    #[test]
    fn cleanup_ages_out_records() {
        let tracker = RequestContextTracker::new();
        let ctx = enumeration(&tracker, "/");
        tracker.start_telemetry(&ctx, "enumerate");

        assert_eq!(tracker.cleanup(Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(tracker.cleanup(Duration::from_millis(10)), 1);
        assert!(tracker.telemetry(&ctx.request_id).is_empty());
        assert_eq!(tracker.stats().active_requests, 0);
    }

    #[test]
    fn release_all_clears_active() {
        let tracker = RequestContextTracker::new();
        enumeration(&tracker, "/a");
        enumeration(&tracker, "/b");
        assert_eq!(tracker.release_all(), 2);
        assert_eq!(tracker.stats().active_requests, 0);
    }

    #[test]
    fn restarted_operation_replaces_its_totals() {
        let tracker = RequestContextTracker::new();
        let ctx = enumeration(&tracker, "/debug");
        tracker.start_telemetry(&ctx, "readDir");
        tracker.end_telemetry(&ctx.request_id, "readDir", TelemetryResult::Error, None);
        tracker.start_telemetry(&ctx, "readDir");
        tracker.end_telemetry(&ctx.request_id, "readDir", TelemetryResult::Cached, None);

        let stats = tracker.stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.error_rate, 0.0);
        assert_eq!(stats.cache_hit_rate, 1.0);

        std::thread::sleep(Duration::from_millis(20));
        tracker.cleanup(Duration::from_millis(10));
        assert_eq!(tracker.stats(), RequestStats::default());
    }

    #[test]
    fn long_history_does_not_slow_callbacks() {
        let tracker = RequestContextTracker::new();
        let started = Instant::now();
        for _ in 0..50_000 {
            let ctx = enumeration(&tracker, "/objects");
            tracker.start_telemetry(&ctx, "enumerate");
            tracker.end_telemetry(&ctx.request_id, "enumerate", TelemetryResult::Success, None);
        }
        for _ in 0..1_000 {
            let ctx = enumeration(&tracker, "/chats");
            tracker.start_telemetry(&ctx, "enumerate");
            tracker.end_telemetry(&ctx.request_id, "enumerate", TelemetryResult::Cached, None);
        }
        assert!(started.elapsed() < Duration::from_secs(10));

        let stats = tracker.stats();
        assert_eq!(stats.total_requests, 51_000);
        assert_eq!(stats.active_requests, 0);
        assert!((stats.cache_hit_rate - 1_000.0 / 51_000.0).abs() < 1e-9);
    }
}
