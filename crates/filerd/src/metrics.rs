//! Prometheus /metrics + health and diagnostics HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics              Prometheus text format
//!   GET /healthz              Liveness probe (always 200 if process is running)
//!   GET /readyz               Readiness probe (200 if the store root is populated)
//!   GET /stats                JSON snapshot of caches, telemetry and store calls
//!   GET /telemetry            Aggregate request stats and recent errors
//!   GET /telemetry/{id}       One request's context, telemetry and sub-tree
//!   GET /browse/{*path}       Directory listing through the projection callbacks

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::Serialize;

use filer_fuse::{AdapterStats, WriteBufferAdapter};
use filer_projfs::{CachingProvider, ProjectionCallbacks, ProviderStats, TelemetryView};
use filer_store::{MeteredStore, OpendalStore, StoreCounters};

/// What is serving the mount.
#[derive(Clone)]
pub enum Frontend {
    Projection(Arc<CachingProvider>),
    Fuse(Arc<WriteBufferAdapter>),
}

/// Shared state behind every handler
#[derive(Clone)]
pub struct DiagnosticsState {
    pub metrics: Arc<Metrics>,
    pub store: Arc<MeteredStore<OpendalStore>>,
    pub frontend: Frontend,
    /// Present in projection mode.
    pub callbacks: Option<Arc<dyn ProjectionCallbacks>>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OpLabels {
    op: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CacheLabels {
    cache: String,
}

/// Gauges refreshed from the live snapshots on every scrape.
pub struct Metrics {
    registry: Registry,
    active_requests: Gauge,
    requests: Gauge,
    request_duration_ms: Gauge<f64, AtomicU64>,
    request_error_rate: Gauge<f64, AtomicU64>,
    cache_entries: Family<CacheLabels, Gauge>,
    cache_hit_rate: Family<CacheLabels, Gauge<f64, AtomicU64>>,
    content_bytes: Gauge,
    errors: Gauge,
    store_calls: Family<OpLabels, Gauge>,
    committed_files: Gauge,
    open_writes: Gauge,
    buffered_writes: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut m = Metrics {
            registry: Registry::with_prefix("filer"),
            active_requests: Gauge::default(),
            requests: Gauge::default(),
            request_duration_ms: Gauge::default(),
            request_error_rate: Gauge::default(),
            cache_entries: Family::default(),
            cache_hit_rate: Family::default(),
            content_bytes: Gauge::default(),
            errors: Gauge::default(),
            store_calls: Family::default(),
            committed_files: Gauge::default(),
            open_writes: Gauge::default(),
            buffered_writes: Gauge::default(),
        };
        m.registry.register(
            "active_requests",
            "Requests with an open context",
            m.active_requests.clone(),
        );
        m.registry.register(
            "requests",
            "Requests with recorded telemetry",
            m.requests.clone(),
        );
        m.registry.register(
            "request_duration_ms",
            "Average duration of finished requests",
            m.request_duration_ms.clone(),
        );
        m.registry.register(
            "request_error_rate",
            "Share of finished requests that failed",
            m.request_error_rate.clone(),
        );
        m.registry.register(
            "cache_entries",
            "Entries held per cache",
            m.cache_entries.clone(),
        );
        m.registry.register(
            "cache_hit_rate",
            "Hit rate per cache",
            m.cache_hit_rate.clone(),
        );
        m.registry.register(
            "content_cache_bytes",
            "Bytes held by the content cache",
            m.content_bytes.clone(),
        );
        m.registry.register(
            "logged_errors",
            "Contextual errors currently retained",
            m.errors.clone(),
        );
        m.registry.register(
            "store_calls",
            "Backing store calls by operation",
            m.store_calls.clone(),
        );
        m.registry.register(
            "committed_files",
            "Write buffers committed to the store",
            m.committed_files.clone(),
        );
        m.registry.register(
            "open_writes",
            "Write descriptors currently open",
            m.open_writes.clone(),
        );
        m.registry.register(
            "buffered_writes",
            "Write buffers waiting for release",
            m.buffered_writes.clone(),
        );
        m
    }

    fn refresh(&self, state: &DiagnosticsState) {
        let counters = state.store.counters();
        for (op, value) in [
            ("read_dir", counters.read_dir),
            ("stat", counters.stat),
            ("read_file", counters.read_file),
            ("read_chunk", counters.read_chunk),
            ("write", counters.writes),
            ("error", counters.errors),
        ] {
            self.store_calls
                .get_or_create(&OpLabels { op: op.into() })
                .set(clamp(value));
        }

        match &state.frontend {
            Frontend::Projection(provider) => {
                let s = provider.stats();
                self.active_requests.set(clamp(s.telemetry.active_requests as u64));
                self.requests.set(clamp(s.telemetry.total_requests as u64));
                self.request_duration_ms.set(s.telemetry.average_duration_ms);
                self.request_error_rate.set(s.telemetry.error_rate);
                self.errors.set(clamp(s.errors.total as u64));
                self.content_bytes.set(clamp(s.content_cache.total_bytes));
                for (cache, entries, hit_rate) in [
                    ("directory", s.directory_cache.entries, Some(s.directory_cache.hit_rate)),
                    ("content", s.content_cache.cache.entries, Some(s.content_cache.cache.hit_rate)),
                    ("persistent", s.persistent.directories + s.persistent.files, None),
                ] {
                    let labels = CacheLabels { cache: cache.into() };
                    self.cache_entries
                        .get_or_create(&labels)
                        .set(clamp(entries as u64));
                    if let Some(rate) = hit_rate {
                        self.cache_hit_rate.get_or_create(&labels).set(rate);
                    }
                }
            }
            Frontend::Fuse(adapter) => {
                let s = adapter.stats();
                self.committed_files.set(clamp(s.committed));
                self.open_writes.set(clamp(s.open_writes as u64));
                self.buffered_writes.set(clamp(s.buffered as u64));
            }
        }
    }

    fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut body = String::new();
        encode(&mut body, &self.registry)?;
        Ok(body)
    }
}

fn clamp(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

#[derive(Serialize)]
struct StatsView {
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<ProviderStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    adapter: Option<AdapterStats>,
    store: StoreCounters,
}

pub fn router(state: DiagnosticsState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/stats", get(stats_handler))
        .route("/telemetry", get(telemetry_handler))
        .route("/telemetry/{request_id}", get(request_telemetry_handler))
        .route("/browse", get(browse_root_handler))
        .route("/browse/{*path}", get(browse_handler))
        .with_state(state)
}

/// Serve metrics, health and diagnostics on `addr` (e.g. "127.0.0.1:9110")
pub async fn serve(addr: String, state: DiagnosticsState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz, /stats, /telemetry");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn metrics_handler(State(state): State<DiagnosticsState>) -> impl IntoResponse {
    state.metrics.refresh(&state);
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness probe: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe: returns 200 if the store root lists children, 503 otherwise.
async fn readyz_handler(State(state): State<DiagnosticsState>) -> impl IntoResponse {
    match filer_store::check_health(state.store.as_ref()).await {
        Ok(_) => (StatusCode::OK, "ready".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

async fn stats_handler(State(state): State<DiagnosticsState>) -> Json<StatsView> {
    let store = state.store.counters();
    Json(match &state.frontend {
        Frontend::Projection(provider) => StatsView {
            mode: "projection",
            provider: Some(provider.stats()),
            adapter: None,
            store,
        },
        Frontend::Fuse(adapter) => StatsView {
            mode: "fuse",
            provider: None,
            adapter: Some(adapter.stats()),
            store,
        },
    })
}

async fn telemetry_handler(State(state): State<DiagnosticsState>) -> Response {
    match &state.frontend {
        Frontend::Projection(provider) => Json(provider.telemetry(None)).into_response(),
        Frontend::Fuse(_) => no_telemetry(),
    }
}

async fn request_telemetry_handler(
    State(state): State<DiagnosticsState>,
    Path(request_id): Path<String>,
) -> Response {
    let Frontend::Projection(provider) = &state.frontend else {
        return no_telemetry();
    };
    match provider.telemetry(Some(&request_id)) {
        TelemetryView::Request(t) if t.context.is_none() && t.telemetry.is_empty() => (
            StatusCode::NOT_FOUND,
            format!("unknown request {request_id}"),
        )
            .into_response(),
        view => Json(view).into_response(),
    }
}

async fn browse_root_handler(State(state): State<DiagnosticsState>) -> Response {
    browse(state, "/".to_string()).await
}

async fn browse_handler(
    State(state): State<DiagnosticsState>,
    Path(path): Path<String>,
) -> Response {
    browse(state, path).await
}

/// The callbacks block their thread, so they run on the blocking pool.
async fn browse(state: DiagnosticsState, path: String) -> Response {
    let Some(callbacks) = state.callbacks else {
        return (
            StatusCode::NOT_FOUND,
            "browsing is only available in projection mode",
        )
            .into_response();
    };
    match tokio::task::spawn_blocking(move || callbacks.enumerate(&path)).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn no_telemetry() -> Response {
    (
        StatusCode::NOT_FOUND,
        "request telemetry is only tracked in projection mode",
    )
        .into_response()
}
