use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::remote::MetricsCallback;

const NAMESPACE: &str = "vera";

/// Produces the JSON body served at /stats.
pub type StatsProvider = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Prometheus metrics for pipeline health.
///
/// All metrics use the "vera" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    stats: parking_lot::Mutex<Option<StatsProvider>>,

    // === Collection ===
    /// Samples that passed validation.
    pub samples_collected: Counter,
    /// Samples rejected by validation, by offending field.
    pub samples_rejected: CounterVec,
    /// Ticks where the metric source failed.
    pub source_errors: Counter,
    /// Anomalies detected, by kind.
    pub anomalies: CounterVec,
    /// Whether collection is paused (1=yes, 0=no).
    pub paused: Gauge,

    // === Batching ===
    /// Flushes attempted, by reason.
    pub flushes: CounterVec,
    /// Wall time of a batch flush.
    pub flush_duration: Histogram,
    /// Records delivered by batch flushes.
    pub records_flushed: Counter,
    /// Records currently held in the batch.
    pub batch_size: Gauge,

    // === Offline queue and sync ===
    /// Records handed to the offline queue.
    pub records_queued: Counter,
    /// Records delivered from the offline queue.
    pub records_synced: Counter,
    /// Records removed from the queue without delivery, by reason.
    pub records_dropped: CounterVec,
    /// Entries in the offline queue.
    pub queue_size: Gauge,
    /// Sync passes that reached the remote.
    pub sync_passes: Counter,
    /// Wall time of a sync pass.
    pub sync_duration: Histogram,

    // === Remote ===
    /// Whether the remote store is reachable (1=yes, 0=no).
    pub online: Gauge,
    /// Remote failures by operation and error_type.
    pub remote_errors: CounterVec,
    /// Remote requests by operation and status.
    pub remote_requests_total: CounterVec,
    /// Remote request latency by operation.
    pub remote_request_duration: HistogramVec,

    // === Storage ===
    /// Local persistence failures by error_type.
    pub persistence_errors: CounterVec,
}

fn counter(name: &str, help: &str) -> Result<Counter> {
    Ok(Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> Result<CounterVec> {
    Ok(CounterVec::new(
        Opts::new(name, help).namespace(NAMESPACE),
        labels,
    )?)
}

fn gauge(name: &str, help: &str) -> Result<Gauge> {
    Ok(Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> Result<Histogram> {
    Ok(Histogram::with_opts(
        HistogramOpts::new(name, help)
            .namespace(NAMESPACE)
            .buckets(buckets),
    )?)
}

fn latency_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let samples_collected = counter(
            "samples_collected_total",
            "Samples that passed validation.",
        )?;
        let samples_rejected = counter_vec(
            "samples_rejected_total",
            "Samples rejected by validation.",
            &["field"],
        )?;
        let source_errors = counter(
            "source_errors_total",
            "Collection ticks where the metric source failed.",
        )?;
        let anomalies = counter_vec("anomalies_total", "Anomalies detected.", &["kind"])?;
        let paused = gauge("paused", "Whether collection is paused (1=yes, 0=no).")?;

        let flushes = counter_vec("flushes_total", "Batch flushes attempted.", &["reason"])?;
        let flush_duration = histogram(
            "flush_duration_seconds",
            "Wall time of a batch flush.",
            latency_buckets(),
        )?;
        let records_flushed = counter(
            "records_flushed_total",
            "Records delivered by batch flushes.",
        )?;
        let batch_size = gauge("batch_size", "Records currently held in the batch.")?;

        let records_queued = counter(
            "records_queued_total",
            "Records handed to the offline queue.",
        )?;
        let records_synced = counter(
            "records_synced_total",
            "Records delivered from the offline queue.",
        )?;
        let records_dropped = counter_vec(
            "records_dropped_total",
            "Records removed from the offline queue without delivery.",
            &["reason"],
        )?;
        let queue_size = gauge("queue_size", "Entries in the offline queue.")?;
        let sync_passes = counter("sync_passes_total", "Sync passes that reached the remote.")?;
        let sync_duration = histogram(
            "sync_duration_seconds",
            "Wall time of a sync pass.",
            vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
        )?;

        let online = gauge(
            "online",
            "Whether the remote store is reachable (1=yes, 0=no).",
        )?;
        let remote_errors = counter_vec(
            "remote_errors_total",
            "Remote store failures.",
            &["operation", "error_type"],
        )?;
        let remote_requests_total = counter_vec(
            "remote_requests_total",
            "Remote store requests.",
            &["operation", "status"],
        )?;
        let remote_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "remote_request_duration_seconds",
                "Remote store request latency.",
            )
            .namespace(NAMESPACE)
            .buckets(latency_buckets()),
            &["operation"],
        )?;

        let persistence_errors = counter_vec(
            "persistence_errors_total",
            "Local persistence failures.",
            &["error_type"],
        )?;

        registry.register(Box::new(samples_collected.clone()))?;
        registry.register(Box::new(samples_rejected.clone()))?;
        registry.register(Box::new(source_errors.clone()))?;
        registry.register(Box::new(anomalies.clone()))?;
        registry.register(Box::new(paused.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(records_flushed.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(records_queued.clone()))?;
        registry.register(Box::new(records_synced.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(queue_size.clone()))?;
        registry.register(Box::new(sync_passes.clone()))?;
        registry.register(Box::new(sync_duration.clone()))?;
        registry.register(Box::new(online.clone()))?;
        registry.register(Box::new(remote_errors.clone()))?;
        registry.register(Box::new(remote_requests_total.clone()))?;
        registry.register(Box::new(remote_request_duration.clone()))?;
        registry.register(Box::new(persistence_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            stats: parking_lot::Mutex::new(None),
            samples_collected,
            samples_rejected,
            source_errors,
            anomalies,
            paused,
            flushes,
            flush_duration,
            records_flushed,
            batch_size,
            records_queued,
            records_synced,
            records_dropped,
            queue_size,
            sync_passes,
            sync_duration,
            online,
            remote_errors,
            remote_requests_total,
            remote_request_duration,
            persistence_errors,
        })
    }

    /// Installs the /stats body provider. Takes effect on the next `start`.
    pub fn set_stats_provider(&self, provider: StatsProvider) {
        *self.stats.lock() = Some(provider);
    }

    /// Callback for [`crate::remote::HttpRemoteStore::with_metrics`].
    pub fn remote_request_callback(self: &Arc<Self>) -> MetricsCallback {
        let metrics = Arc::clone(self);
        Box::new(move |operation: &str, status: &str, duration: Duration| {
            metrics
                .remote_requests_total
                .with_label_values(&[operation, status])
                .inc();
            metrics
                .remote_request_duration
                .with_label_values(&[operation])
                .observe(duration.as_secs_f64());
        })
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics, /healthz and /stats.
    ///
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9095"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
            stats: self.stats.lock().clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/stats", get(stats_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        if let Some(previous) = self.shutdown.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    stats: Option<StatsProvider>,
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /stats - Pipeline statistics as JSON.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.stats {
        Some(provider) => Json(provider()).into_response(),
        None => (StatusCode::NOT_FOUND, "stats not available").into_response(),
    }
}
