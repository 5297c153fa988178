use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use vera_agent::agent::worker::run_batch_worker;
use vera_agent::agent::Agent;
use vera_agent::batch::BatchAggregator;
use vera_agent::buffer::CircularBuffer;
use vera_agent::collector::stats::PipelineStats;
use vera_agent::collector::{BatchCommand, Collector, CollectorOptions, TickOutcome};
use vera_agent::config::{Config, RemoteConfig};
use vera_agent::connectivity::ConnectivityMonitor;
use vera_agent::export::health::HealthMetrics;
use vera_agent::queue::OfflineQueue;
use vera_agent::remote::{HttpRemoteStore, MemoryRemoteStore, RemoteError};
use vera_agent::sample::anomaly::{AnomalyDetector, AnomalyKind};
use vera_agent::sample::validate::sanitize;
use vera_agent::sample::{DeviceInfo, PerformanceRecord, RawMetricsSample};
use vera_agent::source::StaticSource;
use vera_agent::storage::{FileStore, MemoryStore, Persistence};
use vera_agent::sync::SyncReconciler;

const TIMEOUT: Duration = Duration::from_secs(5);

fn sample(cpu: f64) -> RawMetricsSample {
    RawMetricsSample {
        cpu_usage: cpu,
        ram_usage: 40.0,
        gpu_usage: 0.0,
        disk_usage: 55.0,
        network_download: 2.0,
        network_upload: 1.0,
    }
}

fn record(cpu: f64) -> PerformanceRecord {
    PerformanceRecord::from_sample(
        &sanitize(&sample(cpu)),
        &DeviceInfo {
            id: Some("dev-1".into()),
            name: None,
        },
        SystemTime::now(),
    )
}

fn collector(
    source: StaticSource,
    queue: &Arc<OfflineQueue>,
) -> (Collector, mpsc::Receiver<BatchCommand>, Arc<PipelineStats>) {
    let (tx, rx) = mpsc::channel(16);
    let stats = Arc::new(PipelineStats::new());
    let collector = Collector::new(
        Box::new(source),
        AnomalyDetector::default(),
        Arc::new(Mutex::new(CircularBuffer::new(60))),
        tx,
        Arc::clone(queue),
        Arc::clone(&stats),
        CollectorOptions {
            device: DeviceInfo::default(),
            save_interval_ticks: 300,
            sanitize_invalid: false,
        },
    );
    (collector, rx, stats)
}

#[tokio::test]
async fn test_sync_partial_failure_is_persisted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn Persistence> = Arc::new(FileStore::open(dir.path()).expect("open store"));
    let queue = Arc::new(OfflineQueue::open(Arc::clone(&store), 1000, 5));
    queue
        .enqueue_all((0..120u32).map(|i| record(f64::from(i % 50))))
        .expect("enqueue");

    let remote = Arc::new(MemoryRemoteStore::new());
    remote.script([
        None,
        Some(RemoteError::Status {
            status: 503,
            body: "busy".into(),
        }),
        None,
    ]);
    let connectivity = Arc::new(ConnectivityMonitor::new(Arc::clone(&remote), TIMEOUT));
    let sync = SyncReconciler::new(Arc::clone(&remote), Arc::clone(&queue), connectivity, 50, TIMEOUT);

    let report = sync.sync_now().await;
    assert_eq!(remote.insert_calls(), 3);
    assert_eq!(report.synced, 70);
    assert_eq!(report.failed, 50);
    assert_eq!(queue.len(), 50);

    // Retry counts survive a restart.
    let reopened = OfflineQueue::open(
        Arc::new(FileStore::open(dir.path()).expect("reopen store")),
        1000,
        5,
    );
    let entries = reopened.all();
    assert_eq!(entries.len(), 50);
    assert!(entries.iter().all(|r| r.retry_count == 1));
}

#[tokio::test]
async fn test_unreachable_remote_queues_within_the_tick() {
    let queue = Arc::new(OfflineQueue::open(Arc::new(MemoryStore::new()), 100, 5));
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.set_reachable(false);

    let connectivity = ConnectivityMonitor::new(Arc::clone(&remote), TIMEOUT);
    assert!(!connectivity.check_now().await);

    let batch = Arc::new(BatchAggregator::new(
        Arc::clone(&remote),
        Arc::clone(&queue),
        connectivity.subscribe(),
        20,
        Duration::from_secs(300),
        TIMEOUT,
    ));

    let (mut collector, rx, stats) = collector(StaticSource::new(sample(20.0)), &queue);
    let worker = tokio::spawn(run_batch_worker(Arc::clone(&batch), Arc::clone(&stats), rx));

    assert!(matches!(collector.tick(), TickOutcome::Collected { .. }));
    drop(collector);
    worker.await.expect("worker");

    assert_eq!(remote.insert_calls(), 0);
    assert_eq!(queue.len(), 1);
    assert!(batch.is_empty());
}

#[tokio::test]
async fn test_anomaly_bypasses_batching() {
    let queue = Arc::new(OfflineQueue::open(Arc::new(MemoryStore::new()), 100, 5));
    let (mut collector, mut rx, stats) = collector(StaticSource::new(sample(93.0)), &queue);

    match collector.tick() {
        TickOutcome::Collected {
            anomaly,
            flush_requested,
            ..
        } => {
            assert_eq!(anomaly, AnomalyKind::CpuSpike);
            assert!(flush_requested);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    match rx.try_recv().expect("command sent") {
        BatchCommand::AddAndForceFlush(rec, kind) => {
            assert_eq!(kind, AnomalyKind::CpuSpike);
            assert_eq!(rec.cpu_usage, 93.0);
        }
        other => panic!("unexpected command: {other:?}"),
    }
    assert_eq!(stats.snapshot().anomalies, 1);
}

#[tokio::test]
async fn test_invalid_sample_never_reaches_chart_or_batch() {
    let queue = Arc::new(OfflineQueue::open(Arc::new(MemoryStore::new()), 100, 5));
    let (mut collector, mut rx, stats) = collector(StaticSource::new(sample(f64::NAN)), &queue);

    assert!(matches!(collector.tick(), TickOutcome::Rejected(_)));
    assert!(rx.try_recv().is_err());
    assert!(queue.is_empty());

    let snap = stats.snapshot();
    assert_eq!(snap.total_collected, 0);
    assert_eq!(snap.validation_errors, 1);
}

/// Minimal PostgREST-style table endpoint.
#[derive(Default)]
struct Table {
    rows: Mutex<Vec<serde_json::Value>>,
    keys: Mutex<Vec<String>>,
}

async fn insert_rows(
    State(table): State<Arc<Table>>,
    headers: HeaderMap,
    Json(rows): Json<Vec<serde_json::Value>>,
) -> StatusCode {
    if let Some(key) = headers.get("apikey").and_then(|v| v.to_str().ok()) {
        table.keys.lock().push(key.to_string());
    }
    table.rows.lock().extend(rows);
    StatusCode::CREATED
}

async fn select_ids() -> Json<serde_json::Value> {
    Json(serde_json::json!([]))
}

async fn serve_table() -> (String, Arc<Table>) {
    let table = Arc::new(Table::default());
    let app = Router::new()
        .route("/rest/v1/performance_metrics", get(select_ids).post(insert_rows))
        .with_state(Arc::clone(&table));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}"), table)
}

#[tokio::test]
async fn test_agent_delivers_over_http() {
    let (endpoint, table) = serve_table().await;

    let mut cfg = Config {
        remote: RemoteConfig {
            endpoint,
            api_key: "anon-key".into(),
            ..Default::default()
        },
        ..Default::default()
    };
    cfg.pipeline.collection_tick = Duration::from_millis(20);
    cfg.pipeline.max_batch_size = 5;
    cfg.health.enabled = false;
    cfg.validate().expect("valid config");

    let health = Arc::new(HealthMetrics::new("").expect("metrics"));
    let remote = HttpRemoteStore::new(&cfg.remote)
        .expect("remote")
        .with_metrics(health.remote_request_callback());

    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn Persistence> = Arc::new(FileStore::open(dir.path()).expect("open store"));

    let mut agent = Agent::new(
        cfg,
        Arc::clone(&health),
        Arc::new(remote),
        Box::new(StaticSource::new(sample(30.0))),
        store,
    );
    agent.start().await.expect("start");

    // Wait for the first size flush.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while table.rows.lock().len() < 5 {
        assert!(tokio::time::Instant::now() < deadline, "no rows delivered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    agent.stop().await.expect("stop");

    let stats = agent.stats();
    let rows = table.rows.lock().clone();
    assert_eq!(rows.len() as u64, stats.pipeline.total_collected);
    assert_eq!(stats.queue.total, 0);
    assert_eq!(rows[0]["cpu_usage"], 30.0);
    assert!(rows[0].get("device_id").is_none());
    assert!(table.keys.lock().iter().all(|k| k == "anon-key"));
    assert!(
        health
            .remote_requests_total
            .with_label_values(&["insert", "success"])
            .get()
            >= 1.0
    );
}
