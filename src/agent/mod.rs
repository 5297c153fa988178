pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchAggregator, BatchStats, FlushOutcome, FlushReason};
use crate::buffer::CircularBuffer;
use crate::collector::stats::{PipelineStats, PipelineStatsSnapshot};
use crate::collector::{BatchCommand, Collector, CollectorOptions};
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::export::health::HealthMetrics;
use crate::queue::{OfflineQueue, QueueStats};
use crate::remote::{RemoteError, RemoteStore};
use crate::sample::anomaly::AnomalyDetector;
use crate::sample::{format_rfc3339, DataPoint};
use crate::source::SampleSource;
use crate::storage::snapshot::{self, OfflineSnapshot};
use crate::storage::{Persistence, PersistenceError};
use crate::sync::{SyncReconciler, SyncReport, SyncStatus};

/// Everything the stats endpoint and the agent read from.
struct Parts<R> {
    stats: Arc<PipelineStats>,
    buffer: Arc<Mutex<CircularBuffer>>,
    queue: Arc<OfflineQueue>,
    batch: Arc<BatchAggregator<R>>,
    sync: Arc<SyncReconciler<R>>,
    connectivity: Arc<ConnectivityMonitor<R>>,
    paused: Arc<AtomicBool>,
}

/// Combined view of the pipeline served at /stats.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStats {
    pub pipeline: PipelineStatsSnapshot,
    pub batch: BatchStats,
    pub queue: QueueStats,
    pub sync: SyncStatus,
    pub online: bool,
    pub last_connectivity_check: Option<String>,
    pub paused: bool,
    pub chart_points: usize,
}

impl<R: RemoteStore> Parts<R> {
    fn snapshot(&self) -> AgentStats {
        let connectivity = self.connectivity.state();
        AgentStats {
            pipeline: self.stats.snapshot(),
            batch: self.batch.stats(),
            queue: self.queue.stats(),
            sync: self.sync.status(),
            online: connectivity.online,
            last_connectivity_check: connectivity.last_checked.map(format_rfc3339),
            paused: self.paused.load(Ordering::Relaxed),
            chart_points: self.buffer.lock().len(),
        }
    }
}

/// Tasks spawned by `start`, joined by `stop`.
#[derive(Default)]
struct Tasks {
    collection: Option<JoinHandle<()>>,
    batch: Option<JoinHandle<()>>,
    connectivity: Option<JoinHandle<()>>,
    sync: Option<JoinHandle<()>>,
}

/// Agent owns one pipeline: source, collector, batch, offline queue,
/// connectivity and sync, plus the health server.
pub struct Agent<R> {
    cfg: Config,
    health: Arc<HealthMetrics>,
    persistence: Arc<dyn Persistence>,
    parts: Arc<Parts<R>>,
    collector: Option<Collector>,
    commands: Option<mpsc::Receiver<BatchCommand>>,
    tasks: Tasks,
    cancel: CancellationToken,
}

impl<R: RemoteStore> Agent<R> {
    /// Builds every component. Nothing runs until `start`.
    ///
    /// The persisted offline queue is reloaded, and the last saved chart
    /// snapshot seeds the live buffer.
    pub fn new(
        cfg: Config,
        health: Arc<HealthMetrics>,
        remote: Arc<R>,
        source: Box<dyn SampleSource>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let p = &cfg.pipeline;

        let queue = Arc::new(OfflineQueue::open(
            Arc::clone(&persistence),
            p.max_queue_size,
            p.max_retry_attempts,
        ));
        health.queue_size.set(queue.len() as f64);
        if !queue.is_empty() {
            info!(count = queue.len(), "restored offline queue");
        }

        let mut ring = CircularBuffer::new(p.circular_buffer_capacity);
        match snapshot::load_snapshot(persistence.as_ref()) {
            Ok(Some(saved)) => {
                debug!(points = saved.points.len(), saved_at = %saved.saved_at, "seeding chart from snapshot");
                for point in saved.points {
                    ring.push(point);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "loading offline snapshot"),
        }
        let buffer = Arc::new(Mutex::new(ring));

        let stats = Arc::new(PipelineStats::new());
        let connectivity = Arc::new(
            ConnectivityMonitor::new(Arc::clone(&remote), cfg.remote.timeout)
                .with_metrics(Arc::clone(&health)),
        );

        let batch = Arc::new(
            BatchAggregator::new(
                Arc::clone(&remote),
                Arc::clone(&queue),
                connectivity.subscribe(),
                p.max_batch_size,
                p.batch_timeout,
                cfg.remote.timeout,
            )
            .with_metrics(Arc::clone(&health))
            .with_stats(Arc::clone(&stats)),
        );

        let sync = Arc::new(
            SyncReconciler::new(
                remote,
                Arc::clone(&queue),
                Arc::clone(&connectivity),
                p.sync_batch_size,
                cfg.remote.timeout,
            )
            .with_metrics(Arc::clone(&health)),
        );

        let (tx, rx) = mpsc::channel(p.command_channel_capacity);
        let collector = Collector::new(
            source,
            AnomalyDetector::new(&cfg.anomaly),
            Arc::clone(&buffer),
            tx,
            Arc::clone(&queue),
            Arc::clone(&stats),
            CollectorOptions {
                device: cfg.device_info(),
                save_interval_ticks: p.save_interval_ticks,
                sanitize_invalid: p.sanitize_invalid,
            },
        )
        .with_metrics(Arc::clone(&health));

        let parts = Arc::new(Parts {
            stats,
            buffer,
            queue,
            batch,
            sync,
            connectivity,
            paused: collector.pause_flag(),
        });

        Self {
            cfg,
            health,
            persistence,
            parts,
            collector: Some(collector),
            commands: Some(rx),
            tasks: Tasks::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Start the health server and the pipeline tasks.
    pub async fn start(&mut self) -> Result<()> {
        let (Some(collector), Some(commands)) = (self.collector.take(), self.commands.take())
        else {
            bail!("agent already started");
        };

        // 0. Health server first so probes respond during startup.
        if self.cfg.health.enabled {
            let parts = Arc::clone(&self.parts);
            self.health.set_stats_provider(Arc::new(move || {
                serde_json::to_value(parts.snapshot()).unwrap_or(serde_json::Value::Null)
            }));
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 1. Establish the initial connectivity state.
        let online = self.parts.connectivity.check_now().await;
        info!(online, "initial connectivity check");

        let p = &self.cfg.pipeline;

        // 2. Batch worker, which exits once the collector is gone.
        self.tasks.batch = Some(tokio::spawn(worker::run_batch_worker(
            Arc::clone(&self.parts.batch),
            Arc::clone(&self.parts.stats),
            commands,
        )));

        // 3. Background monitors.
        self.tasks.connectivity = Some(
            self.parts
                .connectivity
                .spawn(p.connectivity_check_interval, self.cancel.child_token()),
        );
        self.tasks.sync = Some(self.parts.sync.start_periodic(p.sync_interval, &self.cancel));

        // 4. Collection.
        self.tasks.collection = Some(tokio::spawn(
            collector.run(p.collection_tick, self.cancel.child_token()),
        ));

        info!(
            tick = ?p.collection_tick,
            max_batch_size = p.max_batch_size,
            queued = self.parts.queue.len(),
            "agent fully started",
        );

        Ok(())
    }

    /// Gracefully stop all components.
    ///
    /// Collection stops first, then the batch worker drains, the batch is
    /// flushed and the queue gets one last sync pass, all within
    /// `shutdown_timeout`. Whatever is left stays in the persisted queue.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        let tasks = std::mem::take(&mut self.tasks);
        let parts = Arc::clone(&self.parts);
        let timeout = self.cfg.pipeline.shutdown_timeout;

        if tokio::time::timeout(timeout, drain(tasks, parts)).await.is_err() {
            warn!(
                timeout = ?timeout,
                queued = self.parts.queue.len(),
                batched = self.parts.batch.size(),
                "shutdown timed out, remaining records stay queued",
            );
            let moved = self.parts.batch.hand_off_all().await;
            if moved > 0 {
                info!(count = moved, "moved unsent batch to offline queue");
            }
        }

        if let Err(e) = self.save_snapshot() {
            warn!(error = %e, "saving offline snapshot");
        }

        self.health.stop();
        info!("agent stopped");

        Ok(())
    }

    pub fn pause(&self) {
        self.parts.paused.store(true, Ordering::Relaxed);
        self.health.paused.set(1.0);
        info!("collection paused");
    }

    pub fn resume(&self) {
        self.parts.paused.store(false, Ordering::Relaxed);
        self.health.paused.set(0.0);
        info!("collection resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.parts.paused.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> AgentStats {
        self.parts.snapshot()
    }

    /// Current live chart, oldest first.
    pub fn chart(&self) -> Vec<DataPoint> {
        self.parts.buffer.lock().snapshot()
    }

    /// Points from the last `seconds` seconds.
    pub fn chart_window(&self, seconds: u64) -> Vec<DataPoint> {
        self.parts.buffer.lock().window(seconds)
    }

    /// Flush the batch now, regardless of size or age.
    pub async fn flush_now(&self) -> Result<FlushOutcome, RemoteError> {
        self.parts.batch.force_flush(FlushReason::Manual).await
    }

    /// Run one sync pass now.
    pub async fn sync_now(&self) -> SyncReport {
        self.parts.sync.sync_now().await
    }

    /// Persist the live chart for offline viewing.
    pub fn save_snapshot(&self) -> Result<(), PersistenceError> {
        let points = self.chart();
        let saved = OfflineSnapshot::new(points, SystemTime::now());
        snapshot::save_snapshot(self.persistence.as_ref(), &saved)?;
        debug!(points = saved.points.len(), "saved offline snapshot");
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<Option<OfflineSnapshot>, PersistenceError> {
        snapshot::load_snapshot(self.persistence.as_ref())
    }

    /// Discard every queued record.
    pub fn clear_queue(&self) -> Result<(), PersistenceError> {
        self.parts.queue.clear()?;
        self.health.queue_size.set(0.0);
        Ok(())
    }
}

async fn drain<R: RemoteStore>(tasks: Tasks, parts: Arc<Parts<R>>) {
    // The collector owns the only command sender, so once its task ends the
    // worker sees a closed channel after handling what was already sent.
    for (name, handle) in [
        ("collection", tasks.collection),
        ("batch", tasks.batch),
        ("connectivity", tasks.connectivity),
        ("sync", tasks.sync),
    ] {
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "task ended abnormally");
            }
        }
    }

    match parts.batch.force_flush(FlushReason::Shutdown).await {
        Ok(outcome) => debug!(
            delivered = outcome.delivered,
            queued = outcome.queued,
            "final flush"
        ),
        Err(e) => warn!(error = %e, "final flush failed"),
    }

    // A failed final flush can leave records below the size bound in memory.
    let moved = parts.batch.hand_off_all().await;
    if moved > 0 {
        info!(count = moved, "moved unsent batch to offline queue");
    }

    if !parts.queue.is_empty() && parts.connectivity.is_online() {
        let report = parts.sync.sync_now().await;
        info!(
            synced = report.synced,
            failed = report.failed,
            remaining = parts.queue.len(),
            "final sync pass",
        );
    }
}
