//! Drains the offline queue into the remote store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::export::health::HealthMetrics;
use crate::queue::{OfflineQueue, QueueEntry};
use crate::remote::{insert_with_timeout, RemoteStore};
use crate::sample::PerformanceRecord;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    /// Records removed for good after exhausting their retries. They are
    /// also counted in `failed`.
    pub dropped: usize,
    /// Another pass was already running; nothing was attempted.
    pub skipped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub is_active: bool,
    pub is_syncing: bool,
    pub queue_size: usize,
    pub oldest_record: Option<String>,
    pub newest_record: Option<String>,
    pub problem_records: usize,
}

/// Clears the in-progress flag when a pass ends, including on panic.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncReconciler<R> {
    remote: Arc<R>,
    queue: Arc<OfflineQueue>,
    connectivity: Arc<ConnectivityMonitor<R>>,
    batch_size: usize,
    remote_timeout: Duration,
    syncing: AtomicBool,
    periodic: Mutex<Option<CancellationToken>>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<R: RemoteStore> SyncReconciler<R> {
    pub fn new(
        remote: Arc<R>,
        queue: Arc<OfflineQueue>,
        connectivity: Arc<ConnectivityMonitor<R>>,
        batch_size: usize,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            remote,
            queue,
            connectivity,
            batch_size: batch_size.max(1),
            remote_timeout,
            syncing: AtomicBool::new(false),
            periodic: Mutex::new(None),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Runs one pass over a snapshot of the queue.
    ///
    /// Returns a skipped report if a pass is already running. Sub-batches
    /// are attempted in FIFO order and a failed one does not stop the pass.
    pub async fn sync_now(&self) -> SyncReport {
        let Some(_guard) = PassGuard::acquire(&self.syncing) else {
            debug!("sync pass already running, skipping");
            return SyncReport {
                skipped: true,
                ..SyncReport::default()
            };
        };

        let entries = self.queue.entries();
        if entries.is_empty() {
            return SyncReport::default();
        }

        if !self.connectivity.check_now().await {
            debug!(queued = entries.len(), "remote offline, sync deferred");
            return SyncReport {
                failed: entries.len(),
                ..SyncReport::default()
            };
        }

        let start = std::time::Instant::now();
        info!(queued = entries.len(), "starting sync pass");

        let mut report = SyncReport::default();
        for chunk in entries.chunks(self.batch_size) {
            self.sync_chunk(chunk, &mut report).await;
        }

        if let Some(ref m) = self.metrics {
            m.sync_passes.inc();
            m.sync_duration.observe(start.elapsed().as_secs_f64());
            m.records_synced.inc_by(report.synced as f64);
            m.queue_size.set(self.queue.len() as f64);
        }

        info!(
            synced = report.synced,
            failed = report.failed,
            dropped = report.dropped,
            remaining = self.queue.len(),
            "sync pass complete",
        );

        report
    }

    async fn sync_chunk(&self, chunk: &[QueueEntry], report: &mut SyncReport) {
        let max_retry = self.queue.max_retry();
        let (expired, live): (Vec<&QueueEntry>, Vec<&QueueEntry>) = chunk
            .iter()
            .partition(|e| e.record.retry_count >= max_retry);

        if !expired.is_empty() {
            let ids: Vec<u64> = expired.iter().map(|e| e.id).collect();
            match self.queue.blocking(move |q| q.drop_ids(&ids)).await {
                Ok(n) => {
                    report.failed += n;
                    report.dropped += n;
                    self.count_dropped(n);
                }
                Err(e) => self.persistence_failed(&e),
            }
        }

        if live.is_empty() {
            return;
        }

        let ids: Vec<u64> = live.iter().map(|e| e.id).collect();
        let records: Vec<PerformanceRecord> = live.iter().map(|e| e.record.record.clone()).collect();

        match insert_with_timeout(self.remote.as_ref(), &records, self.remote_timeout).await {
            Ok(()) => {
                report.synced += records.len();
                if let Err(e) = self.queue.blocking(move |q| q.remove_ids(&ids)).await {
                    self.persistence_failed(&e);
                }
            }
            Err(err) => {
                report.failed += records.len();
                warn!(error = %err, records = records.len(), "sync sub-batch failed");
                if let Some(ref m) = self.metrics {
                    m.remote_errors.with_label_values(&["sync", err.kind()]).inc();
                }
                match self.queue.blocking(move |q| q.increment_retry_ids(&ids)).await {
                    Ok(outcome) => {
                        report.dropped += outcome.dropped;
                        self.count_dropped(outcome.dropped);
                    }
                    Err(e) => self.persistence_failed(&e),
                }
            }
        }
    }

    fn count_dropped(&self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(ref m) = self.metrics {
            m.records_dropped
                .with_label_values(&["max_retry"])
                .inc_by(n as f64);
        }
    }

    fn persistence_failed(&self, e: &crate::storage::PersistenceError) {
        warn!(error = %e, "persisting offline queue failed");
        if let Some(ref m) = self.metrics {
            m.persistence_errors.with_label_values(&[e.kind()]).inc();
        }
    }

    /// Spawns the periodic sync task.
    ///
    /// A pass runs immediately, then on every tick while the queue is not
    /// empty, and whenever connectivity comes back after an outage.
    pub fn start_periodic(
        self: &Arc<Self>,
        interval: Duration,
        parent: &CancellationToken,
    ) -> JoinHandle<()> {
        let cancel = parent.child_token();
        if let Some(previous) = self.periodic.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let this = Arc::clone(self);
        let mut state_rx = self.connectivity.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut first = true;
            let mut was_online = state_rx.borrow_and_update().online;
            let mut watching = true;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,

                    _ = ticker.tick() => {
                        if first || !this.queue.is_empty() {
                            this.sync_now().await;
                        }
                        first = false;
                        // Changes published by our own probe are not transitions to act on.
                        was_online = state_rx.borrow_and_update().online;
                    }

                    changed = state_rx.changed(), if watching => {
                        if changed.is_err() {
                            watching = false;
                            continue;
                        }
                        let online = state_rx.borrow_and_update().online;
                        if online && !was_online && !this.queue.is_empty() {
                            info!("connectivity restored, syncing offline queue");
                            this.sync_now().await;
                            state_rx.borrow_and_update();
                        }
                        was_online = online;
                    }
                }
            }
        })
    }

    /// Stops the periodic task. An in-flight pass completes.
    pub fn stop(&self) {
        if let Some(cancel) = self.periodic.lock().take() {
            cancel.cancel();
        }
    }

    pub fn status(&self) -> SyncStatus {
        let stats = self.queue.stats();
        let is_active = self
            .periodic
            .lock()
            .as_ref()
            .is_some_and(|c| !c.is_cancelled());
        SyncStatus {
            is_active,
            is_syncing: self.is_syncing(),
            queue_size: stats.total,
            oldest_record: stats.oldest,
            newest_record: stats.newest,
            problem_records: stats.high_retry_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::remote::{MemoryRemoteStore, RemoteError};
    use crate::sample::{validate::sanitize, DeviceInfo, RawMetricsSample};
    use crate::storage::MemoryStore;

    fn record(cpu: f64) -> PerformanceRecord {
        let sample = sanitize(&RawMetricsSample {
            cpu_usage: cpu,
            ..RawMetricsSample::default()
        });
        PerformanceRecord::from_sample(&sample, &DeviceInfo::default(), SystemTime::now())
    }

    struct Fixture {
        remote: Arc<MemoryRemoteStore>,
        queue: Arc<OfflineQueue>,
        sync: Arc<SyncReconciler<MemoryRemoteStore>>,
    }

    fn fixture(queued: usize) -> Fixture {
        let remote = Arc::new(MemoryRemoteStore::new());
        let queue = Arc::new(OfflineQueue::open(Arc::new(MemoryStore::new()), 1000, 5));
        queue
            .enqueue_all((0..queued).map(|i| record((i % 100) as f64)))
            .expect("seed queue");
        let monitor = Arc::new(ConnectivityMonitor::new(remote.clone(), Duration::from_secs(1)));
        let sync = Arc::new(SyncReconciler::new(
            remote.clone(),
            queue.clone(),
            monitor,
            50,
            Duration::from_secs(10),
        ));
        Fixture {
            remote,
            queue,
            sync,
        }
    }

    #[tokio::test]
    async fn test_empty_queue_is_noop() {
        let f = fixture(0);
        assert_eq!(f.sync.sync_now().await, SyncReport::default());
        assert_eq!(f.remote.ping_calls(), 0);
    }

    #[tokio::test]
    async fn test_offline_reports_all_failed_without_mutation() {
        let f = fixture(7);
        f.remote.set_reachable(false);

        let report = f.sync.sync_now().await;
        assert_eq!(report.failed, 7);
        assert_eq!(report.synced, 0);
        assert_eq!(f.remote.insert_calls(), 0);
        assert!(f.queue.all().iter().all(|r| r.retry_count == 0));
    }

    #[tokio::test]
    async fn test_second_sub_batch_failure() {
        let f = fixture(120);
        f.remote
            .script([None, Some(RemoteError::Transport("reset".to_string())), None]);

        let report = f.sync.sync_now().await;

        assert_eq!(f.remote.insert_calls(), 3);
        assert_eq!(report.synced, 70);
        assert_eq!(report.failed, 50);
        assert_eq!(f.queue.len(), 50);
        assert!(f.queue.all().iter().all(|r| r.retry_count == 1));

        let sizes: Vec<usize> = f.remote.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![50, 20]);
    }

    #[tokio::test]
    async fn test_delivered_records_are_not_replayed() {
        let f = fixture(10);
        assert_eq!(f.sync.sync_now().await.synced, 10);
        assert!(f.queue.is_empty());

        assert_eq!(f.sync.sync_now().await, SyncReport::default());
        assert_eq!(f.remote.records().len(), 10);
    }

    #[tokio::test]
    async fn test_retry_bound_across_passes() {
        let f = fixture(1);
        f.remote
            .script((0..10).map(|_| Some(RemoteError::Unavailable)));

        for pass in 1..5 {
            let report = f.sync.sync_now().await;
            assert_eq!(report.failed, 1, "pass {pass}");
            assert_eq!(report.dropped, 0, "pass {pass}");
        }

        let report = f.sync.sync_now().await;
        assert_eq!(report.dropped, 1);
        assert!(f.queue.is_empty());
        assert_eq!(f.remote.insert_calls(), 5);

        // Never attempted again.
        f.sync.sync_now().await;
        assert_eq!(f.remote.insert_calls(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_pass_is_skipped() {
        let f = fixture(3);
        let _held = PassGuard::acquire(&f.sync.syncing).expect("acquire");

        let report = f.sync.sync_now().await;
        assert!(report.skipped);
        assert_eq!(f.remote.insert_calls(), 0);
        assert!(f.sync.status().is_syncing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_runs_immediately_then_when_non_empty() {
        let f = fixture(5);
        let cancel = CancellationToken::new();
        let handle = f.sync.start_periodic(Duration::from_secs(60), &cancel);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.queue.is_empty());
        assert_eq!(f.remote.insert_calls(), 1);
        assert!(f.sync.status().is_active);

        // Empty queue: ticks do not probe.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(f.remote.ping_calls(), 1);

        f.queue.enqueue(record(1.0)).expect("enqueue");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(f.queue.is_empty());
        assert_eq!(f.remote.insert_calls(), 2);

        f.sync.stop();
        handle.await.expect("join");
        assert!(!f.sync.status().is_active);
    }

    #[tokio::test]
    async fn test_status() {
        let f = fixture(2);
        let status = f.sync.status();
        assert_eq!(status.queue_size, 2);
        assert!(!status.is_active);
        assert!(status.oldest_record.is_some());
        assert_eq!(status.problem_records, 0);
    }
}
