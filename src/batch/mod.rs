//! In-memory accumulation of records before delivery.
//!
//! A batch is flushed when it reaches `max_batch_size`, when `batch_timeout`
//! has passed since the previous flush, or on demand. Each flush submits the
//! buffered set in one atomic insert and, on success, removes exactly the
//! records it submitted; records added while the insert was in flight stay
//! for the next flush. While the remote is known to be offline a flush moves
//! the batch into the offline queue without touching the network.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::collector::stats::PipelineStats;
use crate::connectivity::ConnectivityState;
use crate::export::health::HealthMetrics;
use crate::queue::OfflineQueue;
use crate::remote::{insert_with_timeout, RemoteError, RemoteStore};
use crate::sample::{format_rfc3339, PerformanceRecord};

/// Why a flush was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushReason {
    Size,
    Timeout,
    SaveInterval,
    Anomaly,
    Offline,
    Shutdown,
    Manual,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Timeout => "timeout",
            Self::SaveInterval => "save_interval",
            Self::Anomaly => "anomaly",
            Self::Offline => "offline",
            Self::Shutdown => "shutdown",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Idle,
    Accumulating,
    Flushing,
}

/// What a completed flush did with the records it took.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub delivered: usize,
    pub queued: usize,
}

#[derive(Debug)]
pub struct AddOutcome {
    /// Batch size right after the add, before any triggered flush.
    pub size: usize,
    /// Result of the flush the add triggered, if any.
    pub flush: Option<Result<FlushOutcome, RemoteError>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStats {
    pub size: usize,
    pub state: BatchState,
    pub oldest: Option<String>,
    pub newest: Option<String>,
    pub last_flush: Option<String>,
    #[serde(with = "humantime_serde")]
    pub time_since_last_flush: Duration,
    pub flushes: u64,
    pub failed_flushes: u64,
}

struct Pending {
    id: u64,
    record: PerformanceRecord,
    added_at: SystemTime,
}

struct Inner {
    items: Vec<Pending>,
    next_id: u64,
    last_flush: Instant,
    last_flush_wall: Option<SystemTime>,
    flushing: bool,
    flushes: u64,
    failed_flushes: u64,
}

impl Inner {
    /// Removes and returns the pending records with the given ids, in order.
    fn take_ids(&mut self, ids: &[u64]) -> Vec<PerformanceRecord> {
        let mut taken = Vec::with_capacity(ids.len());
        let mut kept = Vec::with_capacity(self.items.len());
        for p in self.items.drain(..) {
            if ids.contains(&p.id) {
                taken.push(p.record);
            } else {
                kept.push(p);
            }
        }
        self.items = kept;
        taken
    }

    fn state(&self) -> BatchState {
        if self.flushing {
            BatchState::Flushing
        } else if self.items.is_empty() {
            BatchState::Idle
        } else {
            BatchState::Accumulating
        }
    }

    fn mark_flushed(&mut self) {
        self.flushing = false;
        self.flushes += 1;
        self.last_flush = Instant::now();
        self.last_flush_wall = Some(SystemTime::now());
    }
}

pub struct BatchAggregator<R> {
    remote: Arc<R>,
    queue: Arc<OfflineQueue>,
    connectivity: watch::Receiver<ConnectivityState>,
    max_batch_size: usize,
    batch_timeout: Duration,
    remote_timeout: Duration,
    inner: Mutex<Inner>,
    // Serializes flushes; a second caller waits and then runs its own.
    flush_lock: tokio::sync::Mutex<()>,
    metrics: Option<Arc<HealthMetrics>>,
    stats: Option<Arc<PipelineStats>>,
}

impl<R: RemoteStore> BatchAggregator<R> {
    pub fn new(
        remote: Arc<R>,
        queue: Arc<OfflineQueue>,
        connectivity: watch::Receiver<ConnectivityState>,
        max_batch_size: usize,
        batch_timeout: Duration,
        remote_timeout: Duration,
    ) -> Self {
        let max_batch_size = max_batch_size.max(1);
        Self {
            remote,
            queue,
            connectivity,
            max_batch_size,
            batch_timeout,
            remote_timeout,
            inner: Mutex::new(Inner {
                items: Vec::with_capacity(max_batch_size),
                next_id: 0,
                last_flush: Instant::now(),
                last_flush_wall: None,
                flushing: false,
                flushes: 0,
                failed_flushes: 0,
            }),
            flush_lock: tokio::sync::Mutex::new(()),
            metrics: None,
            stats: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Counts delivered and queued records as saved.
    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    fn note_saved(&self, count: usize) {
        if let Some(ref stats) = self.stats {
            stats.record_saved(count as u64, SystemTime::now());
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn is_online(&self) -> bool {
        self.connectivity.borrow().online
    }

    /// Buffers a record, flushing when the batch is full or the remote is
    /// offline.
    pub async fn add(&self, record: PerformanceRecord) -> AddOutcome {
        let size = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.items.push(Pending {
                id,
                record,
                added_at: SystemTime::now(),
            });
            inner.items.len()
        };
        self.observe_size(size);

        let reason = if !self.is_online() {
            Some(FlushReason::Offline)
        } else if size >= self.max_batch_size {
            Some(FlushReason::Size)
        } else {
            None
        };

        let flush = match reason {
            Some(reason) => Some(self.flush_with(reason).await),
            None => None,
        };

        AddOutcome { size, flush }
    }

    /// Flushes whatever is buffered.
    pub async fn flush(&self) -> Result<FlushOutcome, RemoteError> {
        self.flush_with(FlushReason::Manual).await
    }

    /// Flushes immediately regardless of size or timer, tagging the reason.
    pub async fn force_flush(&self, reason: FlushReason) -> Result<FlushOutcome, RemoteError> {
        self.flush_with(reason).await
    }

    /// Flushes a non-empty batch once `batch_timeout` has passed since the
    /// previous flush. Returns `None` when nothing was due.
    pub async fn flush_if_due(&self) -> Option<Result<FlushOutcome, RemoteError>> {
        let due = {
            let inner = self.inner.lock();
            !inner.items.is_empty() && inner.last_flush.elapsed() >= self.batch_timeout
        };
        if !due {
            return None;
        }
        Some(self.flush_with(FlushReason::Timeout).await)
    }

    async fn flush_with(&self, reason: FlushReason) -> Result<FlushOutcome, RemoteError> {
        let _guard = self.flush_lock.lock().await;

        let (ids, records) = {
            let mut inner = self.inner.lock();
            if inner.items.is_empty() {
                return Ok(FlushOutcome::default());
            }
            inner.flushing = true;
            let ids: Vec<u64> = inner.items.iter().map(|p| p.id).collect();
            let records: Vec<PerformanceRecord> =
                inner.items.iter().map(|p| p.record.clone()).collect();
            (ids, records)
        };

        if let Some(ref m) = self.metrics {
            m.flushes.with_label_values(&[reason.as_str()]).inc();
        }

        if !self.is_online() {
            let queued = self.hand_off(&ids).await;
            self.inner.lock().mark_flushed();
            debug!(queued, "offline, moved batch to offline queue");
            return Ok(FlushOutcome {
                delivered: 0,
                queued,
            });
        }

        let start = std::time::Instant::now();
        let result = insert_with_timeout(self.remote.as_ref(), &records, self.remote_timeout).await;
        if let Some(ref m) = self.metrics {
            m.flush_duration.observe(start.elapsed().as_secs_f64());
        }

        match result {
            Ok(()) => {
                let delivered = {
                    let mut inner = self.inner.lock();
                    let delivered = inner.take_ids(&ids).len();
                    inner.mark_flushed();
                    self.observe_size(inner.items.len());
                    delivered
                };
                if let Some(ref m) = self.metrics {
                    m.records_flushed.inc_by(delivered as f64);
                }
                self.note_saved(delivered);
                info!(delivered, reason = reason.as_str(), "flushed batch");
                Ok(FlushOutcome {
                    delivered,
                    queued: 0,
                })
            }
            Err(e) => {
                let over_bound = {
                    let mut inner = self.inner.lock();
                    inner.mark_flushed();
                    inner.failed_flushes += 1;
                    inner.items.len() >= self.max_batch_size
                };
                if let Some(ref m) = self.metrics {
                    m.remote_errors
                        .with_label_values(&["insert", e.kind()])
                        .inc();
                }

                if over_bound {
                    let queued = self.hand_off(&ids).await;
                    warn!(error = %e, queued, "batch flush failed, moved batch to offline queue");
                } else {
                    warn!(error = %e, records = ids.len(), "batch flush failed, keeping batch");
                }
                Err(e)
            }
        }
    }

    /// Moves everything still buffered into the offline queue, even while a
    /// flush is in flight. Returns how many records moved.
    pub async fn hand_off_all(&self) -> usize {
        let ids: Vec<u64> = {
            let mut inner = self.inner.lock();
            inner.flushing = false;
            inner.items.iter().map(|p| p.id).collect()
        };
        if ids.is_empty() {
            return 0;
        }
        self.hand_off(&ids).await
    }

    /// Moves the given pending records into the offline queue.
    async fn hand_off(&self, ids: &[u64]) -> usize {
        let records = {
            let mut inner = self.inner.lock();
            let records = inner.take_ids(ids);
            self.observe_size(inner.items.len());
            records
        };
        let count = records.len();

        match self.queue.blocking(move |q| q.enqueue_all(records)).await {
            Ok(_) => self.note_saved(count),
            Err(e) => {
                warn!(error = %e, count, "persisting offline queue failed");
                if let Some(ref m) = self.metrics {
                    m.persistence_errors.with_label_values(&[e.kind()]).inc();
                }
            }
        }
        if let Some(ref m) = self.metrics {
            m.records_queued.inc_by(count as f64);
            m.queue_size.set(self.queue.len() as f64);
        }
        count
    }

    fn observe_size(&self, size: usize) {
        if let Some(ref m) = self.metrics {
            m.batch_size.set(size as f64);
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn state(&self) -> BatchState {
        self.inner.lock().state()
    }

    /// Copy of the buffered records, oldest first.
    pub fn pending(&self) -> Vec<PerformanceRecord> {
        self.inner
            .lock()
            .items
            .iter()
            .map(|p| p.record.clone())
            .collect()
    }

    pub fn stats(&self) -> BatchStats {
        let inner = self.inner.lock();
        BatchStats {
            size: inner.items.len(),
            state: inner.state(),
            oldest: inner.items.first().map(|p| format_rfc3339(p.added_at)),
            newest: inner.items.last().map(|p| format_rfc3339(p.added_at)),
            last_flush: inner.last_flush_wall.map(format_rfc3339),
            time_since_last_flush: inner.last_flush.elapsed(),
            flushes: inner.flushes,
            failed_flushes: inner.failed_flushes,
        }
    }

    /// Drops every buffered record without delivering it. Returns how many.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.items.len();
        inner.items.clear();
        self.observe_size(0);
        dropped
    }
}
