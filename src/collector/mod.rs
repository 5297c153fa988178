//! The per-tick collection step.
//!
//! A tick samples the source, validates, feeds the live chart buffer,
//! classifies, and hands the resulting record to the batch worker over a
//! bounded channel. It never awaits network I/O; if the worker cannot keep
//! up the record goes straight to the offline queue.

pub mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::batch::FlushReason;
use crate::buffer::CircularBuffer;
use crate::export::health::HealthMetrics;
use crate::queue::OfflineQueue;
use crate::sample::anomaly::{AnomalyDetector, AnomalyKind};
use crate::sample::validate::{sanitize, validate, ValidationError};
use crate::sample::{unix_millis, DataPoint, DeviceInfo, PerformanceRecord};
use crate::source::{SampleSource, SourceError};

use stats::{ErrorKind, PipelineStats};

/// Work sent from the collection tick to the batch worker.
#[derive(Debug)]
pub enum BatchCommand {
    /// Buffer the record on the normal batching path.
    Add(PerformanceRecord),
    /// Buffer the record and flush right away.
    AddAndForceFlush(PerformanceRecord, AnomalyKind),
    /// Flush whatever is buffered.
    Flush(FlushReason),
}

impl BatchCommand {
    fn into_record(self) -> Option<PerformanceRecord> {
        match self {
            Self::Add(r) | Self::AddAndForceFlush(r, _) => Some(r),
            Self::Flush(_) => None,
        }
    }
}

/// What one tick did.
#[derive(Debug)]
pub enum TickOutcome {
    Paused,
    SourceFailed(SourceError),
    Rejected(ValidationError),
    Collected {
        anomaly: AnomalyKind,
        /// An immediate or save-interval flush was requested.
        flush_requested: bool,
        /// The sample failed validation and was clamped instead.
        sanitized: bool,
    },
}

/// Collection settings.
#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub device: DeviceInfo,
    /// Non-anomalous ticks between save-interval flushes; 0 disables them.
    pub save_interval_ticks: u64,
    /// Clamp invalid samples instead of dropping them.
    pub sanitize_invalid: bool,
}

pub struct Collector {
    source: Box<dyn SampleSource>,
    detector: AnomalyDetector,
    buffer: Arc<Mutex<CircularBuffer>>,
    commands: mpsc::Sender<BatchCommand>,
    fallback: Arc<OfflineQueue>,
    stats: Arc<PipelineStats>,
    options: CollectorOptions,
    ticks_since_save: u64,
    paused: Arc<AtomicBool>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl Collector {
    pub fn new(
        source: Box<dyn SampleSource>,
        detector: AnomalyDetector,
        buffer: Arc<Mutex<CircularBuffer>>,
        commands: mpsc::Sender<BatchCommand>,
        fallback: Arc<OfflineQueue>,
        stats: Arc<PipelineStats>,
        options: CollectorOptions,
    ) -> Self {
        Self {
            source,
            detector,
            buffer,
            commands,
            fallback,
            stats,
            options,
            ticks_since_save: 0,
            paused: Arc::new(AtomicBool::new(false)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Shared pause flag, for controlling a collector that has been moved
    /// into its task.
    pub fn pause_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.paused)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Runs one collection step.
    pub fn tick(&mut self) -> TickOutcome {
        if self.is_paused() {
            return TickOutcome::Paused;
        }

        let now = SystemTime::now();

        let raw = match self.source.sample() {
            Ok(raw) => raw,
            Err(e) => {
                self.stats.record_error(ErrorKind::Source);
                if let Some(ref m) = self.metrics {
                    m.source_errors.inc();
                }
                warn!(error = %e, source = self.source.name(), "sampling failed");
                return TickOutcome::SourceFailed(e);
            }
        };

        let (sample, sanitized) = match validate(&raw) {
            Ok(sample) => (sample, false),
            Err(e) => {
                self.stats.record_error(ErrorKind::Validation);
                if let Some(ref m) = self.metrics {
                    m.samples_rejected.with_label_values(&[e.field]).inc();
                }
                if !self.options.sanitize_invalid {
                    debug!(error = %e, "dropping invalid sample");
                    return TickOutcome::Rejected(e);
                }
                debug!(error = %e, "clamping invalid sample");
                (sanitize(&raw), true)
            }
        };

        self.stats.record_collected(now);
        if let Some(ref m) = self.metrics {
            m.samples_collected.inc();
        }

        self.buffer
            .lock()
            .push(DataPoint::from_sample(&sample, unix_millis(now)));

        let event = self.detector.classify_at(&sample, now);
        let record = PerformanceRecord::from_sample(&sample, &self.options.device, now);

        if event.is_anomaly() {
            self.stats.record_anomaly(&event);
            if let Some(ref m) = self.metrics {
                m.anomalies.with_label_values(&[event.kind.as_str()]).inc();
            }
            warn!(kind = event.kind.as_str(), value = event.value, "anomaly detected, flushing immediately");

            // The anomaly flush covers the pending batch too.
            self.ticks_since_save = 0;
            self.dispatch(BatchCommand::AddAndForceFlush(record, event.kind), now);
            return TickOutcome::Collected {
                anomaly: event.kind,
                flush_requested: true,
                sanitized,
            };
        }

        self.dispatch(BatchCommand::Add(record), now);

        let mut flush_requested = false;
        self.ticks_since_save += 1;
        if self.options.save_interval_ticks > 0
            && self.ticks_since_save >= self.options.save_interval_ticks
        {
            self.ticks_since_save = 0;
            self.dispatch(BatchCommand::Flush(FlushReason::SaveInterval), now);
            flush_requested = true;
        }

        TickOutcome::Collected {
            anomaly: AnomalyKind::None,
            flush_requested,
            sanitized,
        }
    }

    fn dispatch(&self, command: BatchCommand, now: SystemTime) {
        let rejected = match self.commands.try_send(command) {
            Ok(()) => return,
            Err(TrySendError::Full(cmd)) => {
                debug!("batch worker busy, routing record to offline queue");
                cmd
            }
            Err(TrySendError::Closed(cmd)) => cmd,
        };

        let Some(record) = rejected.into_record() else {
            debug!("dropping flush request, batch worker unavailable");
            return;
        };

        match self.fallback.enqueue(record) {
            Ok(_) => {
                self.stats.record_saved(1, now);
                if let Some(ref m) = self.metrics {
                    m.records_queued.inc();
                    m.queue_size.set(self.fallback.len() as f64);
                }
            }
            Err(e) => {
                self.stats.record_error(ErrorKind::Persistence);
                if let Some(ref m) = self.metrics {
                    m.persistence_errors.with_label_values(&[e.kind()]).inc();
                }
                warn!(error = %e, "persisting offline queue failed");
            }
        }
    }

    /// Ticks every `period` until cancelled.
    pub async fn run(mut self, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::RawMetricsSample;
    use crate::source::StaticSource;
    use crate::storage::MemoryStore;

    fn nominal() -> RawMetricsSample {
        RawMetricsSample {
            cpu_usage: 30.0,
            ram_usage: 40.0,
            gpu_usage: 5.0,
            disk_usage: 50.0,
            network_download: 2.0,
            network_upload: 1.0,
        }
    }

    struct Fixture {
        collector: Collector,
        rx: mpsc::Receiver<BatchCommand>,
        queue: Arc<OfflineQueue>,
        buffer: Arc<Mutex<CircularBuffer>>,
        stats: Arc<PipelineStats>,
    }

    fn fixture(source: StaticSource, capacity: usize, save_interval_ticks: u64) -> Fixture {
        let (tx, rx) = mpsc::channel(capacity);
        let queue = Arc::new(OfflineQueue::open(Arc::new(MemoryStore::new()), 100, 5));
        let buffer = Arc::new(Mutex::new(CircularBuffer::new(60)));
        let stats = Arc::new(PipelineStats::new());
        let collector = Collector::new(
            Box::new(source),
            AnomalyDetector::default(),
            buffer.clone(),
            tx,
            queue.clone(),
            stats.clone(),
            CollectorOptions {
                device: DeviceInfo {
                    id: Some("dev-1".to_string()),
                    name: None,
                },
                save_interval_ticks,
                sanitize_invalid: false,
            },
        );
        Fixture {
            collector,
            rx,
            queue,
            buffer,
            stats,
        }
    }

    #[test]
    fn test_normal_tick_adds_record() {
        let mut f = fixture(StaticSource::new(nominal()), 8, 300);

        let outcome = f.collector.tick();
        assert!(matches!(
            outcome,
            TickOutcome::Collected {
                anomaly: AnomalyKind::None,
                flush_requested: false,
                sanitized: false,
            }
        ));

        match f.rx.try_recv().expect("command sent") {
            BatchCommand::Add(record) => {
                assert_eq!(record.cpu_usage, 30.0);
                assert_eq!(record.network_usage, 1.5);
                assert_eq!(record.device_id.as_deref(), Some("dev-1"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(f.buffer.lock().len(), 1);
        // Saved once the worker delivers or queues it.
        assert_eq!(f.stats.snapshot().total_saved, 0);
    }

    #[test]
    fn test_anomaly_forces_flush() {
        let mut raw = nominal();
        raw.cpu_usage = 81.0;
        let mut f = fixture(StaticSource::new(raw), 8, 300);

        let outcome = f.collector.tick();
        assert!(matches!(
            outcome,
            TickOutcome::Collected {
                anomaly: AnomalyKind::CpuSpike,
                flush_requested: true,
                ..
            }
        ));
        assert!(matches!(
            f.rx.try_recv().expect("command"),
            BatchCommand::AddAndForceFlush(_, AnomalyKind::CpuSpike)
        ));
        assert!(f.rx.try_recv().is_err());

        let last = f.stats.snapshot().last_anomaly.expect("recorded");
        assert_eq!(last.value, 81.0);
    }

    #[test]
    fn test_invalid_sample_is_never_pushed() {
        let mut raw = nominal();
        raw.ram_usage = f64::NAN;
        let mut f = fixture(StaticSource::new(raw), 8, 300);

        match f.collector.tick() {
            TickOutcome::Rejected(e) => assert_eq!(e.field, "ram_usage"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(f.buffer.lock().is_empty());
        assert!(f.rx.try_recv().is_err());

        let snap = f.stats.snapshot();
        assert_eq!(snap.validation_errors, 1);
        assert_eq!(snap.total_collected, 0);
    }

    #[test]
    fn test_sanitize_invalid_option_clamps() {
        let mut raw = nominal();
        raw.gpu_usage = 130.0;
        let mut f = fixture(StaticSource::new(raw), 8, 300);
        f.collector.options.sanitize_invalid = true;

        assert!(matches!(
            f.collector.tick(),
            TickOutcome::Collected { sanitized: true, .. }
        ));
        match f.rx.try_recv().expect("command") {
            BatchCommand::Add(record) => assert_eq!(record.gpu_usage, 100.0),
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(f.stats.snapshot().validation_errors, 1);
    }

    #[test]
    fn test_source_failure_is_counted() {
        let mut source = StaticSource::new(nominal());
        source.fail_next(1);
        let mut f = fixture(source, 8, 300);

        assert!(matches!(f.collector.tick(), TickOutcome::SourceFailed(_)));
        assert!(matches!(f.collector.tick(), TickOutcome::Collected { .. }));
        assert_eq!(f.stats.snapshot().source_errors, 1);
    }

    #[test]
    fn test_save_interval_requests_flush() {
        let mut f = fixture(StaticSource::new(nominal()), 16, 3);

        for _ in 0..3 {
            f.collector.tick();
        }

        let mut commands = Vec::new();
        while let Ok(cmd) = f.rx.try_recv() {
            commands.push(cmd);
        }
        assert_eq!(commands.len(), 4);
        assert!(matches!(
            commands[3],
            BatchCommand::Flush(FlushReason::SaveInterval)
        ));
    }

    #[test]
    fn test_full_channel_falls_back_to_queue() {
        let mut f = fixture(StaticSource::new(nominal()), 1, 0);

        f.collector.tick();
        f.collector.tick();

        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.stats.snapshot().total_saved, 1);
        assert!(matches!(f.rx.try_recv(), Ok(BatchCommand::Add(_))));
    }

    #[test]
    fn test_pause_and_resume() {
        let mut f = fixture(StaticSource::new(nominal()), 8, 300);
        f.collector.pause();
        assert!(f.collector.is_paused());
        assert!(matches!(f.collector.tick(), TickOutcome::Paused));
        assert!(f.buffer.lock().is_empty());

        let flag = f.collector.pause_flag();
        flag.store(false, Ordering::Relaxed);
        assert!(matches!(f.collector.tick(), TickOutcome::Collected { .. }));
    }
}
