use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;

use crate::sample::anomaly::{AnomalyEvent, AnomalyKind};
use crate::sample::format_rfc3339;

/// Error categories counted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ErrorKind {
    Validation = 0,
    Source = 1,
    Remote = 2,
    Persistence = 3,
}

const ERROR_KINDS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalySummary {
    pub kind: AnomalyKind,
    pub value: f64,
    pub detected_at: String,
}

/// Cumulative pipeline counters, shared by the collection path and the
/// batch worker.
///
/// Counters are lock-free; the timestamps sit behind one small mutex.
pub struct PipelineStats {
    total_collected: AtomicU64,
    total_saved: AtomicU64,
    errors: [AtomicU64; ERROR_KINDS],
    anomalies: AtomicU64,
    times: Mutex<Times>,
}

#[derive(Default)]
struct Times {
    last_anomaly: Option<AnomalySummary>,
    last_collection: Option<SystemTime>,
    last_save: Option<SystemTime>,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub total_collected: u64,
    pub total_saved: u64,
    pub total_errors: u64,
    pub validation_errors: u64,
    pub source_errors: u64,
    pub remote_errors: u64,
    pub persistence_errors: u64,
    pub anomalies: u64,
    pub last_anomaly: Option<AnomalySummary>,
    pub last_collection: Option<String>,
    pub last_save: Option<String>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            total_collected: AtomicU64::new(0),
            total_saved: AtomicU64::new(0),
            errors: std::array::from_fn(|_| AtomicU64::new(0)),
            anomalies: AtomicU64::new(0),
            times: Mutex::new(Times::default()),
        }
    }

    /// A sample passed validation and entered the pipeline.
    pub fn record_collected(&self, at: SystemTime) {
        self.total_collected.fetch_add(1, Ordering::Relaxed);
        self.times.lock().last_collection = Some(at);
    }

    /// Records were delivered to the remote or persisted in the offline queue.
    pub fn record_saved(&self, count: u64, at: SystemTime) {
        self.total_saved.fetch_add(count, Ordering::Relaxed);
        self.times.lock().last_save = Some(at);
    }

    pub fn record_error(&self, kind: ErrorKind) {
        self.errors[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_anomaly(&self, event: &AnomalyEvent) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
        self.times.lock().last_anomaly = Some(AnomalySummary {
            kind: event.kind,
            value: event.value,
            detected_at: format_rfc3339(event.detected_at),
        });
    }

    pub fn errors(&self, kind: ErrorKind) -> u64 {
        self.errors[kind as usize].load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.errors.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        let times = self.times.lock();
        PipelineStatsSnapshot {
            total_collected: self.total_collected.load(Ordering::Relaxed),
            total_saved: self.total_saved.load(Ordering::Relaxed),
            total_errors: self.total_errors(),
            validation_errors: self.errors(ErrorKind::Validation),
            source_errors: self.errors(ErrorKind::Source),
            remote_errors: self.errors(ErrorKind::Remote),
            persistence_errors: self.errors(ErrorKind::Persistence),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            last_anomaly: times.last_anomaly.clone(),
            last_collection: times.last_collection.map(format_rfc3339),
            last_save: times.last_save.map(format_rfc3339),
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}
