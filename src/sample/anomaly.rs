use std::time::SystemTime;

use serde::Serialize;

use crate::config::AnomalyConfig;

use super::ValidatedSample;

/// Kind of threshold breach found in a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    CpuSpike,
    RamSpike,
    DiskFull,
    None,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CpuSpike => "cpu_spike",
            Self::RamSpike => "ram_spike",
            Self::DiskFull => "disk_full",
            Self::None => "none",
        }
    }

    /// Every kind that represents an actual anomaly.
    pub fn all() -> &'static [AnomalyKind] {
        &[Self::CpuSpike, Self::RamSpike, Self::DiskFull]
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyEvent {
    pub kind: AnomalyKind,
    /// The breaching value, or 0 when `kind` is `None`.
    pub value: f64,
    pub detected_at: SystemTime,
}

impl AnomalyEvent {
    pub fn is_anomaly(&self) -> bool {
        self.kind != AnomalyKind::None
    }
}

/// Stateless threshold classifier.
///
/// Rules are checked in priority order CPU, RAM, disk and the first match
/// wins. There is no hysteresis: a value hovering around a threshold is
/// reported on every tick it exceeds it.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    cpu_threshold: f64,
    ram_threshold: f64,
    disk_threshold: f64,
}

impl AnomalyDetector {
    pub fn new(cfg: &AnomalyConfig) -> Self {
        Self {
            cpu_threshold: cfg.cpu_threshold,
            ram_threshold: cfg.ram_threshold,
            disk_threshold: cfg.disk_threshold,
        }
    }

    pub fn classify(&self, sample: &ValidatedSample) -> AnomalyEvent {
        self.classify_at(sample, SystemTime::now())
    }

    pub fn classify_at(&self, sample: &ValidatedSample, now: SystemTime) -> AnomalyEvent {
        let (kind, value) = if sample.cpu_usage() > self.cpu_threshold {
            (AnomalyKind::CpuSpike, sample.cpu_usage())
        } else if sample.ram_usage() > self.ram_threshold {
            (AnomalyKind::RamSpike, sample.ram_usage())
        } else if sample.disk_usage() > self.disk_threshold {
            (AnomalyKind::DiskFull, sample.disk_usage())
        } else {
            (AnomalyKind::None, 0.0)
        };

        AnomalyEvent {
            kind,
            value,
            detected_at: now,
        }
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(&AnomalyConfig::default())
    }
}
