pub mod anomaly;
pub mod validate;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One reading from the host metric source, before any validation.
///
/// Usage fields are percentages, network fields are MB/s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawMetricsSample {
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub gpu_usage: f64,
    pub disk_usage: f64,
    pub network_download: f64,
    pub network_upload: f64,
}

/// A sample whose fields are guaranteed to be finite and inside their domain.
///
/// Only [`validate::validate`] and [`validate::sanitize`] construct one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidatedSample {
    cpu_usage: f64,
    ram_usage: f64,
    gpu_usage: f64,
    disk_usage: f64,
    network_download: f64,
    network_upload: f64,
}

impl ValidatedSample {
    pub fn cpu_usage(&self) -> f64 {
        self.cpu_usage
    }

    pub fn ram_usage(&self) -> f64 {
        self.ram_usage
    }

    pub fn gpu_usage(&self) -> f64 {
        self.gpu_usage
    }

    pub fn disk_usage(&self) -> f64 {
        self.disk_usage
    }

    pub fn network_download(&self) -> f64 {
        self.network_download
    }

    pub fn network_upload(&self) -> f64 {
        self.network_upload
    }

    /// Mean of download and upload throughput, as stored remotely.
    pub fn network_usage(&self) -> f64 {
        (self.network_download + self.network_upload) / 2.0
    }

    /// Converts back into the raw representation.
    pub fn into_raw(self) -> RawMetricsSample {
        RawMetricsSample {
            cpu_usage: self.cpu_usage,
            ram_usage: self.ram_usage,
            gpu_usage: self.gpu_usage,
            disk_usage: self.disk_usage,
            network_download: self.network_download,
            network_upload: self.network_upload,
        }
    }
}

/// A point on the live chart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub cpu: f64,
    pub ram: f64,
    pub gpu: f64,
    pub disk: f64,
    pub network_download: f64,
    pub network_upload: f64,
}

impl DataPoint {
    pub fn from_sample(sample: &ValidatedSample, timestamp_ms: i64) -> Self {
        Self {
            timestamp: timestamp_ms,
            cpu: sample.cpu_usage,
            ram: sample.ram_usage,
            gpu: sample.gpu_usage,
            disk: sample.disk_usage,
            network_download: sample.network_download,
            network_upload: sample.network_upload,
        }
    }
}

/// Identity attached to every stored record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: Option<String>,
    pub name: Option<String>,
}

/// The durable unit delivered to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    /// RFC 3339 timestamp with millisecond precision.
    pub timestamp: String,
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub gpu_usage: f64,
    pub disk_usage: f64,
    pub network_usage: f64,
    pub water_bottles_equivalent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

impl PerformanceRecord {
    pub fn from_sample(sample: &ValidatedSample, device: &DeviceInfo, at: SystemTime) -> Self {
        Self {
            timestamp: format_rfc3339(at),
            cpu_usage: sample.cpu_usage,
            ram_usage: sample.ram_usage,
            gpu_usage: sample.gpu_usage,
            disk_usage: sample.disk_usage,
            network_usage: sample.network_usage(),
            water_bottles_equivalent: water_bottles_equivalent(sample),
            device_id: device.id.clone(),
            device_name: device.name.clone(),
        }
    }
}

/// A record waiting in the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRecord {
    #[serde(flatten)]
    pub record: PerformanceRecord,
    pub queued_at: String,
    pub retry_count: u32,
}

impl QueuedRecord {
    pub fn new(record: PerformanceRecord, queued_at: SystemTime) -> Self {
        Self {
            record,
            queued_at: format_rfc3339(queued_at),
            retry_count: 0,
        }
    }
}

// Full-load component draw in watts used for the energy estimate.
const CPU_MAX_WATTS: f64 = 95.0;
const RAM_MAX_WATTS: f64 = 15.0;
const GPU_MAX_WATTS: f64 = 150.0;
const DISK_MAX_WATTS: f64 = 10.0;

/// Litres of water consumed producing one kWh.
const LITRES_PER_KWH: f64 = 0.25;
const LITRES_PER_BOTTLE: f64 = 0.5;

/// Estimates the energy drawn during one second at the sampled load,
/// expressed as half-litre water bottles.
pub fn water_bottles_equivalent(sample: &ValidatedSample) -> f64 {
    let watts = sample.cpu_usage / 100.0 * CPU_MAX_WATTS
        + sample.ram_usage / 100.0 * RAM_MAX_WATTS
        + sample.gpu_usage / 100.0 * GPU_MAX_WATTS
        + sample.disk_usage / 100.0 * DISK_MAX_WATTS;

    let kwh_per_second = watts / 1000.0 / 3600.0;
    kwh_per_second * LITRES_PER_KWH / LITRES_PER_BOTTLE
}

/// Formats a wall-clock time the way the remote store expects it
/// (`2024-01-01T00:00:00.000Z`).
pub fn format_rfc3339(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Milliseconds since the Unix epoch, saturating at zero for pre-epoch times.
pub fn unix_millis(t: SystemTime) -> i64 {
    let since = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    i64::try_from(since.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::validate::sanitize;
    use super::*;

    fn sample(cpu: f64, ram: f64, gpu: f64, disk: f64, down: f64, up: f64) -> ValidatedSample {
        sanitize(&RawMetricsSample {
            cpu_usage: cpu,
            ram_usage: ram,
            gpu_usage: gpu,
            disk_usage: disk,
            network_download: down,
            network_upload: up,
        })
    }

    #[test]
    fn test_record_from_sample_averages_network() {
        let s = sample(10.0, 20.0, 30.0, 40.0, 8.0, 2.0);
        let device = DeviceInfo {
            id: Some("dev-1".to_string()),
            name: Some("workstation".to_string()),
        };

        let record = PerformanceRecord::from_sample(&s, &device, UNIX_EPOCH);

        assert_eq!(record.timestamp, "1970-01-01T00:00:00.000Z");
        assert_eq!(record.network_usage, 5.0);
        assert_eq!(record.cpu_usage, 10.0);
        assert_eq!(record.device_id.as_deref(), Some("dev-1"));
        assert_eq!(record.device_name.as_deref(), Some("workstation"));
    }

    #[test]
    fn test_water_bottles_at_full_load() {
        let s = sample(100.0, 100.0, 100.0, 100.0, 0.0, 0.0);
        // 270 W for one second.
        let expected = 270.0 / 1000.0 / 3600.0 * 0.25 / 0.5;
        assert!((water_bottles_equivalent(&s) - expected).abs() < 1e-15);
    }

    #[test]
    fn test_water_bottles_idle_is_zero() {
        let s = sample(0.0, 0.0, 0.0, 0.0, 50.0, 50.0);
        assert_eq!(water_bottles_equivalent(&s), 0.0);
    }

    #[test]
    fn test_record_serialization_omits_missing_device() {
        let s = sample(1.0, 2.0, 3.0, 4.0, 0.0, 0.0);
        let record = PerformanceRecord::from_sample(&s, &DeviceInfo::default(), UNIX_EPOCH);

        let json = serde_json::to_string(&record).expect("serialize");
        assert!(json.contains("\"water_bottles_equivalent\""));
        assert!(!json.contains("device_id"));
        assert!(!json.contains("device_name"));
    }

    #[test]
    fn test_queued_record_flattens_fields() {
        let s = sample(1.0, 2.0, 3.0, 4.0, 0.0, 0.0);
        let record = PerformanceRecord::from_sample(&s, &DeviceInfo::default(), UNIX_EPOCH);
        let queued = QueuedRecord::new(record, UNIX_EPOCH + Duration::from_secs(1));

        let value = serde_json::to_value(&queued).expect("serialize");
        assert_eq!(value["cpu_usage"], 1.0);
        assert_eq!(value["retry_count"], 0);
        assert_eq!(value["queued_at"], "1970-01-01T00:00:01.000Z");
        assert!(value.get("record").is_none());
    }

    #[test]
    fn test_unix_millis() {
        assert_eq!(unix_millis(UNIX_EPOCH + Duration::from_millis(1500)), 1500);
        assert_eq!(unix_millis(UNIX_EPOCH - Duration::from_secs(1)), 0);
    }
}
