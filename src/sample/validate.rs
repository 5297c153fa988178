//! Gate between the metric source and the rest of the pipeline.
//!
//! [`validate`] rejects a sample outright when any field is non-finite or out
//! of its domain. [`sanitize`] clamps instead, for callers that prefer
//! continuity over rejection.

use thiserror::Error;

use super::{RawMetricsSample, ValidatedSample};

/// Upper bound for percentage fields.
pub const USAGE_MAX: f64 = 100.0;

/// Upper bound for network throughput in MB/s. Real links stay far below it;
/// anything above is a bad hardware read.
pub const NETWORK_MAX_MBPS: f64 = 1000.0;

/// A sample field failed its bound check.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("invalid {field}: {value} (expected 0..={max})")]
pub struct ValidationError {
    pub field: &'static str,
    pub value: f64,
    pub max: f64,
}

/// Field name, value and upper bound, in check order.
fn fields(raw: &RawMetricsSample) -> [(&'static str, f64, f64); 6] {
    [
        ("cpu_usage", raw.cpu_usage, USAGE_MAX),
        ("ram_usage", raw.ram_usage, USAGE_MAX),
        ("gpu_usage", raw.gpu_usage, USAGE_MAX),
        ("disk_usage", raw.disk_usage, USAGE_MAX),
        ("network_download", raw.network_download, NETWORK_MAX_MBPS),
        ("network_upload", raw.network_upload, NETWORK_MAX_MBPS),
    ]
}

/// Accepts the sample only if every field is finite and within bounds.
///
/// The error reports the first offending field.
pub fn validate(raw: &RawMetricsSample) -> Result<ValidatedSample, ValidationError> {
    for (field, value, max) in fields(raw) {
        if !value.is_finite() || !(0.0..=max).contains(&value) {
            return Err(ValidationError { field, value, max });
        }
    }

    Ok(ValidatedSample {
        cpu_usage: raw.cpu_usage,
        ram_usage: raw.ram_usage,
        gpu_usage: raw.gpu_usage,
        disk_usage: raw.disk_usage,
        network_download: raw.network_download,
        network_upload: raw.network_upload,
    })
}

/// Clamps every field into its domain. NaN becomes zero.
pub fn sanitize(raw: &RawMetricsSample) -> ValidatedSample {
    ValidatedSample {
        cpu_usage: clamp(raw.cpu_usage, USAGE_MAX),
        ram_usage: clamp(raw.ram_usage, USAGE_MAX),
        gpu_usage: clamp(raw.gpu_usage, USAGE_MAX),
        disk_usage: clamp(raw.disk_usage, USAGE_MAX),
        network_download: clamp(raw.network_download, NETWORK_MAX_MBPS),
        network_upload: clamp(raw.network_upload, NETWORK_MAX_MBPS),
    }
}

fn clamp(value: f64, max: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, max)
}
