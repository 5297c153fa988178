use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::sample::{DeviceInfo, RawMetricsSample};

/// Top-level configuration for the vera agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identity stamped on every record.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Collection, batching, queueing and sync tuning.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Anomaly thresholds.
    #[serde(default)]
    pub anomaly: AnomalyConfig,

    /// Remote table store connection.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Local persistence for the offline queue and snapshot.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Host metric source.
    #[serde(default)]
    pub source: SourceConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Device identity. Both fields are optional and sent as-is.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,
}

/// Pipeline tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Records per remote insert before a size flush. Default: 20.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Time since the previous flush after which a non-empty batch is flushed.
    /// Default: 5m.
    #[serde(default = "default_batch_timeout", with = "humantime_serde")]
    pub batch_timeout: Duration,

    /// Offline queue capacity; the oldest entry is evicted beyond it. Default: 1000.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Failed sync attempts before a queued record is dropped. Default: 5.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Period of the background queue sync. Default: 60s.
    #[serde(default = "default_sync_interval", with = "humantime_serde")]
    pub sync_interval: Duration,

    /// Records per insert during a sync pass. Default: 50.
    #[serde(default = "default_sync_batch_size")]
    pub sync_batch_size: usize,

    /// Period of the connectivity probe. Default: 30s.
    #[serde(default = "default_connectivity_check_interval", with = "humantime_serde")]
    pub connectivity_check_interval: Duration,

    /// Collection tick. Default: 1s.
    #[serde(default = "default_collection_tick", with = "humantime_serde")]
    pub collection_tick: Duration,

    /// Non-anomalous ticks between save-interval flushes. Default: 300.
    #[serde(default = "default_save_interval_ticks")]
    pub save_interval_ticks: u64,

    /// Live chart window, in points. Default: 60.
    #[serde(default = "default_circular_buffer_capacity")]
    pub circular_buffer_capacity: usize,

    /// Upper bound on the whole shutdown sequence. Default: 5s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Capacity of the collector to batch worker channel. Default: 256.
    #[serde(default = "default_command_channel_capacity")]
    pub command_channel_capacity: usize,

    /// Clamp out-of-range samples instead of rejecting them. Default: false.
    #[serde(default)]
    pub sanitize_invalid: bool,
}

/// Usage percentages above which a sample is an anomaly.
#[derive(Debug, Clone, Deserialize)]
pub struct AnomalyConfig {
    /// Default: 80.
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,

    /// Default: 85.
    #[serde(default = "default_ram_threshold")]
    pub ram_threshold: f64,

    /// Default: 95.
    #[serde(default = "default_disk_threshold")]
    pub disk_threshold: f64,
}

/// Remote table store connection.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the REST endpoint (e.g., "https://db.example.com").
    #[serde(default)]
    pub endpoint: String,

    /// Target table. Default: "performance_metrics".
    #[serde(default = "default_remote_table")]
    pub table: String,

    /// Sent as both the apikey header and the bearer token.
    #[serde(default)]
    pub api_key: String,

    /// Extra HTTP headers sent on every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body compression: none, gzip, or zstd. Default: "none".
    #[serde(default = "default_remote_compression")]
    pub compression: String,

    /// Per-request timeout. Default: 10s.
    #[serde(default = "default_remote_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Local persistence.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the queue and snapshot files. Default: "./vera-data".
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
}

/// Which metric source feeds the collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// procfs and statvfs on Linux.
    #[default]
    Proc,
    /// A fixed sample, for demos and soak tests.
    Static,
}

/// Host metric source.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,

    /// Path whose filesystem is reported as disk usage. Default: "/".
    #[serde(default = "default_disk_path")]
    pub disk_path: PathBuf,

    /// Sample replayed by the static source.
    #[serde(default)]
    pub sample: RawMetricsSample,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics, /healthz and /stats. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9095".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_batch_size() -> usize {
    20
}

fn default_batch_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_sync_batch_size() -> usize {
    50
}

fn default_connectivity_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_collection_tick() -> Duration {
    Duration::from_secs(1)
}

fn default_save_interval_ticks() -> u64 {
    300
}

fn default_circular_buffer_capacity() -> usize {
    60
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_command_channel_capacity() -> usize {
    256
}

fn default_cpu_threshold() -> f64 {
    80.0
}

fn default_ram_threshold() -> f64 {
    85.0
}

fn default_disk_threshold() -> f64 {
    95.0
}

fn default_remote_table() -> String {
    "performance_metrics".to_string()
}

fn default_remote_compression() -> String {
    "none".to_string()
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./vera-data")
}

fn default_disk_path() -> PathBuf {
    PathBuf::from("/")
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9095".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            device: DeviceConfig::default(),
            pipeline: PipelineConfig::default(),
            anomaly: AnomalyConfig::default(),
            remote: RemoteConfig::default(),
            storage: StorageConfig::default(),
            source: SourceConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            batch_timeout: default_batch_timeout(),
            max_queue_size: default_max_queue_size(),
            max_retry_attempts: default_max_retry_attempts(),
            sync_interval: default_sync_interval(),
            sync_batch_size: default_sync_batch_size(),
            connectivity_check_interval: default_connectivity_check_interval(),
            collection_tick: default_collection_tick(),
            save_interval_ticks: default_save_interval_ticks(),
            circular_buffer_capacity: default_circular_buffer_capacity(),
            shutdown_timeout: default_shutdown_timeout(),
            command_channel_capacity: default_command_channel_capacity(),
            sanitize_invalid: false,
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: default_cpu_threshold(),
            ram_threshold: default_ram_threshold(),
            disk_threshold: default_disk_threshold(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            table: default_remote_table(),
            api_key: String::new(),
            headers: HashMap::new(),
            compression: default_remote_compression(),
            timeout: default_remote_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            disk_path: default_disk_path(),
            sample: RawMetricsSample::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.remote.endpoint.is_empty() {
            bail!("remote.endpoint is required");
        }
        if !self.remote.endpoint.starts_with("http://")
            && !self.remote.endpoint.starts_with("https://")
        {
            bail!("remote.endpoint must be an http(s) URL");
        }
        if self.remote.table.is_empty() {
            bail!("remote.table is required");
        }
        if !matches!(self.remote.compression.as_str(), "none" | "gzip" | "zstd") {
            bail!(
                "remote.compression must be one of none, gzip, zstd (got {:?})",
                self.remote.compression
            );
        }
        if self.remote.timeout.is_zero() {
            bail!("remote.timeout must be positive");
        }

        let p = &self.pipeline;
        if p.max_batch_size == 0 {
            bail!("pipeline.max_batch_size must be positive");
        }
        if p.max_queue_size == 0 {
            bail!("pipeline.max_queue_size must be positive");
        }
        if p.max_retry_attempts == 0 {
            bail!("pipeline.max_retry_attempts must be positive");
        }
        if p.sync_batch_size == 0 {
            bail!("pipeline.sync_batch_size must be positive");
        }
        if p.save_interval_ticks == 0 {
            bail!("pipeline.save_interval_ticks must be positive");
        }
        if p.circular_buffer_capacity == 0 {
            bail!("pipeline.circular_buffer_capacity must be positive");
        }
        if p.command_channel_capacity == 0 {
            bail!("pipeline.command_channel_capacity must be positive");
        }
        for (name, value) in [
            ("pipeline.batch_timeout", p.batch_timeout),
            ("pipeline.sync_interval", p.sync_interval),
            ("pipeline.connectivity_check_interval", p.connectivity_check_interval),
            ("pipeline.collection_tick", p.collection_tick),
            ("pipeline.shutdown_timeout", p.shutdown_timeout),
        ] {
            if value.is_zero() {
                bail!("{name} must be positive");
            }
        }

        for (name, value) in [
            ("anomaly.cpu_threshold", self.anomaly.cpu_threshold),
            ("anomaly.ram_threshold", self.anomaly.ram_threshold),
            ("anomaly.disk_threshold", self.anomaly.disk_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                bail!("{name} must be in (0, 100], got {value}");
            }
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health is enabled");
        }

        Ok(())
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.device.id.clone(),
            name: self.device.name.clone(),
        }
    }
}
