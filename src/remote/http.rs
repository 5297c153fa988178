use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::config::RemoteConfig;
use crate::sample::PerformanceRecord;

use super::{MetricsCallback, RemoteError, RemoteStore};

/// Remote store speaking the PostgREST table API.
///
/// Inserts are a JSON array `POST /rest/v1/<table>`; the reachability probe
/// selects a single id from the same table.
pub struct HttpRemoteStore {
    http: reqwest::Client,
    insert_url: String,
    ping_url: String,
    api_key: String,
    headers: Vec<(String, String)>,
    compression: Compression,
    metrics: Option<MetricsCallback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "none" | "" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            other => bail!("unsupported compression: {other}"),
        }
    }

    fn content_encoding(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gzip"),
            Self::Zstd => Some("zstd"),
        }
    }

    fn encode(self, data: Vec<u8>) -> std::io::Result<Vec<u8>> {
        match self {
            Self::None => Ok(data),
            Self::Gzip => {
                use flate2::write::GzEncoder;

                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(&data)?;
                encoder.finish()
            }
            Self::Zstd => zstd::encode_all(data.as_slice(), 0),
        }
    }
}

impl HttpRemoteStore {
    pub fn new(cfg: &RemoteConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        let base = cfg.endpoint.trim_end_matches('/');
        let insert_url = format!("{base}/rest/v1/{}", cfg.table);
        let ping_url = format!("{insert_url}?select=id&limit=1");

        let mut headers: Vec<(String, String)> = cfg
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.sort();

        Ok(Self {
            http,
            insert_url,
            ping_url,
            api_key: cfg.api_key.clone(),
            headers,
            compression: Compression::parse(&cfg.compression)?,
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, operation: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(operation, status, duration);
        }
    }

    fn authorize(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if !self.api_key.is_empty() {
            request = request
                .header("apikey", self.api_key.as_str())
                .header("Authorization", format!("Bearer {}", self.api_key));
        }
        for (k, v) in &self.headers {
            request = request.header(k.as_str(), v.as_str());
        }
        request
    }

    async fn post_records(&self, records: &[PerformanceRecord]) -> Result<(), RemoteError> {
        let body =
            serde_json::to_vec(records).map_err(|e| RemoteError::Encoding(e.to_string()))?;
        let raw_len = body.len();
        let body = self
            .compression
            .encode(body)
            .map_err(|e| RemoteError::Encoding(e.to_string()))?;

        let mut request = self
            .http
            .post(&self.insert_url)
            .header("Content-Type", "application/json")
            .header("Prefer", "return=minimal")
            .body(body);

        if let Some(encoding) = self.compression.content_encoding() {
            request = request.header("Content-Encoding", encoding);
        }

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }
        // Drain body for connection reuse.
        let _ = response.bytes().await;

        debug!(records = records.len(), bytes = raw_len, "inserted records");
        Ok(())
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout(Duration::ZERO)
    } else {
        RemoteError::Transport(e.to_string())
    }
}

impl RemoteStore for HttpRemoteStore {
    fn name(&self) -> &str {
        "http"
    }

    async fn insert(&self, records: &[PerformanceRecord]) -> Result<(), RemoteError> {
        if records.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let result = self.post_records(records).await;
        let status = match &result {
            Ok(()) => "success",
            Err(e) => e.kind(),
        };
        self.record_request("insert", status, start.elapsed());
        result
    }

    async fn ping(&self) -> bool {
        let start = Instant::now();
        let request = self
            .http
            .get(&self.ping_url)
            .header("Accept", "application/json");

        let online = match self.authorize(request).send().await {
            Ok(response) => {
                let ok = response.status().is_success();
                let _ = response.bytes().await;
                ok
            }
            Err(e) => {
                debug!(error = %e, "connectivity probe failed");
                false
            }
        };

        let status = if online { "success" } else { "error" };
        self.record_request("ping", status, start.elapsed());
        online
    }
}
