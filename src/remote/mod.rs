//! Remote store client abstraction.

pub mod http;
pub mod memory;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::sample::PerformanceRecord;

pub use http::HttpRemoteStore;
pub use memory::MemoryRemoteStore;

/// Callback type for recording remote request metrics.
/// Receives (operation, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Delivery failure. Never surfaced past the pipeline; it only drives
/// retry accounting and metrics.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("encoding request: {0}")]
    Encoding(String),

    #[error("remote store unavailable")]
    Unavailable,
}

impl RemoteError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Transport(_) => "transport",
            Self::Status { .. } => "status",
            Self::Encoding(_) => "encoding",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Destination for performance records.
///
/// `insert` is atomic from the caller's view: either every record in the
/// slice is accepted or the call fails.
pub trait RemoteStore: Send + Sync + 'static {
    /// Store name for logging.
    fn name(&self) -> &str;

    fn insert(
        &self,
        records: &[PerformanceRecord],
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Cheap reachability probe.
    fn ping(&self) -> impl Future<Output = bool> + Send;
}

/// Runs `insert` under a deadline, mapping expiry to [`RemoteError::Timeout`].
pub async fn insert_with_timeout<R: RemoteStore>(
    remote: &R,
    records: &[PerformanceRecord],
    timeout: Duration,
) -> Result<(), RemoteError> {
    match tokio::time::timeout(timeout, remote.insert(records)).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(timeout)),
    }
}

/// Runs `ping` under a deadline; expiry counts as unreachable.
pub async fn ping_with_timeout<R: RemoteStore>(remote: &R, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, remote.ping())
        .await
        .unwrap_or(false)
}
