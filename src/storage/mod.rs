//! Key-value persistence used by the offline queue and the snapshot cache.

pub mod file;
pub mod memory;
pub mod snapshot;

use std::io;

use thiserror::Error;

pub use file::FileStore;
pub use memory::MemoryStore;

/// ENOSPC on Linux and macOS.
const NO_SPACE_OS_ERROR: i32 = 28;

/// Failure to read or write persisted state.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("persistence I/O on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("storage quota exceeded writing {key}: needed {needed} bytes, {available} available")]
    QuotaExceeded {
        key: String,
        needed: usize,
        available: usize,
    },

    #[error("serializing {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("blocking persistence task failed: {0}")]
    Task(String),
}

impl PersistenceError {
    /// Wraps an I/O error, mapping out-of-space into `QuotaExceeded`.
    pub fn from_io(key: &str, needed: usize, source: io::Error) -> Self {
        if source.raw_os_error() == Some(NO_SPACE_OS_ERROR) {
            return Self::QuotaExceeded {
                key: key.to_string(),
                needed,
                available: 0,
            };
        }
        Self::Io {
            key: key.to_string(),
            source,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::Serialization { .. } => "serialization",
            Self::Task(_) => "task",
        }
    }
}

/// Synchronous key-value storage.
///
/// Writes replace the whole value for a key. Implementations must be safe to
/// share across tasks.
pub trait Persistence: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Returns the stored bytes, or `None` if the key was never written.
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError>;

    /// Removes the key. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), PersistenceError>;
}
