use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::sample::{format_rfc3339, DataPoint};

use super::{Persistence, PersistenceError};

/// Persistence key holding the last live-chart window.
pub const SNAPSHOT_KEY: &str = "offline_snapshot";

/// Recent chart points saved for display while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineSnapshot {
    pub saved_at: String,
    pub points: Vec<DataPoint>,
}

impl OfflineSnapshot {
    pub fn new(points: Vec<DataPoint>, at: SystemTime) -> Self {
        Self {
            saved_at: format_rfc3339(at),
            points,
        }
    }
}

pub fn save_snapshot(
    store: &dyn Persistence,
    snapshot: &OfflineSnapshot,
) -> Result<(), PersistenceError> {
    let bytes = serde_json::to_vec(snapshot).map_err(|source| PersistenceError::Serialization {
        key: SNAPSHOT_KEY.to_string(),
        source,
    })?;
    store.save(SNAPSHOT_KEY, &bytes)
}

/// Reads the saved snapshot. A corrupt value is logged and reported as absent.
pub fn load_snapshot(store: &dyn Persistence) -> Result<Option<OfflineSnapshot>, PersistenceError> {
    let Some(bytes) = store.load(SNAPSHOT_KEY)? else {
        return Ok(None);
    };

    match serde_json::from_slice(&bytes) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            warn!(error = %e, backend = store.name(), "discarding corrupt offline snapshot");
            Ok(None)
        }
    }
}
