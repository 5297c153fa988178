use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{Persistence, PersistenceError};

/// In-process persistence with an optional byte quota.
///
/// Used by tests and demos. `set_failing(true)` makes every save return an
/// I/O error so callers' failure paths can be exercised.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
    quota: Option<usize>,
    failing: AtomicBool,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the total stored bytes across all keys.
    pub fn with_quota(quota: usize) -> Self {
        Self {
            quota: Some(quota),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Raw bytes for `key`, bypassing the trait.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.values.lock().get(key).cloned()
    }

    /// Writes raw bytes for `key`, bypassing quota and failure injection.
    pub fn put(&self, key: &str, bytes: &[u8]) {
        self.values.lock().insert(key.to_string(), bytes.to_vec());
    }
}

impl Persistence for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(PersistenceError::Io {
                key: key.to_string(),
                source: io::Error::new(io::ErrorKind::Other, "injected failure"),
            });
        }

        let mut values = self.values.lock();
        if let Some(quota) = self.quota {
            let others: usize = values
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len())
                .sum();
            let available = quota.saturating_sub(others);
            if bytes.len() > available {
                return Err(PersistenceError::QuotaExceeded {
                    key: key.to_string(),
                    needed: bytes.len(),
                    available,
                });
            }
        }

        values.insert(key.to_string(), bytes.to_vec());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        self.values.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let store = MemoryStore::new();
        store.save("k", b"v").expect("save");
        assert_eq!(store.load("k").expect("load"), Some(b"v".to_vec()));
        assert_eq!(store.save_count(), 1);
        store.delete("k").expect("delete");
        assert!(store.load("k").expect("load").is_none());
    }

    #[test]
    fn test_quota_counts_other_keys() {
        let store = MemoryStore::with_quota(10);
        store.save("a", b"123456").expect("fits");

        // Replacing the same key only counts the new value.
        store.save("a", b"1234567890").expect("replace fits");

        let err = store.save("b", b"1").expect_err("over quota");
        match err {
            PersistenceError::QuotaExceeded {
                needed, available, ..
            } => {
                assert_eq!(needed, 1);
                assert_eq!(available, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_injected_failure_keeps_previous_value() {
        let store = MemoryStore::new();
        store.save("k", b"old").expect("save");
        store.set_failing(true);
        assert!(store.save("k", b"new").is_err());
        assert_eq!(store.get("k"), Some(b"old".to_vec()));
    }
}
