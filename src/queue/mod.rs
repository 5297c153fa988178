//! Durable FIFO of records that could not be delivered yet.
//!
//! The queue is the single writer of its persistence key. Every mutation
//! rewrites the full JSON array while the lock is held, so concurrent
//! enqueue from the batch path and removal from the sync path cannot
//! interleave writes. Entries carry a process-local sequence id that is
//! not persisted; the sync path addresses entries by id so removals made
//! during a pass never shift the targets of later ones.
//!
//! File-backed saves fsync. Async callers run mutations through
//! [`OfflineQueue::blocking`] so the write happens on the blocking pool.
//! The collection tick calls the sync API directly, since it only enqueues
//! when the batch worker channel is full or closed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::sample::{PerformanceRecord, QueuedRecord};
use crate::storage::{Persistence, PersistenceError};

/// Persistence key for the queue contents.
pub const QUEUE_KEY: &str = "performance_data_queue";

/// Entries with more retries than this are reported as problem records.
pub const HIGH_RETRY_THRESHOLD: u32 = 3;

/// A queued record together with its in-process address.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: u64,
    pub record: QueuedRecord,
}

/// Result of [`OfflineQueue::increment_retry_ids`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOutcome {
    /// Entries whose retry count went up and are still queued.
    pub incremented: usize,
    /// Entries that reached the retry limit and were removed.
    pub dropped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub oldest: Option<String>,
    pub newest: Option<String>,
    pub high_retry_count: usize,
    /// Records removed after exhausting their retries since start.
    pub permanent_failures: u64,
    /// Records evicted by the size bound since start.
    pub evicted: u64,
}

struct Inner {
    entries: VecDeque<QueueEntry>,
    next_id: u64,
    permanent_failures: u64,
    evicted: u64,
}

impl Inner {
    fn push(&mut self, record: QueuedRecord) {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(QueueEntry { id, record });
    }

    fn position(&self, id: u64) -> Option<usize> {
        // Ids are assigned in increasing order and entries keep FIFO order.
        self.entries.binary_search_by_key(&id, |e| e.id).ok()
    }
}

pub struct OfflineQueue {
    persistence: Arc<dyn Persistence>,
    max_size: usize,
    max_retry: u32,
    inner: Mutex<Inner>,
}

impl OfflineQueue {
    /// Loads any persisted entries and returns the queue.
    ///
    /// Unreadable or corrupt data is logged and the queue starts empty. If
    /// more than `max_size` entries were persisted, only the newest are kept.
    pub fn open(persistence: Arc<dyn Persistence>, max_size: usize, max_retry: u32) -> Self {
        let max_size = max_size.max(1);
        let mut inner = Inner {
            entries: VecDeque::new(),
            next_id: 0,
            permanent_failures: 0,
            evicted: 0,
        };

        let mut loaded = load_records(persistence.as_ref());
        if loaded.len() > max_size {
            let excess = loaded.len() - max_size;
            warn!(excess, max_size, "persisted queue over capacity, dropping oldest");
            loaded.drain(..excess);
        }
        for record in loaded {
            inner.push(record);
        }

        if !inner.entries.is_empty() {
            debug!(
                count = inner.entries.len(),
                backend = persistence.name(),
                "restored offline queue"
            );
        }

        Self {
            persistence,
            max_size,
            max_retry,
            inner: Mutex::new(inner),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    /// Appends a fresh record with `retry_count = 0`.
    ///
    /// On a full queue the oldest entry is evicted first and returned.
    pub fn enqueue(
        &self,
        record: PerformanceRecord,
    ) -> Result<Option<QueuedRecord>, PersistenceError> {
        let mut inner = self.inner.lock();
        let evicted = self.push_bounded(&mut inner, QueuedRecord::new(record, SystemTime::now()));
        self.persist(&inner)?;
        Ok(evicted)
    }

    /// Appends several records with a single persistence write.
    ///
    /// Returns how many old entries were evicted to make room.
    pub fn enqueue_all(
        &self,
        records: impl IntoIterator<Item = PerformanceRecord>,
    ) -> Result<usize, PersistenceError> {
        let now = SystemTime::now();
        let mut inner = self.inner.lock();
        let mut evicted = 0;
        for record in records {
            if self
                .push_bounded(&mut inner, QueuedRecord::new(record, now))
                .is_some()
            {
                evicted += 1;
            }
        }
        self.persist(&inner)?;
        Ok(evicted)
    }

    fn push_bounded(&self, inner: &mut Inner, record: QueuedRecord) -> Option<QueuedRecord> {
        let evicted = if inner.entries.len() >= self.max_size {
            inner.evicted += 1;
            inner.entries.pop_front().map(|e| e.record)
        } else {
            None
        };
        if evicted.is_some() {
            warn!(max_size = self.max_size, "offline queue full, evicted oldest record");
        }
        inner.push(record);
        evicted
    }

    /// Runs `op` against the queue on the blocking thread pool.
    pub async fn blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(&OfflineQueue) -> Result<T, PersistenceError> + Send + 'static,
        T: Send + 'static,
    {
        let queue = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&queue))
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))?
    }

    /// Copy of all queued records, oldest first.
    pub fn all(&self) -> Vec<QueuedRecord> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| e.record.clone())
            .collect()
    }

    /// Copy of all entries with their ids, oldest first.
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.inner.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Removes the entry at `index`. Out-of-range indices are ignored.
    pub fn remove(&self, index: usize) -> Result<Option<QueuedRecord>, PersistenceError> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.remove(index) else {
            return Ok(None);
        };
        self.persist(&inner)?;
        Ok(Some(entry.record))
    }

    /// Adds one retry to the entry at `index`.
    ///
    /// Returns `true` if the entry hit the retry limit and was dropped.
    pub fn increment_retry(&self, index: usize) -> Result<bool, PersistenceError> {
        let mut inner = self.inner.lock();
        let Some(id) = inner.entries.get(index).map(|e| e.id) else {
            return Ok(false);
        };
        let outcome = self.bump(&mut inner, &[id]);
        self.persist(&inner)?;
        Ok(outcome.dropped > 0)
    }

    /// Removes every entry whose id is listed. Unknown ids are ignored.
    ///
    /// Returns the number of entries removed.
    pub fn remove_ids(&self, ids: &[u64]) -> Result<usize, PersistenceError> {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|e| !ids.contains(&e.id));
        let removed = before - inner.entries.len();
        if removed > 0 {
            self.persist(&inner)?;
        }
        Ok(removed)
    }

    /// Adds exactly one retry to each listed entry, dropping those that reach
    /// the limit.
    pub fn increment_retry_ids(&self, ids: &[u64]) -> Result<RetryOutcome, PersistenceError> {
        let mut inner = self.inner.lock();
        let outcome = self.bump(&mut inner, ids);
        if outcome.incremented + outcome.dropped > 0 {
            self.persist(&inner)?;
        }
        Ok(outcome)
    }

    /// Removes entries that already reached the retry limit. Returns how many.
    pub fn drop_ids(&self, ids: &[u64]) -> Result<usize, PersistenceError> {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|e| !ids.contains(&e.id));
        let dropped = before - inner.entries.len();
        if dropped > 0 {
            inner.permanent_failures += dropped as u64;
            warn!(dropped, "dropping records that exhausted their retries");
            self.persist(&inner)?;
        }
        Ok(dropped)
    }

    fn bump(&self, inner: &mut Inner, ids: &[u64]) -> RetryOutcome {
        let mut outcome = RetryOutcome::default();
        let mut exhausted = Vec::new();

        for &id in ids {
            let Some(pos) = inner.position(id) else {
                continue;
            };
            let entry = &mut inner.entries[pos];
            entry.record.retry_count += 1;
            if entry.record.retry_count >= self.max_retry {
                exhausted.push(id);
            } else {
                outcome.incremented += 1;
            }
        }

        if !exhausted.is_empty() {
            inner.entries.retain(|e| !exhausted.contains(&e.id));
            outcome.dropped = exhausted.len();
            inner.permanent_failures += exhausted.len() as u64;
            warn!(
                dropped = exhausted.len(),
                max_retry = self.max_retry,
                "records exceeded max retry attempts, dropped permanently"
            );
        }

        outcome
    }

    /// Removes every entry and the persisted key.
    pub fn clear(&self) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        self.persistence.delete(QUEUE_KEY)
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            total: inner.entries.len(),
            oldest: inner.entries.front().map(|e| e.record.queued_at.clone()),
            newest: inner.entries.back().map(|e| e.record.queued_at.clone()),
            high_retry_count: inner
                .entries
                .iter()
                .filter(|e| e.record.retry_count > HIGH_RETRY_THRESHOLD)
                .count(),
            permanent_failures: inner.permanent_failures,
            evicted: inner.evicted,
        }
    }

    fn persist(&self, inner: &Inner) -> Result<(), PersistenceError> {
        let records: Vec<&QueuedRecord> = inner.entries.iter().map(|e| &e.record).collect();
        let bytes =
            serde_json::to_vec(&records).map_err(|source| PersistenceError::Serialization {
                key: QUEUE_KEY.to_string(),
                source,
            })?;
        self.persistence.save(QUEUE_KEY, &bytes)
    }
}

fn load_records(persistence: &dyn Persistence) -> Vec<QueuedRecord> {
    let bytes = match persistence.load(QUEUE_KEY) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Vec::new(),
        Err(e) => {
            warn!(error = %e, backend = persistence.name(), "reading offline queue failed, starting empty");
            return Vec::new();
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %e, backend = persistence.name(), "discarding corrupt offline queue");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{validate::sanitize, DeviceInfo, RawMetricsSample};
    use crate::storage::MemoryStore;

    fn record(cpu: f64) -> PerformanceRecord {
        let sample = sanitize(&RawMetricsSample {
            cpu_usage: cpu,
            ..RawMetricsSample::default()
        });
        PerformanceRecord::from_sample(&sample, &DeviceInfo::default(), SystemTime::now())
    }

    fn queue(max_size: usize) -> (Arc<MemoryStore>, OfflineQueue) {
        let store = Arc::new(MemoryStore::new());
        let q = OfflineQueue::open(store.clone(), max_size, 5);
        (store, q)
    }

    fn cpus(q: &OfflineQueue) -> Vec<f64> {
        q.all().iter().map(|r| r.record.cpu_usage).collect()
    }

    #[test]
    fn test_enqueue_sets_defaults_and_persists() {
        let (store, q) = queue(10);
        let evicted = q.enqueue(record(1.0)).expect("enqueue");
        assert!(evicted.is_none());

        let all = q.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].retry_count, 0);
        assert!(!all[0].queued_at.is_empty());

        let raw = store.get(QUEUE_KEY).expect("persisted");
        let persisted: Vec<QueuedRecord> = serde_json::from_slice(&raw).expect("json array");
        assert_eq!(persisted, all);
    }

    #[test]
    fn test_full_queue_evicts_exactly_oldest() {
        let (_, q) = queue(3);
        for cpu in [1.0, 2.0, 3.0] {
            q.enqueue(record(cpu)).expect("enqueue");
        }

        let evicted = q.enqueue(record(4.0)).expect("enqueue").expect("evicted");
        assert_eq!(evicted.record.cpu_usage, 1.0);
        assert_eq!(q.len(), 3);
        assert_eq!(cpus(&q), vec![2.0, 3.0, 4.0]);
        assert_eq!(q.stats().evicted, 1);
    }

    #[test]
    fn test_enqueue_all_respects_bound() {
        let (store, q) = queue(3);
        let evicted = q
            .enqueue_all((1..=5).map(|i| record(i as f64)))
            .expect("enqueue_all");
        assert_eq!(evicted, 2);
        assert_eq!(cpus(&q), vec![3.0, 4.0, 5.0]);
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_blocking_mutations_persist() {
        let store = Arc::new(MemoryStore::new());
        let q = Arc::new(OfflineQueue::open(store.clone(), 10, 5));

        q.blocking(|q| q.enqueue_all([record(1.0), record(2.0)]))
            .await
            .expect("enqueue_all");
        let first = vec![q.entries()[0].id];
        let removed = q
            .blocking(move |q| q.remove_ids(&first))
            .await
            .expect("remove_ids");
        assert_eq!(removed, 1);

        let reopened = OfflineQueue::open(store, 10, 5);
        assert_eq!(cpus(&reopened), vec![2.0]);
    }

    #[test]
    fn test_reload_restores_entries_in_order() {
        let store = Arc::new(MemoryStore::new());
        {
            let q = OfflineQueue::open(store.clone(), 10, 5);
            q.enqueue(record(1.0)).expect("enqueue");
            q.enqueue(record(2.0)).expect("enqueue");
            q.increment_retry(0).expect("retry");
        }

        let q = OfflineQueue::open(store, 10, 5);
        let all = q.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].retry_count, 1);
        assert_eq!(all[1].record.cpu_usage, 2.0);
    }

    #[test]
    fn test_reload_over_capacity_keeps_newest() {
        let store = Arc::new(MemoryStore::new());
        {
            let q = OfflineQueue::open(store.clone(), 10, 5);
            q.enqueue_all((1..=6).map(|i| record(i as f64)))
                .expect("enqueue_all");
        }

        let q = OfflineQueue::open(store, 4, 5);
        assert_eq!(cpus(&q), vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_corrupt_data_starts_empty() {
        let store = Arc::new(MemoryStore::new());
        store.put(QUEUE_KEY, b"not json at all");

        let q = OfflineQueue::open(store.clone(), 10, 5);
        assert!(q.is_empty());

        // The queue stays usable and overwrites the corrupt value.
        q.enqueue(record(1.0)).expect("enqueue");
        let raw = store.get(QUEUE_KEY).expect("persisted");
        let persisted: Vec<QueuedRecord> = serde_json::from_slice(&raw).expect("valid json");
        assert_eq!(persisted.len(), 1);
    }

    #[test]
    fn test_remove_by_index() {
        let (_, q) = queue(10);
        q.enqueue_all([record(1.0), record(2.0), record(3.0)])
            .expect("enqueue_all");

        let removed = q.remove(1).expect("remove").expect("present");
        assert_eq!(removed.record.cpu_usage, 2.0);
        assert_eq!(cpus(&q), vec![1.0, 3.0]);
        assert!(q.remove(10).expect("remove").is_none());
    }

    #[test]
    fn test_retry_bound_drops_on_limit() {
        let (_, q) = queue(10);
        q.enqueue(record(1.0)).expect("enqueue");
        let id = q.entries()[0].id;

        for attempt in 1..5 {
            let outcome = q.increment_retry_ids(&[id]).expect("retry");
            assert_eq!(outcome.incremented, 1, "attempt {attempt}");
            assert_eq!(q.all()[0].retry_count, attempt);
        }

        let outcome = q.increment_retry_ids(&[id]).expect("retry");
        assert_eq!(outcome.dropped, 1);
        assert!(q.is_empty());
        assert_eq!(q.stats().permanent_failures, 1);

        // Never resurrected.
        let outcome = q.increment_retry_ids(&[id]).expect("retry");
        assert_eq!(outcome, RetryOutcome::default());
    }

    #[test]
    fn test_remove_ids_is_idempotent() {
        let (_, q) = queue(10);
        q.enqueue_all((1..=4).map(|i| record(i as f64)))
            .expect("enqueue_all");
        let ids: Vec<u64> = q.entries().iter().take(2).map(|e| e.id).collect();

        assert_eq!(q.remove_ids(&ids).expect("remove"), 2);
        assert_eq!(q.remove_ids(&ids).expect("remove again"), 0);
        assert_eq!(cpus(&q), vec![3.0, 4.0]);
    }

    #[test]
    fn test_ids_survive_concurrent_enqueue() {
        let (_, q) = queue(10);
        q.enqueue_all([record(1.0), record(2.0)]).expect("enqueue_all");
        let ids: Vec<u64> = q.entries().iter().map(|e| e.id).collect();

        q.enqueue(record(3.0)).expect("enqueue");
        q.remove_ids(&ids[..1]).expect("remove");
        q.increment_retry_ids(&ids[1..]).expect("retry");

        let all = q.all();
        assert_eq!(cpus(&q), vec![2.0, 3.0]);
        assert_eq!(all[0].retry_count, 1);
        assert_eq!(all[1].retry_count, 0);
    }

    #[test]
    fn test_stats() {
        let (_, q) = queue(10);
        assert_eq!(q.stats(), QueueStats::default());

        q.enqueue_all([record(1.0), record(2.0)]).expect("enqueue_all");
        let id = q.entries()[0].id;
        for _ in 0..4 {
            q.increment_retry_ids(&[id]).expect("retry");
        }

        let stats = q.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.high_retry_count, 1);
        assert!(stats.oldest.is_some());
        assert!(stats.newest.is_some());
    }

    #[test]
    fn test_clear_deletes_key() {
        let (store, q) = queue(10);
        q.enqueue(record(1.0)).expect("enqueue");
        q.clear().expect("clear");
        assert!(q.is_empty());
        assert!(store.get(QUEUE_KEY).is_none());
    }

    #[test]
    fn test_failed_save_keeps_memory_state() {
        let (store, q) = queue(10);
        store.set_failing(true);

        let err = q.enqueue(record(1.0)).expect_err("save fails");
        assert!(matches!(err, PersistenceError::Io { .. }));
        assert_eq!(q.len(), 1);

        store.set_failing(false);
        q.enqueue(record(2.0)).expect("enqueue");
        let raw = store.get(QUEUE_KEY).expect("persisted");
        let persisted: Vec<QueuedRecord> = serde_json::from_slice(&raw).expect("json");
        assert_eq!(persisted.len(), 2);
    }

    #[test]
    fn test_quota_surfaces_as_distinct_error() {
        let store = Arc::new(MemoryStore::with_quota(16));
        let q = OfflineQueue::open(store, 10, 5);
        let err = q.enqueue(record(1.0)).expect_err("over quota");
        assert!(matches!(err, PersistenceError::QuotaExceeded { .. }));
    }
}
