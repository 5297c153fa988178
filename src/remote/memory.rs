use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::sample::PerformanceRecord;

use super::{RemoteError, RemoteStore};

/// In-memory remote store for tests and offline demos.
///
/// Accepted batches are recorded in call order. Failures can be scripted per
/// insert call, and reachability toggled at any time; an unreachable store
/// fails every insert with [`RemoteError::Unavailable`].
pub struct MemoryRemoteStore {
    reachable: AtomicBool,
    script: Mutex<VecDeque<Option<RemoteError>>>,
    batches: Mutex<Vec<Vec<PerformanceRecord>>>,
    delay: Mutex<Option<Duration>>,
    insert_calls: AtomicU64,
    ping_calls: AtomicU64,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            script: Mutex::new(VecDeque::new()),
            batches: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
            insert_calls: AtomicU64::new(0),
            ping_calls: AtomicU64::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Queues outcomes for upcoming insert calls: `None` succeeds,
    /// `Some(err)` fails. Calls beyond the script succeed.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Option<RemoteError>>) {
        self.script.lock().extend(outcomes);
    }

    /// Makes every call sleep first, to exercise timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Batches accepted so far, in call order.
    pub fn batches(&self) -> Vec<Vec<PerformanceRecord>> {
        self.batches.lock().clone()
    }

    /// All accepted records, flattened.
    pub fn records(&self) -> Vec<PerformanceRecord> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn ping_calls(&self) -> u64 {
        self.ping_calls.load(Ordering::SeqCst)
    }

    async fn maybe_delay(&self) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert(&self, records: &[PerformanceRecord]) -> Result<(), RemoteError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_delay().await;

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable);
        }
        if let Some(Some(err)) = self.script.lock().pop_front() {
            return Err(err);
        }

        self.batches.lock().push(records.to_vec());
        Ok(())
    }

    async fn ping(&self) -> bool {
        self.ping_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_delay().await;
        self.reachable.load(Ordering::SeqCst)
    }
}
