use std::collections::VecDeque;
use std::time::SystemTime;

use crate::sample::{unix_millis, DataPoint};

/// Fixed-capacity ring of recent data points for live charts.
///
/// Pushing into a full buffer evicts the oldest point first, so the length
/// never exceeds the capacity. Readers only ever get copies.
#[derive(Debug, Clone)]
pub struct CircularBuffer {
    points: VecDeque<DataPoint>,
    capacity: usize,
}

impl CircularBuffer {
    /// Creates an empty buffer. A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, point: DataPoint) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    /// Copy of the contents, oldest first.
    pub fn snapshot(&self) -> Vec<DataPoint> {
        self.points.iter().copied().collect()
    }

    /// Points from the last `seconds` seconds of wall-clock time.
    pub fn window(&self, seconds: u64) -> Vec<DataPoint> {
        self.window_at(unix_millis(SystemTime::now()), seconds)
    }

    /// Points with `timestamp >= now_ms - seconds * 1000`, oldest first.
    pub fn window_at(&self, now_ms: i64, seconds: u64) -> Vec<DataPoint> {
        let span = i64::try_from(seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        let cutoff = now_ms.saturating_sub(span);
        self.points
            .iter()
            .filter(|p| p.timestamp >= cutoff)
            .copied()
            .collect()
    }

    pub fn latest(&self) -> Option<DataPoint> {
        self.points.back().copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

impl Default for CircularBuffer {
    fn default() -> Self {
        Self::new(60)
    }
}
