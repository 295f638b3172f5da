//! Percentile estimation over a sliding window of samples.

use std::collections::VecDeque;

/// Keeps the last `capacity` samples of a scalar and reports a configured
/// percentile over them. With the default 0.99 percentile and a window of 10
/// this is effectively max-of-window, which is the conservative estimate the
/// dispatch math wants.
///
/// Thread-confined to the scheduler loop; no interior locking.
#[derive(Debug, Clone)]
pub struct SlidingWindowEstimator {
    window: VecDeque<u64>,
    capacity: usize,
    percentile: f64,
}

impl SlidingWindowEstimator {
    pub fn new(capacity: usize, percentile: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            percentile: percentile.clamp(0.0, 1.0),
        }
    }

    /// Push a sample, evicting the oldest once the window is full.
    pub fn insert(&mut self, sample: u64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(sample);
    }

    /// Value at the configured percentile, or 0 for an empty window.
    pub fn estimate(&self) -> u64 {
        if self.window.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.window.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((sorted.len() - 1) as f64 * self.percentile).ceil() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
