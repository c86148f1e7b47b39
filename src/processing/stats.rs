//! Trailing-window statistics.
//!
//! The window holds the last `capacity` values. Mean and variance are kept with
//! Welford's update, extended with the matching removal step when a value leaves
//! the window. Min and max come from monotonic deques, so every update is O(1)
//! amortized. Rounding drift from repeated add/remove pairs is cleared by an exact
//! recomputation every [`RESYNC_INTERVAL`] updates.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Updates between exact recomputations of mean and variance.
pub const RESYNC_INTERVAL: usize = 1024;

/// Default window length in samples.
pub const DEFAULT_WINDOW: usize = 100;

/// Snapshot of the window.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    /// Values in the window.
    pub count: usize,
    /// Arithmetic mean.
    pub mean: f64,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
    /// Population standard deviation.
    pub std_dev: f64,
}

/// Count-based trailing window.
#[derive(Clone, Debug)]
pub struct WindowedStats {
    capacity: usize,
    values: VecDeque<(u64, f64)>,
    next_index: u64,
    mean: f64,
    m2: f64,
    min_candidates: VecDeque<(u64, f64)>,
    max_candidates: VecDeque<(u64, f64)>,
    since_resync: usize,
}

impl Default for WindowedStats {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl WindowedStats {
    /// Window of `capacity` values (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
            next_index: 0,
            mean: 0.0,
            m2: 0.0,
            min_candidates: VecDeque::new(),
            max_candidates: VecDeque::new(),
            since_resync: 0,
        }
    }

    /// Window length.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Values currently held.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no value has been pushed (or all were cleared).
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Adds a value, evicting the oldest when the window is full. Non-finite
    /// values are ignored.
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if self.values.len() == self.capacity {
            self.evict();
        }

        let index = self.next_index;
        self.next_index += 1;
        self.values.push_back((index, value));

        let n = self.values.len() as f64;
        let delta = value - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (value - self.mean);

        while self.min_candidates.back().is_some_and(|&(_, v)| v >= value) {
            self.min_candidates.pop_back();
        }
        self.min_candidates.push_back((index, value));
        while self.max_candidates.back().is_some_and(|&(_, v)| v <= value) {
            self.max_candidates.pop_back();
        }
        self.max_candidates.push_back((index, value));

        self.since_resync += 1;
        if self.since_resync >= RESYNC_INTERVAL {
            self.resync();
        }
    }

    fn evict(&mut self) {
        let Some((index, value)) = self.values.pop_front() else {
            return;
        };
        let remaining = self.values.len();
        if remaining == 0 {
            self.mean = 0.0;
            self.m2 = 0.0;
        } else {
            let n = (remaining + 1) as f64;
            let mean = (n * self.mean - value) / (n - 1.0);
            self.m2 -= (value - self.mean) * (value - mean);
            self.mean = mean;
            if self.m2 < 0.0 {
                self.m2 = 0.0;
            }
        }
        if self.min_candidates.front().is_some_and(|&(i, _)| i == index) {
            self.min_candidates.pop_front();
        }
        if self.max_candidates.front().is_some_and(|&(i, _)| i == index) {
            self.max_candidates.pop_front();
        }
    }

    /// Recomputes mean and variance exactly from the window contents.
    pub fn resync(&mut self) {
        self.since_resync = 0;
        let n = self.values.len();
        if n == 0 {
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        let mean = self.values.iter().map(|&(_, v)| v).sum::<f64>() / n as f64;
        self.m2 = self
            .values
            .iter()
            .map(|&(_, v)| (v - mean) * (v - mean))
            .sum();
        self.mean = mean;
    }

    /// Drops every value.
    pub fn clear(&mut self) {
        self.values.clear();
        self.min_candidates.clear();
        self.max_candidates.clear();
        self.mean = 0.0;
        self.m2 = 0.0;
        self.since_resync = 0;
    }

    /// Current metrics, `None` while empty.
    pub fn snapshot(&self) -> Option<AggregatedMetrics> {
        let count = self.values.len();
        let min = self.min_candidates.front()?.1;
        let max = self.max_candidates.front()?.1;
        Some(AggregatedMetrics {
            count,
            mean: self.mean,
            min,
            max,
            std_dev: (self.m2 / count as f64).max(0.0).sqrt(),
        })
    }
}
