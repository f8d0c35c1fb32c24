//! Latency estimation.
//!
//! Envelopes from a steady host arrive at a steady rate; deviations from the
//! mean inter-arrival gap are a cheap jitter signal. [`LatencyEstimator`]
//! keeps a fixed-window [`MovingAverage`] of gaps and reports, per arrival,
//! how far the latest gap sits from that average.

use std::{collections::VecDeque, time::Duration};

/// Fixed-window arithmetic mean.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl MovingAverage {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        }
    }

    /// Pushes a sample, evicting the oldest once the window is full.
    pub fn add_sample(&mut self, sample: f64) {
        if self.window.len() == self.capacity {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
        self.window.push_back(sample);
        self.sum += sample;
    }

    /// Mean of the current window, `None` while empty.
    pub fn mean(&self) -> Option<f64> {
        if self.window.is_empty() {
            None
        } else {
            Some(self.sum / self.window.len() as f64)
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

/// Inter-arrival jitter tracker.
#[derive(Debug, Clone)]
pub struct LatencyEstimator {
    gaps: MovingAverage,
    last_arrival: Option<Duration>,
    current: f64,
}

impl LatencyEstimator {
    pub fn new(window: usize) -> Self {
        Self {
            gaps: MovingAverage::new(window),
            last_arrival: None,
            current: 0.0,
        }
    }

    /// `gap - mean` against the samples seen so far; zero without a baseline.
    pub fn current_latency_delta(&self, gap_secs: f64) -> f64 {
        self.gaps.mean().map_or(0.0, |mean| gap_secs - mean)
    }

    /// Records one gap and returns its latency delta.
    pub fn add_sample(&mut self, gap_secs: f64) -> f64 {
        let delta = self.current_latency_delta(gap_secs);
        self.gaps.add_sample(gap_secs);
        self.current = delta;
        delta
    }

    /// Records an envelope arrival at `now` and returns the latency delta for
    /// its batch. The very first arrival only establishes the reference time.
    pub fn on_arrival(&mut self, now: Duration) -> f64 {
        let delta = match self.last_arrival {
            Some(prev) => self.add_sample(now.saturating_sub(prev).as_secs_f64()),
            None => {
                self.current = 0.0;
                0.0
            }
        };
        self.last_arrival = Some(now);
        delta
    }

    /// Latency delta of the most recent arrival, in seconds.
    pub fn latest(&self) -> f64 {
        self.current
    }
}
