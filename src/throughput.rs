//! Throughput sampling
//!
//! A bounded ring of rate observations taken at a fixed cadence (1 Hz by
//! default). Samples drive display and ETA only; nothing in the engine
//! makes correctness decisions from them.

use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default ring size: one minute at 1 Hz
pub const DEFAULT_WINDOW: usize = 60;

/// Weight of the newest sample in the smoothed rate
const EWMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    pub at: DateTime<Utc>,
    pub bytes_per_sec: f64,
    pub rows_per_sec: f64,
}

/// Rolling byte/row rate tracker fed with cumulative counters
#[derive(Debug, Clone)]
pub struct ThroughputSampler {
    window: usize,
    samples: VecDeque<ThroughputSample>,
    last: Option<(Instant, u64, u64)>,
    smoothed_bytes: f64,
    smoothed_rows: f64,
}

impl ThroughputSampler {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            last: None,
            smoothed_bytes: 0.0,
            smoothed_rows: 0.0,
        }
    }

    /// Record cumulative totals observed at `now`.
    ///
    /// The first call only sets the baseline. Counters that move backwards
    /// contribute a zero rate for that interval.
    pub fn observe(&mut self, now: Instant, total_bytes: u64, total_rows: u64) {
        let Some((prev_at, prev_bytes, prev_rows)) = self.last else {
            self.last = Some((now, total_bytes, total_rows));
            return;
        };

        let elapsed = now.saturating_duration_since(prev_at).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }

        let bytes_per_sec = total_bytes.saturating_sub(prev_bytes) as f64 / elapsed;
        let rows_per_sec = total_rows.saturating_sub(prev_rows) as f64 / elapsed;

        if self.samples.is_empty() {
            self.smoothed_bytes = bytes_per_sec;
            self.smoothed_rows = rows_per_sec;
        } else {
            self.smoothed_bytes = EWMA_ALPHA * bytes_per_sec + (1.0 - EWMA_ALPHA) * self.smoothed_bytes;
            self.smoothed_rows = EWMA_ALPHA * rows_per_sec + (1.0 - EWMA_ALPHA) * self.smoothed_rows;
        }

        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(ThroughputSample {
            at: Utc::now(),
            bytes_per_sec,
            rows_per_sec,
        });
        self.last = Some((now, total_bytes, total_rows));
    }

    pub fn latest(&self) -> Option<&ThroughputSample> {
        self.samples.back()
    }

    pub fn smoothed_bytes_per_sec(&self) -> f64 {
        self.smoothed_bytes
    }

    pub fn smoothed_rows_per_sec(&self) -> f64 {
        self.smoothed_rows
    }

    /// Seconds to move `remaining_bytes` at the smoothed rate; `None` when
    /// the rate is zero (ETA unknown)
    pub fn eta_secs(&self, remaining_bytes: u64) -> Option<u64> {
        if remaining_bytes == 0 {
            return Some(0);
        }
        if self.smoothed_bytes <= f64::EPSILON {
            return None;
        }
        Some((remaining_bytes as f64 / self.smoothed_bytes).ceil() as u64)
    }

    /// Bytes/sec series, oldest first
    pub fn byte_series(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.bytes_per_sec).collect()
    }

    pub fn samples(&self) -> impl Iterator<Item = &ThroughputSample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

impl Default for ThroughputSampler {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rate_from_cumulative_counters() {
        let t0 = Instant::now();
        let mut s = ThroughputSampler::new(10);
        s.observe(t0, 0, 0);
        assert!(s.is_empty());

        s.observe(t0 + Duration::from_secs(1), 1000, 10);
        assert_eq!(s.latest().unwrap().bytes_per_sec, 1000.0);
        assert_eq!(s.smoothed_bytes_per_sec(), 1000.0);
        assert_eq!(s.smoothed_rows_per_sec(), 10.0);
        assert_eq!(s.eta_secs(5000), Some(5));
    }

    #[test]
    fn test_ring_is_bounded() {
        let t0 = Instant::now();
        let mut s = ThroughputSampler::new(3);
        for i in 0..10u64 {
            s.observe(t0 + Duration::from_secs(i), i * 100, i);
        }
        assert_eq!(s.len(), 3);
        assert_eq!(s.byte_series(), vec![100.0, 100.0, 100.0]);
    }

    #[test]
    fn test_zero_rate_means_unknown_eta() {
        let t0 = Instant::now();
        let mut s = ThroughputSampler::new(5);
        assert_eq!(s.eta_secs(100), None);
        s.observe(t0, 500, 5);
        s.observe(t0 + Duration::from_secs(1), 500, 5);
        assert_eq!(s.eta_secs(100), None);
        assert_eq!(s.eta_secs(0), Some(0));
    }

    #[test]
    fn test_counter_reset_yields_zero_rate() {
        let t0 = Instant::now();
        let mut s = ThroughputSampler::new(5);
        s.observe(t0, 800, 8);
        s.observe(t0 + Duration::from_secs(1), 100, 1);
        assert_eq!(s.latest().unwrap().bytes_per_sec, 0.0);
    }

    #[test]
    fn test_smoothing_dampens_spikes() {
        let t0 = Instant::now();
        let mut s = ThroughputSampler::new(10);
        s.observe(t0, 0, 0);
        s.observe(t0 + Duration::from_secs(1), 100, 0);
        s.observe(t0 + Duration::from_secs(2), 1100, 0);
        let smoothed = s.smoothed_bytes_per_sec();
        assert!(smoothed > 100.0 && smoothed < 1000.0, "{}", smoothed);
    }
}
