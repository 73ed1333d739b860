//! Latency histogram using HdrHistogram
//!
//! Per-action completion latencies (submit to harvest) are recorded with
//! microsecond resolution up to one hour, which comfortably covers the
//! slow-I/O threshold. Samples above the ceiling are clamped.
//!
//! # Example
//!
//! ```
//! use blockprobe::stats::histogram::LatencyHistogram;
//! use std::time::Duration;
//!
//! let mut hist = LatencyHistogram::new().unwrap();
//! hist.record(Duration::from_micros(100));
//! hist.record(Duration::from_micros(300));
//!
//! let summary = hist.summary();
//! assert_eq!(summary.count, 2);
//! ```

use crate::Result;
use hdrhistogram::Histogram;
use serde::Serialize;
use std::time::Duration;

/// One hour in microseconds
const MAX_TRACKABLE_US: u64 = 3_600_000_000;

/// Latency histogram wrapper (microsecond buckets, 3 significant digits)
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    histogram: Histogram<u64>,
}

/// Condensed view of a histogram for reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub min_us: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
    pub max_us: u64,
}

impl LatencyHistogram {
    /// Create an empty histogram
    pub fn new() -> Result<Self> {
        let histogram = Histogram::new_with_bounds(1, MAX_TRACKABLE_US, 3)
            .map_err(|e| anyhow::anyhow!("Failed to create latency histogram: {}", e))?;
        Ok(Self { histogram })
    }

    /// Record a latency sample, clamped to [1µs, 1h]
    #[inline]
    pub fn record(&mut self, latency: Duration) {
        let micros = (latency.as_micros() as u64).clamp(1, MAX_TRACKABLE_US);
        let _ = self.histogram.record(micros);
    }

    /// Latency at `percentile` (0.0 - 100.0), or None if empty
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.is_empty() {
            return None;
        }
        Some(Duration::from_micros(self.histogram.value_at_percentile(percentile)))
    }

    pub fn min(&self) -> Option<Duration> {
        (!self.is_empty()).then(|| Duration::from_micros(self.histogram.min()))
    }

    pub fn max(&self) -> Option<Duration> {
        (!self.is_empty()).then(|| Duration::from_micros(self.histogram.max()))
    }

    pub fn mean(&self) -> Option<Duration> {
        (!self.is_empty()).then(|| Duration::from_secs_f64(self.histogram.mean() / 1_000_000.0))
    }

    /// Number of samples recorded
    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.len() == 0
    }

    /// Fold another worker's samples into this histogram
    pub fn merge(&mut self, other: &LatencyHistogram) -> Result<()> {
        self.histogram
            .add(&other.histogram)
            .map_err(|e| anyhow::anyhow!("Failed to merge histograms: {}", e))?;
        Ok(())
    }

    /// Summary for text and JSON reports
    pub fn summary(&self) -> LatencySummary {
        if self.is_empty() {
            return LatencySummary::default();
        }
        let h = &self.histogram;
        LatencySummary {
            count: h.len(),
            min_us: h.min(),
            mean_us: h.mean(),
            p50_us: h.value_at_percentile(50.0),
            p90_us: h.value_at_percentile(90.0),
            p99_us: h.value_at_percentile(99.0),
            p999_us: h.value_at_percentile(99.9),
            max_us: h.max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_histogram_is_empty() {
        let hist = LatencyHistogram::new().unwrap();
        assert_eq!(hist.len(), 0);
        assert!(hist.percentile(50.0).is_none());
        assert_eq!(hist.summary(), LatencySummary::default());
    }

    #[test]
    fn test_percentile() {
        let mut hist = LatencyHistogram::new().unwrap();
        for i in 1..=100 {
            hist.record(Duration::from_micros(i * 10));
        }

        let p50 = hist.percentile(50.0).unwrap();
        let p99 = hist.percentile(99.0).unwrap();
        assert!(p50.as_micros() >= 450 && p50.as_micros() <= 550);
        assert!(p99.as_micros() >= 940 && p99.as_micros() <= 1040);
    }

    #[test]
    fn test_min_max_mean() {
        let mut hist = LatencyHistogram::new().unwrap();
        hist.record(Duration::from_micros(100));
        hist.record(Duration::from_micros(500));
        hist.record(Duration::from_micros(300));

        assert_eq!(hist.min().unwrap().as_micros(), 100);
        assert!((499..=501).contains(&hist.max().unwrap().as_micros()));
        let mean = hist.mean().unwrap().as_micros();
        assert!((295..=305).contains(&mean));
    }

    #[test]
    fn test_record_clamps_extremes() {
        let mut hist = LatencyHistogram::new().unwrap();
        hist.record(Duration::ZERO);
        hist.record(Duration::from_secs(7200));

        assert_eq!(hist.len(), 2);
        assert_eq!(hist.min().unwrap(), Duration::from_micros(1));
        assert!(hist.max().unwrap() <= Duration::from_secs(3601));
    }

    #[test]
    fn test_merge() {
        let mut hist1 = LatencyHistogram::new().unwrap();
        hist1.record(Duration::from_micros(100));
        let mut hist2 = LatencyHistogram::new().unwrap();
        hist2.record(Duration::from_micros(300));
        hist2.record(Duration::from_micros(400));

        hist1.merge(&hist2).unwrap();
        let summary = hist1.summary();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.min_us, 100);
    }
}
