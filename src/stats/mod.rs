//! Statistics collection
//!
//! Each dispatcher publishes into its own `RunCounters`, a set of cache-line
//! aligned atomics shared (via `Arc`) with the reporter thread. Only the
//! dispatcher writes them; the reporter reads snapshots and diffs them into
//! throughput figures. Latency histograms stay private to the dispatcher and
//! are merged once the run is over.
//!
//! # Example
//!
//! ```
//! use blockprobe::stats::RunCounters;
//! use blockprobe::positions::Action;
//!
//! let counters = RunCounters::new();
//! counters.record_submit(Action::Write, 4096);
//! counters.record_received();
//!
//! let snap = counters.snapshot();
//! assert_eq!(snap.write_bytes, 4096);
//! assert_eq!(snap.received, 1);
//! ```

pub mod histogram;

use crate::positions::Action;
use crate::util::time::{format_rate, format_throughput, per_second};
use crate::Result;
use histogram::{LatencyHistogram, LatencySummary};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Cache-line aligned atomic counter to prevent false sharing
///
/// ```text
/// [value: 8 bytes][padding: 56 bytes] = 64 bytes total
/// ```
#[repr(align(64))]
#[derive(Debug)]
pub struct AlignedCounter {
    value: AtomicU64,
    _padding: [u8; 56],
}

impl AlignedCounter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
            _padding: [0; 56],
        }
    }

    /// Add and return the new value
    #[inline]
    pub fn add(&self, val: u64) -> u64 {
        self.value.fetch_add(val, Ordering::Relaxed) + val
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set(&self, val: u64) {
        self.value.store(val, Ordering::Relaxed);
    }
}

impl Default for AlignedCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Live counters for one dispatcher
///
/// Monotonic for the life of the worker, except `in_flight` which is a gauge.
#[derive(Debug, Default)]
pub struct RunCounters {
    submitted: AlignedCounter,
    received: AlignedCounter,
    read_ops: AlignedCounter,
    read_bytes: AlignedCounter,
    write_ops: AlignedCounter,
    write_bytes: AlignedCounter,
    flush_ops: AlignedCounter,
    discard_ops: AlignedCounter,
    errors: AlignedCounter,
    slow_ios: AlignedCounter,
    verified: AlignedCounter,
    in_flight: AlignedCounter,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one request accepted by the engine
    #[inline]
    pub fn record_submit(&self, action: Action, bytes: u64) {
        self.submitted.add(1);
        match action {
            Action::Read => {
                self.read_ops.add(1);
                self.read_bytes.add(bytes);
            }
            Action::Write => {
                self.write_ops.add(1);
                self.write_bytes.add(bytes);
            }
            Action::Flush => {
                self.flush_ops.add(1);
            }
            Action::Discard | Action::Pause => {}
        }
    }

    /// Account one inline discard
    ///
    /// Counted as a write operation but not as submitted bytes, since nothing
    /// went through the async queue.
    #[inline]
    pub fn record_discard(&self) {
        self.discard_ops.add(1);
        self.write_ops.add(1);
    }

    #[inline]
    pub fn record_received(&self) {
        self.received.add(1);
    }

    /// Count an error and return the running total
    #[inline]
    pub fn record_error(&self) -> u64 {
        self.errors.add(1)
    }

    #[inline]
    pub fn record_slow(&self) {
        self.slow_ios.add(1);
    }

    #[inline]
    pub fn record_verified(&self) {
        self.verified.add(1);
    }

    #[inline]
    pub fn set_in_flight(&self, n: usize) {
        self.in_flight.set(n as u64);
    }

    pub fn errors(&self) -> u64 {
        self.errors.get()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            submitted: self.submitted.get(),
            received: self.received.get(),
            read_ops: self.read_ops.get(),
            read_bytes: self.read_bytes.get(),
            write_ops: self.write_ops.get(),
            write_bytes: self.write_bytes.get(),
            flush_ops: self.flush_ops.get(),
            discard_ops: self.discard_ops.get(),
            errors: self.errors.get(),
            slow_ios: self.slow_ios.get(),
            verified: self.verified.get(),
            in_flight: self.in_flight.get(),
        }
    }
}

/// Point-in-time copy of `RunCounters`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub submitted: u64,
    pub received: u64,
    pub read_ops: u64,
    pub read_bytes: u64,
    pub write_ops: u64,
    pub write_bytes: u64,
    pub flush_ops: u64,
    pub discard_ops: u64,
    pub errors: u64,
    pub slow_ios: u64,
    pub verified: u64,
    pub in_flight: u64,
}

impl CounterSnapshot {
    /// Add another worker's counters
    pub fn merge(&mut self, other: &CounterSnapshot) {
        self.submitted += other.submitted;
        self.received += other.received;
        self.read_ops += other.read_ops;
        self.read_bytes += other.read_bytes;
        self.write_ops += other.write_ops;
        self.write_bytes += other.write_bytes;
        self.flush_ops += other.flush_ops;
        self.discard_ops += other.discard_ops;
        self.errors += other.errors;
        self.slow_ios += other.slow_ios;
        self.verified += other.verified;
        self.in_flight += other.in_flight;
    }

    pub fn total_bytes(&self) -> u64 {
        self.read_bytes + self.write_bytes
    }
}

/// Rates between two snapshots
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Throughput {
    pub read_bytes_per_sec: f64,
    pub write_bytes_per_sec: f64,
    pub read_iops: f64,
    pub write_iops: f64,
}

impl Throughput {
    pub fn between(earlier: &CounterSnapshot, later: &CounterSnapshot, elapsed: Duration) -> Self {
        Self {
            read_bytes_per_sec: per_second(later.read_bytes.saturating_sub(earlier.read_bytes), elapsed),
            write_bytes_per_sec: per_second(later.write_bytes.saturating_sub(earlier.write_bytes), elapsed),
            read_iops: per_second(later.read_ops.saturating_sub(earlier.read_ops), elapsed),
            write_iops: per_second(later.write_ops.saturating_sub(earlier.write_ops), elapsed),
        }
    }

    pub fn total_iops(&self) -> f64 {
        self.read_iops + self.write_iops
    }
}

impl std::fmt::Display for Throughput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "read {} ({} IOPS), write {} ({} IOPS)",
            format_throughput(self.read_bytes_per_sec),
            format_rate(self.read_iops),
            format_throughput(self.write_bytes_per_sec),
            format_rate(self.write_iops),
        )
    }
}

/// Per-action completion latencies for one worker
#[derive(Debug, Clone)]
pub struct LatencyStats {
    pub read: LatencyHistogram,
    pub write: LatencyHistogram,
    /// Async flush requests and periodic synchronous flushes
    pub flush: LatencyHistogram,
}

impl LatencyStats {
    pub fn new() -> Result<Self> {
        Ok(Self {
            read: LatencyHistogram::new()?,
            write: LatencyHistogram::new()?,
            flush: LatencyHistogram::new()?,
        })
    }

    #[inline]
    pub fn record(&mut self, action: Action, latency: Duration) {
        match action {
            Action::Read => self.read.record(latency),
            Action::Write | Action::Discard => self.write.record(latency),
            Action::Flush => self.flush.record(latency),
            Action::Pause => {}
        }
    }

    pub fn merge(&mut self, other: &LatencyStats) -> Result<()> {
        self.read.merge(&other.read)?;
        self.write.merge(&other.write)?;
        self.flush.merge(&other.flush)?;
        Ok(())
    }

    pub fn summary(&self) -> LatencyReport {
        LatencyReport {
            read: self.read.summary(),
            write: self.write.summary(),
            flush: self.flush.summary(),
        }
    }
}

/// Serializable latency overview
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyReport {
    pub read: LatencySummary,
    pub write: LatencySummary,
    pub flush: LatencySummary,
}
