//! Aggregate progress reporting, low-IOPS early exit and the finish watchdog
//!
//! The reporter wakes every interval, sums all workers' counters and logs the
//! combined rates. It is also the only place that can end a run from outside
//! the workers: a sustained IOPS collapse sets the stop flag, and a run that
//! overstays its finish deadline by the grace period terminates the process.

use super::barrier::StartBarrier;
use crate::aio::OPLOG;
use crate::stats::{CounterSnapshot, RunCounters, Throughput};
use crate::util::resource::resident_bytes;
use crate::util::time::format_bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Consecutive low periods that end the run
pub const LOW_IOPS_PERIODS: u32 = 10;

/// Exit code used when the watchdog fires
pub const WATCHDOG_EXIT_CODE: i32 = 3;

/// Tracks consecutive report periods below an IOPS floor
///
/// Only armed once at least `armed_after` bytes were written, so a slow
/// start or a read-only warm-up never trips it.
#[derive(Debug, Clone)]
pub struct LowIopsDetector {
    threshold: f64,
    armed_after: u64,
    low_periods: u32,
}

impl LowIopsDetector {
    pub fn new(threshold: f64, armed_after: u64) -> Self {
        Self {
            threshold,
            armed_after,
            low_periods: 0,
        }
    }

    /// Feed one period; true when the run should end
    pub fn observe(&mut self, iops: f64, written: u64) -> bool {
        if written < self.armed_after {
            self.low_periods = 0;
            return false;
        }
        if iops < self.threshold {
            self.low_periods += 1;
        } else {
            self.low_periods = 0;
        }
        self.low_periods >= LOW_IOPS_PERIODS
    }

    pub fn low_periods(&self) -> u32 {
        self.low_periods
    }
}

/// Why the reporter loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterExit {
    /// Every worker finished
    Finished,
    /// Low-IOPS early exit requested a stop
    LowIops,
}

pub struct Reporter {
    counters: Vec<Arc<RunCounters>>,
    interval: Duration,
    low_iops: Option<LowIopsDetector>,
    watchdog: Option<Instant>,
    stop: Arc<AtomicBool>,
}

impl Reporter {
    pub fn new(counters: Vec<Arc<RunCounters>>, interval: Duration, stop: Arc<AtomicBool>) -> Self {
        Self {
            counters,
            interval,
            low_iops: None,
            watchdog: None,
            stop,
        }
    }

    pub fn with_low_iops(mut self, detector: LowIopsDetector) -> Self {
        self.low_iops = Some(detector);
        self
    }

    /// Terminate the process if workers are still running at `deadline`
    pub fn with_watchdog(mut self, deadline: Instant) -> Self {
        self.watchdog = Some(deadline);
        self
    }

    fn aggregate(&self) -> CounterSnapshot {
        let mut total = CounterSnapshot::default();
        for c in &self.counters {
            total.merge(&c.snapshot());
        }
        total
    }

    /// Report until every worker has called `finish` on the barrier
    pub fn run(mut self, barrier: &StartBarrier) -> ReporterExit {
        // Ticks continue without progress lines so the watchdog still runs
        let log_progress = !self.interval.is_zero();
        let tick = if log_progress { self.interval } else { Duration::from_secs(1) };

        let mut last = self.aggregate();
        let mut last_time = Instant::now();
        let mut exit = ReporterExit::Finished;

        while !barrier.wait_finished_timeout(tick) {
            let now = Instant::now();
            let snap = self.aggregate();
            let rates = Throughput::between(&last, &snap, now - last_time);

            if log_progress {
                tracing::info!(
                    in_flight = snap.in_flight,
                    errors = snap.errors,
                    "all devices: {}",
                    rates
                );
                if let Some(rss) = resident_bytes() {
                    tracing::debug!(rss = %format_bytes(rss), "memory");
                }
            }

            if let Some(detector) = self.low_iops.as_mut() {
                if exit != ReporterExit::LowIops && detector.observe(rates.total_iops(), snap.write_bytes) {
                    tracing::warn!(
                        iops = rates.total_iops(),
                        periods = detector.low_periods(),
                        "IOPS stayed below the exit threshold; stopping"
                    );
                    self.stop.store(true, Ordering::SeqCst);
                    exit = ReporterExit::LowIops;
                }
            }

            if let Some(deadline) = self.watchdog {
                if now >= deadline {
                    tracing::error!(
                        target: OPLOG,
                        finished = barrier.finished(),
                        workers = barrier.parties(),
                        "workers still running past the finish deadline; terminating"
                    );
                    self.stop.store(true, Ordering::SeqCst);
                    std::process::exit(WATCHDOG_EXIT_CODE);
                }
            }

            last = snap;
            last_time = now;
        }

        exit
    }
}
