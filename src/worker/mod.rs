//! Per-device workers
//!
//! A `Worker` is one device's complete job: its opened target, its generated
//! work items, a `Dispatcher` bound to a fresh engine, and the `RoundPlan`
//! derived from the configured limits. Workers are prepared up front on the
//! calling thread so a bad device fails the whole job before any IO starts;
//! `run_workers` then moves each onto its own thread, releases them together
//! through a `StartBarrier` and reports on them until they are all done.
//!
//! # Example
//!
//! ```no_run
//! use blockprobe::config::Config;
//! use blockprobe::worker::run_job;
//! use std::path::PathBuf;
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//!
//! let mut config = Config::default();
//! config.job.devices = vec![PathBuf::from("/dev/sdb")];
//!
//! let report = run_job(Arc::new(config), Arc::new(AtomicBool::new(false)))?;
//! println!("{} bytes submitted", report.totals().submitted_bytes());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod barrier;
pub mod reporter;

use crate::aio::round::sleep_unless_stopped;
use crate::aio::{DispatchOptions, Dispatcher, RoundController, RoundPlan, RunTotals};
use crate::config::{Config, LimitsConfig};
use crate::engine::{create_engine, IOEngine};
use crate::output::dump::DumpWriter;
use crate::positions::generate::{generate, run_uuid, LayoutSpec};
use crate::positions::lengths::LengthSet;
use crate::positions::{Action, PositionContainer};
use crate::stats::{CounterSnapshot, LatencyStats, RunCounters};
use crate::target::{open_target, DeviceInfo, OpenFlags, Target};
use crate::util::resource::buffer_ram_limit;
use crate::Result;
use anyhow::Context;
use barrier::StartBarrier;
use reporter::{LowIopsDetector, Reporter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// What one worker did
#[derive(Debug)]
pub struct WorkerReport {
    pub id: usize,
    pub device: PathBuf,
    pub engine: &'static str,
    pub info: DeviceInfo,
    pub totals: RunTotals,
    pub counters: CounterSnapshot,
    pub latency: LatencyStats,
    pub elapsed: Duration,
    /// Fatal error that ended the run, after its IO was drained
    pub error: Option<anyhow::Error>,
}

/// Results of a whole job
#[derive(Debug)]
pub struct JobReport {
    pub workers: Vec<WorkerReport>,
    pub elapsed: Duration,
    /// A low-IOPS early exit stopped the job
    pub stopped_low_iops: bool,
}

impl JobReport {
    pub fn counters(&self) -> CounterSnapshot {
        let mut total = CounterSnapshot::default();
        for w in &self.workers {
            total.merge(&w.counters);
        }
        total
    }

    pub fn totals(&self) -> RunTotals {
        let mut total = RunTotals {
            drained_cleanly: true,
            ..RunTotals::default()
        };
        for w in &self.workers {
            total.rounds = total.rounds.max(w.totals.rounds);
            total.completed += w.totals.completed;
            total.submitted += w.totals.submitted;
            total.read_bytes += w.totals.read_bytes;
            total.write_bytes += w.totals.write_bytes;
            total.errors += w.totals.errors;
            total.verified += w.totals.verified;
            total.drained_cleanly &= w.totals.drained_cleanly;
        }
        total
    }

    pub fn latency(&self) -> Result<LatencyStats> {
        let mut merged = LatencyStats::new()?;
        for w in &self.workers {
            merged.merge(&w.latency)?;
        }
        Ok(merged)
    }

    /// First fatal error, in worker order
    pub fn first_error(&self) -> Option<&anyhow::Error> {
        self.workers.iter().find_map(|w| w.error.as_ref())
    }
}

/// Derive the round structure from the configured limits
///
/// `range` is the tested byte range, `items` the number of work items and
/// `block` the largest block size. The finish deadline is attached when the
/// run starts.
pub fn derive_round_plan(limits: &LimitsConfig, range: (u64, u64), items: u64, block: u64) -> RoundPlan {
    let span = range.1.saturating_sub(range.0);
    let run_time = limits.run_seconds.map(Duration::from_secs_f64);

    let mut plan = RoundPlan {
        range,
        waitfor: Duration::from_secs_f64(limits.waitfor.max(0.0)),
        rerandomize: limits.rerandomize,
        add_block_size: limits.add_block_size.then_some(block),
        ..RoundPlan::default()
    };

    if limits.rerandomize || limits.add_block_size {
        // One pass over the range (or the items) per round
        if let Some(x) = limits.lba_times {
            plan.rounds = Some(x);
            plan.round_bytes = Some(span);
            plan.total_bytes = Some(span.saturating_mul(x));
        } else if let Some(x) = limits.position_times {
            plan.rounds = Some(x);
            plan.round_positions = Some(items);
            plan.total_positions = Some(items.saturating_mul(x));
        } else {
            plan.rounds = Some(0);
            plan.run_time = run_time;
        }
    } else if let Some(x) = limits.lba_times {
        plan.round_bytes = Some(span.saturating_mul(x));
    } else if let Some(x) = limits.position_times {
        plan.round_positions = Some(items.saturating_mul(x));
    } else {
        plan.run_time = run_time;
    }

    if let Some(r) = limits.rounds {
        plan.rounds = Some(r);
    }
    plan
}

/// `<base>.<id>`, so concurrent workers never share a dump file
pub fn dump_path(base: &Path, id: usize) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{}", id));
    PathBuf::from(name)
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// One device's prepared job
pub struct Worker {
    id: usize,
    config: Arc<Config>,
    target: Arc<dyn Target>,
    items: PositionContainer,
    dispatcher: Dispatcher,
    plan: RoundPlan,
    counters: Arc<RunCounters>,
    stop: Arc<AtomicBool>,
}

impl Worker {
    /// Prepare a worker with the configured engine
    pub fn new(id: usize, config: Arc<Config>, device: &Path, stop: Arc<AtomicBool>) -> Result<Self> {
        let engine = create_engine(config.job.engine)?;
        Self::with_engine(id, config, device, engine, stop)
    }

    /// Prepare a worker around an existing (uninitialized) engine
    pub fn with_engine(
        id: usize,
        config: Arc<Config>,
        device: &Path,
        engine: Box<dyn IOEngine>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        let job = &config.job;

        let flags = OpenFlags {
            direct: job.direct,
            write: job.modifies_device(),
            exclusive: job.exclusive,
            file_size: job.file_size,
        };
        let target = open_target(device, &flags)
            .with_context(|| format!("Failed to prepare {}", device.display()))?;

        let info = target.info().clone();
        info.log_warnings(
            device,
            job.largest_block() as usize,
            job.discard_fraction > 0.0 || config.verify.pre_discard,
        );

        let alignment = job.alignment.unwrap_or(info.logical_block_size.max(512)) as usize;
        let max_position = job.max_position.unwrap_or(target.size()).min(target.size());
        anyhow::ensure!(
            max_position > job.min_position,
            "{}: range {}..{} is empty (device size {})",
            device.display(),
            job.min_position,
            max_position,
            target.size()
        );

        let lengths = match job.max_block_size {
            Some(max) if max > job.block_size && job.power_of_two_sizes => {
                LengthSet::powers_of_two(job.block_size as usize, max as usize)?
            }
            Some(max) if max > job.block_size => {
                LengthSet::aligned_range(job.block_size as usize, max as usize, alignment)?
            }
            _ => LengthSet::fixed(job.block_size as usize)?,
        };

        let seed = job.seed.unwrap_or_else(clock_seed).wrapping_add(id as u64);
        let spec = LayoutSpec {
            min_position: job.min_position,
            max_position,
            alignment,
            lengths,
            read_fraction: job.read_fraction,
            discard_fraction: job.discard_fraction,
            sequential: job.sequential,
            verify: config.verify.enabled,
            unique_seeds: job.unique_seeds,
            count: job.positions,
        };
        let mut items = generate(&spec, seed, run_uuid(id))?;
        if let Some(window) = job.jumble {
            items.jumble(window, seed);
        }
        if let Some(iops) = config.pacing.target_iops {
            items.add_delay(iops);
        }

        tracing::info!(
            worker = id,
            device = %device.display(),
            positions = items.len(),
            reads = items.count(Action::Read),
            writes = items.count(Action::Write),
            discards = items.count(Action::Discard),
            pass_bytes = items.pass_bytes(),
            alignment,
            "positions generated"
        );

        let opts = DispatchOptions {
            queue_depth: job.queue_depth,
            alignment,
            stride: job.stride,
            flush_every: config.pacing.flush_every,
            barrier: config.pacing.barrier,
            abort_on_submit_error: config.verify.abort_on_submit_error,
            poll_timeout: config.pacing.poll_timeout(),
            slow_threshold: Duration::from_secs_f64(config.runtime.slow_seconds.max(0.0)),
            error_ceiling: config.runtime.error_ceiling,
            drain_attempts: config.runtime.drain_attempts,
            report_interval: config.pacing.report_interval(),
            ram_limit: buffer_ram_limit(config.runtime.ram_limit),
            ..DispatchOptions::default()
        };

        let counters = Arc::new(RunCounters::new());
        let mut dispatcher = Dispatcher::new(engine, target.clone(), opts, counters.clone(), stop.clone())?;
        if let Some(base) = &config.output.dump {
            dispatcher = dispatcher.with_dump(DumpWriter::create(&dump_path(base, id))?);
        }

        let range = (job.min_position, max_position);
        let mut plan = derive_round_plan(&config.limits, range, items.len() as u64, job.largest_block());
        plan.seed = seed;
        plan.pre_discard = config.verify.pre_discard;

        Ok(Self {
            id,
            config,
            target,
            items,
            dispatcher,
            plan,
            counters,
            stop,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn counters(&self) -> &Arc<RunCounters> {
        &self.counters
    }

    pub fn items(&self) -> &PositionContainer {
        &self.items
    }

    pub fn plan(&self) -> &RoundPlan {
        &self.plan
    }

    /// Bytes in the tested range
    pub fn range_bytes(&self) -> u64 {
        self.plan.range.1.saturating_sub(self.plan.range.0)
    }

    /// Run every round; always calls `barrier.finish()` before returning
    pub fn run(mut self, barrier: &StartBarrier) -> WorkerReport {
        barrier.wait_start();

        let prewait = Duration::from_secs_f64(self.config.limits.prewait.max(0.0));
        if !prewait.is_zero() {
            tracing::info!(worker = self.id, seconds = prewait.as_secs_f64(), "waiting before start");
            sleep_unless_stopped(prewait, &self.stop);
        }

        let start = Instant::now();
        self.dispatcher.set_run_start(start);
        let mut plan = self.plan.clone();
        plan.finish_at = self
            .config
            .limits
            .finish_seconds
            .map(|s| start + Duration::from_secs_f64(s));

        let controller = RoundController::new(plan);
        let mut totals = RunTotals::new();
        let result = controller.run_into(&mut self.dispatcher, &mut self.items, &self.stop, &mut totals);

        let error = match result {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(
                    worker = self.id,
                    device = %self.target.path().display(),
                    rounds = totals.rounds,
                    "{:#}",
                    e
                );
                // One failed device ends the whole job
                self.stop.store(true, Ordering::SeqCst);
                Some(e)
            }
        };
        if let Err(e) = self.dispatcher.finish_dump() {
            tracing::warn!(worker = self.id, error = %e, "failed to flush dump file");
        }

        let report = WorkerReport {
            id: self.id,
            device: self.target.path().to_path_buf(),
            engine: self.dispatcher.engine_name(),
            info: self.target.info().clone(),
            totals,
            counters: self.counters.snapshot(),
            latency: self.dispatcher.latency().clone(),
            elapsed: start.elapsed(),
            error,
        };
        barrier.finish();
        report
    }
}

/// Prepare one worker per configured device and run them
pub fn run_job(config: Arc<Config>, stop: Arc<AtomicBool>) -> Result<JobReport> {
    let workers = config
        .job
        .devices
        .iter()
        .enumerate()
        .map(|(id, device)| Worker::new(id, config.clone(), device, stop.clone()))
        .collect::<Result<Vec<_>>>()?;
    run_workers(workers, &config, stop)
}

/// Run prepared workers on their own threads with a reporter alongside
pub fn run_workers(workers: Vec<Worker>, config: &Config, stop: Arc<AtomicBool>) -> Result<JobReport> {
    anyhow::ensure!(!workers.is_empty(), "no workers to run");

    let barrier = Arc::new(StartBarrier::new(workers.len()));
    let counters: Vec<Arc<RunCounters>> = workers.iter().map(|w| w.counters().clone()).collect();
    let device_bytes: u64 = workers.iter().map(Worker::range_bytes).sum();
    let start = Instant::now();

    let mut reporter = Reporter::new(counters, config.pacing.report_interval(), stop.clone());
    if let Some(threshold) = config.limits.exit_iops {
        reporter = reporter.with_low_iops(LowIopsDetector::new(threshold, device_bytes));
    }
    if let Some(finish) = config.limits.finish_seconds {
        let grace = config.runtime.watchdog_grace.max(0.0);
        reporter = reporter.with_watchdog(start + Duration::from_secs_f64(finish + grace));
    }

    let reporter_barrier = barrier.clone();
    let reporter_handle = thread::Builder::new()
        .name("blockprobe-report".into())
        .spawn(move || reporter.run(&reporter_barrier))
        .context("Failed to spawn reporter thread")?;

    let mut handles = Vec::with_capacity(workers.len());
    for worker in workers {
        let worker_barrier = barrier.clone();
        let name = format!("blockprobe-{}", worker.id());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker.run(&worker_barrier));
        match handle {
            Ok(h) => handles.push(h),
            Err(e) => {
                // Parked workers would wait for this one forever
                stop.store(true, Ordering::SeqCst);
                barrier.wait_start();
                barrier.finish();
                tracing::error!(error = %e, "failed to spawn worker thread");
            }
        }
    }

    let mut reports = Vec::with_capacity(handles.len());
    for h in handles {
        match h.join() {
            Ok(report) => reports.push(report),
            Err(_) => anyhow::bail!("worker thread panicked"),
        }
    }
    let stopped_low_iops = matches!(reporter_handle.join(), Ok(reporter::ReporterExit::LowIops));

    Ok(JobReport {
        workers: reports,
        elapsed: start.elapsed(),
        stopped_low_iops,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::DispatchError;
    use crate::engine::mock::MockEngine;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, devices: usize) -> Config {
        let mut config = Config::default();
        config.job.devices = (0..devices).map(|i| dir.path().join(format!("dev{}.img", i))).collect();
        config.job.direct = false;
        config.job.exclusive = false;
        config.job.file_size = Some(1 << 20);
        config.job.queue_depth = 8;
        config.job.alignment = Some(4096);
        config.job.seed = Some(7);
        config.pacing.report_interval = 0.0;
        config.limits.run_seconds = None;
        config
    }

    fn limits() -> LimitsConfig {
        LimitsConfig {
            run_seconds: Some(5.0),
            ..LimitsConfig::default()
        }
    }

    #[test]
    fn test_plan_time_only() {
        let plan = derive_round_plan(&limits(), (0, 1 << 20), 256, 4096);
        assert_eq!(plan.run_time, Some(Duration::from_secs(5)));
        assert_eq!(plan.rounds, None);
        assert_eq!(plan.round_bytes, None);
        assert_eq!(plan.add_block_size, None);
    }

    #[test]
    fn test_plan_lba_times_single_round() {
        let l = LimitsConfig {
            lba_times: Some(3),
            ..limits()
        };
        let plan = derive_round_plan(&l, (4096, 4096 + (1 << 20)), 256, 4096);
        assert_eq!(plan.round_bytes, Some(3 << 20));
        assert_eq!(plan.run_time, None);
        assert_eq!(plan.rounds, None);
    }

    #[test]
    fn test_plan_position_times_single_round() {
        let l = LimitsConfig {
            position_times: Some(2),
            ..limits()
        };
        let plan = derive_round_plan(&l, (0, 1 << 20), 256, 4096);
        assert_eq!(plan.round_positions, Some(512));
        assert_eq!(plan.rounds, None);
    }

    #[test]
    fn test_plan_rerandomize_with_lba_times() {
        let l = LimitsConfig {
            lba_times: Some(4),
            rerandomize: true,
            ..limits()
        };
        let plan = derive_round_plan(&l, (0, 1 << 20), 256, 4096);
        assert_eq!(plan.rounds, Some(4));
        assert_eq!(plan.round_bytes, Some(1 << 20));
        assert_eq!(plan.total_bytes, Some(4 << 20));
        assert_eq!(plan.run_time, None);
        assert!(plan.rerandomize);
    }

    #[test]
    fn test_plan_add_block_size_with_position_times() {
        let l = LimitsConfig {
            position_times: Some(3),
            add_block_size: true,
            ..limits()
        };
        let plan = derive_round_plan(&l, (0, 1 << 20), 256, 65536);
        assert_eq!(plan.rounds, Some(3));
        assert_eq!(plan.round_positions, Some(256));
        assert_eq!(plan.total_positions, Some(768));
        assert_eq!(plan.add_block_size, Some(65536));
    }

    #[test]
    fn test_plan_rerandomize_by_time_is_unbounded() {
        let l = LimitsConfig {
            rerandomize: true,
            waitfor: 0.5,
            ..limits()
        };
        let plan = derive_round_plan(&l, (0, 1 << 20), 256, 4096);
        assert_eq!(plan.rounds, Some(0));
        assert_eq!(plan.run_time, Some(Duration::from_secs(5)));
        assert_eq!(plan.waitfor, Duration::from_millis(500));
    }

    #[test]
    fn test_plan_explicit_rounds_override() {
        let l = LimitsConfig {
            rerandomize: true,
            rounds: Some(2),
            ..limits()
        };
        let plan = derive_round_plan(&l, (0, 1 << 20), 256, 4096);
        assert_eq!(plan.rounds, Some(2));
    }

    #[test]
    fn test_dump_path() {
        assert_eq!(dump_path(Path::new("/tmp/run.dump"), 3), PathBuf::from("/tmp/run.dump.3"));
    }

    #[test]
    fn test_worker_prepares_layout() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir, 1);
        config.job.read_fraction = 0.0;
        config.job.max_position = Some(256 * 1024);
        config.limits.lba_times = Some(1);
        let device = config.job.devices[0].clone();

        let stop = Arc::new(AtomicBool::new(false));
        let worker =
            Worker::with_engine(0, Arc::new(config), &device, Box::new(MockEngine::new()), stop).unwrap();

        assert_eq!(worker.items().len(), 64);
        assert_eq!(worker.items().count(Action::Write), 64);
        assert_eq!(worker.range_bytes(), 256 * 1024);
        assert_eq!(worker.plan().round_bytes, Some(256 * 1024));
        assert_eq!(worker.plan().seed, 7);
    }

    #[test]
    fn test_worker_rejects_empty_range() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir, 1);
        config.job.read_fraction = 0.0;
        config.job.min_position = 2 << 20;
        let device = config.job.devices[0].clone();

        let stop = Arc::new(AtomicBool::new(false));
        let result = Worker::with_engine(0, Arc::new(config), &device, Box::new(MockEngine::new()), stop);
        assert!(result.is_err());
    }

    #[test]
    fn test_run_workers_write_verify() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir, 2);
        config.job.read_fraction = 0.0;
        config.job.max_position = Some(128 * 1024);
        config.limits.position_times = Some(1);
        config.verify.enabled = true;
        config.output.dump = Some(dir.path().join("run.dump"));
        let config = Arc::new(config);

        let stop = Arc::new(AtomicBool::new(false));
        let workers: Vec<Worker> = config
            .job
            .devices
            .iter()
            .enumerate()
            .map(|(id, dev)| {
                Worker::with_engine(id, config.clone(), dev, Box::new(MockEngine::new()), stop.clone()).unwrap()
            })
            .collect();

        let report = run_workers(workers, &config, stop).unwrap();
        assert_eq!(report.workers.len(), 2);
        assert!(report.first_error().is_none());
        assert!(!report.stopped_low_iops);

        for w in &report.workers {
            assert_eq!(w.engine, "mock");
            assert_eq!(w.totals.rounds, 1);
            assert_eq!(w.totals.errors, 0);
            assert!(w.totals.drained_cleanly);
            // Every write is read back and checked
            assert_eq!(w.totals.verified, 32);
            assert_eq!(w.counters.write_bytes, 128 * 1024);
        }

        let totals = report.totals();
        assert_eq!(totals.verified, 64);
        assert_eq!(totals.write_bytes, 256 * 1024);
        assert_eq!(report.counters().read_bytes, 256 * 1024);
        assert!(report.latency().unwrap().write.len() > 0);

        let dump = std::fs::read_to_string(dir.path().join("run.dump.0")).unwrap();
        assert_eq!(dump.lines().count(), 64);
        assert!(dir.path().join("run.dump.1").exists());
    }

    #[test]
    fn test_fatal_error_stops_other_workers() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir, 2);
        config.job.read_fraction = 0.0;
        config.job.max_position = Some(64 * 1024);
        config.limits.rounds = Some(0);
        config.limits.rerandomize = true;
        config.limits.run_seconds = Some(30.0);
        config.verify.enabled = true;
        let config = Arc::new(config);

        let stop = Arc::new(AtomicBool::new(false));
        let bad = MockEngine::new();
        bad.set_corrupt_after_write(Some(0));
        let engines: Vec<Box<dyn IOEngine>> = vec![Box::new(bad), Box::new(MockEngine::new())];

        let workers: Vec<Worker> = engines
            .into_iter()
            .enumerate()
            .map(|(id, engine)| {
                let dev = config.job.devices[id].clone();
                Worker::with_engine(id, config.clone(), &dev, engine, stop.clone()).unwrap()
            })
            .collect();

        let report = run_workers(workers, &config, stop.clone()).unwrap();
        assert!(stop.load(Ordering::SeqCst));

        let err = report.first_error().expect("integrity failure reported");
        assert!(matches!(
            err.downcast_ref::<DispatchError>(),
            Some(DispatchError::Integrity { position: 0, .. })
        ));
        // The healthy worker finished without an error of its own
        assert!(report.workers[1].error.is_none());
    }

    #[test]
    fn test_failed_worker_keeps_finished_rounds() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir, 1);
        config.job.read_fraction = 0.0;
        config.job.max_position = Some(64 * 1024);
        config.limits.position_times = Some(1);
        config.limits.rerandomize = true;
        config.limits.rounds = Some(3);
        config.verify.abort_on_submit_error = true;
        let config = Arc::new(config);

        let stop = Arc::new(AtomicBool::new(false));
        let mock = MockEngine::new();
        // 16 items per round: the 20th submission lands in round two
        mock.reject_every(20, 0);
        let dev = config.job.devices[0].clone();
        let worker = Worker::with_engine(0, config.clone(), &dev, Box::new(mock), stop.clone()).unwrap();
        assert_eq!(worker.items().len(), 16);

        let report = run_workers(vec![worker], &config, stop).unwrap();
        let w = &report.workers[0];
        assert!(matches!(
            w.error.as_ref().and_then(|e| e.downcast_ref::<DispatchError>()),
            Some(DispatchError::SubmitAborted { .. })
        ));
        assert_eq!(w.totals.rounds, 1);
        assert_eq!(w.totals.write_bytes, 64 * 1024);
    }

    #[test]
    fn test_stop_flag_ends_unbounded_job() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir, 1);
        config.job.read_fraction = 0.0;
        config.limits.rounds = Some(0);
        config.limits.rerandomize = true;
        config.limits.run_seconds = Some(0.05);
        let config = Arc::new(config);

        let stop = Arc::new(AtomicBool::new(false));
        let dev = config.job.devices[0].clone();
        let worker = Worker::with_engine(0, config.clone(), &dev, Box::new(MockEngine::new()), stop.clone()).unwrap();

        let s = stop.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            s.store(true, Ordering::SeqCst);
        });

        let report = run_workers(vec![worker], &config, stop).unwrap();
        stopper.join().unwrap();
        assert!(report.workers[0].totals.rounds >= 1);
        assert!(report.first_error().is_none());
    }
}
