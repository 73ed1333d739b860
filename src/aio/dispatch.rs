//! Dispatch loop, completion harvester and drain
//!
//! A `Dispatcher` owns one IO engine and drives a `PositionContainer` through
//! it, one round per `run()` call. Each call:
//!
//! 1. allocates the buffer pool and slot ring, then initialises the engine
//! 2. loops: check stop/deadline, submit under the `2k+1` ramp rule, report,
//!    periodic flush, poll and harvest
//! 3. drains everything still in flight (bounded)
//! 4. cleans up the engine and frees the pool, exactly once
//!
//! Completions carry the work item index as their token, so the harvester
//! never touches raw addresses. Everything in here runs on the worker's own
//! thread; the only shared state is the `RunCounters` and the stop flag.

use super::error::DispatchError;
use super::pool::{BufferPool, SlotRing};
use super::watermark::Watermark;
use super::OPLOG;
use crate::engine::{EngineConfig, IOCompletion, IOEngine, IOOperation, OperationType};
use crate::output::dump::DumpWriter;
use crate::positions::{Action, PositionContainer};
use crate::stats::{CounterSnapshot, LatencyStats, RunCounters, Throughput};
use crate::target::Target;
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Completion failures logged at error level per run; the rest go to trace
const LOGGED_FAILURES: u64 = 10;

/// Tunables for one dispatcher
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub queue_depth: usize,
    /// Buffer alignment, at least 512
    pub alignment: usize,
    /// Items to advance after each one
    pub stride: usize,
    /// Synchronous flush after this many submitted writes
    pub flush_every: Option<u64>,
    /// Only poll once the queue is full
    pub barrier: bool,
    /// Treat a rejected submission as fatal
    pub abort_on_submit_error: bool,
    pub poll_timeout: Duration,
    pub slow_threshold: Duration,
    pub error_ceiling: u64,
    pub drain_attempts: u32,
    pub drain_poll: Duration,
    pub report_interval: Duration,
    /// Upper bound on buffer pool bytes
    pub ram_limit: Option<u64>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            queue_depth: 32,
            alignment: 512,
            stride: 1,
            flush_every: None,
            barrier: false,
            abort_on_submit_error: false,
            poll_timeout: Duration::from_millis(10),
            slow_threshold: Duration::from_secs(30),
            error_ceiling: 1_000_000,
            drain_attempts: 3600,
            drain_poll: Duration::from_secs(1),
            report_interval: Duration::from_secs(1),
            ram_limit: None,
        }
    }
}

/// Exit conditions for one round
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundLimits {
    /// Stop submitting at this instant
    pub deadline: Option<Instant>,
    /// Stop before submitted read+write bytes would pass this
    pub byte_budget: Option<u64>,
    /// Stop once this many requests were accepted
    pub position_budget: Option<u64>,
}

/// What one round did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundOutcome {
    /// Successfully harvested operations (inline discards included)
    pub completed: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    /// Requests accepted by the engine; inline discards are not counted
    pub submitted: u64,
    /// Inline discards performed
    pub discards: u64,
    pub errors: u64,
    pub verified: u64,
    /// Nothing was left in flight when resources were released
    pub drained_cleanly: bool,
    pub free_slots_at_exit: usize,
}

impl RoundOutcome {
    pub fn submitted_bytes(&self) -> u64 {
        self.read_bytes + self.write_bytes
    }
}

/// Per-invocation state; dropped (freeing the pool) at the end of `run()`
struct RunState {
    pool: BufferPool,
    slots: SlotRing,
    queue_depth: usize,
    in_flight: usize,
    index: usize,
    round_start: Instant,
    outcome: RoundOutcome,
    writes_since_flush: u64,
    failures_logged: u64,
    idle_attempts: usize,
    last_report: Instant,
    last_snapshot: CounterSnapshot,
    fatal: Option<anyhow::Error>,
}

impl RunState {
    fn fail(&mut self, err: anyhow::Error) {
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
    }

    #[cfg(debug_assertions)]
    fn check_slots(&self, items: &PositionContainer) {
        let mut seen: Vec<usize> = self.slots.free_slots();
        seen.extend(items.items().iter().filter(|i| i.status.in_flight).filter_map(|i| i.status.slot));
        seen.sort_unstable();
        debug_assert!(
            seen.iter().copied().eq(0..self.slots.capacity()),
            "slot accounting broken: {:?}",
            seen
        );
    }
}

enum Step {
    /// Request accepted by the engine
    Submitted,
    /// Done synchronously (inline discard); nothing entered the queue
    Inline,
    /// Move on without submitting
    Skip,
    /// Leave the index here and stop submitting this iteration
    Stall,
    /// Leave the loop
    Exit,
}

/// Async dispatcher for one device
pub struct Dispatcher {
    engine: Box<dyn IOEngine>,
    target: Arc<dyn Target>,
    device: String,
    opts: DispatchOptions,
    counters: Arc<RunCounters>,
    latency: LatencyStats,
    stop: Arc<AtomicBool>,
    dump: Option<DumpWriter>,
    run_start: Instant,
}

impl Dispatcher {
    pub fn new(
        engine: Box<dyn IOEngine>,
        target: Arc<dyn Target>,
        opts: DispatchOptions,
        counters: Arc<RunCounters>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        anyhow::ensure!(
            opts.alignment >= 512 && opts.alignment.is_power_of_two(),
            "alignment {} must be a power of two >= 512",
            opts.alignment
        );
        anyhow::ensure!(opts.stride >= 1, "stride must be at least 1");

        Ok(Self {
            device: target.path().display().to_string(),
            engine,
            target,
            opts,
            counters,
            latency: LatencyStats::new()?,
            stop,
            dump: None,
            run_start: Instant::now(),
        })
    }

    /// Emit a dump line for every completed item
    pub fn with_dump(mut self, dump: DumpWriter) -> Self {
        self.dump = Some(dump);
        self
    }

    /// Reference point for dump timestamps
    pub fn set_run_start(&mut self, start: Instant) {
        self.run_start = start;
    }

    pub fn latency(&self) -> &LatencyStats {
        &self.latency
    }

    pub fn counters(&self) -> &Arc<RunCounters> {
        &self.counters
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.opts
    }

    pub fn target(&self) -> &Arc<dyn Target> {
        &self.target
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.capabilities().name
    }

    /// Flush the dump file, if any
    pub fn finish_dump(&mut self) -> Result<()> {
        match self.dump.as_mut() {
            Some(dump) => dump.flush(),
            None => Ok(()),
        }
    }

    /// Run one round over `items`
    ///
    /// Fatal conditions still drain and release before the error is returned.
    pub fn run(&mut self, items: &mut PositionContainer, limits: &RoundLimits) -> Result<RoundOutcome> {
        anyhow::ensure!(!items.is_empty(), "no work items to dispatch");

        let queue_depth = self.opts.queue_depth.clamp(1, items.len());
        if queue_depth < self.opts.queue_depth {
            tracing::debug!(requested = self.opts.queue_depth, queue_depth, "queue depth clamped to item count");
        }

        let seed = items.items()[0].seed;
        let pool = BufferPool::new(
            queue_depth,
            items.max_block_size(),
            self.opts.alignment,
            self.opts.ram_limit,
            seed,
        )?;
        self.engine.init(&EngineConfig { queue_depth })?;

        let now = Instant::now();
        let mut state = RunState {
            pool,
            slots: SlotRing::new(queue_depth),
            queue_depth,
            in_flight: 0,
            index: 0,
            round_start: now,
            outcome: RoundOutcome::default(),
            writes_since_flush: 0,
            failures_logged: 0,
            idle_attempts: 0,
            last_report: now,
            last_snapshot: self.counters.snapshot(),
            fatal: None,
        };

        tracing::debug!(
            device = %self.device,
            engine = self.engine.capabilities().name,
            items = items.len(),
            queue_depth,
            "round started"
        );

        self.dispatch_loop(items, limits, &mut state);
        state.outcome.drained_cleanly = self.drain(items, &mut state);
        state.outcome.free_slots_at_exit = state.slots.free_count();
        self.counters.set_in_flight(state.in_flight);

        let cleanup = self.engine.cleanup();
        drop(state.pool);

        if let Some(err) = state.fatal {
            return Err(err);
        }
        cleanup?;
        Ok(state.outcome)
    }

    fn dispatch_loop(&mut self, items: &mut PositionContainer, limits: &RoundLimits, state: &mut RunState) {
        let n = items.len();

        loop {
            if self.stop.load(Ordering::Relaxed) {
                tracing::debug!(device = %self.device, "stop requested");
                break;
            }
            if limits.deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            if state.fatal.is_some() {
                break;
            }

            // Ramp: depth grows 1, 3, 7, ... until the queue depth
            let allowed = (2 * state.outcome.submitted as usize + 1).min(state.queue_depth);
            let mut submitted_now = 0usize;
            let mut attempts = 0usize;
            let mut exit = false;

            while state.in_flight < allowed && attempts < n {
                let idx = state.index;
                let due = Duration::from_micros(items.items()[idx].scheduled_offset_us);
                if state.round_start.elapsed() < due {
                    break;
                }

                match self.submit_one(items, idx, limits, state) {
                    Step::Submitted => {
                        submitted_now += 1;
                        state.idle_attempts = 0;
                        self.advance(state, n);
                        if limits.position_budget.is_some_and(|p| state.outcome.submitted >= p) {
                            exit = true;
                            break;
                        }
                    }
                    Step::Skip | Step::Inline => {
                        state.idle_attempts += 1;
                        self.advance(state, n);
                    }
                    Step::Stall => break,
                    Step::Exit => {
                        exit = true;
                        break;
                    }
                }
                attempts += 1;
            }

            #[cfg(debug_assertions)]
            state.check_slots(items);

            if exit || state.fatal.is_some() {
                break;
            }

            self.maybe_report(state);
            self.maybe_flush(state);

            if state.in_flight > 0 {
                let saturated = state.in_flight >= state.queue_depth;
                if !self.opts.barrier || saturated || submitted_now == 0 {
                    self.poll(items, state, self.opts.poll_timeout);
                }
            } else if submitted_now == 0 {
                if state.idle_attempts >= n {
                    tracing::warn!(device = %self.device, "no work items left to queue, ending round");
                    break;
                }
                let due = Duration::from_micros(items.items()[state.index].scheduled_offset_us);
                let wait = due.saturating_sub(state.round_start.elapsed()).min(self.opts.poll_timeout);
                if !wait.is_zero() {
                    std::thread::sleep(wait);
                }
            }
        }
    }

    fn advance(&self, state: &mut RunState, n: usize) {
        state.index += self.opts.stride;
        if state.index >= n {
            state.index = 0;
            state.round_start = Instant::now();
        }
    }

    fn submit_one(
        &mut self,
        items: &mut PositionContainer,
        idx: usize,
        limits: &RoundLimits,
        state: &mut RunState,
    ) -> Step {
        let run_uuid = items.run_uuid();
        let item = &items.items()[idx];
        let (action, position, length, seed) = (item.action, item.position, item.length, item.seed);

        if item.status.in_flight {
            tracing::debug!(device = %self.device, index = idx, position, "item still in flight, skipping");
            return Step::Skip;
        }

        let over_budget = |bytes: u64| {
            limits
                .byte_budget
                .is_some_and(|b| state.outcome.submitted_bytes() + bytes > b)
        };

        match action {
            Action::Pause => {
                if state.in_flight > 0 {
                    Step::Stall
                } else {
                    Step::Skip
                }
            }
            Action::Discard => {
                if self.target.info().discard_max_bytes < self.opts.alignment as u64 {
                    return Step::Skip;
                }
                self.discard_inline(items, idx, state)
            }
            Action::Read | Action::Write => {
                if over_budget(length as u64) {
                    return Step::Exit;
                }
                let Some(slot) = state.slots.take() else {
                    state.fail(
                        DispatchError::SlotsExhausted {
                            in_flight: state.in_flight,
                            queue_depth: state.queue_depth,
                        }
                        .into(),
                    );
                    return Step::Exit;
                };

                let (op_type, buffer) = if action == Action::Write {
                    let mark = Watermark::new(position, run_uuid);
                    (OperationType::Write, state.pool.prepare_write(slot, length, seed, mark))
                } else {
                    (OperationType::Read, state.pool.read_ptr(slot))
                };

                let op = IOOperation {
                    op_type,
                    target_fd: self.target.fd(),
                    offset: position,
                    buffer,
                    length,
                    user_data: idx as u64,
                };
                match self.engine.submit(op) {
                    Ok(()) => {
                        self.mark_submitted(items, idx, Some(slot), state);
                        if action == Action::Write {
                            state.writes_since_flush += 1;
                        }
                        Step::Submitted
                    }
                    Err(e) => {
                        if let Err(give) = state.slots.give(slot) {
                            state.fail(give);
                        }
                        self.submit_failed(action, position, e, state)
                    }
                }
            }
            Action::Flush => {
                let op = IOOperation {
                    op_type: OperationType::Fsync,
                    target_fd: self.target.fd(),
                    offset: 0,
                    buffer: std::ptr::null_mut(),
                    length: 0,
                    user_data: idx as u64,
                };
                match self.engine.submit(op) {
                    Ok(()) => {
                        self.mark_submitted(items, idx, None, state);
                        Step::Submitted
                    }
                    Err(e) => self.submit_failed(action, position, e, state),
                }
            }
        }
    }

    fn mark_submitted(&self, items: &mut PositionContainer, idx: usize, slot: Option<usize>, state: &mut RunState) {
        let item = &mut items.items_mut()[idx];
        item.status.in_flight = true;
        item.status.success = false;
        item.status.submit_time = Some(Instant::now());
        item.status.finish_time = None;
        item.status.slot = slot;

        let bytes = item.length as u64;
        match item.action {
            Action::Read => state.outcome.read_bytes += bytes,
            Action::Write => state.outcome.write_bytes += bytes,
            _ => {}
        }
        state.outcome.submitted += 1;
        state.in_flight += 1;
        self.counters.record_submit(item.action, bytes);
        self.counters.set_in_flight(state.in_flight);
    }

    /// Count a rejected request; `Stall` keeps the index on it for a retry next iteration
    fn submit_failed(&mut self, action: Action, position: u64, err: anyhow::Error, state: &mut RunState) -> Step {
        state.outcome.errors += 1;
        let total = self.counters.record_error();
        tracing::warn!(device = %self.device, %action, position, error = %err, "submission failed");

        if self.opts.abort_on_submit_error {
            state.fail(
                DispatchError::SubmitAborted {
                    action: action.to_string(),
                    position,
                    reason: format!("{:#}", err),
                }
                .into(),
            );
            return Step::Exit;
        }
        if total > self.opts.error_ceiling {
            state.fail(DispatchError::ErrorCeiling { errors: total }.into());
            return Step::Exit;
        }
        Step::Stall
    }

    fn discard_inline(&mut self, items: &mut PositionContainer, idx: usize, state: &mut RunState) -> Step {
        let (position, length) = {
            let item = &items.items()[idx];
            (item.position, item.length)
        };

        let start = Instant::now();
        let result = self.target.discard(position, length as u64);
        let finish = Instant::now();

        match result {
            Ok(()) => {
                let item = &mut items.items_mut()[idx];
                item.status.submit_time = Some(start);
                item.status.finish_time = Some(finish);
                item.status.success = true;

                state.outcome.discards += 1;
                state.outcome.completed += 1;
                self.counters.record_discard();
                self.latency.record(Action::Discard, finish - start);
                self.dump_item(items, idx);
                Step::Inline
            }
            // A failing discard is not retried in place
            Err(e) => match self.submit_failed(Action::Discard, position, e, state) {
                Step::Stall => Step::Skip,
                other => other,
            },
        }
    }

    fn maybe_report(&self, state: &mut RunState) {
        let elapsed = state.last_report.elapsed();
        if self.opts.report_interval.is_zero() || elapsed < self.opts.report_interval {
            return;
        }
        let snapshot = self.counters.snapshot();
        let throughput = Throughput::between(&state.last_snapshot, &snapshot, elapsed);
        tracing::info!(
            device = %self.device,
            in_flight = state.in_flight,
            errors = snapshot.errors,
            "{}",
            throughput
        );
        state.last_report = Instant::now();
        state.last_snapshot = snapshot;
    }

    fn maybe_flush(&mut self, state: &mut RunState) {
        let Some(every) = self.opts.flush_every else { return };
        if every == 0 || state.writes_since_flush < every {
            return;
        }
        state.writes_since_flush = 0;

        let start = Instant::now();
        match self.target.sync() {
            Ok(()) => self.latency.record(Action::Flush, start.elapsed()),
            Err(e) => {
                state.outcome.errors += 1;
                self.counters.record_error();
                tracing::warn!(device = %self.device, error = %e, "periodic flush failed");
            }
        }
    }

    fn poll(&mut self, items: &mut PositionContainer, state: &mut RunState, timeout: Duration) {
        match self.engine.poll_completions(1, Some(timeout)) {
            Ok(completions) => {
                if !completions.is_empty() {
                    state.idle_attempts = 0;
                }
                for completion in completions {
                    self.harvest(items, state, completion);
                }
            }
            Err(e) => state.fail(e.context("polling for completions failed")),
        }
        self.counters.set_in_flight(state.in_flight);
    }

    fn harvest(&mut self, items: &mut PositionContainer, state: &mut RunState, completion: IOCompletion) {
        let idx = completion.user_data as usize;
        if idx >= items.len() || !items.items()[idx].status.in_flight {
            tracing::warn!(device = %self.device, token = completion.user_data, "completion for unknown request");
            return;
        }

        let now = Instant::now();
        let run_uuid = items.run_uuid();
        let item = &items.items()[idx];
        let (action, position, length) = (item.action, item.position, item.length);
        let submit_time = item.status.submit_time.unwrap_or(now);
        let slot = item.status.slot;

        let failure = match &completion.result {
            Ok(n) if *n == length => None,
            Ok(n) => Some(format!("short transfer: {} of {} bytes", n, length)),
            Err(e) => Some(format!("{:#}", e)),
        };

        // Only check reads whose linked write finished before the read went out
        let expected = match (failure.is_none(), action, item.verify) {
            (true, Action::Read, Some(link)) => {
                let write = &items.items()[link].status;
                match write.finish_time {
                    Some(f) if write.success && f <= submit_time => Some(Watermark::new(position, run_uuid)),
                    _ => None,
                }
            }
            _ => None,
        };

        let item = &mut items.items_mut()[idx];
        item.status.in_flight = false;
        item.status.finish_time = Some(now);
        item.status.slot = None;
        item.status.success = failure.is_none();

        state.in_flight -= 1;
        self.counters.record_received();
        let latency = now.saturating_duration_since(submit_time);

        match failure {
            None => {
                state.outcome.completed += 1;
                self.latency.record(action, latency);

                if let (Some(mark), Some(slot)) = (expected, slot) {
                    let checked = mark.check(state.pool.read_buf(slot, length));
                    match checked {
                        Ok(()) => {
                            state.outcome.verified += 1;
                            self.counters.record_verified();
                        }
                        Err(found) => {
                            tracing::error!(
                                target: OPLOG,
                                device = %self.device,
                                position,
                                expected_run = run_uuid,
                                found_position = found.position,
                                found_run = found.run_uuid,
                                "watermark mismatch"
                            );
                            state.fail(
                                DispatchError::Integrity {
                                    device: self.device.clone(),
                                    position,
                                    expected_run: run_uuid,
                                    found_position: found.position,
                                    found_run: found.run_uuid,
                                }
                                .into(),
                            );
                        }
                    }
                }
                self.dump_item(items, idx);
            }
            Some(reason) => {
                state.outcome.errors += 1;
                let total = self.counters.record_error();
                state.failures_logged += 1;
                if state.failures_logged <= LOGGED_FAILURES {
                    tracing::error!(device = %self.device, %action, position, length, error = %reason, "IO failed");
                    if state.failures_logged == LOGGED_FAILURES {
                        tracing::error!(device = %self.device, "further IO failures this round are not logged");
                    }
                } else {
                    tracing::trace!(device = %self.device, %action, position, error = %reason, "IO failed");
                }
                if total > self.opts.error_ceiling {
                    state.fail(DispatchError::ErrorCeiling { errors: total }.into());
                }
            }
        }

        if latency > self.opts.slow_threshold {
            self.counters.record_slow();
            tracing::warn!(
                target: OPLOG,
                device = %self.device,
                %action,
                position,
                length,
                latency_ms = latency.as_millis() as u64,
                "slow IO"
            );
        }

        if let Some(slot) = slot {
            if let Err(e) = state.slots.give(slot) {
                state.fail(e);
            }
        }
    }

    fn dump_item(&mut self, items: &PositionContainer, idx: usize) {
        let Some(dump) = self.dump.as_mut() else { return };
        if let Err(e) = dump.write_item(&items.items()[idx], self.run_start, &self.device) {
            tracing::warn!(device = %self.device, error = %e, "disabling completion dump");
            self.dump = None;
        }
    }

    /// Wait (bounded) for everything still in flight; true if nothing is left
    fn drain(&mut self, items: &mut PositionContainer, state: &mut RunState) -> bool {
        let mut attempts = 0;
        while state.in_flight > 0 && attempts < self.opts.drain_attempts {
            self.poll(items, state, self.opts.drain_poll);
            attempts += 1;
            if state.in_flight > 0 && attempts % 3 == 0 {
                tracing::info!(device = %self.device, in_flight = state.in_flight, attempts, "waiting for outstanding IO");
            }
        }

        if state.in_flight > 0 {
            tracing::warn!(
                target: OPLOG,
                device = %self.device,
                in_flight = state.in_flight,
                attempts,
                "drain timed out with IO outstanding; releasing anyway"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::positions::WorkItem;
    use crate::target::{open_target, OpenFlags};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        target: Arc<dyn Target>,
        mock: MockEngine,
        counters: Arc<RunCounters>,
        stop: Arc<AtomicBool>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let flags = OpenFlags {
            direct: false,
            write: true,
            exclusive: false,
            file_size: Some(1 << 20),
        };
        let target = open_target(&dir.path().join("dev.img"), &flags).unwrap();
        Fixture {
            _dir: dir,
            target,
            mock: MockEngine::new(),
            counters: Arc::new(RunCounters::new()),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    fn dispatcher(f: &Fixture, opts: DispatchOptions) -> Dispatcher {
        Dispatcher::new(
            Box::new(f.mock.clone()),
            f.target.clone(),
            opts,
            f.counters.clone(),
            f.stop.clone(),
        )
        .unwrap()
    }

    fn writes(n: usize) -> PositionContainer {
        let items = (0..n)
            .map(|i| WorkItem::new((i * 4096) as u64, 4096, Action::Write, 1))
            .collect();
        PositionContainer::new(items, 99)
    }

    fn verified_pairs(n: usize) -> PositionContainer {
        let mut items: Vec<WorkItem> = (0..n)
            .map(|i| WorkItem::new((i * 4096) as u64, 4096, Action::Write, 1))
            .collect();
        for i in 0..n {
            let mut read = WorkItem::new((i * 4096) as u64, 4096, Action::Read, 1);
            read.verify = Some(i);
            items.push(read);
        }
        PositionContainer::new(items, 99)
    }

    fn qd(queue_depth: usize) -> DispatchOptions {
        DispatchOptions {
            queue_depth,
            alignment: 4096,
            ..DispatchOptions::default()
        }
    }

    fn budget(positions: u64) -> RoundLimits {
        RoundLimits {
            position_budget: Some(positions),
            ..RoundLimits::default()
        }
    }

    fn per_epoch(mock: &MockEngine) -> Vec<usize> {
        let mut batches: BTreeMap<usize, usize> = BTreeMap::new();
        for record in mock.submitted_operations() {
            *batches.entry(record.poll_epoch).or_default() += 1;
        }
        batches.into_values().collect()
    }

    #[test]
    fn test_ramp_up_pattern() {
        let f = fixture();
        let mut d = dispatcher(&f, qd(4));
        let mut items = writes(16);

        let outcome = d.run(&mut items, &budget(16)).unwrap();

        assert_eq!(per_epoch(&f.mock), vec![1, 3, 4, 4, 4]);
        assert_eq!(outcome.submitted, 16);
        assert_eq!(outcome.completed, 16);
        assert_eq!(outcome.write_bytes, 65536);
        assert_eq!(outcome.read_bytes, 0);
        assert_eq!(outcome.errors, 0);
        assert!(outcome.drained_cleanly);
        assert_eq!(outcome.free_slots_at_exit, 4);
        assert_eq!(f.counters.snapshot().received, 16);
        assert!(items.items().iter().all(|i| i.status.success && !i.status.in_flight));
        assert_eq!(f.mock.cleanup_count(), 1);
    }

    #[test]
    fn test_ramp_restarts_each_run() {
        let f = fixture();
        let mut d = dispatcher(&f, qd(4));
        let mut items = writes(16);

        d.run(&mut items, &budget(8)).unwrap();
        d.run(&mut items, &budget(8)).unwrap();

        // Two rounds, each ramping 1, 3, 4 from scratch
        assert_eq!(per_epoch(&f.mock), vec![1, 3, 4, 1, 3, 4]);
        assert_eq!(f.mock.cleanup_count(), 2);
    }

    #[test]
    fn test_rejected_submissions_counted_and_retried() {
        let f = fixture();
        f.mock.reject_first_where(|r| (r.offset / 4096) % 5 == 0);
        let mut d = dispatcher(&f, qd(4));
        let mut items = writes(16);

        let outcome = d.run(&mut items, &budget(16)).unwrap();

        assert_eq!(outcome.errors, 4);
        assert_eq!(f.mock.rejected_count(), 4);
        assert_eq!(f.counters.errors(), 4);
        assert_eq!(f.mock.submitted_count(), 16);
        assert!(items.items().iter().all(|i| i.status.success));
        assert_eq!(outcome.free_slots_at_exit, 4);
    }

    #[test]
    fn test_every_fifth_submission_rejected() {
        // (phase, expected errors): attempts 5, 10, 15 or attempts 1, 6, 11, 16
        for (phase, errors) in [(0, 3), (1, 4)] {
            let f = fixture();
            f.mock.reject_every(5, phase);
            let mut d = dispatcher(&f, qd(4));
            let mut items = writes(16);

            let outcome = d.run(&mut items, &budget(16)).unwrap();

            assert_eq!(outcome.errors, errors, "phase {}", phase);
            assert_eq!(outcome.submitted, 16);
            assert_eq!(outcome.write_bytes, 65536);
            assert_eq!(f.mock.rejected_count() as u64, errors);
            assert_eq!(f.mock.duplicate_submissions(), 0);
            let never: Vec<usize> = (0..16).filter(|&i| !items.items()[i].status.success).collect();
            assert!(never.is_empty(), "phase {}: never succeeded {:?}", phase, never);
        }
    }

    #[test]
    fn test_abort_on_submit_error() {
        let f = fixture();
        f.mock.reject_first_where(|r| r.offset == 8192);
        let mut d = dispatcher(
            &f,
            DispatchOptions {
                abort_on_submit_error: true,
                ..qd(4)
            },
        );
        let mut items = writes(16);

        let err = d.run(&mut items, &budget(16)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DispatchError>(),
            Some(DispatchError::SubmitAborted { position: 8192, .. })
        ));
        // Items 0 and 1 were accepted and drained before returning
        assert_eq!(f.mock.pending_count(), 0);
        assert_eq!(f.mock.cleanup_count(), 1);
    }

    #[test]
    fn test_collision_skips_in_flight_items() {
        let f = fixture();
        f.mock.set_newest_first(true);
        f.mock.set_max_per_poll(Some(1));
        let mut d = dispatcher(&f, qd(4));
        let mut items = writes(4);

        let outcome = d.run(&mut items, &budget(24)).unwrap();

        assert_eq!(f.mock.duplicate_submissions(), 0);
        assert_eq!(outcome.submitted, 24);
        assert_eq!(outcome.completed, 24);
        assert_eq!(outcome.free_slots_at_exit, 4);
    }

    #[test]
    fn test_verification_round_trip() {
        let f = fixture();
        let mut d = dispatcher(&f, qd(4));
        let mut items = verified_pairs(4);

        let outcome = d.run(&mut items, &budget(8)).unwrap();

        assert_eq!(outcome.verified, 4);
        assert_eq!(f.counters.snapshot().verified, 4);
        let stored = f.mock.stored(4096).unwrap();
        assert_eq!(Watermark::read(&stored), Watermark::new(4096, 99));
    }

    #[test]
    fn test_verification_detects_corruption() {
        let f = fixture();
        f.mock.set_corrupt_after_write(Some(8192));
        let mut d = dispatcher(&f, qd(4));
        let mut items = verified_pairs(4);

        let err = d.run(&mut items, &budget(8)).unwrap_err();
        match err.downcast_ref::<DispatchError>() {
            Some(DispatchError::Integrity { position, expected_run, found_position, .. }) => {
                assert_eq!(*position, 8192);
                assert_eq!(*expected_run, 99);
                assert_ne!(*found_position, 8192);
            }
            other => panic!("expected integrity failure, got {:?}", other),
        }
        assert_eq!(f.mock.cleanup_count(), 1);
    }

    #[test]
    fn test_verification_skipped_when_write_unfinished() {
        let f = fixture();
        f.mock.set_corrupt_after_write(Some(0));
        f.mock.set_hold_completions(true);
        let mut d = dispatcher(
            &f,
            DispatchOptions {
                drain_poll: Duration::from_millis(5),
                drain_attempts: 400,
                ..qd(2)
            },
        );
        // Write and its verifying read go out before the write completes
        let mut items = verified_pairs(1);

        let release = f.mock.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            release.set_hold_completions(false);
        });
        let outcome = d.run(&mut items, &budget(2)).unwrap();
        handle.join().unwrap();

        assert_eq!(outcome.completed, 2);
        assert_eq!(outcome.verified, 0);
        assert!(outcome.drained_cleanly);
    }

    #[test]
    fn test_byte_budget() {
        let f = fixture();
        let mut d = dispatcher(&f, qd(4));
        let mut items = writes(16);

        let limits = RoundLimits {
            byte_budget: Some(10_000),
            ..RoundLimits::default()
        };
        let outcome = d.run(&mut items, &limits).unwrap();

        assert_eq!(outcome.write_bytes, 8192);
        assert!(outcome.submitted_bytes() <= 10_000);
        assert_eq!(outcome.completed, 2);
    }

    #[test]
    fn test_deadline_and_stop_flag() {
        let f = fixture();
        let mut d = dispatcher(&f, qd(4));
        let mut items = writes(16);

        let past = RoundLimits {
            deadline: Some(Instant::now()),
            ..RoundLimits::default()
        };
        assert_eq!(d.run(&mut items, &past).unwrap().submitted, 0);

        f.stop.store(true, Ordering::Relaxed);
        assert_eq!(d.run(&mut items, &RoundLimits::default()).unwrap().submitted, 0);
        assert_eq!(f.mock.cleanup_count(), 2);
    }

    #[test]
    fn test_drain_timeout_releases_once() {
        let f = fixture();
        f.mock.set_hold_completions(true);
        let mut d = dispatcher(
            &f,
            DispatchOptions {
                drain_attempts: 3,
                drain_poll: Duration::from_millis(1),
                ..qd(4)
            },
        );
        let mut items = writes(8);

        let outcome = d.run(&mut items, &budget(1)).unwrap();

        assert!(!outcome.drained_cleanly);
        assert_eq!(outcome.free_slots_at_exit, 3);
        assert_eq!(f.mock.cleanup_count(), 1);
        assert_eq!(f.counters.snapshot().in_flight, 1);
    }

    #[test]
    fn test_completion_errors_and_ceiling() {
        let f = fixture();
        f.mock.set_should_fail(true);
        let mut d = dispatcher(&f, qd(4));
        let mut items = writes(8);

        let outcome = d.run(&mut items, &budget(8)).unwrap();
        assert_eq!(outcome.errors, 8);
        assert_eq!(outcome.completed, 0);
        assert!(items.items().iter().all(|i| !i.status.success && i.status.finish_time.is_some()));

        let mut d = dispatcher(
            &f,
            DispatchOptions {
                error_ceiling: 10,
                ..qd(4)
            },
        );
        let err = d.run(&mut items, &budget(8)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DispatchError>(),
            Some(DispatchError::ErrorCeiling { errors: 11 })
        ));
    }

    #[test]
    fn test_short_transfer_is_error() {
        let f = fixture();
        f.mock.set_bytes_per_op(512);
        let mut d = dispatcher(&f, qd(2));
        let mut items = writes(2);

        let outcome = d.run(&mut items, &budget(2)).unwrap();
        assert_eq!(outcome.errors, 2);
        assert_eq!(outcome.completed, 0);
    }

    #[test]
    fn test_slow_io_counted() {
        let f = fixture();
        let mut d = dispatcher(
            &f,
            DispatchOptions {
                slow_threshold: Duration::ZERO,
                ..qd(4)
            },
        );
        let mut items = writes(4);

        d.run(&mut items, &budget(4)).unwrap();
        assert_eq!(f.counters.snapshot().slow_ios, 4);
    }

    #[test]
    fn test_mixed_actions() {
        let f = fixture();
        let items = vec![
            WorkItem::new(0, 4096, Action::Write, 1),
            WorkItem::new(0, 0, Action::Flush, 0),
            WorkItem::new(4096, 8192, Action::Discard, 0),
            WorkItem::new(0, 0, Action::Pause, 0),
            WorkItem::new(0, 4096, Action::Read, 1),
        ];
        let mut items = PositionContainer::new(items, 5);
        let mut d = dispatcher(&f, qd(4));

        let outcome = d.run(&mut items, &budget(3)).unwrap();

        assert_eq!(outcome.submitted, 3);
        assert_eq!(outcome.discards, 1);
        assert_eq!(outcome.read_bytes, 4096);
        assert_eq!(outcome.write_bytes, 4096);
        let ops: Vec<OperationType> = f.mock.submitted_operations().iter().map(|r| r.op_type).collect();
        assert_eq!(ops, vec![OperationType::Write, OperationType::Fsync, OperationType::Read]);

        let snap = f.counters.snapshot();
        assert_eq!(snap.discard_ops, 1);
        assert_eq!(snap.flush_ops, 1);
        assert_eq!(d.latency().flush.len(), 1);
    }

    #[test]
    fn test_periodic_flush_and_dump() {
        let f = fixture();
        let dump_path = f._dir.path().join("dump.tsv");
        let mut d = dispatcher(
            &f,
            DispatchOptions {
                flush_every: Some(4),
                ..qd(4)
            },
        )
        .with_dump(DumpWriter::create(&dump_path).unwrap());
        let mut items = writes(16);

        d.run(&mut items, &budget(16)).unwrap();
        d.finish_dump().unwrap();

        assert!(d.latency().flush.len() >= 3);
        let dump = std::fs::read_to_string(&dump_path).unwrap();
        assert_eq!(dump.lines().count(), 16);
        assert!(dump.lines().all(|l| l.starts_with("W\t")));
    }

    #[test]
    fn test_pacing_delays_submissions() {
        let f = fixture();
        let mut d = dispatcher(&f, qd(4));
        let mut items = writes(4);
        items.add_delay(100.0);

        let start = Instant::now();
        d.run(&mut items, &budget(4)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_queue_depth_clamped_to_items() {
        let f = fixture();
        let mut d = dispatcher(&f, qd(64));
        let mut items = writes(3);

        let outcome = d.run(&mut items, &budget(3)).unwrap();
        assert_eq!(outcome.free_slots_at_exit, 3);
    }

    #[test]
    fn test_ram_limit_fails_before_engine_init() {
        let f = fixture();
        let mut d = dispatcher(
            &f,
            DispatchOptions {
                ram_limit: Some(4096),
                ..qd(4)
            },
        );
        let err = d.run(&mut writes(8), &budget(8)).unwrap_err();
        assert!(matches!(err.downcast_ref::<DispatchError>(), Some(DispatchError::BufferTooLarge { .. })));
        assert_eq!(f.mock.submitted_count(), 0);
        assert_eq!(f.mock.cleanup_count(), 0);
    }

    #[test]
    fn test_inline_discards_stay_out_of_budgets() {
        let f = fixture();
        let mut items: Vec<WorkItem> = (0..4)
            .map(|i| WorkItem::new((i * 4096) as u64, 4096, Action::Discard, 0))
            .collect();
        items.extend((0..4).map(|i| WorkItem::new((i * 4096) as u64, 4096, Action::Write, 1)));
        let mut items = PositionContainer::new(items, 7);
        let mut d = dispatcher(&f, qd(4));

        let outcome = d.run(&mut items, &budget(4)).unwrap();

        assert_eq!(outcome.discards, 4);
        assert_eq!(outcome.submitted, 4);
        assert_eq!(outcome.write_bytes, 16384);
        assert_eq!(f.mock.submitted_count(), 4);
        assert!(f.mock.submitted_operations().iter().all(|r| r.op_type == OperationType::Write));

        let snap = f.counters.snapshot();
        assert_eq!(snap.submitted, 4);
        assert_eq!(snap.discard_ops, 4);
        assert_eq!(snap.write_bytes, 16384);
        assert_eq!(snap.received, 4);
    }

    #[test]
    fn test_discard_only_round_ends_after_one_pass() {
        let f = fixture();
        let items = (0..3)
            .map(|i| WorkItem::new((i * 4096) as u64, 4096, Action::Discard, 0))
            .collect();
        let mut items = PositionContainer::new(items, 7);
        let mut d = dispatcher(&f, qd(2));

        let outcome = d.run(&mut items, &budget(3)).unwrap();

        assert_eq!(outcome.submitted, 0);
        assert_eq!(outcome.discards, 3);
        assert_eq!(f.mock.submitted_count(), 0);
    }

    #[test]
    fn test_barrier_mode() {
        let f = fixture();
        let mut d = dispatcher(
            &f,
            DispatchOptions {
                barrier: true,
                ..qd(4)
            },
        );
        let mut items = writes(16);

        let outcome = d.run(&mut items, &budget(16)).unwrap();

        // No poll until the queue is full, so every batch is a full queue
        assert_eq!(per_epoch(&f.mock), vec![4, 4, 4, 4]);
        assert_eq!(outcome.completed, 16);
        assert_eq!(outcome.free_slots_at_exit, 4);
        assert!(items.items().iter().all(|i| i.status.success));
    }

    #[test]
    fn test_stride_wraps() {
        let f = fixture();
        let mut d = dispatcher(
            &f,
            DispatchOptions {
                stride: 2,
                ..qd(1)
            },
        );
        let mut items = writes(5);

        d.run(&mut items, &budget(6)).unwrap();

        let blocks: Vec<u64> = f.mock.submitted_operations().iter().map(|r| r.offset / 4096).collect();
        assert_eq!(blocks, vec![0, 2, 4, 0, 2, 4]);
        assert!(!items.items()[1].status.success);
        assert!(!items.items()[3].status.success);
    }

    #[test]
    fn test_wrap_restarts_pacing() {
        let f = fixture();
        let mut d = dispatcher(&f, qd(1));
        let mut items = writes(3);
        // Items due at 0, 20 and 40ms into each pass
        items.add_delay(50.0);

        let start = Instant::now();
        d.run(&mut items, &budget(6)).unwrap();

        // The second pass waits out the schedule again
        assert!(start.elapsed() >= Duration::from_millis(75));
    }

    #[test]
    fn test_pause_stalls_until_idle() {
        let f = fixture();
        let items = vec![
            WorkItem::new(0, 4096, Action::Write, 1),
            WorkItem::new(4096, 4096, Action::Write, 1),
            WorkItem::new(0, 0, Action::Pause, 0),
            WorkItem::new(8192, 4096, Action::Write, 1),
        ];
        let mut items = PositionContainer::new(items, 3);
        let mut d = dispatcher(&f, qd(4));

        d.run(&mut items, &budget(3)).unwrap();

        // Without the stall the third write would join the second's batch
        assert_eq!(per_epoch(&f.mock), vec![1, 1, 1]);
        let second_done = items.items()[1].status.finish_time.unwrap();
        let third_sent = items.items()[3].status.submit_time.unwrap();
        assert!(second_done <= third_sent);
    }
}
