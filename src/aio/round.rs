//! Round controller
//!
//! Runs the dispatcher repeatedly over the same work items. After every round
//! the exit conditions are checked in order: cumulative byte budget,
//! cumulative position budget (logged only), finish deadline, round count.
//! Between rounds the items may be reshuffled or moved forward by one block so
//! that consecutive rounds sweep different parts of the device.

use super::dispatch::{Dispatcher, RoundLimits, RoundOutcome};
use crate::positions::{Action, PositionContainer};
use crate::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// How a worker's rounds are bounded and varied
#[derive(Debug, Clone, Default)]
pub struct RoundPlan {
    /// Wall-clock limit of each round
    pub run_time: Option<Duration>,
    /// No round runs past this instant
    pub finish_at: Option<Instant>,
    /// Submitted-bytes limit of each round
    pub round_bytes: Option<u64>,
    /// Stop once this many bytes were submitted across rounds
    pub total_bytes: Option<u64>,
    /// Accepted-request limit of each round
    pub round_positions: Option<u64>,
    /// Reported when reached; does not stop the run
    pub total_positions: Option<u64>,
    /// `None` runs a single round, `Some(0)` repeats until another limit hits
    pub rounds: Option<u64>,
    /// Reshuffle with `seed + round` between rounds
    pub rerandomize: bool,
    /// Move every item forward by this many bytes between rounds
    pub add_block_size: Option<u64>,
    /// Device range used by `add_block_size` and the pre-discard
    pub range: (u64, u64),
    pub seed: u64,
    /// Pause between rounds
    pub waitfor: Duration,
    /// Discard the whole range before each round when the job writes
    pub pre_discard: bool,
}

/// Totals over all rounds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub rounds: u64,
    pub completed: u64,
    pub submitted: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub errors: u64,
    pub verified: u64,
    /// Every round drained before releasing its resources
    pub drained_cleanly: bool,
}

impl RunTotals {
    pub fn new() -> Self {
        Self {
            drained_cleanly: true,
            ..Self::default()
        }
    }

    fn absorb(&mut self, round: &RoundOutcome) {
        self.rounds += 1;
        self.completed += round.completed;
        self.submitted += round.submitted;
        self.read_bytes += round.read_bytes;
        self.write_bytes += round.write_bytes;
        self.errors += round.errors;
        self.verified += round.verified;
        self.drained_cleanly &= round.drained_cleanly;
    }

    pub fn submitted_bytes(&self) -> u64 {
        self.read_bytes + self.write_bytes
    }
}

pub struct RoundController {
    plan: RoundPlan,
}

impl RoundController {
    pub fn new(plan: RoundPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &RoundPlan {
        &self.plan
    }

    /// Run rounds until a limit, the stop flag or a fatal error ends the job
    pub fn run(&self, dispatcher: &mut Dispatcher, items: &mut PositionContainer, stop: &AtomicBool) -> Result<RunTotals> {
        let mut totals = RunTotals::new();
        self.run_into(dispatcher, items, stop, &mut totals)?;
        Ok(totals)
    }

    /// Like `run`, accumulating into `totals` so finished rounds survive a fatal error
    pub fn run_into(
        &self,
        dispatcher: &mut Dispatcher,
        items: &mut PositionContainer,
        stop: &AtomicBool,
        totals: &mut RunTotals,
    ) -> Result<()> {
        let plan = &self.plan;
        items.reset_status();

        while !stop.load(Ordering::Relaxed) {
            if plan.pre_discard {
                self.pre_discard(dispatcher, items);
            }

            let now = Instant::now();
            let deadline = match (plan.run_time.map(|t| now + t), plan.finish_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let limits = RoundLimits {
                deadline,
                byte_budget: plan.round_bytes,
                position_budget: plan.round_positions,
            };

            tracing::debug!(round = totals.rounds, ?limits, "round starting");
            let outcome = dispatcher.run(items, &limits)?;
            totals.absorb(&outcome);
            tracing::debug!(
                round = totals.rounds,
                submitted = outcome.submitted,
                bytes = outcome.submitted_bytes(),
                errors = outcome.errors,
                "round finished"
            );

            let Some(max_rounds) = plan.rounds else { break };

            if plan.total_bytes.is_some_and(|b| totals.submitted_bytes() >= b) {
                tracing::info!(bytes = totals.submitted_bytes(), "reached byte limit");
                break;
            }
            if plan.total_positions.is_some_and(|p| totals.submitted >= p) {
                tracing::info!(positions = totals.submitted, "reached position limit");
            }
            if plan.finish_at.is_some_and(|f| Instant::now() >= f) {
                tracing::info!("finish time reached");
                break;
            }
            if max_rounds > 0 && totals.rounds >= max_rounds {
                break;
            }
            if stop.load(Ordering::Relaxed) {
                break;
            }

            if plan.rerandomize {
                items.shuffle(plan.seed.wrapping_add(totals.rounds));
                tracing::info!(first = items.items()[0].position, "shuffled positions");
            }
            if let Some(block) = plan.add_block_size {
                items.add_block_size(block, plan.range.0, plan.range.1);
                tracing::info!(block, first = items.items()[0].position, "advanced positions");
            }
            sleep_unless_stopped(plan.waitfor, stop);
        }

        Ok(())
    }

    fn pre_discard(&self, dispatcher: &Dispatcher, items: &PositionContainer) {
        let target = dispatcher.target();
        if items.count(Action::Write) == 0 || target.info().discard_max_bytes == 0 {
            return;
        }
        let (min, max) = self.plan.range;
        let start = Instant::now();
        match target.discard(min, max.saturating_sub(min)) {
            Ok(()) => tracing::info!(
                device = %target.path().display(),
                bytes = max.saturating_sub(min),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "pre-discard done"
            ),
            Err(e) => tracing::warn!(device = %target.path().display(), error = %e, "pre-discard failed"),
        }
    }
}

/// Sleep in short steps so a stop request is noticed promptly
pub fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let step = Duration::from_millis(50);
    let end = Instant::now() + total;
    while !stop.load(Ordering::Relaxed) {
        let left = end.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        std::thread::sleep(left.min(step));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::dispatch::DispatchOptions;
    use crate::engine::mock::MockEngine;
    use crate::positions::WorkItem;
    use crate::stats::RunCounters;
    use crate::target::{open_target, OpenFlags};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        mock: MockEngine,
        stop: Arc<AtomicBool>,
        dispatcher: Dispatcher,
    }

    fn fixture(queue_depth: usize) -> Fixture {
        fixture_with(DispatchOptions {
            queue_depth,
            alignment: 4096,
            ..DispatchOptions::default()
        })
    }

    fn fixture_with(opts: DispatchOptions) -> Fixture {
        let dir = TempDir::new().unwrap();
        let flags = OpenFlags {
            direct: false,
            write: true,
            exclusive: false,
            file_size: Some(1 << 20),
        };
        let target = open_target(&dir.path().join("dev.img"), &flags).unwrap();
        let mock = MockEngine::new();
        let stop = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher::new(
            Box::new(mock.clone()),
            target,
            opts,
            Arc::new(RunCounters::new()),
            stop.clone(),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            mock,
            stop,
            dispatcher,
        }
    }

    fn writes(n: usize) -> PositionContainer {
        let items = (0..n)
            .map(|i| WorkItem::new((i * 4096) as u64, 4096, Action::Write, 3))
            .collect();
        PositionContainer::new(items, 11)
    }

    fn offsets_of_round(mock: &MockEngine, round: usize, per_round: usize) -> Vec<u64> {
        mock.submitted_operations()[round * per_round..(round + 1) * per_round]
            .iter()
            .map(|r| r.offset)
            .collect()
    }

    #[test]
    fn test_single_round_by_default() {
        let mut f = fixture(4);
        let mut items = writes(16);
        let plan = RoundPlan {
            round_positions: Some(16),
            ..RoundPlan::default()
        };

        let totals = RoundController::new(plan).run(&mut f.dispatcher, &mut items, &f.stop).unwrap();
        assert_eq!(totals.rounds, 1);
        assert_eq!(totals.write_bytes, 65536);
        assert!(totals.drained_cleanly);
        assert_eq!(f.mock.cleanup_count(), 1);
    }

    #[test]
    fn test_rejected_submissions_recover_over_rounds() {
        let mut f = fixture(4);
        f.mock.reject_first_where(|r| (r.offset / 4096) % 5 == 0);
        let mut items = writes(16);
        let plan = RoundPlan {
            round_positions: Some(16),
            rounds: Some(2),
            ..RoundPlan::default()
        };

        let totals = RoundController::new(plan).run(&mut f.dispatcher, &mut items, &f.stop).unwrap();
        assert_eq!(totals.rounds, 2);
        assert_eq!(totals.errors, 4);
        assert!(items.items().iter().all(|i| i.status.success));
    }

    #[test]
    fn test_fatal_error_keeps_finished_rounds() {
        let mut f = fixture_with(DispatchOptions {
            queue_depth: 4,
            alignment: 4096,
            abort_on_submit_error: true,
            ..DispatchOptions::default()
        });
        // Round one needs 16 attempts; the 20th falls in round two
        f.mock.reject_every(20, 0);
        let mut items = writes(16);
        let plan = RoundPlan {
            round_positions: Some(16),
            rounds: Some(3),
            ..RoundPlan::default()
        };

        let mut totals = RunTotals::new();
        let err = RoundController::new(plan)
            .run_into(&mut f.dispatcher, &mut items, &f.stop, &mut totals)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<crate::aio::DispatchError>(),
            Some(crate::aio::DispatchError::SubmitAborted { .. })
        ));
        assert_eq!(totals.rounds, 1);
        assert_eq!(totals.submitted, 16);
        assert_eq!(totals.write_bytes, 65536);
    }

    #[test]
    fn test_total_byte_budget_ends_unbounded_rounds() {
        let mut f = fixture(4);
        let mut items = writes(8);
        let pass = items.pass_bytes();
        let plan = RoundPlan {
            round_bytes: Some(pass),
            total_bytes: Some(3 * pass),
            rounds: Some(0),
            ..RoundPlan::default()
        };

        let totals = RoundController::new(plan).run(&mut f.dispatcher, &mut items, &f.stop).unwrap();
        assert_eq!(totals.rounds, 3);
        assert_eq!(totals.write_bytes, 3 * pass);
    }

    #[test]
    fn test_position_total_is_informational() {
        let mut f = fixture(2);
        let mut items = writes(4);
        let plan = RoundPlan {
            round_positions: Some(4),
            total_positions: Some(4),
            rounds: Some(3),
            ..RoundPlan::default()
        };

        let totals = RoundController::new(plan).run(&mut f.dispatcher, &mut items, &f.stop).unwrap();
        assert_eq!(totals.rounds, 3);
        assert_eq!(totals.submitted, 12);
    }

    #[test]
    fn test_rerandomize_between_rounds() {
        let mut f = fixture(4);
        let mut items = writes(32);
        let plan = RoundPlan {
            round_positions: Some(32),
            rounds: Some(2),
            rerandomize: true,
            seed: 5,
            ..RoundPlan::default()
        };

        RoundController::new(plan).run(&mut f.dispatcher, &mut items, &f.stop).unwrap();
        let first = offsets_of_round(&f.mock, 0, 32);
        let second = offsets_of_round(&f.mock, 1, 32);
        assert_ne!(first, second);

        let mut sorted = second.clone();
        sorted.sort();
        assert_eq!(sorted, first);
    }

    #[test]
    fn test_add_block_size_between_rounds() {
        let mut f = fixture(2);
        let mut items = writes(4);
        let plan = RoundPlan {
            round_positions: Some(4),
            rounds: Some(2),
            add_block_size: Some(4096),
            range: (0, 5 * 4096),
            ..RoundPlan::default()
        };

        RoundController::new(plan).run(&mut f.dispatcher, &mut items, &f.stop).unwrap();
        assert_eq!(offsets_of_round(&f.mock, 1, 4), vec![4096, 8192, 12288, 16384]);
    }

    #[test]
    fn test_finish_deadline() {
        let mut f = fixture(4);
        let mut items = writes(8);
        let plan = RoundPlan {
            run_time: Some(Duration::from_millis(20)),
            finish_at: Some(Instant::now() + Duration::from_millis(50)),
            rounds: Some(0),
            ..RoundPlan::default()
        };

        let start = Instant::now();
        let totals = RoundController::new(plan).run(&mut f.dispatcher, &mut items, &f.stop).unwrap();
        assert!(totals.rounds >= 2);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_stop_flag_prevents_rounds() {
        let mut f = fixture(4);
        let mut items = writes(8);
        f.stop.store(true, Ordering::Relaxed);

        let totals = RoundController::new(RoundPlan::default())
            .run(&mut f.dispatcher, &mut items, &f.stop)
            .unwrap();
        assert_eq!(totals.rounds, 0);
        assert_eq!(f.mock.cleanup_count(), 0);
    }

    #[test]
    fn test_sleep_unless_stopped_returns_early() {
        let stop = AtomicBool::new(true);
        let start = Instant::now();
        sleep_unless_stopped(Duration::from_secs(10), &stop);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
