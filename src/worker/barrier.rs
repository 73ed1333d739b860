//! Start/finish rendezvous between workers and the reporter

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct State {
    started: usize,
    finished: usize,
}

/// Releases all workers at once, then tracks how many are done
///
/// Every worker must call `wait_start` exactly once and `finish` exactly once,
/// even when its run fails, or the others stay parked.
#[derive(Debug)]
pub struct StartBarrier {
    parties: usize,
    state: Mutex<State>,
    cond: Condvar,
}

impl StartBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Block until every party has arrived
    pub fn wait_start(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.started += 1;
        if state.started >= self.parties {
            self.cond.notify_all();
            return;
        }
        while state.started < self.parties {
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Mark one party as done
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.finished += 1;
        self.cond.notify_all();
    }

    pub fn finished(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).finished
    }

    /// Wait up to `timeout` for every party to finish; true once they all have
    pub fn wait_finished_timeout(&self, timeout: Duration) -> bool {
        let end = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while state.finished < self.parties {
            let left = end.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            state = self
                .cond
                .wait_timeout(state, left)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        true
    }
}
