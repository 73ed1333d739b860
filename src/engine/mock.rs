//! Mock IO engine for testing
//!
//! Simulates a block device in memory so the dispatcher can be exercised
//! deterministically without touching the kernel.
//!
//! # Features
//!
//! - In-memory backing store: writes are captured at submit time, reads are
//!   served from it (zeros where nothing was written)
//! - Scriptable submission rejections (first attempt at matching offsets, or
//!   every n-th submission attempt)
//! - Scriptable completion failures and short transfers
//! - Withheld completions to exercise the drain timeout
//! - Bounded, newest-first completion batches to force out-of-order harvesting
//! - Scriptable corruption of stored blocks right after they are written
//! - Per-submission poll epoch, so tests can reconstruct submission batches
//!
//! The engine is `Clone`; clones share state, so a test keeps one handle while
//! the dispatcher owns the other.
//!
//! # Example
//!
//! ```
//! use blockprobe::engine::{IOEngine, EngineConfig, IOOperation, OperationType};
//! use blockprobe::engine::mock::MockEngine;
//!
//! let mut engine = MockEngine::new();
//! engine.init(&EngineConfig::default()).unwrap();
//!
//! let op = IOOperation {
//!     op_type: OperationType::Read,
//!     target_fd: 1,
//!     offset: 0,
//!     buffer: std::ptr::null_mut(),
//!     length: 4096,
//!     user_data: 42,
//! };
//! engine.submit(op).unwrap();
//!
//! let completions = engine.poll_completions(1, None).unwrap();
//! assert_eq!(completions.len(), 1);
//! assert_eq!(completions[0].user_data, 42);
//! ```

use super::{EngineCapabilities, EngineConfig, IOCompletion, IOEngine, IOOperation, OperationType};
use crate::Result;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type SubmitFilter = Box<dyn Fn(&OperationRecord) -> bool + Send>;

/// Record of a submitted operation for testing verification
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub op_type: OperationType,
    pub target_fd: i32,
    pub offset: u64,
    pub length: usize,
    pub user_data: u64,
    /// Number of `poll_completions` calls made before this submission
    pub poll_epoch: usize,
}

struct PendingOp {
    user_data: u64,
    op_type: OperationType,
    length: usize,
}

#[derive(Default)]
struct MockState {
    pending: VecDeque<PendingOp>,
    store: BTreeMap<u64, Vec<u8>>,
    submitted: Vec<OperationRecord>,
    polls: usize,
    cleanups: usize,
    should_fail: bool,
    bytes_per_op: usize,
    hold_completions: bool,
    max_per_poll: Option<usize>,
    newest_first: bool,
    corrupt_after_write: Option<u64>,
    duplicates: usize,
    reject_first: Option<SubmitFilter>,
    /// (period, phase): reject attempt k (1-based) when k % period == phase
    reject_every: Option<(usize, usize)>,
    attempts: usize,
    rejected_offsets: HashSet<u64>,
    rejected: usize,
}

/// Mock IO engine for testing
#[derive(Clone)]
pub struct MockEngine {
    config: Option<EngineConfig>,
    state: Arc<Mutex<MockState>>,
}

impl MockEngine {
    /// Create a new mock engine that completes every request successfully
    pub fn new() -> Self {
        Self {
            config: None,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Complete every subsequent request with an error
    pub fn set_should_fail(&self, should_fail: bool) {
        self.lock().should_fail = should_fail;
    }

    /// Report this many bytes per successful request (0 = requested length)
    pub fn set_bytes_per_op(&self, bytes: usize) {
        self.lock().bytes_per_op = bytes;
    }

    /// Keep completions queued instead of returning them from polls
    pub fn set_hold_completions(&self, hold: bool) {
        self.lock().hold_completions = hold;
    }

    /// Return at most `limit` completions per poll
    pub fn set_max_per_poll(&self, limit: Option<usize>) {
        self.lock().max_per_poll = limit;
    }

    /// Complete the most recent submissions first
    pub fn set_newest_first(&self, newest_first: bool) {
        self.lock().newest_first = newest_first;
    }

    /// Flip the first stored byte whenever a write lands at `offset`
    pub fn set_corrupt_after_write(&self, offset: Option<u64>) {
        self.lock().corrupt_after_write = offset;
    }

    /// Submissions whose `user_data` was already pending
    pub fn duplicate_submissions(&self) -> usize {
        self.lock().duplicates
    }

    /// Reject the first submission at every offset matching `filter`
    ///
    /// Later submissions at an already-rejected offset are accepted.
    pub fn reject_first_where<F>(&self, filter: F)
    where
        F: Fn(&OperationRecord) -> bool + Send + 'static,
    {
        self.lock().reject_first = Some(Box::new(filter));
    }

    /// Reject submission attempt `k` (counting from 1) whenever `k % period == phase`
    pub fn reject_every(&self, period: usize, phase: usize) {
        let period = period.max(1);
        self.lock().reject_every = Some((period, phase % period));
    }

    /// Number of submissions rejected so far
    pub fn rejected_count(&self) -> usize {
        self.lock().rejected
    }

    /// Get the number of operations currently pending
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Get a copy of all accepted operations
    pub fn submitted_operations(&self) -> Vec<OperationRecord> {
        self.lock().submitted.clone()
    }

    /// Get the number of accepted operations
    pub fn submitted_count(&self) -> usize {
        self.lock().submitted.len()
    }

    /// How many times `cleanup()` ran
    pub fn cleanup_count(&self) -> usize {
        self.lock().cleanups
    }

    /// Bytes last written at `offset`
    pub fn stored(&self, offset: u64) -> Option<Vec<u8>> {
        self.lock().store.get(&offset).cloned()
    }

    /// Flip one byte of the block stored at `offset`
    pub fn corrupt(&self, offset: u64, byte: usize) {
        if let Some(block) = self.lock().store.get_mut(&offset) {
            if let Some(b) = block.get_mut(byte) {
                *b ^= 0xFF;
            }
        }
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IOEngine for MockEngine {
    fn init(&mut self, config: &EngineConfig) -> Result<()> {
        self.config = Some(config.clone());
        Ok(())
    }

    fn submit(&mut self, op: IOOperation) -> Result<()> {
        let mut state = self.lock();

        let record = OperationRecord {
            op_type: op.op_type,
            target_fd: op.target_fd,
            offset: op.offset,
            length: op.length,
            user_data: op.user_data,
            poll_epoch: state.polls,
        };

        state.attempts += 1;
        if let Some((period, phase)) = state.reject_every {
            if state.attempts % period == phase {
                state.rejected += 1;
                anyhow::bail!("Mock submission attempt {} rejected", state.attempts);
            }
        }

        let reject = match &state.reject_first {
            Some(filter) => filter(&record) && !state.rejected_offsets.contains(&op.offset),
            None => false,
        };
        if reject {
            state.rejected_offsets.insert(op.offset);
            state.rejected += 1;
            anyhow::bail!("Mock submission rejected at offset {}", op.offset);
        }

        if !op.buffer.is_null() && op.length > 0 {
            match op.op_type {
                OperationType::Write => {
                    let data = unsafe { std::slice::from_raw_parts(op.buffer, op.length) };
                    let mut block = data.to_vec();
                    if state.corrupt_after_write == Some(op.offset) {
                        block[0] ^= 0xFF;
                    }
                    state.store.insert(op.offset, block);
                }
                OperationType::Read => {
                    let dst = unsafe { std::slice::from_raw_parts_mut(op.buffer, op.length) };
                    match state.store.get(&op.offset) {
                        Some(src) => {
                            let n = src.len().min(dst.len());
                            dst[..n].copy_from_slice(&src[..n]);
                            dst[n..].fill(0);
                        }
                        None => dst.fill(0),
                    }
                }
                OperationType::Fsync => {}
            }
        }

        if state.pending.iter().any(|p| p.user_data == op.user_data) {
            state.duplicates += 1;
        }
        state.submitted.push(record);
        state.pending.push_back(PendingOp {
            user_data: op.user_data,
            op_type: op.op_type,
            length: op.length,
        });
        Ok(())
    }

    fn poll_completions(
        &mut self,
        _min_complete: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<IOCompletion>> {
        let completions = {
            let mut state = self.lock();
            state.polls += 1;

            let mut completions = Vec::new();
            if !state.hold_completions {
                let limit = state.max_per_poll.unwrap_or(usize::MAX);
                while completions.len() < limit {
                    let next = if state.newest_first {
                        state.pending.pop_back()
                    } else {
                        state.pending.pop_front()
                    };
                    let Some(op) = next else { break };

                    let result = if state.should_fail {
                        Err(anyhow::anyhow!("Mock IO error"))
                    } else if state.bytes_per_op == 0 {
                        Ok(op.length)
                    } else {
                        Ok(state.bytes_per_op)
                    };

                    completions.push(IOCompletion {
                        user_data: op.user_data,
                        result,
                        op_type: op.op_type,
                    });
                }
            }
            completions
        };

        // Nothing ready: behave like a timed wait
        if completions.is_empty() {
            if let Some(t) = timeout {
                std::thread::sleep(t.min(Duration::from_millis(100)));
            }
        }
        Ok(completions)
    }

    fn cleanup(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.pending.clear();
        state.cleanups += 1;
        Ok(())
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            name: "mock",
            async_io: true,
            max_queue_depth: self.config.as_ref().map(|c| c.queue_depth).unwrap_or(65536),
        }
    }
}
