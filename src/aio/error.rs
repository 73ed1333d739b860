//! Fatal dispatcher outcomes
//!
//! Everything recoverable (a rejected submission under the skip policy, a
//! failed completion, a slow request) is counted and logged instead. These
//! variants stop the run: the dispatcher drains and releases its resources
//! first, then hands the error back wrapped in `anyhow::Error`, where callers
//! recover it with `downcast_ref::<DispatchError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// A verifying read returned a watermark other than the one written
    #[error(
        "data integrity failure on {device} at position {position}: \
         expected (position {position}, run {expected_run}), found (position {found_position}, run {found_run})"
    )]
    Integrity {
        device: String,
        position: u64,
        expected_run: u64,
        found_position: u64,
        found_run: u64,
    },

    #[error("too many IO errors ({errors}), giving up")]
    ErrorCeiling { errors: u64 },

    /// The free list ran dry while the in-flight count said otherwise
    #[error("no free slot with {in_flight} of {queue_depth} in flight")]
    SlotsExhausted { in_flight: usize, queue_depth: usize },

    #[error("submission of {action} at position {position} failed: {reason}")]
    SubmitAborted {
        action: String,
        position: u64,
        reason: String,
    },

    #[error("buffer pool needs {needed} bytes but only {limit} are allowed")]
    BufferTooLarge { needed: u64, limit: u64 },
}
