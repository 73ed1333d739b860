//! Asynchronous dispatch core
//!
//! - `pool`: aligned buffer pool and slot free list
//! - `watermark`: position/run stamp written into every block
//! - `dispatch`: submission loop, completion harvesting and drain
//! - `round`: repeated rounds with budgets and between-round reshaping
//! - `error`: fatal outcomes callers can match on

pub mod dispatch;
pub mod error;
pub mod pool;
pub mod round;
pub mod watermark;

pub use dispatch::{DispatchOptions, Dispatcher, RoundLimits, RoundOutcome};
pub use error::DispatchError;
pub use round::{RoundController, RoundPlan, RunTotals};

/// Tracing target for operational-log entries (slow IO, drain timeouts,
/// integrity failures), so they can be routed apart from progress output
pub const OPLOG: &str = "blockprobe::oplog";
