//! blockprobe - asynchronous block-device load generator and integrity verifier
//!
//! blockprobe keeps a configurable number of reads, writes, flushes and
//! discards in flight against block devices (or regular files) through Linux
//! native AIO or io_uring, measures their latency and throughput, and can
//! prove that written data reads back intact by stamping a watermark into
//! every written block.
//!
//! # Architecture
//!
//! - **engine**: `IOEngine` trait with libaio and io_uring backends
//! - **aio**: buffer pool, slot free list, dispatch loop, completion
//!   harvester, drain-on-exit and the round controller
//! - **positions**: work items and the position generator
//! - **target**: device handles, sysfs metadata and inline discard
//! - **worker**: one thread per device, start barrier and reporter
//! - **stats** / **output**: counters, latency histograms and summaries

pub mod aio;
pub mod config;
pub mod engine;
pub mod output;
pub mod positions;
pub mod stats;
pub mod target;
pub mod util;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use engine::IOEngine;
pub use worker::{run_job, JobReport};

/// Result type used throughout blockprobe
pub type Result<T> = anyhow::Result<T>;
