//! Configuration module
//!
//! Handles CLI argument parsing, TOML job files, and validation. A job file
//! and the command line both produce a `Config`; CLI flags win where both set
//! a value.

pub mod cli;
pub mod cli_convert;
pub mod toml;
pub mod validator;

use crate::engine::EngineKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Complete run configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// What to run and where; one worker per device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Block devices or regular files
    #[serde(default)]
    pub devices: Vec<PathBuf>,
    #[serde(default)]
    pub engine: EngineKind,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Smallest (or only) block size in bytes
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Largest block size; sizes between are drawn in alignment steps
    pub max_block_size: Option<u64>,
    /// Draw only power-of-two sizes between `block_size` and `max_block_size`
    #[serde(default)]
    pub power_of_two_sizes: bool,
    /// IO alignment; defaults to the device's logical block size
    pub alignment: Option<u64>,
    /// Fraction of items that read
    #[serde(default = "default_read_fraction")]
    pub read_fraction: f64,
    /// Fraction of items that discard
    #[serde(default)]
    pub discard_fraction: f64,
    /// Keep ascending position order
    #[serde(default)]
    pub sequential: bool,
    /// Items to advance after each submission
    #[serde(default = "default_stride")]
    pub stride: usize,
    /// First byte of the tested range
    #[serde(default)]
    pub min_position: u64,
    /// End of the tested range; defaults to the device size
    pub max_position: Option<u64>,
    /// Exact number of positions (otherwise the range is covered once)
    pub positions: Option<usize>,
    /// Shuffle inside windows of this many items after generation
    pub jumble: Option<usize>,
    /// Size for regular files created by write jobs
    pub file_size: Option<u64>,
    #[serde(default = "default_true")]
    pub direct: bool,
    /// O_EXCL on block devices
    #[serde(default = "default_true")]
    pub exclusive: bool,
    /// Random seed; derived from the clock when unset
    pub seed: Option<u64>,
    /// Give every item its own content seed
    #[serde(default)]
    pub unique_seeds: bool,
}

fn default_queue_depth() -> usize {
    16
}

fn default_block_size() -> u64 {
    4096
}

fn default_read_fraction() -> f64 {
    1.0
}

fn default_stride() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            engine: EngineKind::default(),
            queue_depth: default_queue_depth(),
            block_size: default_block_size(),
            max_block_size: None,
            power_of_two_sizes: false,
            alignment: None,
            read_fraction: default_read_fraction(),
            discard_fraction: 0.0,
            sequential: false,
            stride: default_stride(),
            min_position: 0,
            max_position: None,
            positions: None,
            jumble: None,
            file_size: None,
            direct: true,
            exclusive: true,
            seed: None,
            unique_seeds: false,
        }
    }
}

impl JobConfig {
    pub fn write_fraction(&self) -> f64 {
        (1.0 - self.read_fraction - self.discard_fraction).max(0.0)
    }

    /// Whether the job modifies the device at all
    pub fn modifies_device(&self) -> bool {
        self.write_fraction() > 0.0 || self.discard_fraction > 0.0
    }

    pub fn largest_block(&self) -> u64 {
        self.max_block_size.unwrap_or(self.block_size).max(self.block_size)
    }
}

/// Time, byte and round limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Wall-clock length of each round (seconds)
    #[serde(default = "default_run_seconds")]
    pub run_seconds: Option<f64>,
    /// Overall finish deadline (seconds from start)
    pub finish_seconds: Option<f64>,
    /// Submit this many times the range size in bytes
    pub lba_times: Option<u64>,
    /// Submit every position this many times
    pub position_times: Option<u64>,
    /// Maximum rounds
    pub rounds: Option<u64>,
    /// Reshuffle positions between rounds
    #[serde(default)]
    pub rerandomize: bool,
    /// Move positions forward by one block between rounds
    #[serde(default)]
    pub add_block_size: bool,
    /// Pause between rounds (seconds)
    #[serde(default)]
    pub waitfor: f64,
    /// Pause before the first round (seconds)
    #[serde(default)]
    pub prewait: f64,
    /// End early after sustained IOPS below this
    pub exit_iops: Option<f64>,
}

fn default_run_seconds() -> Option<f64> {
    Some(10.0)
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            run_seconds: default_run_seconds(),
            finish_seconds: None,
            lba_times: None,
            position_times: None,
            rounds: None,
            rerandomize: false,
            add_block_size: false,
            waitfor: 0.0,
            prewait: 0.0,
            exit_iops: None,
        }
    }
}

/// Submission pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Spread each pass to this many IOPS
    pub target_iops: Option<f64>,
    /// Poll only when the queue is full
    #[serde(default)]
    pub barrier: bool,
    /// Synchronous flush after this many writes
    pub flush_every: Option<u64>,
    /// Completion poll timeout (milliseconds)
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Progress report interval (seconds)
    #[serde(default = "default_report_interval")]
    pub report_interval: f64,
}

fn default_poll_timeout_ms() -> u64 {
    10
}

fn default_report_interval() -> f64 {
    1.0
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            target_iops: None,
            barrier: false,
            flush_every: None,
            poll_timeout_ms: default_poll_timeout_ms(),
            report_interval: default_report_interval(),
        }
    }
}

impl PacingConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs_f64(self.report_interval.max(0.0))
    }
}

/// Integrity and error policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Read back every write and check its watermark
    #[serde(default)]
    pub enabled: bool,
    /// Stop the run on the first rejected submission
    #[serde(default)]
    pub abort_on_submit_error: bool,
    /// Discard the tested range before each round
    #[serde(default)]
    pub pre_discard: bool,
}

/// Output configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// JSON summary file
    pub json_output: Option<PathBuf>,
    /// Per-item completion dump; one file per device, suffixed with the worker id
    pub dump: Option<PathBuf>,
    /// Skip the text summary
    #[serde(default)]
    pub quiet: bool,
    /// Log verbosity (0 = info)
    #[serde(default)]
    pub verbosity: u8,
}

/// Safety valves and resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Errors tolerated before the run is abandoned
    #[serde(default = "default_error_ceiling")]
    pub error_ceiling: u64,
    /// Latency above which an IO is logged as slow (seconds)
    #[serde(default = "default_slow_seconds")]
    pub slow_seconds: f64,
    /// One-second drain polls before giving up on outstanding IO
    #[serde(default = "default_drain_attempts")]
    pub drain_attempts: u32,
    /// Cap on each worker's buffer pool (bytes)
    pub ram_limit: Option<u64>,
    /// Grace past the finish deadline before the process is killed (seconds)
    #[serde(default = "default_watchdog_grace")]
    pub watchdog_grace: f64,
}

fn default_error_ceiling() -> u64 {
    1_000_000
}

fn default_slow_seconds() -> f64 {
    30.0
}

fn default_drain_attempts() -> u32 {
    3600
}

fn default_watchdog_grace() -> f64 {
    30.0
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            error_ceiling: default_error_ceiling(),
            slow_seconds: default_slow_seconds(),
            drain_attempts: default_drain_attempts(),
            ram_limit: None,
            watchdog_grace: default_watchdog_grace(),
        }
    }
}
