//! CLI argument parsing using clap

use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// blockprobe - async block device load generator and verifier
#[derive(Parser, Debug, Default)]
#[command(name = "blockprobe")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Block devices or files to test (one worker each)
    #[arg(value_name = "DEVICE")]
    pub devices: Vec<PathBuf>,

    /// TOML job file; command-line flags override it
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    // === Job Options ===
    /// IO engine: libaio or io_uring
    #[arg(short = 'e', long)]
    pub engine: Option<String>,

    /// IO queue depth (1-65536)
    #[arg(short = 'q', long)]
    pub queue_depth: Option<usize>,

    /// Block size (e.g., 4k, 64k, 1M)
    #[arg(short = 'b', long)]
    pub block_size: Option<String>,

    /// Largest block size; sizes are drawn between --block-size and this
    #[arg(long)]
    pub max_block_size: Option<String>,

    /// Only draw power-of-two block sizes
    #[arg(long)]
    pub power_of_two: bool,

    /// IO alignment (default: device logical block size)
    #[arg(long)]
    pub alignment: Option<String>,

    /// Fraction of operations that read (0.0-1.0)
    #[arg(short = 'r', long)]
    pub read: Option<f64>,

    /// Fraction of operations that discard (0.0-1.0)
    #[arg(long)]
    pub discard: Option<f64>,

    /// Sequential positions instead of random
    #[arg(short = 's', long)]
    pub sequential: bool,

    /// Advance this many positions after each IO
    #[arg(long)]
    pub stride: Option<usize>,

    /// Start of the tested range (e.g., 1G)
    #[arg(long)]
    pub min_position: Option<String>,

    /// End of the tested range (default: device size)
    #[arg(long)]
    pub max_position: Option<String>,

    /// Exact number of positions to generate
    #[arg(long)]
    pub positions: Option<usize>,

    /// Shuffle positions inside windows of this size
    #[arg(long)]
    pub jumble: Option<usize>,

    /// Size of regular files created for writing (e.g., 1G)
    #[arg(long)]
    pub file_size: Option<String>,

    /// Use buffered IO instead of O_DIRECT
    #[arg(long)]
    pub no_direct: bool,

    /// Do not open block devices with O_EXCL
    #[arg(long)]
    pub not_exclusive: bool,

    /// Random seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Different content seed for every position
    #[arg(long)]
    pub unique_seeds: bool,

    // === Limits ===
    /// Length of each round (e.g., 30s, 5m)
    #[arg(short = 't', long)]
    pub time: Option<String>,

    /// Overall finish deadline (e.g., 1h)
    #[arg(long)]
    pub finish: Option<String>,

    /// Submit this many times the range size
    #[arg(short = 'x', long)]
    pub lba_times: Option<u64>,

    /// Submit every position this many times
    #[arg(short = 'X', long)]
    pub position_times: Option<u64>,

    /// Maximum number of rounds
    #[arg(long)]
    pub rounds: Option<u64>,

    /// Reshuffle positions between rounds
    #[arg(long)]
    pub rerandomize: bool,

    /// Move positions forward one block between rounds
    #[arg(long)]
    pub add_block_size: bool,

    /// Pause between rounds (e.g., 5s)
    #[arg(long)]
    pub waitfor: Option<String>,

    /// Pause before starting (e.g., 2s)
    #[arg(long)]
    pub prewait: Option<String>,

    /// Stop early after sustained IOPS below this value
    #[arg(long)]
    pub exit_iops: Option<f64>,

    // === Pacing ===
    /// Target IOPS per worker
    #[arg(long)]
    pub iops: Option<f64>,

    /// Only poll for completions once the queue is full
    #[arg(long)]
    pub barrier: bool,

    /// Flush after this many writes
    #[arg(short = 'F', long)]
    pub flush_every: Option<u64>,

    // === Verification ===
    /// Read back every write and check its watermark
    #[arg(long)]
    pub verify: bool,

    /// Stop on the first rejected submission
    #[arg(long)]
    pub abort_on_error: bool,

    /// Discard the range before each round
    #[arg(long)]
    pub pre_discard: bool,

    // === Output ===
    /// Write a JSON summary to this file
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Dump every completed IO to this file
    #[arg(long)]
    pub dump: Option<PathBuf>,

    /// Suppress the text summary
    #[arg(long)]
    pub quiet: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,

    // === Runtime ===
    /// Cap each worker's buffer memory (e.g., 4G)
    #[arg(long)]
    pub ram_limit: Option<String>,
}
