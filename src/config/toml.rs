//! TOML job file parsing

use super::*;
use crate::config::cli::Cli;
use crate::config::cli_convert::{parse_duration, parse_size};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML job file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML job configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    merge_job(cli, &mut config.job)?;
    merge_limits(cli, &mut config.limits)?;

    // Pacing
    if let Some(iops) = cli.iops {
        config.pacing.target_iops = Some(iops);
    }
    if cli.barrier {
        config.pacing.barrier = true;
    }
    if let Some(n) = cli.flush_every {
        config.pacing.flush_every = Some(n);
    }

    // Verification
    if cli.verify {
        config.verify.enabled = true;
    }
    if cli.abort_on_error {
        config.verify.abort_on_submit_error = true;
    }
    if cli.pre_discard {
        config.verify.pre_discard = true;
    }

    // Output
    if let Some(ref path) = cli.json {
        config.output.json_output = Some(path.clone());
    }
    if let Some(ref path) = cli.dump {
        config.output.dump = Some(path.clone());
    }
    if cli.quiet {
        config.output.quiet = true;
    }
    if cli.verbose > 0 {
        config.output.verbosity = cli.verbose;
    }

    // Runtime
    if let Some(ref limit) = cli.ram_limit {
        config.runtime.ram_limit = Some(parse_size(limit)?);
    }

    Ok(config)
}

fn merge_job(cli: &Cli, job: &mut JobConfig) -> Result<()> {
    // Positional devices replace the job file's list
    if !cli.devices.is_empty() {
        job.devices = cli.devices.clone();
    }
    if let Some(ref engine) = cli.engine {
        job.engine = engine.parse()?;
    }
    if let Some(qd) = cli.queue_depth {
        job.queue_depth = qd;
    }
    if let Some(ref bs) = cli.block_size {
        job.block_size = parse_size(bs)?;
    }
    if let Some(ref bs) = cli.max_block_size {
        job.max_block_size = Some(parse_size(bs)?);
    }
    if cli.power_of_two {
        job.power_of_two_sizes = true;
    }
    if let Some(ref align) = cli.alignment {
        job.alignment = Some(parse_size(align)?);
    }
    if let Some(read) = cli.read {
        job.read_fraction = read;
    }
    if let Some(discard) = cli.discard {
        job.discard_fraction = discard;
    }
    if cli.sequential {
        job.sequential = true;
    }
    if let Some(stride) = cli.stride {
        job.stride = stride;
    }
    if let Some(ref pos) = cli.min_position {
        job.min_position = parse_size(pos)?;
    }
    if let Some(ref pos) = cli.max_position {
        job.max_position = Some(parse_size(pos)?);
    }
    if let Some(n) = cli.positions {
        job.positions = Some(n);
    }
    if let Some(window) = cli.jumble {
        job.jumble = Some(window);
    }
    if let Some(ref size) = cli.file_size {
        job.file_size = Some(parse_size(size)?);
    }
    if cli.no_direct {
        job.direct = false;
    }
    if cli.not_exclusive {
        job.exclusive = false;
    }
    if let Some(seed) = cli.seed {
        job.seed = Some(seed);
    }
    if cli.unique_seeds {
        job.unique_seeds = true;
    }
    Ok(())
}

fn merge_limits(cli: &Cli, limits: &mut LimitsConfig) -> Result<()> {
    if let Some(ref t) = cli.time {
        limits.run_seconds = Some(parse_duration(t)?.as_secs_f64());
    }
    if let Some(ref t) = cli.finish {
        limits.finish_seconds = Some(parse_duration(t)?.as_secs_f64());
    }
    if let Some(x) = cli.lba_times {
        limits.lba_times = Some(x);
    }
    if let Some(x) = cli.position_times {
        limits.position_times = Some(x);
    }
    if let Some(r) = cli.rounds {
        limits.rounds = Some(r);
    }
    if cli.rerandomize {
        limits.rerandomize = true;
    }
    if cli.add_block_size {
        limits.add_block_size = true;
    }
    if let Some(ref t) = cli.waitfor {
        limits.waitfor = parse_duration(t)?.as_secs_f64();
    }
    if let Some(ref t) = cli.prewait {
        limits.prewait = parse_duration(t)?.as_secs_f64();
    }
    if let Some(iops) = cli.exit_iops {
        limits.exit_iops = Some(iops);
    }
    Ok(())
}
