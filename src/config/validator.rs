//! Configuration validation

use super::*;
use crate::positions::lengths::MAX_BLOCK_LEN;
use anyhow::Result;

/// Largest supported queue depth
pub const MAX_QUEUE_DEPTH: usize = 65536;

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_job(&config.job)?;
    validate_limits(&config.limits)?;
    validate_pacing(&config.pacing)?;
    validate_runtime(&config.runtime)?;

    if config.verify.enabled && config.job.write_fraction() == 0.0 {
        tracing::warn!("Verification enabled but the job issues no writes; nothing will be checked");
    }
    if config.verify.pre_discard && !config.job.modifies_device() {
        anyhow::bail!("pre_discard requires a job that writes or discards");
    }

    Ok(())
}

/// Validate job configuration
pub fn validate_job(job: &JobConfig) -> Result<()> {
    if job.devices.is_empty() {
        anyhow::bail!("At least one device is required");
    }

    if job.queue_depth == 0 || job.queue_depth > MAX_QUEUE_DEPTH {
        anyhow::bail!(
            "queue_depth must be between 1 and {}, got {}",
            MAX_QUEUE_DEPTH,
            job.queue_depth
        );
    }

    if let Some(align) = job.alignment {
        if align < 512 || !align.is_power_of_two() {
            anyhow::bail!("alignment must be a power of two >= 512, got {}", align);
        }
    }
    let align = job.alignment.unwrap_or(512);

    validate_block_size("block_size", job.block_size, align)?;
    if let Some(max) = job.max_block_size {
        validate_block_size("max_block_size", max, align)?;
        if max < job.block_size {
            anyhow::bail!(
                "max_block_size ({}) must be >= block_size ({})",
                max,
                job.block_size
            );
        }
    }

    validate_fraction("read_fraction", job.read_fraction)?;
    validate_fraction("discard_fraction", job.discard_fraction)?;
    if job.read_fraction + job.discard_fraction > 1.0 + f64::EPSILON {
        anyhow::bail!(
            "read_fraction ({}) + discard_fraction ({}) must not exceed 1.0",
            job.read_fraction,
            job.discard_fraction
        );
    }

    if job.stride == 0 {
        anyhow::bail!("stride must be at least 1");
    }

    if let Some(max) = job.max_position {
        if max <= job.min_position {
            anyhow::bail!(
                "max_position ({}) must be greater than min_position ({})",
                max,
                job.min_position
            );
        }
    }

    if job.positions == Some(0) {
        anyhow::bail!("positions must be at least 1");
    }
    if job.jumble == Some(0) {
        anyhow::bail!("jumble window must be at least 1");
    }

    Ok(())
}

fn validate_block_size(name: &str, size: u64, align: u64) -> Result<()> {
    if size == 0 {
        anyhow::bail!("{} must be non-zero", name);
    }
    if size > MAX_BLOCK_LEN as u64 {
        anyhow::bail!("{} {} exceeds the 1 GiB maximum", name, size);
    }
    if size % align != 0 {
        anyhow::bail!("{} {} is not a multiple of the alignment {}", name, size, align);
    }
    Ok(())
}

fn validate_fraction(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        anyhow::bail!("{} must be between 0.0 and 1.0, got {}", name, value);
    }
    Ok(())
}

fn validate_seconds(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        anyhow::bail!("{} must be a positive number of seconds, got {}", name, value);
    }
    Ok(())
}

/// Validate limits configuration
pub fn validate_limits(limits: &LimitsConfig) -> Result<()> {
    if let Some(t) = limits.run_seconds {
        validate_seconds("run_seconds", t)?;
    }
    if let Some(t) = limits.finish_seconds {
        validate_seconds("finish_seconds", t)?;
    }
    if limits.lba_times == Some(0) {
        anyhow::bail!("lba_times must be at least 1");
    }
    if limits.position_times == Some(0) {
        anyhow::bail!("position_times must be at least 1");
    }
    if limits.waitfor < 0.0 || limits.prewait < 0.0 {
        anyhow::bail!("waitfor and prewait must not be negative");
    }
    if let Some(iops) = limits.exit_iops {
        if iops <= 0.0 {
            anyhow::bail!("exit_iops must be positive, got {}", iops);
        }
    }

    // Nothing else would ever end an unbounded run
    let bounded = limits.run_seconds.is_some()
        || limits.finish_seconds.is_some()
        || limits.lba_times.is_some()
        || limits.position_times.is_some()
        || matches!(limits.rounds, Some(r) if r > 0);
    if !bounded {
        tracing::warn!("No time, byte or round limit set; the run ends only on interrupt");
    }

    Ok(())
}

/// Validate pacing configuration
pub fn validate_pacing(pacing: &PacingConfig) -> Result<()> {
    if let Some(iops) = pacing.target_iops {
        if !iops.is_finite() || iops <= 0.0 {
            anyhow::bail!("target_iops must be positive, got {}", iops);
        }
    }
    if pacing.flush_every == Some(0) {
        anyhow::bail!("flush_every must be at least 1");
    }
    if pacing.poll_timeout_ms == 0 {
        anyhow::bail!("poll_timeout_ms must be at least 1");
    }
    if pacing.report_interval < 0.0 {
        anyhow::bail!("report_interval must not be negative");
    }
    Ok(())
}

/// Validate runtime configuration
pub fn validate_runtime(runtime: &RuntimeConfig) -> Result<()> {
    if runtime.error_ceiling == 0 {
        anyhow::bail!("error_ceiling must be at least 1");
    }
    if runtime.slow_seconds < 0.0 {
        anyhow::bail!("slow_seconds must not be negative");
    }
    if runtime.drain_attempts == 0 {
        anyhow::bail!("drain_attempts must be at least 1");
    }
    if runtime.ram_limit == Some(0) {
        anyhow::bail!("ram_limit must be non-zero");
    }
    if runtime.watchdog_grace < 0.0 {
        anyhow::bail!("watchdog_grace must not be negative");
    }
    Ok(())
}
