//! JSON summary output
//!
//! One document per run: when and how it ran, per-device results and the
//! aggregate. Latencies are reported in microseconds and rates both raw and
//! human-readable.

use crate::aio::{DispatchError, RunTotals};
use crate::config::Config;
use crate::stats::{CounterSnapshot, LatencyReport};
use crate::target::DeviceInfo;
use crate::util::time::{format_throughput, per_second};
use crate::worker::{JobReport, WorkerReport};
use crate::Result;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Throughput with bytes/sec and human-readable format
#[derive(Debug, Clone, Serialize)]
pub struct JsonThroughput {
    pub bytes_per_sec: u64,
    pub human: String,
}

impl JsonThroughput {
    pub fn new(bytes_per_sec: f64) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec as u64,
            human: format_throughput(bytes_per_sec),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRates {
    pub read: JsonThroughput,
    pub write: JsonThroughput,
    pub read_iops: f64,
    pub write_iops: f64,
}

impl JsonRates {
    fn new(counters: &CounterSnapshot, elapsed: std::time::Duration) -> Self {
        Self {
            read: JsonThroughput::new(per_second(counters.read_bytes, elapsed)),
            write: JsonThroughput::new(per_second(counters.write_bytes, elapsed)),
            read_iops: per_second(counters.read_ops, elapsed),
            write_iops: per_second(counters.write_ops, elapsed),
        }
    }
}

/// The run's settings worth recording next to its results
#[derive(Debug, Clone, Serialize)]
pub struct JsonRunConfig {
    pub engine: String,
    pub queue_depth: usize,
    pub block_size: u64,
    pub max_block_size: u64,
    pub read_fraction: f64,
    pub write_fraction: f64,
    pub discard_fraction: f64,
    pub verify: bool,
    pub direct: bool,
    pub seed: Option<u64>,
}

impl JsonRunConfig {
    pub fn from_config(config: &Config) -> Self {
        let job = &config.job;
        Self {
            engine: job.engine.to_string(),
            queue_depth: job.queue_depth,
            block_size: job.block_size,
            max_block_size: job.largest_block(),
            read_fraction: job.read_fraction,
            write_fraction: job.write_fraction(),
            discard_fraction: job.discard_fraction,
            verify: config.verify.enabled,
            direct: job.direct,
            seed: job.seed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonDevice {
    pub id: usize,
    pub device: String,
    pub engine: &'static str,
    pub info: DeviceInfo,
    pub elapsed_secs: f64,
    pub totals: RunTotals,
    pub counters: CounterSnapshot,
    pub rates: JsonRates,
    pub latency: LatencyReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable tag for the typed fatal errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonAggregate {
    pub totals: RunTotals,
    pub counters: CounterSnapshot,
    pub rates: JsonRates,
    pub latency: LatencyReport,
}

/// Top-level JSON document
#[derive(Debug, Clone, Serialize)]
pub struct JsonSummary {
    pub tool: &'static str,
    pub version: &'static str,
    pub started_at: String,
    pub finished_at: String,
    pub elapsed_secs: f64,
    pub success: bool,
    pub stopped_low_iops: bool,
    pub config: JsonRunConfig,
    pub devices: Vec<JsonDevice>,
    pub aggregate: JsonAggregate,
}

fn error_kind(err: &anyhow::Error) -> Option<&'static str> {
    err.downcast_ref::<DispatchError>().map(|e| match e {
        DispatchError::Integrity { .. } => "integrity",
        DispatchError::ErrorCeiling { .. } => "error_ceiling",
        DispatchError::SlotsExhausted { .. } => "slots_exhausted",
        DispatchError::SubmitAborted { .. } => "submit_aborted",
        DispatchError::BufferTooLarge { .. } => "buffer_too_large",
    })
}

fn device_to_json(w: &WorkerReport) -> JsonDevice {
    JsonDevice {
        id: w.id,
        device: w.device.display().to_string(),
        engine: w.engine,
        info: w.info.clone(),
        elapsed_secs: w.elapsed.as_secs_f64(),
        totals: w.totals,
        counters: w.counters,
        rates: JsonRates::new(&w.counters, w.elapsed),
        latency: w.latency.summary(),
        error: w.error.as_ref().map(|e| format!("{:#}", e)),
        error_kind: w.error.as_ref().and_then(error_kind),
    }
}

/// Build the summary document for a finished job
pub fn build_summary(report: &JobReport, config: &Config, started_at: DateTime<Utc>) -> Result<JsonSummary> {
    let counters = report.counters();
    let finished_at = started_at
        + chrono::Duration::from_std(report.elapsed).unwrap_or_else(|_| chrono::Duration::zero());

    Ok(JsonSummary {
        tool: "blockprobe",
        version: env!("CARGO_PKG_VERSION"),
        started_at: started_at.to_rfc3339(),
        finished_at: finished_at.to_rfc3339(),
        elapsed_secs: report.elapsed.as_secs_f64(),
        success: report.first_error().is_none(),
        stopped_low_iops: report.stopped_low_iops,
        config: JsonRunConfig::from_config(config),
        devices: report.workers.iter().map(device_to_json).collect(),
        aggregate: JsonAggregate {
            totals: report.totals(),
            counters,
            rates: JsonRates::new(&counters, report.elapsed),
            latency: report.latency()?.summary(),
        },
    })
}

/// Write the summary as pretty-printed JSON
pub fn write_json_output(path: &Path, summary: &JsonSummary) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create JSON output file: {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, summary)
        .with_context(|| format!("Failed to write JSON output: {}", path.display()))?;
    writer.flush()?;
    Ok(())
}
