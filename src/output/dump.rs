//! Per-item completion dump
//!
//! One tab-separated line per completed work item:
//!
//! ```text
//! action  position  length  seed  submit_s  finish_s  latency_us  device
//! W       8192      4096    17    0.001204  0.001291  87          /dev/sdb
//! ```
//!
//! Times are seconds since the run started.

use crate::positions::WorkItem;
use crate::Result;
use anyhow::Context;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

pub struct DumpWriter {
    out: BufWriter<Box<dyn Write + Send>>,
    lines: u64,
}

impl DumpWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("Failed to create dump file: {}", path.display()))?;
        Ok(Self::from_writer(Box::new(file)))
    }

    pub fn from_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: BufWriter::new(out),
            lines: 0,
        }
    }

    /// Append one line for a harvested item
    pub fn write_item(&mut self, item: &WorkItem, run_start: Instant, device: &str) -> Result<()> {
        let since = |t: Option<Instant>| t.map(|t| t.saturating_duration_since(run_start).as_secs_f64()).unwrap_or(0.0);
        let latency_us = match (item.status.submit_time, item.status.finish_time) {
            (Some(s), Some(f)) => f.saturating_duration_since(s).as_micros() as u64,
            _ => 0,
        };

        writeln!(
            self.out,
            "{}\t{}\t{}\t{}\t{:.6}\t{:.6}\t{}\t{}",
            item.action.code(),
            item.position,
            item.length,
            item.seed,
            since(item.status.submit_time),
            since(item.status.finish_time),
            latency_us,
            device
        )
        .context("Failed to write dump line")?;
        self.lines += 1;
        Ok(())
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().context("Failed to flush dump file")
    }
}
