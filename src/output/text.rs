//! Human-readable text output

use crate::stats::histogram::LatencySummary;
use crate::worker::{JobReport, WorkerReport};
use crate::util::time::{format_bytes, format_rate, format_throughput, per_second};
use crate::Result;
use std::io::Write;
use std::time::Duration;

/// Print the job summary to stdout
pub fn print_results(report: &JobReport) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    write_results(&mut out, report)
}

/// Write the job summary
///
/// Per-device lines first (only when there is more than one device), then the
/// aggregate: operations, throughput, latency percentiles, errors and flushes.
pub fn write_results<W: Write>(out: &mut W, report: &JobReport) -> Result<()> {
    writeln!(out, "═══════════════════════════════════════════════════════════")?;
    writeln!(out, "                    RUN SUMMARY")?;
    writeln!(out, "═══════════════════════════════════════════════════════════")?;
    writeln!(out)?;
    writeln!(out, "Elapsed Time: {:.3}s", report.elapsed.as_secs_f64())?;
    writeln!(out)?;

    if report.workers.len() > 1 {
        writeln!(out, "Devices:")?;
        for w in &report.workers {
            write_device_line(out, w)?;
        }
        writeln!(out)?;
    }

    let counters = report.counters();
    let totals = report.totals();
    let elapsed = report.elapsed;

    writeln!(out, "Operations:")?;
    writeln!(
        out,
        "  Read:    {} ops ({}) - {} IOPS, {}",
        format_number(counters.read_ops),
        format_bytes(counters.read_bytes),
        format_rate(per_second(counters.read_ops, elapsed)),
        format_throughput(per_second(counters.read_bytes, elapsed))
    )?;
    writeln!(
        out,
        "  Write:   {} ops ({}) - {} IOPS, {}",
        format_number(counters.write_ops),
        format_bytes(counters.write_bytes),
        format_rate(per_second(counters.write_ops, elapsed)),
        format_throughput(per_second(counters.write_bytes, elapsed))
    )?;
    if counters.discard_ops > 0 {
        writeln!(out, "  Discard: {} ops", format_number(counters.discard_ops))?;
    }
    if counters.flush_ops > 0 {
        writeln!(out, "  Flush:   {} ops", format_number(counters.flush_ops))?;
    }
    writeln!(out, "  Rounds:  {}", totals.rounds)?;
    writeln!(out)?;

    let latency = report.latency()?.summary();
    writeln!(out, "Latency:")?;
    write_latency_line(out, "Read", &latency.read)?;
    write_latency_line(out, "Write", &latency.write)?;
    write_latency_line(out, "Flush", &latency.flush)?;
    writeln!(out)?;

    if totals.verified > 0 {
        writeln!(out, "Verification:")?;
        writeln!(out, "  Blocks verified: {}", format_number(totals.verified))?;
        writeln!(out)?;
    }

    if counters.errors > 0 || counters.slow_ios > 0 || !totals.drained_cleanly {
        writeln!(out, "Problems:")?;
        if counters.errors > 0 {
            writeln!(out, "  Errors:   {}", format_number(counters.errors))?;
        }
        if counters.slow_ios > 0 {
            writeln!(out, "  Slow IOs: {}", format_number(counters.slow_ios))?;
        }
        if !totals.drained_cleanly {
            writeln!(out, "  Requests were still in flight when a round gave up draining")?;
        }
        writeln!(out)?;
    }

    if report.stopped_low_iops {
        writeln!(out, "Stopped early: IOPS fell below the exit threshold")?;
    }
    for w in report.workers.iter().filter(|w| w.error.is_some()) {
        if let Some(e) = &w.error {
            writeln!(out, "FAILED {}: {:#}", w.device.display(), e)?;
        }
    }

    Ok(())
}

fn write_device_line<W: Write>(out: &mut W, w: &WorkerReport) -> Result<()> {
    let c = &w.counters;
    writeln!(
        out,
        "  [{}] {} ({}): read {} / write {} in {:.1}s{}",
        w.id,
        w.device.display(),
        w.engine,
        format_bytes(c.read_bytes),
        format_bytes(c.write_bytes),
        w.elapsed.as_secs_f64(),
        if w.error.is_some() { " FAILED" } else { "" }
    )?;
    Ok(())
}

fn write_latency_line<W: Write>(out: &mut W, label: &str, s: &LatencySummary) -> Result<()> {
    if s.count == 0 {
        return Ok(());
    }
    writeln!(
        out,
        "  {:<6} mean {}  p50 {}  p99 {}  p99.9 {}  max {}",
        label,
        format_us(s.mean_us as u64),
        format_us(s.p50_us),
        format_us(s.p99_us),
        format_us(s.p999_us),
        format_us(s.max_us)
    )?;
    Ok(())
}

fn format_us(us: u64) -> String {
    crate::util::time::format_duration(Duration::from_micros(us))
}

/// Format number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    let chars: Vec<char> = s.chars().collect();

    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }

    result
}
