//! Rate and size formatting helpers for progress lines and summaries

use std::time::Duration;

/// Format a duration in human-readable form
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use blockprobe::util::time::format_duration;
///
/// assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(5)), "5.00s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();

    if nanos < 1_000 {
        format!("{}ns", nanos)
    } else if nanos < 1_000_000 {
        format!("{:.2}us", nanos as f64 / 1_000.0)
    } else if nanos < 1_000_000_000 {
        format!("{:.2}ms", nanos as f64 / 1_000_000.0)
    } else {
        format!("{:.2}s", nanos as f64 / 1_000_000_000.0)
    }
}

/// Format an operation rate (IOPS)
///
/// ```
/// use blockprobe::util::time::format_rate;
///
/// assert_eq!(format_rate(500.0), "500");
/// assert_eq!(format_rate(1500.0), "1.50K");
/// ```
pub fn format_rate(rate: f64) -> String {
    if rate < 1_000.0 {
        format!("{:.0}", rate)
    } else if rate < 1_000_000.0 {
        format!("{:.2}K", rate / 1_000.0)
    } else {
        format!("{:.2}M", rate / 1_000_000.0)
    }
}

/// Events (or bytes) per second over `duration`; zero for an empty interval
pub fn per_second(count: u64, duration: Duration) -> f64 {
    let seconds = duration.as_secs_f64();
    if seconds > 0.0 {
        count as f64 / seconds
    } else {
        0.0
    }
}

/// Format throughput with binary units
///
/// ```
/// use blockprobe::util::time::format_throughput;
///
/// assert_eq!(format_throughput(1536.0), "1.50 KiB/s");
/// assert_eq!(format_throughput(2_621_440.0), "2.50 MiB/s");
/// ```
pub fn format_throughput(bytes_per_sec: f64) -> String {
    format!("{}/s", format_size_f64(bytes_per_sec))
}

/// Format a byte count with binary units
///
/// ```
/// use blockprobe::util::time::format_bytes;
///
/// assert_eq!(format_bytes(512), "512.00 B");
/// assert_eq!(format_bytes(65536), "64.00 KiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    format_size_f64(bytes as f64)
}

fn format_size_f64(value: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut scaled = value;
    let mut unit = 0;
    while scaled >= 1024.0 && unit < UNITS.len() - 1 {
        scaled /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", scaled, UNITS[unit])
}
