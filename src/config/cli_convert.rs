//! String-to-value conversions for CLI flags

use anyhow::{Context, Result};
use std::time::Duration;

/// Parse a size string (e.g., "1G", "100M", "4k") to bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if s.ends_with('k') || s.ends_with("kb") || s.ends_with("kib") {
        (s.trim_end_matches("ib").trim_end_matches('b').trim_end_matches('k'), 1024u64)
    } else if s.ends_with('m') || s.ends_with("mb") || s.ends_with("mib") {
        (s.trim_end_matches("ib").trim_end_matches('b').trim_end_matches('m'), 1024 * 1024)
    } else if s.ends_with('g') || s.ends_with("gb") || s.ends_with("gib") {
        (s.trim_end_matches("ib").trim_end_matches('b').trim_end_matches('g'), 1024 * 1024 * 1024)
    } else if s.ends_with('t') || s.ends_with("tb") || s.ends_with("tib") {
        (s.trim_end_matches("ib").trim_end_matches('b').trim_end_matches('t'), 1024u64.pow(4))
    } else {
        (s.trim_end_matches('b'), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid size format: {}", s))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Size too large: {}", s))
}

/// Parse a duration string (e.g., "500ms", "30s", "5m", "1h", "2.5")
///
/// A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    let (num_str, seconds_per_unit) = if let Some(n) = s.strip_suffix("ms") {
        (n, 0.001)
    } else if let Some(n) = s.strip_suffix("us") {
        (n, 0.000_001)
    } else if let Some(n) = s.strip_suffix("min").or_else(|| s.strip_suffix('m')) {
        (n, 60.0)
    } else if let Some(n) = s.strip_suffix("hr").or_else(|| s.strip_suffix('h')) {
        (n, 3600.0)
    } else if let Some(n) = s.strip_suffix("sec").or_else(|| s.strip_suffix('s')) {
        (n, 1.0)
    } else {
        (s.as_str(), 1.0)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration format: {}", s))?;
    if !num.is_finite() || num < 0.0 {
        anyhow::bail!("Duration must be a non-negative number: {}", s);
    }

    Ok(Duration::from_secs_f64(num * seconds_per_unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("4KiB").unwrap(), 4096);
        assert_eq!(parse_size("64KB").unwrap(), 65536);
        assert_eq!(parse_size("1M").unwrap(), 1 << 20);
        assert_eq!(parse_size("2g").unwrap(), 2 << 30);
        assert_eq!(parse_size("1T").unwrap(), 1 << 40);
        assert_eq!(parse_size("512b").unwrap(), 512);
        assert!(parse_size("abc").is_err());
        assert!(parse_size("99999999999T").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("5min").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("-1").is_err());
        assert!(parse_duration("soon").is_err());
    }
}
