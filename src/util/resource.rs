//! Host memory queries
//!
//! The buffer pool is sized from the queue depth and the largest block; it
//! must fit in physical memory or the run would swap instead of measuring the
//! device.

/// Total physical memory in bytes, from `sysinfo(2)`
pub fn total_ram() -> Option<u64> {
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::sysinfo(&mut info) };
    if result != 0 {
        return None;
    }
    Some(info.totalram as u64 * info.mem_unit as u64)
}

/// Ceiling for one worker's buffer pool
///
/// Defaults to all of physical memory; an explicit limit can only lower it.
pub fn buffer_ram_limit(configured: Option<u64>) -> Option<u64> {
    match (configured, total_ram()) {
        (Some(c), Some(t)) => Some(c.min(t)),
        (c, t) => c.or(t),
    }
}

/// Resident set size of this process in bytes, from /proc/self/status
pub fn resident_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_ram_nonzero() {
        assert!(total_ram().unwrap() > 0);
    }

    #[test]
    fn test_configured_limit_only_lowers() {
        let total = total_ram().unwrap();
        assert_eq!(buffer_ram_limit(Some(4096)), Some(4096));
        assert_eq!(buffer_ram_limit(Some(u64::MAX)), Some(total));
        assert_eq!(buffer_ram_limit(None), Some(total));
    }

    #[test]
    fn test_resident_bytes() {
        assert!(resident_bytes().unwrap() > 0);
    }
}
