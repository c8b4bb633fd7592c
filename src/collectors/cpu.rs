use super::{CollectError, Result};
use std::time::Duration;

/// Aggregate CPU tick counters from one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle:  u64,
    pub total: u64,
}

/// Parse the aggregate `cpu ` line of /proc/stat.
/// Total is the sum of every counter; idle is the fourth one.
pub fn parse_proc_stat(text: &str) -> Option<CpuTimes> {
    for line in text.lines() {
        if !line.starts_with("cpu ") { continue; }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 { continue; }

        let mut times = CpuTimes::default();
        for (i, field) in fields[1..].iter().enumerate() {
            let val = super::parse(field);
            times.total += val;
            if i == 3 {
                times.idle = val;
            }
        }
        return Some(times);
    }
    None
}

#[cfg(target_os = "linux")]
pub fn read_cpu_times() -> Result<CpuTimes> {
    const PATH: &str = "/proc/stat";
    let text = std::fs::read_to_string(PATH)
        .map_err(|source| CollectError::Io { path: PATH, source })?;
    parse_proc_stat(&text).ok_or(CollectError::Parse(PATH))
}

#[cfg(not(target_os = "linux"))]
pub fn read_cpu_times() -> Result<CpuTimes> {
    Err(CollectError::Unsupported("cpu"))
}

/// Busy percentage between two snapshots. 0 when no ticks elapsed.
pub fn usage_between(prev: &CpuTimes, curr: &CpuTimes) -> f64 {
    let d_total = curr.total.saturating_sub(prev.total);
    let d_idle  = curr.idle .saturating_sub(prev.idle);
    if d_total == 0 {
        return 0.0;
    }
    (1.0 - d_idle as f64 / d_total as f64) * 100.0
}

/// Take two snapshots `interval` apart and return the CPU busy percentage.
/// Blocks the calling thread for `interval`.
pub fn sample_cpu_percent(interval: Duration) -> Result<f64> {
    let first = read_cpu_times()?;
    std::thread::sleep(interval);
    let second = read_cpu_times()?;
    let pct = usage_between(&first, &second);
    tracing::trace!(pct, ?interval, "cpu sample");
    Ok(pct)
}
