//! OS resource readings used by the sampler and the watchdog.
//!
//! Linux-first: process RSS from `/proc/self/status`, system memory from
//! `/proc/meminfo`, CPU from `/proc/stat` deltas. Disk usage comes from
//! `fs2` and works everywhere. Every probe degrades to `None` rather than
//! erroring; a missing reading is not a health failure by itself.

use std::path::Path;

/// One set of resource readings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceReadings {
    /// Resident set size of this process, in megabytes.
    pub process_rss_mb: Option<u64>,
    /// System-wide memory usage percent (0-100).
    pub system_memory_percent: Option<f64>,
    /// Usage percent of the volume holding the given path (0-100).
    pub disk_usage_percent: Option<f64>,
}

/// Read RSS, system memory, and disk usage for `artifact_dir`'s volume.
#[must_use]
pub fn read_resources(artifact_dir: &Path) -> ResourceReadings {
    ResourceReadings {
        process_rss_mb: process_rss_mb(),
        system_memory_percent: system_memory_percent(),
        disk_usage_percent: disk_usage_percent(artifact_dir),
    }
}

/// Resident set size of the current process in MB.
#[cfg(target_os = "linux")]
#[must_use]
pub fn process_rss_mb() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            // Format: "12345 kB"
            let kb: u64 = rest.trim().split_whitespace().next()?.parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn process_rss_mb() -> Option<u64> {
    None
}

/// System-wide memory usage percent from /proc/meminfo.
#[cfg(target_os = "linux")]
#[must_use]
pub fn system_memory_percent() -> Option<f64> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb: Option<u64> = None;
    let mut available_kb: Option<u64> = None;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.trim().split_whitespace().next()?.parse().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.trim().split_whitespace().next()?.parse().ok();
        }
        if total_kb.is_some() && available_kb.is_some() {
            break;
        }
    }
    let total = total_kb?;
    let available = available_kb?;
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available);
    Some(used as f64 / total as f64 * 100.0)
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn system_memory_percent() -> Option<f64> {
    None
}

/// Usage percent of the filesystem holding `path`.
#[must_use]
pub fn disk_usage_percent(path: &Path) -> Option<f64> {
    let total = fs2::total_space(path).ok()?;
    let available = fs2::available_space(path).ok()?;
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available);
    Some(used as f64 / total as f64 * 100.0)
}

/// Aggregate CPU counters from one /proc/stat read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

/// Read the aggregate "cpu" line from /proc/stat.
#[cfg(target_os = "linux")]
#[must_use]
pub fn read_cpu_times() -> Option<CpuTimes> {
    let contents = std::fs::read_to_string("/proc/stat").ok()?;
    let line = contents.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    // idle + iowait count as not-busy.
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn read_cpu_times() -> Option<CpuTimes> {
    None
}

/// CPU usage percent between two /proc/stat readings.
#[must_use]
pub fn cpu_percent_between(earlier: CpuTimes, later: CpuTimes) -> Option<f64> {
    let total_delta = later.total.checked_sub(earlier.total)?;
    if total_delta == 0 {
        return None;
    }
    let busy_delta = later.busy.saturating_sub(earlier.busy);
    Some(busy_delta as f64 / total_delta as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_usage_of_tempdir_is_sane() {
        let dir = tempfile::tempdir().unwrap();
        let pct = disk_usage_percent(dir.path());
        if let Some(pct) = pct {
            assert!((0.0..=100.0).contains(&pct));
        }
    }

    #[test]
    fn disk_usage_of_missing_path_is_none() {
        assert!(disk_usage_percent(Path::new("/nonexistent/streamwarden")).is_none());
    }

    #[test]
    fn cpu_percent_between_deltas() {
        let earlier = CpuTimes { busy: 100, total: 1000 };
        let later = CpuTimes { busy: 150, total: 1100 };
        let pct = cpu_percent_between(earlier, later).unwrap();
        assert!((pct - 50.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_percent_requires_forward_progress() {
        let t = CpuTimes { busy: 10, total: 100 };
        assert!(cpu_percent_between(t, t).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_probes_return_plausible_values() {
        let rss = process_rss_mb();
        assert!(rss.is_some());
        let mem = system_memory_percent().unwrap();
        assert!((0.0..=100.0).contains(&mem));
        assert!(read_cpu_times().is_some());
    }
}
