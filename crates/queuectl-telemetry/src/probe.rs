//! Process resource readings for telemetry samples.

use std::time::Duration;

/// Where telemetry reads resource usage from. Swappable so tests can feed
/// fixed numbers.
pub trait ResourceProbe: Send + Sync {
    /// Resident memory of this process, if it can be read.
    fn memory_bytes(&self) -> Option<u64>;
    /// User plus system CPU time consumed by this process so far.
    fn cpu_time(&self) -> Option<Duration>;
    /// Logical CPUs the process may run on.
    fn cpu_count(&self) -> usize;
}

/// Reads the current process through `/proc` and `getrusage(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessProbe;

impl ResourceProbe for ProcessProbe {
    fn memory_bytes(&self) -> Option<u64> {
        resident_from_statm().or_else(max_rss_bytes)
    }

    fn cpu_time(&self) -> Option<Duration> {
        let usage = rusage_self()?;
        Some(timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime))
    }

    fn cpu_count(&self) -> usize {
        num_cpus::get().max(1)
    }
}

/// Fraction of total machine CPU used by this process between two readings,
/// in `0.0..=1.0`. `None` when no wall time has passed.
pub fn cpu_load(cpu_delta: Duration, wall_delta: Duration, cpus: usize) -> Option<f64> {
    let capacity = wall_delta.as_secs_f64() * cpus.max(1) as f64;
    if capacity <= 0.0 {
        return None;
    }
    Some((cpu_delta.as_secs_f64() / capacity).clamp(0.0, 1.0))
}

/// Resident set size from `/proc/self/statm` (second field, in pages).
fn resident_from_statm() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    // SAFETY: sysconf has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = u64::try_from(page_size).ok().filter(|p| *p > 0)?;
    Some(pages * page_size)
}

/// Peak RSS, for platforms without procfs.
fn max_rss_bytes() -> Option<u64> {
    let usage = rusage_self()?;
    let max_rss = u64::try_from(usage.ru_maxrss).ok()?;
    // Linux and the BSDs report kilobytes, macOS reports bytes.
    if cfg!(target_os = "macos") {
        Some(max_rss)
    } else {
        Some(max_rss * 1024)
    }
}

fn rusage_self() -> Option<libc::rusage> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage writes a full rusage into the pointer on success.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    // SAFETY: rc == 0, so the struct was initialised.
    Some(unsafe { usage.assume_init() })
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    let secs = u64::try_from(tv.tv_sec).unwrap_or(0);
    let micros = u64::try_from(tv.tv_usec).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(micros)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_probe_reads_something() {
        let probe = ProcessProbe;
        assert!(probe.memory_bytes().unwrap_or(0) > 0);
        assert!(probe.cpu_time().is_some());
        assert!(probe.cpu_count() >= 1);
    }

    #[test]
    fn cpu_load_is_a_fraction_of_all_cpus() {
        let load = cpu_load(Duration::from_millis(500), Duration::from_secs(1), 2).expect("load");
        assert!((load - 0.25).abs() < 1e-9);
    }

    #[test]
    fn cpu_load_clamps_and_rejects_zero_wall_time() {
        assert_eq!(cpu_load(Duration::from_secs(10), Duration::from_secs(1), 1), Some(1.0));
        assert_eq!(cpu_load(Duration::from_secs(1), Duration::ZERO, 4), None);
    }
}
