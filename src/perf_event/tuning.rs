//! Kernel knobs that gate sampling throughput.
//!
//! The limits are raised before descriptors are opened and are not
//! restored on exit; a tighter limit left behind would silently throttle
//! the next profiler run, matching what perf itself leaves behind. The
//! tracing `saved_cmdlines_size` is the exception and is restored.

use std::io;
use std::path::Path;

pub const PERF_CPU_TIME_MAX_PERCENT: &str = "/proc/sys/kernel/perf_cpu_time_max_percent";
pub const PERF_EVENT_MAX_SAMPLE_RATE: &str = "/proc/sys/kernel/perf_event_max_sample_rate";
pub const PERF_EVENT_MLOCK_KB: &str = "/proc/sys/kernel/perf_event_mlock_kb";

const SAVED_CMDLINES_SIZE: &[&str] = &[
    "/sys/kernel/tracing/saved_cmdlines_size",
    "/sys/kernel/debug/tracing/saved_cmdlines_size",
];

pub const DEFAULT_SAMPLE_FREQUENCY: u64 = 4000;
pub const DEFAULT_EVENT_MAX_SAMPLE_RATE: u64 = 100000;
pub const DEFAULT_CPU_TIME_MAX_PERCENT: u64 = 25;
pub const DEFAULT_SAVED_CMDLINES_SIZE: u64 = 4096;

pub fn read_u64_from_proc_file(path: &str) -> io::Result<u64> {
    let text = std::fs::read_to_string(path)?;
    text.trim()
        .parse::<u64>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub fn write_u64_to_proc_file(path: &str, value: u64) -> io::Result<()> {
    std::fs::write(path, value.to_string())
}

fn raise_limit(path: &str, wanted: u64) -> bool {
    let current = match read_u64_from_proc_file(path) {
        Ok(v) => v,
        Err(err) => {
            log::warn!("cannot read {path}: {err}");
            return false;
        }
    };
    if current >= wanted {
        return true;
    }
    match write_u64_to_proc_file(path, wanted) {
        Ok(()) => {
            log::info!("raised {path} from {current} to {wanted}");
            true
        }
        Err(err) => {
            log::warn!(
                "cannot raise {path} to {wanted} ({err}); continuing with the kernel cap {current}"
            );
            false
        }
    }
}

/// State of the tuning pass; remembered so the summary can report which
/// caps may still be in force.
#[derive(Debug, Default)]
pub struct PerfLimits {
    pub sample_rate_capped: bool,
    pub mlock_capped: bool,
    saved_cmdlines_old: Option<u64>,
}

impl PerfLimits {
    /// Raise the three sampling knobs as far as the requested session
    /// needs. Failures degrade, they never abort.
    pub fn apply(frequency: u64, mmap_pages: u32, cpu_limit_percent: Option<u64>) -> PerfLimits {
        let mut limits = PerfLimits::default();

        let cpu_percent = cpu_limit_percent.unwrap_or(DEFAULT_CPU_TIME_MAX_PERCENT);
        raise_limit(PERF_CPU_TIME_MAX_PERCENT, cpu_percent);

        let wanted_rate = frequency.max(DEFAULT_EVENT_MAX_SAMPLE_RATE);
        limits.sample_rate_capped = !raise_limit(PERF_EVENT_MAX_SAMPLE_RATE, wanted_rate);

        let mlock_kb = num_cpus::get() as u64 * (mmap_pages as u64 + 1) * 4;
        limits.mlock_capped = !raise_limit(PERF_EVENT_MLOCK_KB, mlock_kb);

        limits
    }

    /// Grow the tracing cmdline cache so comm resolution of busy systems
    /// does not recycle entries mid-session. The old size is put back by
    /// `restore`.
    pub fn bump_saved_cmdlines(&mut self) {
        for path in SAVED_CMDLINES_SIZE {
            if !Path::new(path).exists() {
                continue;
            }
            if let Ok(old) = read_u64_from_proc_file(path) {
                if write_u64_to_proc_file(path, DEFAULT_SAVED_CMDLINES_SIZE).is_ok() {
                    self.saved_cmdlines_old = Some(old);
                }
            }
            break;
        }
    }

    pub fn restore(&mut self) {
        if let Some(old) = self.saved_cmdlines_old.take() {
            for path in SAVED_CMDLINES_SIZE {
                if Path::new(path).exists() {
                    let _ = write_u64_to_proc_file(path, old);
                    break;
                }
            }
        }
    }
}

/// The kernel-configured hard ceiling on sampling frequency, if readable.
pub fn max_sample_rate() -> Option<u64> {
    read_u64_from_proc_file(PERF_EVENT_MAX_SAMPLE_RATE).ok()
}

/// perf_event_paranoid level; openings fail with EACCES above 1 for
/// non-root users and the caller uses this for the error hint.
pub fn paranoia_level() -> Option<i64> {
    let text = std::fs::read_to_string("/proc/sys/kernel/perf_event_paranoid").ok()?;
    text.trim().parse::<i64>().ok()
}

/// kptr_restrict gates whether /proc/kallsyms shows real addresses.
pub fn kernel_pointers_visible() -> bool {
    match std::fs::read_to_string("/proc/sys/kernel/kptr_restrict") {
        Ok(text) => text.trim() == "0",
        Err(_) => false,
    }
}

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
