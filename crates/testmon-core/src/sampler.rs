//! Per-unit resource sampling.
//!
//! [`ResourceSampler::measure`] brackets a unit of work and reports wall time,
//! process CPU time deltas and the peak resident memory seen while the unit
//! ran. A watcher thread polls resident memory for the duration of the unit;
//! entry and exit samples are always included, so the peak never drops below
//! the footprint at entry.
//!
//! Panics raised by the unit are caught so the measurement can complete, then
//! handed back untouched in [`Measurement::outcome`] for the caller to resume.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

const MIB: f64 = 1024.0 * 1024.0;

// ---------------------------------------------------------------------------
// Process probes
// ---------------------------------------------------------------------------

/// Process-level CPU time, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuTimes {
    pub user: f64,
    pub kernel: f64,
}

impl CpuTimes {
    /// CPU time consumed so far by the whole process (all threads).
    pub fn now() -> Self {
        #[cfg(unix)]
        {
            // SAFETY: `rusage` is plain old data; zeroed is a valid initial value.
            let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
            // SAFETY: `usage` is a valid, writable `rusage`.
            let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
            if rc != 0 {
                return Self::default();
            }
            Self {
                user: timeval_secs(usage.ru_utime),
                kernel: timeval_secs(usage.ru_stime),
            }
        }
        #[cfg(not(unix))]
        {
            Self::default()
        }
    }

    /// Field-wise `self - earlier`.
    pub fn since(&self, earlier: &CpuTimes) -> CpuTimes {
        CpuTimes {
            user: self.user - earlier.user,
            kernel: self.kernel - earlier.kernel,
        }
    }
}

#[cfg(unix)]
fn timeval_secs(tv: libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}

/// Current resident set size of this process, in MiB.
pub fn resident_memory_mib() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        // SAFETY: `sysconf` is thread-safe for this query and has no side effects.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return None;
        }
        Some(pages * page_size as f64 / MIB)
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        // No portable "current RSS" outside procfs; the high-water mark is
        // the closest approximation and still honours peak >= entry.
        // SAFETY: `rusage` is plain old data; zeroed is a valid initial value.
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        // SAFETY: `usage` is a valid, writable `rusage`.
        let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
        if rc != 0 {
            return None;
        }
        #[cfg(target_os = "macos")]
        let bytes = usage.ru_maxrss as f64;
        #[cfg(not(target_os = "macos"))]
        let bytes = usage.ru_maxrss as f64 * 1024.0;
        Some(bytes / MIB)
    }
    #[cfg(not(unix))]
    {
        None
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Hook the host runs before each unit, e.g. to force its own collector.
pub type PreUnitHook = Arc<dyn Fn() + Send + Sync>;

/// Sampler configuration.
#[derive(Clone)]
pub struct SamplerOptions {
    /// How often the watcher thread samples resident memory.
    pub poll_interval: Duration,
    /// Called right before each unit starts. The sampler never touches
    /// runtime state on its own; this is where a host opts in.
    pub pre_unit_hook: Option<PreUnitHook>,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            pre_unit_hook: None,
        }
    }
}

impl std::fmt::Debug for SamplerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplerOptions")
            .field("poll_interval", &self.poll_interval)
            .field("pre_unit_hook", &self.pre_unit_hook.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Measurements
// ---------------------------------------------------------------------------

/// Raw numbers for one bracketed unit.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    /// Wall-clock time the unit started.
    pub start_time: DateTime<Local>,
    /// Monotonic elapsed seconds.
    pub wall_time: f64,
    /// Process user CPU seconds consumed during the unit.
    pub user_time: f64,
    /// Process kernel CPU seconds consumed during the unit.
    pub kernel_time: f64,
    /// Highest resident memory observed, MiB.
    pub peak_memory_mib: f64,
}

/// A unit's outcome together with its sample.
pub struct Measurement<T> {
    /// `Err` holds the unit's panic payload, unchanged.
    pub outcome: std::thread::Result<T>,
    pub sample: RawSample,
}

impl<T> Measurement<T> {
    /// Return the unit's value, resuming its panic if it had one.
    pub fn into_value(self) -> T {
        match self.outcome {
            Ok(v) => v,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

/// Brackets units of work against a fixed memory baseline.
#[derive(Debug)]
pub struct ResourceSampler {
    baseline_mib: f64,
    options: SamplerOptions,
    measurements: AtomicU64,
}

impl ResourceSampler {
    /// Create a sampler, establishing the memory baseline immediately.
    pub fn new(options: SamplerOptions) -> Self {
        let mut sampler = Self::with_baseline(0.0, options);
        sampler.baseline_mib = sampler.establish_baseline();
        sampler
    }

    /// Create a sampler with a known baseline.
    pub fn with_baseline(baseline_mib: f64, options: SamplerOptions) -> Self {
        Self {
            baseline_mib,
            options,
            measurements: AtomicU64::new(0),
        }
    }

    /// Resident footprint of a trivial no-op call, MiB.
    fn establish_baseline(&self) -> f64 {
        let (_, sample) = self.bracket(|| std::hint::black_box(true));
        log::debug!("memory baseline {:.3} MiB", sample.peak_memory_mib);
        sample.peak_memory_mib
    }

    /// The memory baseline subtracted from every sample.
    pub fn baseline_mib(&self) -> f64 {
        self.baseline_mib
    }

    /// Number of units measured so far (the baseline does not count).
    pub fn measurements_taken(&self) -> u64 {
        self.measurements.load(Ordering::Relaxed)
    }

    /// Run `unit` and measure it.
    pub fn measure<T, F>(&self, unit: F) -> Measurement<T>
    where
        F: FnOnce() -> T,
    {
        if let Some(hook) = &self.options.pre_unit_hook {
            hook();
        }
        let (outcome, sample) = self.bracket(unit);
        self.measurements.fetch_add(1, Ordering::Relaxed);
        Measurement { outcome, sample }
    }

    fn bracket<T, F>(&self, unit: F) -> (std::thread::Result<T>, RawSample)
    where
        F: FnOnce() -> T,
    {
        let poll = self.options.poll_interval;
        let stop = AtomicBool::new(false);
        let entry_mem = resident_memory_mib().unwrap_or(0.0);

        std::thread::scope(|s| {
            let watcher = s.spawn(|| {
                let mut peak = entry_mem;
                while !stop.load(Ordering::Acquire) {
                    if let Some(m) = resident_memory_mib() {
                        peak = peak.max(m);
                    }
                    std::thread::park_timeout(poll);
                }
                peak
            });

            let start_time = Local::now();
            let cpu_a = CpuTimes::now();
            let t_a = Instant::now();

            let outcome = catch_unwind(AssertUnwindSafe(unit));

            let wall_time = t_a.elapsed().as_secs_f64();
            let cpu = CpuTimes::now().since(&cpu_a);
            let exit_mem = resident_memory_mib().unwrap_or(0.0);

            stop.store(true, Ordering::Release);
            watcher.thread().unpark();
            let watched = watcher.join().unwrap_or(entry_mem);

            let sample = RawSample {
                start_time,
                wall_time,
                user_time: cpu.user,
                kernel_time: cpu.kernel,
                peak_memory_mib: watched.max(exit_mem).max(entry_mem),
            };
            (outcome, sample)
        })
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new(SamplerOptions::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cpu_times_monotonic() {
        let a = CpuTimes::now();
        let mut x = 0u64;
        for i in 0..2_000_000u64 {
            x = x.wrapping_add(std::hint::black_box(i));
        }
        std::hint::black_box(x);
        let d = CpuTimes::now().since(&a);
        assert!(d.user >= 0.0);
        assert!(d.kernel >= 0.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_memory_available_on_linux() {
        let rss = resident_memory_mib().unwrap();
        assert!(rss > 0.0);
    }

    #[test]
    fn test_baseline_established_once() {
        let sampler = ResourceSampler::default();
        assert!(sampler.baseline_mib() >= 0.0);
        assert_eq!(sampler.measurements_taken(), 0);
    }

    #[test]
    fn test_measure_returns_value_and_timing() {
        let sampler = ResourceSampler::default();
        let m = sampler.measure(|| {
            std::thread::sleep(Duration::from_millis(30));
            42
        });
        assert!(m.sample.wall_time >= 0.03);
        assert!(m.sample.user_time >= 0.0);
        assert!(m.sample.kernel_time >= 0.0);
        assert_eq!(m.into_value(), 42);
        assert_eq!(sampler.measurements_taken(), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_peak_memory_not_below_entry() {
        let sampler = ResourceSampler::default();
        let entry = resident_memory_mib().unwrap();
        let m = sampler.measure(|| {
            let v = vec![1u8; 32 * 1024 * 1024];
            std::hint::black_box(&v);
            std::thread::sleep(Duration::from_millis(40));
            v.len()
        });
        // Other tests allocate concurrently; allow a little slack below entry.
        assert!(m.sample.peak_memory_mib >= entry - 8.0);
        assert_eq!(m.into_value(), 32 * 1024 * 1024);
    }

    #[test]
    fn test_panicking_unit_still_measured() {
        let sampler = ResourceSampler::with_baseline(0.0, SamplerOptions::default());
        let m = sampler.measure(|| -> u32 { panic!("unit exploded") });
        assert_eq!(sampler.measurements_taken(), 1);
        assert!(m.sample.wall_time >= 0.0);
        let payload = m.outcome.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"unit exploded"));
    }

    #[test]
    fn test_into_value_resumes_original_panic() {
        let sampler = ResourceSampler::with_baseline(0.0, SamplerOptions::default());
        let m = sampler.measure(|| -> u32 { std::panic::panic_any(7usize) });
        let resumed = catch_unwind(AssertUnwindSafe(|| m.into_value()));
        let payload = resumed.unwrap_err();
        assert_eq!(payload.downcast_ref::<usize>(), Some(&7));
    }

    #[test]
    fn test_pre_unit_hook_runs_before_each_unit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let options = SamplerOptions {
            pre_unit_hook: Some(Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let sampler = ResourceSampler::new(options);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        sampler.measure(|| ());
        sampler.measure(|| ());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
