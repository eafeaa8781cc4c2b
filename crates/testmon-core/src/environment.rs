//! Execution environment fingerprinting.
//!
//! An [`ExecutionEnvironment`] is a static snapshot of the host: CPU, memory,
//! hostname, OS and the toolchain that built the monitored code. Its
//! [`hash`](ExecutionEnvironment::hash) is a pure function of the fields, so
//! repeated runs on the same machine collapse onto one stored environment.
//!
//! Every probe is best-effort. Anything that cannot be read falls back to a
//! fixed placeholder rather than failing the capture.

use serde::{Deserialize, Serialize};

use crate::digest::sha256_hex;

/// Environment variable holding the CPU frequency (MHz) used when the
/// platform cannot report one, or when forced.
pub const CPU_FREQ_ENV: &str = "TESTMON_CPU_FREQ";
/// Truthy environment flag that skips the platform frequency probe entirely.
pub const FORCE_CPU_FREQ_ENV: &str = "TESTMON_FORCE_CPU_FREQ";

const UNKNOWN: &str = "unknown";

// ---------------------------------------------------------------------------
// Capture options
// ---------------------------------------------------------------------------

/// Inputs that steer environment capture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Raw override value for the CPU frequency, in MHz.
    pub cpu_freq_override: Option<String>,
    /// Use only the override, never the platform probe.
    pub force_override: bool,
}

impl CaptureOptions {
    /// Read [`CPU_FREQ_ENV`] and [`FORCE_CPU_FREQ_ENV`] from the process environment.
    pub fn from_env() -> Self {
        Self {
            cpu_freq_override: std::env::var(CPU_FREQ_ENV).ok(),
            force_override: std::env::var(FORCE_CPU_FREQ_ENV)
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
        }
    }
}

fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Resolve the CPU frequency through the fallback chain:
/// platform probe, then the override value, then `0.0`.
///
/// When `force_override` is set the probe is never invoked. An override that
/// is not a finite positive number yields `0.0`, as does a probe answer.
pub fn resolve_cpu_frequency<F>(options: &CaptureOptions, probe: F) -> f64
where
    F: FnOnce() -> Option<f64>,
{
    if !options.force_override {
        if let Some(mhz) = probe().filter(|v| v.is_finite() && *v > 0.0) {
            return mhz;
        }
    }
    let Some(raw) = options.cpu_freq_override.as_deref() else {
        return 0.0;
    };
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => v,
        _ => {
            log::warn!("ignoring invalid {CPU_FREQ_ENV} value '{raw}', using 0.0");
            0.0
        }
    }
}

// ---------------------------------------------------------------------------
// Execution environment
// ---------------------------------------------------------------------------

/// Static descriptors of the machine and runtime a run executes on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEnvironment {
    pub cpu_count: usize,
    pub cpu_frequency_mhz: f64,
    pub cpu_model: String,
    pub cpu_vendor: String,
    pub ram_total_mb: u64,
    pub hostname: String,
    pub machine_type: String,
    pub architecture: String,
    pub os_description: String,
    pub runtime_version: String,
}

impl ExecutionEnvironment {
    /// Snapshot the current host.
    pub fn capture(options: &CaptureOptions) -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(1);
        let uts = uname();

        Self {
            cpu_count,
            cpu_frequency_mhz: resolve_cpu_frequency(options, platform_cpu_frequency_mhz),
            cpu_model: detect_cpu_model().unwrap_or_else(|| UNKNOWN.to_string()),
            cpu_vendor: detect_cpu_vendor().unwrap_or_else(|| UNKNOWN.to_string()),
            ram_total_mb: detect_ram_total_mb().unwrap_or(0),
            hostname: hostname().unwrap_or_else(|| UNKNOWN.to_string()),
            machine_type: uts
                .as_ref()
                .map(|u| u.machine.clone())
                .unwrap_or_else(|| std::env::consts::ARCH.to_string()),
            architecture: format!("{}bit", usize::BITS),
            os_description: match &uts {
                Some(u) => format!("{} - {}", u.sysname, u.release),
                None => std::env::consts::OS.to_string(),
            },
            runtime_version: env!("TESTMON_RUSTC_VERSION").to_string(),
        }
    }

    /// Deterministic identity over every field, in declaration order.
    ///
    /// Floats are rendered with `Display`, which is the shortest text that
    /// round-trips, so equal stored values always hash equally.
    pub fn hash(&self) -> String {
        let cpu_count = self.cpu_count.to_string();
        let freq = self.cpu_frequency_mhz.to_string();
        let ram = self.ram_total_mb.to_string();
        sha256_hex([
            cpu_count.as_str(),
            freq.as_str(),
            self.cpu_model.as_str(),
            self.cpu_vendor.as_str(),
            ram.as_str(),
            self.hostname.as_str(),
            self.machine_type.as_str(),
            self.architecture.as_str(),
            self.os_description.as_str(),
            self.runtime_version.as_str(),
        ])
    }
}

// ---------------------------------------------------------------------------
// Platform probes
// ---------------------------------------------------------------------------

struct Uname {
    sysname: String,
    release: String,
    machine: String,
}

fn c_chars_to_string(raw: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).trim().to_string()
}

#[cfg(unix)]
fn uname() -> Option<Uname> {
    // SAFETY: `utsname` is plain old data; an all-zero value is valid and
    // `uname` fills it in place.
    let mut buf: libc::utsname = unsafe { std::mem::zeroed() };
    // SAFETY: `buf` is a valid, writable `utsname`.
    let rc = unsafe { libc::uname(&mut buf) };
    if rc != 0 {
        return None;
    }
    Some(Uname {
        sysname: c_chars_to_string(&buf.sysname),
        release: c_chars_to_string(&buf.release),
        machine: c_chars_to_string(&buf.machine),
    })
}

#[cfg(not(unix))]
fn uname() -> Option<Uname> {
    None
}

#[cfg(unix)]
fn hostname() -> Option<String> {
    let mut buf = [0 as libc::c_char; 256];
    // SAFETY: the buffer is writable for `buf.len()` bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let name = c_chars_to_string(&buf);
    if name.is_empty() { None } else { Some(name) }
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

#[cfg(target_os = "linux")]
fn cpuinfo_field(key: &str) -> Option<String> {
    let info = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    info.lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(target_os = "macos")]
fn sysctl_value(key: &str) -> Option<String> {
    let output = std::process::Command::new("sysctl")
        .arg("-n")
        .arg(key)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let s = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if s.is_empty() { None } else { Some(s) }
}

/// CPU brand string (best-effort).
fn detect_cpu_model() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        cpuinfo_field("model name")
            .or_else(|| cpuinfo_field("Model"))
            .or_else(|| cpuinfo_field("Hardware"))
    }
    #[cfg(target_os = "macos")]
    {
        sysctl_value("machdep.cpu.brand_string")
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// CPU vendor identifier (best-effort).
fn detect_cpu_vendor() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        cpuinfo_field("vendor_id").or_else(|| cpuinfo_field("CPU implementer"))
    }
    #[cfg(target_os = "macos")]
    {
        sysctl_value("machdep.cpu.vendor").or_else(|| Some("Apple".to_string()))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Total physical memory in MiB.
fn detect_ram_total_mb() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let from_meminfo = std::fs::read_to_string("/proc/meminfo").ok().and_then(|mem| {
            mem.lines()
                .filter_map(|l| l.split_once(':'))
                .find(|(k, _)| *k == "MemTotal")
                .and_then(|(_, rest)| rest.split_whitespace().next()?.parse::<u64>().ok())
                .map(|kb| kb / 1024)
        });
        if from_meminfo.is_some() {
            return from_meminfo;
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Some(bytes) = sysctl_value("hw.memsize").and_then(|s| s.parse::<u64>().ok()) {
            return Some(bytes / (1024 * 1024));
        }
    }
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        // SAFETY: `sysconf` is thread-safe for these queries and has no side effects.
        let (pages, page_size) =
            unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
        if pages > 0 && page_size > 0 {
            return Some((pages as u64).saturating_mul(page_size as u64) / (1024 * 1024));
        }
    }
    None
}

/// Nominal CPU frequency from the platform, in MHz.
///
/// Fixed ratings come first so repeated captures hash the same; the current
/// frequency is only a last resort.
fn platform_cpu_frequency_mhz() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        let cpufreq_paths = [
            "/sys/devices/system/cpu/cpu0/cpufreq/base_frequency",
            "/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq",
            "/sys/devices/system/cpu/cpu0/cpufreq/scaling_cur_freq",
        ];
        for path in cpufreq_paths {
            if let Some(khz) = std::fs::read_to_string(path)
                .ok()
                .and_then(|s| s.trim().parse::<f64>().ok())
            {
                return Some(khz / 1000.0);
            }
        }
        cpuinfo_field("cpu MHz").and_then(|s| s.parse::<f64>().ok())
    }
    #[cfg(target_os = "macos")]
    {
        sysctl_value("hw.cpufrequency")
            .and_then(|s| s.parse::<f64>().ok())
            .map(|hz| hz / 1_000_000.0)
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_env() -> ExecutionEnvironment {
        ExecutionEnvironment {
            cpu_count: 8,
            cpu_frequency_mhz: 2400.5,
            cpu_model: "Example CPU @ 2.40GHz".to_string(),
            cpu_vendor: "GenuineExample".to_string(),
            ram_total_mb: 16_384,
            hostname: "build-host".to_string(),
            machine_type: "x86_64".to_string(),
            architecture: "64bit".to_string(),
            os_description: "Linux - 6.1.0".to_string(),
            runtime_version: "rustc 1.85.0".to_string(),
        }
    }

    #[test]
    fn test_capture_fills_fields() {
        let env = ExecutionEnvironment::capture(&CaptureOptions::default());
        assert!(env.cpu_count >= 1);
        assert!(!env.hostname.is_empty());
        assert!(!env.machine_type.is_empty());
        assert!(env.architecture.ends_with("bit"));
        assert!(env.runtime_version.starts_with("rustc"));
        assert!(env.cpu_frequency_mhz >= 0.0);
    }

    #[test]
    fn test_capture_is_repeatable() {
        let opts = CaptureOptions {
            cpu_freq_override: Some("1234".to_string()),
            force_override: true,
        };
        let a = ExecutionEnvironment::capture(&opts);
        let b = ExecutionEnvironment::capture(&opts);
        assert_eq!(a.cpu_frequency_mhz, 1234.0);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_equal_for_identical_fields() {
        assert_eq!(sample_env().hash(), sample_env().clone().hash());
    }

    #[test]
    fn test_hash_differs_for_each_field() {
        let base = sample_env().hash();
        let variants: Vec<Box<dyn Fn(&mut ExecutionEnvironment)>> = vec![
            Box::new(|e| e.cpu_count += 1),
            Box::new(|e| e.cpu_frequency_mhz = 2400.25),
            Box::new(|e| e.cpu_model.push('!')),
            Box::new(|e| e.cpu_vendor.push('!')),
            Box::new(|e| e.ram_total_mb -= 1),
            Box::new(|e| e.hostname = "other-host".to_string()),
            Box::new(|e| e.machine_type = "aarch64".to_string()),
            Box::new(|e| e.architecture = "32bit".to_string()),
            Box::new(|e| e.os_description = "Darwin - 24.0.0".to_string()),
            Box::new(|e| e.runtime_version = "rustc 1.86.0".to_string()),
        ];
        for (i, mutate) in variants.iter().enumerate() {
            let mut env = sample_env();
            mutate(&mut env);
            assert_ne!(env.hash(), base, "field #{i} did not affect the hash");
        }
    }

    #[test]
    fn test_hash_survives_serde_roundtrip() {
        let env = sample_env();
        let json = serde_json::to_string(&env).unwrap();
        let back: ExecutionEnvironment = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hash(), env.hash());
    }

    // -----------------------------------------------------------------------
    // CPU frequency fallback chain
    // -----------------------------------------------------------------------

    #[test]
    fn test_frequency_prefers_platform_probe() {
        let opts = CaptureOptions {
            cpu_freq_override: Some("3000".to_string()),
            force_override: false,
        };
        assert_eq!(resolve_cpu_frequency(&opts, || Some(1500.0)), 1500.0);
    }

    #[test]
    fn test_frequency_falls_back_to_override() {
        let opts = CaptureOptions {
            cpu_freq_override: Some("3000".to_string()),
            force_override: false,
        };
        assert_eq!(resolve_cpu_frequency(&opts, || None), 3000.0);
    }

    #[test]
    fn test_frequency_force_skips_probe() {
        let opts = CaptureOptions {
            cpu_freq_override: Some("3000".to_string()),
            force_override: true,
        };
        let freq = resolve_cpu_frequency(&opts, || panic!("probe must not run when forced"));
        assert_eq!(freq, 3000.0);
    }

    #[test]
    fn test_frequency_force_without_override_is_zero() {
        let opts = CaptureOptions {
            cpu_freq_override: None,
            force_override: true,
        };
        assert_eq!(resolve_cpu_frequency(&opts, || Some(1500.0)), 0.0);
    }

    #[test]
    fn test_frequency_bad_override_is_zero() {
        let opts = CaptureOptions {
            cpu_freq_override: Some("fast".to_string()),
            force_override: false,
        };
        assert_eq!(resolve_cpu_frequency(&opts, || None), 0.0);
    }

    #[test]
    fn test_frequency_negative_override_is_zero() {
        for raw in ["-5", "0", "-0.5"] {
            let opts = CaptureOptions {
                cpu_freq_override: Some(raw.to_string()),
                force_override: true,
            };
            assert_eq!(resolve_cpu_frequency(&opts, || Some(2400.0)), 0.0);
        }
    }

    #[test]
    fn test_frequency_nothing_available_is_zero() {
        assert_eq!(resolve_cpu_frequency(&CaptureOptions::default(), || None), 0.0);
    }

    #[test]
    fn test_truthy_flags() {
        for v in ["1", "true", "TRUE", " yes ", "on"] {
            assert!(is_truthy(v), "{v:?} should be truthy");
        }
        for v in ["0", "false", "", "no", "off", "2"] {
            assert!(!is_truthy(v), "{v:?} should not be truthy");
        }
    }

    #[test]
    fn test_c_chars_to_string_stops_at_nul() {
        let raw: Vec<libc::c_char> = b"host\0garbage"
            .iter()
            .map(|&b| b as libc::c_char)
            .collect();
        assert_eq!(c_chars_to_string(&raw), "host");
    }
}
