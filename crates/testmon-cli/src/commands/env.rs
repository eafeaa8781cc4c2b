//! `testmon env`: show this machine's execution environment fingerprint.

use testmon_core::{CaptureOptions, ExecutionEnvironment};

pub fn run(json: bool) {
    let env = ExecutionEnvironment::capture(&CaptureOptions::from_env());
    let hash = env.hash();

    if json {
        let mut value = match serde_json::to_value(&env) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("Failed to serialize environment: {e}");
                std::process::exit(1);
            }
        };
        if let Some(obj) = value.as_object_mut() {
            obj.insert("hash".to_string(), serde_json::Value::String(hash));
        }
        super::print_json(&value);
        return;
    }

    println!("Execution environment {}", super::short_id(&hash));
    println!();
    println!("  {:<16} {}", "hostname", env.hostname);
    println!("  {:<16} {}", "os", env.os_description);
    println!("  {:<16} {} ({})", "machine", env.machine_type, env.architecture);
    println!("  {:<16} {}", "cpu", env.cpu_model);
    println!("  {:<16} {}", "vendor", env.cpu_vendor);
    println!("  {:<16} {}", "cores", env.cpu_count);
    if env.cpu_frequency_mhz > 0.0 {
        println!("  {:<16} {:.0} MHz", "frequency", env.cpu_frequency_mhz);
    } else {
        println!("  {:<16} unknown (set {})", "frequency", testmon_core::environment::CPU_FREQ_ENV);
    }
    println!("  {:<16} {} MB", "memory", env.ram_total_mb);
    println!("  {:<16} {}", "runtime", env.runtime_version);
    println!();
    println!("  hash {hash}");
}
