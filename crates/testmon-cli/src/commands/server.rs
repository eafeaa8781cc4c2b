//! `testmon serve`: run the in-memory collector.

pub fn run(host: &str, port: u16) {
    let base = format!("http://{host}:{port}");

    println!("testmon collector v{}", testmon_core::VERSION);
    println!("   {base}");
    println!();
    println!("   Endpoints:");
    println!("     GET  /health            Counts of stored records");
    println!("     GET  /contexts/{{hash}}   Look up an execution context");
    println!("     POST /contexts/         Register an execution context");
    println!("     POST /sessions/         Register a session");
    println!("     POST /metrics/          Submit a metric");
    println!("     GET  /metrics/?session_h=<id>");
    println!();
    println!("   Point a monitored run at it with remote = \"{base}\"");
    println!();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            std::process::exit(1);
        }
    };
    log::info!("binding collector on {host}:{port}");
    if let Err(e) = rt.block_on(testmon_server::run_server(host, port)) {
        log::error!("collector stopped: {e}");
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
}
