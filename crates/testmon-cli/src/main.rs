//! CLI for testmon: per-test resource monitoring.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "testmon")]
#[command(about = "testmon: wall time, CPU and memory for every test you run")]
#[command(version = testmon_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the execution environment fingerprint of this machine
    Env {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the CI tags detected from environment variables
    Ci {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List recorded sessions, or the metrics of one session
    Sessions {
        /// Path to the metrics database
        #[arg(long, default_value = testmon_core::DEFAULT_DB)]
        db: String,

        /// Show metrics for this session (full id or unique prefix)
        #[arg(long)]
        session: Option<String>,

        /// Only show metrics of this kind: function, class, module, session
        #[arg(long)]
        kind: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run an in-memory collection server for remote monitoring
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port
        #[arg(long, default_value = "8050")]
        port: u16,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Env { json } => commands::env::run(json),
        Commands::Ci { json } => commands::ci::run(json),
        Commands::Sessions {
            db,
            session,
            kind,
            json,
        } => commands::sessions::run(&db, session.as_deref(), kind.as_deref(), json),
        Commands::Serve { host, port } => commands::server::run(&host, port),
    }
}
