//! # testmon-core
//!
//! **Resource monitoring for every test you run.**
//!
//! `testmon-core` measures each unit of a test suite (wall time, user and
//! kernel CPU time, peak resident memory above a baseline) and stores the
//! results in a local SQLite file, on a remote collection server, or both.
//! Every run is a session; every machine the suite runs on is an execution
//! environment fingerprinted by content hash, so results can be compared
//! across revisions and hosts.
//!
//! ## Quick Start
//!
//! ```no_run
//! use testmon_core::{ItemIdentity, Kind, MonitorConfig, MonitorDecision, MonitorSession};
//!
//! let mut session = MonitorSession::open(MonitorConfig::default(), "local run", ["team=core"])?;
//! session.establish_environment()?;
//!
//! let outcome = session.bracket_and_record::<_, (), _>(
//!     &MonitorDecision::default(),
//!     &ItemIdentity::new("test_sort", "pkg.sort").with_location("tests/sort.rs"),
//!     Kind::Function,
//!     "sort",
//!     || Ok(vec![3, 1, 2].into_iter().max()),
//! )?;
//! if let Some(metric) = outcome.metric() {
//!     println!("cpu {:.2}  mem {:+.1} MiB", metric.cpu_usage, metric.memory_usage);
//! }
//! session.close();
//! # Ok::<(), testmon_core::MonitorError>(())
//! ```
//!
//! ## Architecture
//!
//! Runner → [`MonitorSession`] → [`ResourceSampler`] → derivation → sinks
//!
//! - [`SqliteStore`]: local, append-only; failures are fatal.
//! - [`RemoteSink`]: HTTP; the first failure disables it for the rest of the run.

pub mod ci;
pub mod config;
pub mod derive;
pub mod digest;
pub mod environment;
pub mod error;
pub mod model;
pub mod remote;
pub mod sampler;
pub mod scm;
pub mod session;
pub mod store;

pub use ci::{CiProvider, PROVIDERS, detect_ci_context, detect_ci_context_with};
pub use config::{ComponentPolicy, DEFAULT_DB, MonitorConfig};
pub use derive::{ComponentTemplate, DerivedMetrics, derive, normalize_variant};
pub use environment::{CaptureOptions, ExecutionEnvironment};
pub use error::{MonitorError, MonitorResult};
pub use model::{ItemIdentity, Kind, Marker, Metric, MonitorDecision, Scope, SessionRecord};
pub use remote::{
    ContextCreated, ContextLookup, ContextPayload, ContextRef, HttpTransport, MetricPayload,
    RemoteSink, SessionPayload, Transport, TransportError,
};
pub use sampler::{Measurement, RawSample, ResourceSampler, SamplerOptions};
pub use scm::{CommandRevision, FixedRevision, RevisionChain, RevisionProvider};
pub use session::{EnvironmentIds, Interrupt, MonitorSession, SessionSummary, UnitOutcome};
pub use store::{SqliteStore, Table};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
