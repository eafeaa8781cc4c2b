//! Session & identity management.
//!
//! A [`MonitorSession`] is opened once per run. It stamps the session
//! identity, writes the session row to every configured sink, reconciles the
//! execution environment against what each sink already holds, and then
//! measures and records units one at a time.
//!
//! ```no_run
//! use testmon_core::{
//!     ItemIdentity, Kind, MonitorConfig, MonitorDecision, MonitorSession, UnitOutcome,
//! };
//!
//! let mut session = MonitorSession::open(MonitorConfig::default(), "nightly", ["team=core"])?;
//! session.establish_environment()?;
//! let outcome = session.bracket_and_record::<_, (), _>(
//!     &MonitorDecision::default(),
//!     &ItemIdentity::new("test_parse", "pkg.parser"),
//!     Kind::Function,
//!     "parser",
//!     || Ok(2 + 2),
//! )?;
//! if let UnitOutcome::Completed { metric: Some(m), .. } = outcome {
//!     println!("{} took {:.3}s", m.item, m.total_time);
//! }
//! let summary = session.close();
//! println!("{} metrics recorded", summary.metrics_recorded);
//! # Ok::<(), testmon_core::MonitorError>(())
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Local, SecondsFormat};
use serde::Serialize;

use crate::ci::detect_ci_context;
use crate::config::MonitorConfig;
use crate::derive::{ComponentTemplate, derive, normalize_variant};
use crate::digest::sha256_hex;
use crate::environment::{CaptureOptions, ExecutionEnvironment};
use crate::error::MonitorResult;
use crate::model::{ItemIdentity, Kind, Metric, MonitorDecision, Scope, SessionRecord};
use crate::remote::{HttpTransport, RemoteSink, Transport};
use crate::sampler::{RawSample, ResourceSampler};
use crate::store::SqliteStore;

// ---------------------------------------------------------------------------
// Unit outcomes
// ---------------------------------------------------------------------------

/// Early exit from a monitored unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interrupt<E> {
    /// The unit decided to skip itself. Nothing is recorded.
    Skip(String),
    /// The unit failed. The measurement is still recorded.
    Fail(E),
}

/// What happened to a unit passed to [`MonitorSession::bracket_and_record`].
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome<T, E> {
    Completed { value: T, metric: Option<Metric> },
    Failed { error: E, metric: Option<Metric> },
    Skipped { reason: String },
}

impl<T, E> UnitOutcome<T, E> {
    /// The metric recorded for this unit, if any.
    pub fn metric(&self) -> Option<&Metric> {
        match self {
            Self::Completed { metric, .. } | Self::Failed { metric, .. } => metric.as_ref(),
            Self::Skipped { .. } => None,
        }
    }

    fn unmeasured(result: Result<T, Interrupt<E>>) -> Self {
        match result {
            Ok(value) => Self::Completed {
                value,
                metric: None,
            },
            Err(Interrupt::Fail(error)) => Self::Failed {
                error,
                metric: None,
            },
            Err(Interrupt::Skip(reason)) => Self::Skipped { reason },
        }
    }
}

/// Environment identifiers assigned by each sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentIds {
    pub local: Option<String>,
    pub remote: Option<String>,
}

/// Final bookkeeping returned by [`MonitorSession::close`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub enabled: bool,
    /// Units the sampler measured, including skipped and out-of-scope ones.
    pub units_measured: u64,
    pub metrics_recorded: u64,
    /// `None` when no remote was configured.
    pub remote_active: Option<bool>,
}

// ---------------------------------------------------------------------------
// Run identity
// ---------------------------------------------------------------------------

fn timestamp(at: &DateTime<Local>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Merge CI tags, the description and `key=value` tags into a JSON object.
///
/// Later entries override earlier ones. Tags without `=` are skipped with a
/// warning.
pub fn build_run_description<S: AsRef<str>>(
    ci: &BTreeMap<String, String>,
    description: &str,
    tags: impl IntoIterator<Item = S>,
) -> MonitorResult<String> {
    let mut map = serde_json::Map::new();
    for (k, v) in ci {
        map.insert(k.clone(), serde_json::Value::String(v.clone()));
    }
    if !description.is_empty() {
        map.insert(
            "description".to_string(),
            serde_json::Value::String(description.to_string()),
        );
    }
    for tag in tags {
        let tag = tag.as_ref();
        match tag.split_once('=') {
            Some((key, value)) => {
                map.insert(key.to_string(), serde_json::Value::String(value.to_string()));
            }
            None => log::warn!("ignoring malformed tag '{tag}' (expected key=value)"),
        }
    }
    Ok(serde_json::to_string(&map)?)
}

/// Session identifier: SHA-256 over revision, run date and description.
pub fn session_id(scm_revision: &str, run_date: &str, description: &str) -> String {
    sha256_hex([scm_revision, run_date, description])
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One monitored run.
pub struct MonitorSession {
    enabled: bool,
    scope: Scope,
    component: ComponentTemplate,
    capture: CaptureOptions,
    record: SessionRecord,
    sampler: Option<ResourceSampler>,
    store: Option<SqliteStore>,
    remote: Option<RemoteSink<Box<dyn Transport>>>,
    environment: Option<ExecutionEnvironment>,
    env_ids: Option<EnvironmentIds>,
    metrics_recorded: u64,
}

impl std::fmt::Debug for MonitorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorSession")
            .field("session_id", &self.record.session_id)
            .field("enabled", &self.enabled)
            .field("scope", &self.scope)
            .field("store", &self.store)
            .field("remote", &self.remote.as_ref().map(|r| r.base_url()))
            .field("env_ids", &self.env_ids)
            .finish()
    }
}

impl MonitorSession {
    /// Validate `config`, stamp the session identity and open the sinks.
    ///
    /// The remote sink, when configured, talks HTTP through
    /// [`HttpTransport`].
    pub fn open<S: AsRef<str>>(
        config: MonitorConfig,
        description: &str,
        tags: impl IntoIterator<Item = S>,
    ) -> MonitorResult<Self> {
        let transport: Option<Box<dyn Transport>> = match &config.remote {
            Some(_) if config.enabled => match HttpTransport::new(config.http_timeout) {
                Ok(t) => Some(Box::new(t)),
                Err(e) => {
                    log::warn!("{e}; remote monitoring disabled");
                    None
                }
            },
            _ => None,
        };
        Self::open_with_transport(config, description, tags, transport)
    }

    /// Like [`open`](Self::open), with a caller-supplied remote transport.
    ///
    /// Without a transport the remote target in `config` is ignored.
    pub fn open_with_transport<S: AsRef<str>>(
        config: MonitorConfig,
        description: &str,
        tags: impl IntoIterator<Item = S>,
        transport: Option<Box<dyn Transport>>,
    ) -> MonitorResult<Self> {
        let component = config.component.template()?;

        let transport = transport.filter(|_| config.remote.is_some());
        let mut enabled = config.enabled;
        if enabled && config.db.is_none() && transport.is_none() {
            log::warn!(
                "both local database and remote server are disabled; monitoring is deactivated"
            );
            enabled = false;
        }

        let run_date = timestamp(&Local::now());
        let scm_revision = if enabled {
            config.revision.resolve()
        } else {
            String::new()
        };
        let record = SessionRecord {
            session_id: session_id(&scm_revision, &run_date, description),
            run_description: build_run_description(&detect_ci_context(), description, tags)?,
            run_date,
            scm_revision,
        };

        let mut session = Self {
            enabled,
            scope: config.scope,
            component,
            capture: config.capture,
            record,
            sampler: None,
            store: None,
            remote: None,
            environment: None,
            env_ids: None,
            metrics_recorded: 0,
        };
        if !enabled {
            return Ok(session);
        }

        session.sampler = Some(ResourceSampler::new(config.sampler));

        if let Some(path) = &config.db {
            let mut store = SqliteStore::open(path)?;
            store.insert_session(&session.record)?;
            session.store = Some(store);
        }
        if let (Some(url), Some(transport)) = (&config.remote, transport) {
            let mut sink = RemoteSink::new(url, transport);
            sink.create_session(&session.record);
            session.remote = Some(sink);
        }

        log::debug!(
            "monitoring session {} opened (scm '{}')",
            session.record.session_id,
            session.record.scm_revision
        );
        Ok(session)
    }

    pub fn session_id(&self) -> &str {
        &self.record.session_id
    }

    pub fn session_record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The local store, when one is configured.
    pub fn store(&self) -> Option<&SqliteStore> {
        self.store.as_ref()
    }

    /// Requests sent to the remote so far; `None` without a remote sink.
    pub fn remote_calls(&self) -> Option<u64> {
        self.remote.as_ref().map(RemoteSink::calls_made)
    }

    pub fn remote_active(&self) -> Option<bool> {
        self.remote.as_ref().map(RemoteSink::is_active)
    }

    /// The captured environment, once established.
    pub fn environment(&self) -> Option<&ExecutionEnvironment> {
        self.environment.as_ref()
    }

    /// Capture this machine's environment and reconcile it with every sink.
    ///
    /// Only the first call does any work.
    pub fn establish_environment(&mut self) -> MonitorResult<&EnvironmentIds> {
        let ids = match self.env_ids.take() {
            Some(ids) => ids,
            None if !self.enabled => EnvironmentIds::default(),
            None => {
                let env = ExecutionEnvironment::capture(&self.capture);
                self.reconcile(env)?
            }
        };
        Ok(self.env_ids.insert(ids))
    }

    /// Reconcile a given environment with every sink, replacing any earlier
    /// one for the rest of the session.
    pub fn reconcile_environment(
        &mut self,
        env: ExecutionEnvironment,
    ) -> MonitorResult<&EnvironmentIds> {
        let ids = if self.enabled {
            self.reconcile(env)?
        } else {
            EnvironmentIds::default()
        };
        Ok(self.env_ids.insert(ids))
    }

    fn reconcile(&mut self, env: ExecutionEnvironment) -> MonitorResult<EnvironmentIds> {
        let hash = env.hash();
        let local = match self.store.as_mut() {
            Some(store) => match store.query_environment_by_hash(&hash)? {
                Some(id) => Some(id),
                None => Some(store.insert_environment(&env)?),
            },
            None => None,
        };
        let remote = self
            .remote
            .as_mut()
            .and_then(|sink| sink.register_environment(&env));
        log::debug!("environment {hash}: local {local:?}, remote {remote:?}");
        self.environment = Some(env);
        Ok(EnvironmentIds { local, remote })
    }

    /// Hand a metric to every sink that knows its environment.
    ///
    /// Each sink stores the metric against the environment identifier it
    /// reconciled, whatever `metric.environment_id` says. Metrics whose kind
    /// is outside the scope are dropped silently. Returns whether at least one
    /// sink accepted the metric.
    pub fn record(&mut self, metric: &Metric) -> MonitorResult<bool> {
        if !self.enabled || !self.scope.contains(metric.kind) {
            return Ok(false);
        }
        let ids = self.establish_environment()?.clone();
        let mut accepted = false;
        if let (Some(store), Some(local_id)) = (self.store.as_mut(), &ids.local) {
            if metric.environment_id == *local_id {
                store.insert_metric(metric)?;
            } else {
                store.insert_metric(&Metric {
                    environment_id: local_id.clone(),
                    ..metric.clone()
                })?;
            }
            accepted = true;
        }
        if let (Some(sink), Some(remote_id)) = (self.remote.as_mut(), &ids.remote) {
            accepted |= sink.submit_metric(metric, remote_id);
        }
        if accepted {
            self.metrics_recorded += 1;
        } else {
            log::debug!("no active sink took the metric for {}", metric.item);
        }
        Ok(accepted)
    }

    /// Turn a raw sample into a metric bound to this session.
    pub fn build_metric(
        &self,
        identity: &ItemIdentity,
        kind: Kind,
        component: &str,
        sample: &RawSample,
        baseline_mib: f64,
    ) -> Metric {
        let derived = derive(
            sample.wall_time,
            sample.user_time,
            sample.kernel_time,
            sample.peak_memory_mib,
            baseline_mib,
        );
        let environment_id = self
            .env_ids
            .as_ref()
            .and_then(|ids| ids.local.clone().or_else(|| ids.remote.clone()))
            .unwrap_or_default();
        Metric {
            session_id: self.record.session_id.clone(),
            environment_id,
            item: identity.item.clone(),
            item_path: identity.item_path.clone(),
            item_variant: normalize_variant(&identity.item_variant),
            item_location: identity.item_location.clone(),
            kind,
            component: self.component.resolve(component),
            start_time: timestamp(&sample.start_time),
            total_time: sample.wall_time,
            user_time: sample.user_time,
            kernel_time: sample.kernel_time,
            cpu_usage: derived.cpu_usage,
            memory_usage: derived.net_memory,
        }
    }

    /// Run `unit` under measurement and record the result.
    ///
    /// Units are run unmeasured when monitoring is off or `decision` says to
    /// skip. A failed unit is still recorded; a skipped one is not. A panic
    /// inside `unit` is resumed after its metric is recorded.
    pub fn bracket_and_record<T, E, F>(
        &mut self,
        decision: &MonitorDecision,
        identity: &ItemIdentity,
        kind: Kind,
        component: &str,
        unit: F,
    ) -> MonitorResult<UnitOutcome<T, E>>
    where
        F: FnOnce() -> Result<T, Interrupt<E>>,
    {
        if !self.enabled || !decision.should_monitor() {
            return Ok(UnitOutcome::unmeasured(unit()));
        }
        self.establish_environment()?;
        let Some(sampler) = &self.sampler else {
            return Ok(UnitOutcome::unmeasured(unit()));
        };
        let baseline = sampler.baseline_mib();
        let measurement = sampler.measure(unit);
        let component = decision.component_override.as_deref().unwrap_or(component);

        let result = match measurement.outcome {
            Ok(result) => result,
            Err(payload) => {
                let metric =
                    self.build_metric(identity, kind, component, &measurement.sample, baseline);
                if let Err(e) = self.record(&metric) {
                    log::error!("cannot record metric for panicking unit {}: {e}", identity.item);
                }
                std::panic::resume_unwind(payload);
            }
        };
        if let Err(Interrupt::Skip(reason)) = result {
            log::debug!("unit {} skipped itself: {reason}", identity.item);
            return Ok(UnitOutcome::Skipped { reason });
        }

        let metric = self.build_metric(identity, kind, component, &measurement.sample, baseline);
        let metric = self.record(&metric)?.then_some(metric);
        Ok(match result {
            Ok(value) => UnitOutcome::Completed { value, metric },
            Err(Interrupt::Fail(error)) => UnitOutcome::Failed { error, metric },
            Err(Interrupt::Skip(reason)) => UnitOutcome::Skipped { reason },
        })
    }

    /// End the session.
    pub fn close(self) -> SessionSummary {
        let summary = SessionSummary {
            session_id: self.record.session_id.clone(),
            enabled: self.enabled,
            units_measured: self
                .sampler
                .as_ref()
                .map_or(0, ResourceSampler::measurements_taken),
            metrics_recorded: self.metrics_recorded,
            remote_active: self.remote_active(),
        };
        log::debug!("monitoring session closed: {summary:?}");
        summary
    }
}
