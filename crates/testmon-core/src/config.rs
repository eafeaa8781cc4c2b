//! Monitoring configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::derive::ComponentTemplate;
use crate::environment::CaptureOptions;
use crate::error::{MonitorError, MonitorResult};
use crate::model::Scope;
use crate::sampler::SamplerOptions;
use crate::scm::RevisionChain;

/// Default local database file name.
pub const DEFAULT_DB: &str = ".testmon.db";

/// How units' components are rewritten before storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentPolicy {
    /// Every unit reports this component.
    pub forced: Option<String>,
    /// Units report `prefix.<own component>`.
    pub prefix: Option<String>,
}

impl ComponentPolicy {
    pub fn new(forced: Option<&str>, prefix: Option<&str>) -> Self {
        let keep = |s: Option<&str>| s.filter(|v| !v.is_empty()).map(str::to_string);
        Self {
            forced: keep(forced),
            prefix: keep(prefix),
        }
    }

    /// The template to apply; forcing and prefixing at once is rejected.
    pub fn template(&self) -> MonitorResult<ComponentTemplate> {
        match (&self.forced, &self.prefix) {
            (Some(_), Some(_)) => Err(MonitorError::Config(
                "a forced component and a component prefix cannot be used together".to_string(),
            )),
            (Some(forced), None) => Ok(ComponentTemplate::forced(forced)),
            (None, Some(prefix)) => Ok(ComponentTemplate::prefixed(prefix)),
            (None, None) => Ok(ComponentTemplate::default()),
        }
    }
}

/// Everything a [`MonitorSession`](crate::MonitorSession) needs to start.
#[derive(Debug)]
pub struct MonitorConfig {
    /// Master switch. When off, units run unmeasured.
    pub enabled: bool,
    pub scope: Scope,
    /// Local SQLite file; `None` disables the local sink.
    pub db: Option<PathBuf>,
    /// Collector base URL; `None` disables the remote sink.
    pub remote: Option<String>,
    pub component: ComponentPolicy,
    pub sampler: SamplerOptions,
    pub revision: RevisionChain,
    pub capture: CaptureOptions,
    /// Per-request timeout for the remote sink.
    pub http_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scope: Scope::default(),
            db: Some(PathBuf::from(DEFAULT_DB)),
            remote: None,
            component: ComponentPolicy::default(),
            sampler: SamplerOptions::default(),
            revision: RevisionChain::default(),
            capture: CaptureOptions::from_env(),
            http_timeout: Duration::from_secs(10),
        }
    }
}
