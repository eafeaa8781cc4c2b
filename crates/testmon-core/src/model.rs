//! Records shared by the session manager and the sinks.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Kind & scope
// ---------------------------------------------------------------------------

/// Granularity of a monitored unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Function,
    Class,
    Module,
    Session,
}

impl Kind {
    pub const ALL: [Kind; 4] = [Kind::Function, Kind::Class, Kind::Module, Kind::Session];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Module => "module",
            Self::Session => "session",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "function" => Ok(Self::Function),
            "class" => Ok(Self::Class),
            "module" => Ok(Self::Module),
            "session" => Ok(Self::Session),
            other => Err(format!("unknown unit kind '{other}'")),
        }
    }
}

/// The set of unit kinds whose metrics are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    kinds: BTreeSet<Kind>,
}

impl Default for Scope {
    /// Function-level only.
    fn default() -> Self {
        Self::only(&[Kind::Function])
    }
}

impl Scope {
    pub fn only(kinds: &[Kind]) -> Self {
        Self {
            kinds: kinds.iter().copied().collect(),
        }
    }

    pub fn all() -> Self {
        Self::only(&Kind::ALL)
    }

    /// Parse a comma-separated list such as `"function,module"`.
    ///
    /// Unknown entries are dropped with a warning. If nothing valid is left,
    /// the default scope is used.
    pub fn parse(list: &str) -> Self {
        let mut kinds = BTreeSet::new();
        for raw in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match raw.parse::<Kind>() {
                Ok(kind) => {
                    kinds.insert(kind);
                }
                Err(e) => log::warn!("{e}; ignoring it in the monitoring scope"),
            }
        }
        if kinds.is_empty() {
            log::warn!("empty monitoring scope '{list}', falling back to function");
            return Self::default();
        }
        Self { kinds }
    }

    pub fn contains(&self, kind: Kind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = Kind> + '_ {
        self.kinds.iter().copied()
    }
}

// ---------------------------------------------------------------------------
// Per-unit inputs
// ---------------------------------------------------------------------------

/// Where a unit lives, as named by the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemIdentity {
    /// Qualified name of the unit.
    pub item: String,
    /// Grouping path, e.g. the module path.
    pub item_path: String,
    /// Raw parametrization suffix; normalized at recording time.
    pub item_variant: String,
    /// Filesystem-relative location.
    pub item_location: String,
}

impl ItemIdentity {
    pub fn new(item: &str, item_path: &str) -> Self {
        Self {
            item: item.to_string(),
            item_path: item_path.to_string(),
            ..Default::default()
        }
    }

    pub fn with_variant(mut self, variant: &str) -> Self {
        self.item_variant = variant.to_string();
        self
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.item_location = location.to_string();
        self
    }
}

/// Monitoring annotations a runner can attach to a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Run the unit but do not monitor it.
    SkipTest,
    /// Skip monitoring when the condition holds.
    SkipTestIf(bool),
    /// Monitor the unit even if something else asked to skip it.
    MonitorTest,
    /// Force monitoring when the condition holds.
    MonitorTestIf(bool),
}

impl Marker {
    /// Parse a marker by name. Unknown names produce a warning and `None`.
    pub fn parse(name: &str, arg: Option<bool>) -> Option<Self> {
        let marker = match (name, arg) {
            ("monitor_skip_test", _) => Self::SkipTest,
            ("monitor_skip_test_if", Some(cond)) => Self::SkipTestIf(cond),
            ("monitor_test", _) => Self::MonitorTest,
            ("monitor_test_if", Some(cond)) => Self::MonitorTestIf(cond),
            ("monitor_skip_test_if" | "monitor_test_if", None) => {
                log::warn!("marker {name} needs a condition; marker will be dropped");
                return None;
            }
            _ => {
                log::warn!("nothing known about marker {name}; marker will be dropped");
                return None;
            }
        };
        Some(marker)
    }
}

/// Per-unit monitoring decision computed once by the runner integration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorDecision {
    pub skip: bool,
    pub force_monitor: bool,
    /// Replaces the unit's own component before templating.
    pub component_override: Option<String>,
}

impl MonitorDecision {
    /// Fold markers into a decision. A forced monitor always beats skip.
    pub fn from_markers(markers: &[Marker]) -> Self {
        let mut decision = Self::default();
        for marker in markers {
            match *marker {
                Marker::SkipTest => decision.skip = true,
                Marker::SkipTestIf(cond) => decision.skip = cond,
                Marker::MonitorTest => decision.force_monitor = true,
                Marker::MonitorTestIf(cond) => decision.force_monitor = cond,
            }
        }
        if decision.force_monitor {
            decision.skip = false;
        }
        decision
    }

    pub fn should_monitor(&self) -> bool {
        self.force_monitor || !self.skip
    }
}

// ---------------------------------------------------------------------------
// Stored records
// ---------------------------------------------------------------------------

/// One run of the whole monitored suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub run_date: String,
    pub scm_revision: String,
    /// JSON object text.
    pub run_description: String,
}

/// One measured execution of a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub session_id: String,
    pub environment_id: String,
    pub item: String,
    pub item_path: String,
    pub item_variant: String,
    pub item_location: String,
    pub kind: Kind,
    pub component: String,
    pub start_time: String,
    pub total_time: f64,
    pub user_time: f64,
    pub kernel_time: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
}
