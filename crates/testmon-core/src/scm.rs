//! Source-control revision lookup.
//!
//! A [`RevisionChain`] asks each [`RevisionProvider`] in turn and keeps the
//! first answer. When nobody answers the revision is the empty string.

use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Something that can name the revision the current run is built from.
pub trait RevisionProvider: Send + Sync {
    /// Short provider name, used in log output.
    fn name(&self) -> &str;

    /// The current revision, or `None` if this provider cannot tell.
    fn revision(&self) -> Option<String>;
}

/// Runs an external command and keeps the first line of its stdout.
#[derive(Debug, Clone)]
pub struct CommandRevision {
    name: String,
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

impl CommandRevision {
    pub fn new(name: &str, program: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
        }
    }

    /// `git rev-parse HEAD`.
    pub fn git() -> Self {
        Self::new("git", "git", &["rev-parse", "HEAD"])
    }

    /// `p4 changes -m1 #have`.
    pub fn perforce() -> Self {
        Self::new("perforce", "p4", &["changes", "-m1", "#have"])
    }

    /// Run the command from `dir` instead of the current directory.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

impl RevisionProvider for CommandRevision {
    fn name(&self) -> &str {
        &self.name
    }

    fn revision(&self) -> Option<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        let output = cmd.output().ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
    }
}

/// A provider that always answers with a fixed value (or never answers).
#[derive(Debug, Clone, Default)]
pub struct FixedRevision(pub Option<String>);

impl FixedRevision {
    pub fn new(rev: &str) -> Self {
        Self(Some(rev.to_string()))
    }
}

impl RevisionProvider for FixedRevision {
    fn name(&self) -> &str {
        "fixed"
    }

    fn revision(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Ordered list of providers; first success wins.
pub struct RevisionChain {
    providers: Vec<Box<dyn RevisionProvider>>,
}

impl std::fmt::Debug for RevisionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.providers.iter().map(|p| p.name()))
            .finish()
    }
}

impl Default for RevisionChain {
    /// git, then perforce.
    fn default() -> Self {
        Self::new()
            .with(CommandRevision::git())
            .with(CommandRevision::perforce())
    }
}

impl RevisionChain {
    /// An empty chain, which always resolves to `""`.
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    pub fn with(mut self, provider: impl RevisionProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// First revision any provider reports, or the empty string.
    pub fn resolve(&self) -> String {
        for provider in &self.providers {
            if let Some(rev) = provider.revision() {
                log::debug!("revision {rev} from {}", provider.name());
                return rev;
            }
        }
        log::debug!("no revision provider answered");
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        answer: Option<String>,
        calls: Arc<AtomicUsize>,
    }

    impl RevisionProvider for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn revision(&self) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    #[test]
    fn test_empty_chain_resolves_empty() {
        assert_eq!(RevisionChain::new().resolve(), "");
    }

    #[test]
    fn test_first_success_wins() {
        let later = Arc::new(AtomicUsize::new(0));
        let chain = RevisionChain::new()
            .with(FixedRevision(None))
            .with(FixedRevision::new("abc123"))
            .with(Counting {
                answer: Some("never".to_string()),
                calls: later.clone(),
            });
        assert_eq!(chain.resolve(), "abc123");
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_program_yields_none() {
        let p = CommandRevision::new("bogus", "testmon-no-such-program-xyz", &[]);
        assert_eq!(p.revision(), None);
    }

    #[test]
    fn test_failing_command_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        // Not a repository, so git (if installed) exits non-zero.
        let chain = RevisionChain::new()
            .with(CommandRevision::git().in_dir(dir.path()))
            .with(FixedRevision::new("fallback"));
        assert_eq!(chain.resolve(), "fallback");
    }

    #[test]
    fn test_chain_debug_lists_provider_names() {
        let chain = RevisionChain::default();
        assert_eq!(format!("{chain:?}"), r#"["git", "perforce"]"#);
    }
}
