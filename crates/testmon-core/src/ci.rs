//! CI context detection.
//!
//! Looks at well-known environment variables to tag a run with the CI
//! provider, branch/job and build number. Providers are checked in a fixed
//! order and the first one whose required variables are all present wins.

use std::collections::BTreeMap;

/// Tag key for the branch or job identifier.
pub const BRANCH_KEY: &str = "pipeline_branch";
/// Tag key for the build number.
pub const BUILD_KEY: &str = "pipeline_build_no";
/// Tag key naming the provider.
pub const PROVIDER_KEY: &str = "__ci__";

/// A CI provider and the variables that identify it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CiProvider {
    /// Value stored under [`PROVIDER_KEY`].
    pub tag: &'static str,
    /// Candidate variables for the branch, first present wins.
    pub branch_vars: &'static [&'static str],
    /// Variable holding the build number.
    pub build_var: &'static str,
}

/// Providers in detection order. This order is part of the contract.
pub const PROVIDERS: &[CiProvider] = &[
    CiProvider {
        tag: "jenkinsci",
        branch_vars: &["BRANCH_NAME", "JOB_NAME"],
        build_var: "BUILD_NUMBER",
    },
    CiProvider {
        tag: "circleci",
        branch_vars: &["CIRCLE_JOB"],
        build_var: "CIRCLE_BUILD_NUM",
    },
    CiProvider {
        tag: "travisci",
        branch_vars: &["TRAVIS_BUILD_ID"],
        build_var: "TRAVIS_BUILD_NUMBER",
    },
    CiProvider {
        tag: "droneci",
        branch_vars: &["DRONE_REPO_BRANCH"],
        build_var: "DRONE_BUILD_NUMBER",
    },
    CiProvider {
        tag: "gitlabci",
        branch_vars: &["CI_JOB_NAME"],
        build_var: "CI_PIPELINE_ID",
    },
    CiProvider {
        tag: "bitbucketci",
        branch_vars: &["BITBUCKET_BRANCH"],
        build_var: "BITBUCKET_BUILD_NUMBER",
    },
];

impl CiProvider {
    /// Tags for this provider, or `None` when a required variable is missing.
    pub fn detect<F>(&self, lookup: &F) -> Option<BTreeMap<String, String>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let build = lookup(self.build_var)?;
        let branch = self.branch_vars.iter().find_map(|v| lookup(v))?;
        let mut tags = BTreeMap::new();
        tags.insert(BRANCH_KEY.to_string(), branch);
        tags.insert(BUILD_KEY.to_string(), build);
        tags.insert(PROVIDER_KEY.to_string(), self.tag.to_string());
        Some(tags)
    }
}

/// Detect the CI context from the process environment.
pub fn detect_ci_context() -> BTreeMap<String, String> {
    detect_ci_context_with(|key| std::env::var(key).ok())
}

/// Detect the CI context using an arbitrary variable lookup.
pub fn detect_ci_context_with<F>(lookup: F) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    PROVIDERS
        .iter()
        .find_map(|p| p.detect(&lookup))
        .unwrap_or_default()
}
