//! Integration tests for testmon-core.
//!
//! These tests run the full local pipeline:
//! session open → environment capture → measured unit → SQLite rows.

use testmon_core::{
    CaptureOptions, ExecutionEnvironment, FixedRevision, ItemIdentity, Kind, Marker,
    MonitorConfig, MonitorDecision, MonitorSession, RevisionChain, Scope, SqliteStore, Table,
    UnitOutcome, detect_ci_context_with,
};

/// Pin the frequency so captures do not depend on CPU scaling.
fn pinned_capture() -> CaptureOptions {
    CaptureOptions {
        cpu_freq_override: Some("2000".to_string()),
        force_override: true,
    }
}

fn config(db: &std::path::Path) -> MonitorConfig {
    MonitorConfig {
        db: Some(db.to_path_buf()),
        revision: RevisionChain::new().with(FixedRevision::new("cafe")),
        capture: pinned_capture(),
        ..MonitorConfig::default()
    }
}

#[test]
fn captured_environment_is_stable_within_a_process() {
    let a = ExecutionEnvironment::capture(&pinned_capture());
    let b = ExecutionEnvironment::capture(&pinned_capture());
    assert_eq!(a, b);
    assert_eq!(a.hash(), b.hash());
    assert!(a.cpu_count >= 1);
    assert!(!a.runtime_version.is_empty());
}

#[test]
fn live_sessions_share_one_environment_row() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("suite.db");

    for run in ["first", "second"] {
        let mut session = MonitorSession::open(config(&db), run, [""; 0]).unwrap();
        let ids = session.establish_environment().unwrap().clone();
        assert!(ids.local.is_some());
        assert_eq!(ids.remote, None);
        let outcome = session
            .bracket_and_record::<_, (), _>(
                &MonitorDecision::default(),
                &ItemIdentity::new("test_live", "suite"),
                Kind::Function,
                "",
                || Ok(()),
            )
            .unwrap();
        assert!(outcome.metric().is_some());
        session.close();
    }

    let store = SqliteStore::open(&db).unwrap();
    assert_eq!(store.count_rows(Table::Environments).unwrap(), 1);
    assert_eq!(store.count_rows(Table::Sessions).unwrap(), 2);
    assert_eq!(store.count_rows(Table::Metrics).unwrap(), 2);
}

#[test]
fn scope_controls_which_kinds_are_stored() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("suite.db");
    let mut cfg = config(&db);
    cfg.scope = Scope::parse("module,session");
    let mut session = MonitorSession::open(cfg, "", [""; 0]).unwrap();

    for kind in Kind::ALL {
        session
            .bracket_and_record::<_, (), _>(
                &MonitorDecision::default(),
                &ItemIdentity::new(&format!("unit_{kind}"), "suite"),
                kind,
                "",
                || Ok(()),
            )
            .unwrap();
    }
    let summary = session.close();
    assert_eq!(summary.units_measured, 4);
    assert_eq!(summary.metrics_recorded, 2);

    let store = SqliteStore::open(&db).unwrap();
    let kinds: Vec<Kind> = store
        .metrics_for_session(&summary.session_id)
        .unwrap()
        .into_iter()
        .map(|m| m.kind)
        .collect();
    assert_eq!(kinds, vec![Kind::Module, Kind::Session]);
}

#[test]
fn markers_drive_monitoring_decisions() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = MonitorSession::open(config(&dir.path().join("m.db")), "", [""; 0]).unwrap();

    let skipped = MonitorDecision::from_markers(&[Marker::SkipTest]);
    let forced = MonitorDecision::from_markers(&[Marker::SkipTest, Marker::MonitorTest]);
    let id = ItemIdentity::new("test_marked", "suite");

    let a = session
        .bracket_and_record::<_, (), _>(&skipped, &id, Kind::Function, "", || Ok(1))
        .unwrap();
    let b = session
        .bracket_and_record::<_, (), _>(&forced, &id, Kind::Function, "", || Ok(2))
        .unwrap();
    assert!(a.metric().is_none());
    assert!(b.metric().is_some());
    assert!(matches!(b, UnitOutcome::Completed { value: 2, .. }));
}

#[test]
fn run_description_carries_ci_and_tags() {
    let dir = tempfile::tempdir().unwrap();
    let session = MonitorSession::open(config(&dir.path().join("m.db")), "perf", ["owner=qa"])
        .unwrap();
    let desc: serde_json::Value =
        serde_json::from_str(&session.session_record().run_description).unwrap();
    assert_eq!(desc["description"], "perf");
    assert_eq!(desc["owner"], "qa");
}

#[test]
fn ci_detection_prefers_first_provider() {
    let vars = [
        ("DRONE_REPO_BRANCH", "main"),
        ("DRONE_BUILD_NUMBER", "12"),
        ("CIRCLE_JOB", "feature"),
        ("CIRCLE_BUILD_NUM", "99"),
    ];
    let tags = detect_ci_context_with(|name| {
        vars.iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string())
    });
    assert_eq!(tags.len(), 3);
    assert_eq!(tags["__ci__"], "circleci");
    assert_eq!(tags["pipeline_branch"], "feature");
    assert_eq!(tags["pipeline_build_no"], "99");
}

#[cfg(target_os = "linux")]
#[test]
fn allocation_shows_up_in_memory_usage() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = MonitorSession::open(config(&dir.path().join("m.db")), "", [""; 0]).unwrap();

    let outcome = session
        .bracket_and_record::<_, (), _>(
            &MonitorDecision::default(),
            &ItemIdentity::new("test_alloc", "suite"),
            Kind::Function,
            "",
            || {
                let block = vec![1u8; 64 * 1024 * 1024];
                std::thread::sleep(std::time::Duration::from_millis(50));
                Ok(std::hint::black_box(block).iter().map(|&b| b as u64).sum::<u64>())
            },
        )
        .unwrap();
    let metric = outcome.metric().unwrap();
    assert!(
        metric.memory_usage > 32.0,
        "expected a visible allocation, got {:.2} MiB",
        metric.memory_usage
    );
    assert!(metric.total_time >= 0.05);
}
