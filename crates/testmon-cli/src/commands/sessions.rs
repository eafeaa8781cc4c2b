//! `testmon sessions`: list recorded sessions and inspect their metrics.

use std::path::Path;

use testmon_core::{Kind, Metric, SessionRecord, SqliteStore, Table};

/// Run the sessions command.
pub fn run(db: &str, session: Option<&str>, kind: Option<&str>, json: bool) {
    if !Path::new(db).exists() {
        println!("No metrics database found at {db}");
        println!("Run a monitored test session first.");
        return;
    }
    let store = match SqliteStore::open(db) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open {db}: {e}");
            std::process::exit(1);
        }
    };
    let sessions = match store.sessions() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to read sessions: {e}");
            std::process::exit(1);
        }
    };

    let kind = match super::parse_kind(kind) {
        Ok(k) => k,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    match session {
        Some(prefix) => show_session(&store, &sessions, prefix, kind, json),
        None => list_sessions(&store, &sessions, json),
    }
}

fn list_sessions(store: &SqliteStore, sessions: &[SessionRecord], json: bool) {
    if json {
        super::print_json(sessions);
        return;
    }
    if sessions.is_empty() {
        println!("No sessions recorded yet.");
        return;
    }

    let metrics = store.count_rows(Table::Metrics).unwrap_or(0);
    let environments = store.count_rows(Table::Environments).unwrap_or(0);
    println!(
        "{} session(s), {metrics} metric(s), {environments} environment(s)",
        sessions.len()
    );
    println!();
    println!(
        "  {:<12}  {:<32}  {:<12}  Description",
        "Session", "Run date", "SCM"
    );
    println!("  {}", "─".repeat(80));
    for s in sessions {
        println!(
            "  {:<12}  {:<32}  {:<12}  {}",
            super::short_id(&s.session_id),
            s.run_date,
            super::short_id(&s.scm_revision),
            s.run_description
        );
    }
}

fn show_session(
    store: &SqliteStore,
    sessions: &[SessionRecord],
    prefix: &str,
    kind: Option<Kind>,
    json: bool,
) {
    let matches: Vec<&SessionRecord> = sessions
        .iter()
        .filter(|s| s.session_id.starts_with(prefix))
        .collect();
    let session = match matches.as_slice() {
        [one] => *one,
        [] => {
            eprintln!("No session matches '{prefix}'");
            std::process::exit(1);
        }
        _ => {
            eprintln!("'{prefix}' matches {} sessions; use a longer prefix", matches.len());
            std::process::exit(1);
        }
    };

    let metrics: Vec<Metric> = match store.metrics_for_session(&session.session_id) {
        Ok(m) => m
            .into_iter()
            .filter(|m| kind.is_none_or(|k| m.kind == k))
            .collect(),
        Err(e) => {
            eprintln!("Failed to read metrics: {e}");
            std::process::exit(1);
        }
    };

    if json {
        super::print_json(&serde_json::json!({
            "session": session,
            "metrics": metrics,
        }));
        return;
    }

    println!("Session {}", session.session_id);
    println!("  run date     {}", session.run_date);
    println!("  scm          {}", session.scm_revision);
    println!("  description  {}", session.run_description);
    println!();
    if metrics.is_empty() {
        println!("  No metrics recorded.");
        return;
    }
    println!(
        "  {:<40} {:<10} {:<16} {:>9} {:>7} {:>10}",
        "Item", "Kind", "Component", "Time (s)", "CPU", "Mem (MiB)"
    );
    println!("  {}", "─".repeat(98));
    for m in &metrics {
        let name = if m.item_variant.is_empty() {
            m.item.clone()
        } else {
            format!("{}[{}]", m.item, m.item_variant)
        };
        println!(
            "  {:<40} {:<10} {:<16} {:>9.4} {:>7.2} {:>10.2}",
            name, m.kind, m.component, m.total_time, m.cpu_usage, m.memory_usage
        );
    }

    let total: f64 = metrics.iter().map(|m| m.total_time).sum();
    let peak = metrics
        .iter()
        .map(|m| m.memory_usage)
        .fold(f64::NEG_INFINITY, f64::max);
    println!();
    println!(
        "  {} metric(s), {total:.3}s total, peak {peak:.2} MiB above baseline",
        metrics.len()
    );
}
