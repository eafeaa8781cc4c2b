//! Local SQLite sink.
//!
//! Three tables: `TEST_SESSIONS`, `EXECUTION_CONTEXTS` and `TEST_METRICS`.
//! The store is append-only. Each insert runs in its own transaction, and
//! metrics reference sessions and environments through foreign keys, so
//! callers must insert those first.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};

use crate::environment::ExecutionEnvironment;
use crate::error::MonitorResult;
use crate::model::{Kind, Metric, SessionRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS TEST_SESSIONS (
    SESSION_H varchar(64) primary key not null unique, -- Session identifier
    RUN_DATE varchar(64), -- Date of test run
    SCM_ID varchar(128), -- SCM revision, empty if unknown
    RUN_DESCRIPTION json -- CI tags, description and user tags
);
CREATE TABLE IF NOT EXISTS EXECUTION_CONTEXTS (
    ENV_H varchar(64) primary key not null unique,
    CPU_COUNT integer,
    CPU_FREQUENCY_MHZ float,
    CPU_TYPE varchar(64),
    CPU_VENDOR varchar(256),
    RAM_TOTAL_MB integer,
    MACHINE_NODE varchar(512),
    MACHINE_TYPE varchar(32),
    MACHINE_ARCH varchar(16),
    SYSTEM_INFO varchar(256),
    RUNTIME_INFO varchar(512)
);
CREATE TABLE IF NOT EXISTS TEST_METRICS (
    SESSION_H varchar(64), -- Session identifier
    ENV_H varchar(64), -- Environment identifier
    ITEM_START_TIME varchar(64), -- Effective start time of the unit
    ITEM_PATH varchar(4096), -- Grouping path (module path)
    ITEM varchar(2048), -- Name of the unit
    ITEM_VARIANT varchar(2048), -- Parametrization, normalized
    ITEM_FS_LOC varchar(2048), -- Relative path of the unit's file
    KIND varchar(64), -- function, class, module or session
    COMPONENT varchar(512) NULL, -- Component the unit belongs to
    TOTAL_TIME float, -- Wall time (s)
    USER_TIME float, -- User CPU time (s)
    KERNEL_TIME float, -- Kernel CPU time (s)
    CPU_USAGE float, -- (user + kernel) / total
    MEM_USAGE float, -- Peak memory above baseline (MiB)
    FOREIGN KEY (SESSION_H) REFERENCES TEST_SESSIONS(SESSION_H),
    FOREIGN KEY (ENV_H) REFERENCES EXECUTION_CONTEXTS(ENV_H)
);
";

/// Tables exposed to [`SqliteStore::count_rows`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Sessions,
    Environments,
    Metrics,
}

impl Table {
    fn name(&self) -> &'static str {
        match self {
            Self::Sessions => "TEST_SESSIONS",
            Self::Environments => "EXECUTION_CONTEXTS",
            Self::Metrics => "TEST_METRICS",
        }
    }
}

/// Handle on the local metrics database.
pub struct SqliteStore {
    conn: Connection,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> MonitorResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self { conn };
        store.prepare()?;
        log::debug!("metrics store opened at {}", path.display());
        Ok(store)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> MonitorResult<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.prepare()?;
        Ok(store)
    }

    fn prepare(&self) -> MonitorResult<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn insert_session(&mut self, session: &SessionRecord) -> MonitorResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO TEST_SESSIONS(SESSION_H, RUN_DATE, SCM_ID, RUN_DESCRIPTION) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                session.session_id,
                session.run_date,
                session.scm_revision,
                session.run_description
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Insert an environment keyed by its hash, returning that identifier.
    pub fn insert_environment(&mut self, env: &ExecutionEnvironment) -> MonitorResult<String> {
        let env_h = env.hash();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO EXECUTION_CONTEXTS(ENV_H, CPU_COUNT, CPU_FREQUENCY_MHZ, CPU_TYPE, \
             CPU_VENDOR, RAM_TOTAL_MB, MACHINE_NODE, MACHINE_TYPE, MACHINE_ARCH, SYSTEM_INFO, \
             RUNTIME_INFO) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                env_h,
                env.cpu_count as i64,
                env.cpu_frequency_mhz,
                env.cpu_model,
                env.cpu_vendor,
                env.ram_total_mb as i64,
                env.hostname,
                env.machine_type,
                env.architecture,
                env.os_description,
                env.runtime_version
            ],
        )?;
        tx.commit()?;
        Ok(env_h)
    }

    pub fn insert_metric(&mut self, metric: &Metric) -> MonitorResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO TEST_METRICS(SESSION_H, ENV_H, ITEM_START_TIME, ITEM_PATH, ITEM, \
             ITEM_VARIANT, ITEM_FS_LOC, KIND, COMPONENT, TOTAL_TIME, USER_TIME, KERNEL_TIME, \
             CPU_USAGE, MEM_USAGE) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                metric.session_id,
                metric.environment_id,
                metric.start_time,
                metric.item_path,
                metric.item,
                metric.item_variant,
                metric.item_location,
                metric.kind.as_str(),
                metric.component,
                metric.total_time,
                metric.user_time,
                metric.kernel_time,
                metric.cpu_usage,
                metric.memory_usage
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Identifier of the stored environment with this hash, if any.
    pub fn query_environment_by_hash(&self, hash: &str) -> MonitorResult<Option<String>> {
        let id = self
            .conn
            .query_row(
                "SELECT ENV_H FROM EXECUTION_CONTEXTS WHERE ENV_H = ?1",
                params![hash],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Read-only helpers
    // -----------------------------------------------------------------------

    pub fn count_rows(&self, table: Table) -> MonitorResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let n: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// All sessions, newest run first.
    pub fn sessions(&self) -> MonitorResult<Vec<SessionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT SESSION_H, RUN_DATE, SCM_ID, RUN_DESCRIPTION FROM TEST_SESSIONS \
             ORDER BY RUN_DATE DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SessionRecord {
                session_id: row.get(0)?,
                run_date: row.get(1)?,
                scm_revision: row.get(2)?,
                run_description: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Metrics recorded in one session, in insertion order.
    pub fn metrics_for_session(&self, session_id: &str) -> MonitorResult<Vec<Metric>> {
        let mut stmt = self.conn.prepare(
            "SELECT SESSION_H, ENV_H, ITEM_START_TIME, ITEM_PATH, ITEM, ITEM_VARIANT, \
             ITEM_FS_LOC, KIND, COMPONENT, TOTAL_TIME, USER_TIME, KERNEL_TIME, CPU_USAGE, \
             MEM_USAGE FROM TEST_METRICS WHERE SESSION_H = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            let kind: String = row.get(7)?;
            let kind = kind.parse::<Kind>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    7,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            })?;
            Ok(Metric {
                session_id: row.get(0)?,
                environment_id: row.get(1)?,
                start_time: row.get(2)?,
                item_path: row.get(3)?,
                item: row.get(4)?,
                item_variant: row.get(5)?,
                item_location: row.get(6)?,
                kind,
                component: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
                total_time: row.get(9)?,
                user_time: row.get(10)?,
                kernel_time: row.get(11)?,
                cpu_usage: row.get(12)?,
                memory_usage: row.get(13)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The stored environment with this identifier.
    pub fn environment(&self, env_id: &str) -> MonitorResult<Option<ExecutionEnvironment>> {
        let env = self
            .conn
            .query_row(
                "SELECT CPU_COUNT, CPU_FREQUENCY_MHZ, CPU_TYPE, CPU_VENDOR, RAM_TOTAL_MB, \
                 MACHINE_NODE, MACHINE_TYPE, MACHINE_ARCH, SYSTEM_INFO, RUNTIME_INFO \
                 FROM EXECUTION_CONTEXTS WHERE ENV_H = ?1",
                params![env_id],
                |row| {
                    Ok(ExecutionEnvironment {
                        cpu_count: row.get::<_, i64>(0)?.max(0) as usize,
                        cpu_frequency_mhz: row.get(1)?,
                        cpu_model: row.get(2)?,
                        cpu_vendor: row.get(3)?,
                        ram_total_mb: row.get::<_, i64>(4)?.max(0) as u64,
                        hostname: row.get(5)?,
                        machine_type: row.get(6)?,
                        architecture: row.get(7)?,
                        os_description: row.get(8)?,
                        runtime_version: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> ExecutionEnvironment {
        ExecutionEnvironment {
            cpu_count: 4,
            cpu_frequency_mhz: 3000.0,
            cpu_model: "cpu".to_string(),
            cpu_vendor: "vendor".to_string(),
            ram_total_mb: 8192,
            hostname: "host".to_string(),
            machine_type: "x86_64".to_string(),
            architecture: "64bit".to_string(),
            os_description: "Linux - 6.1".to_string(),
            runtime_version: "rustc 1.85.0".to_string(),
        }
    }

    fn session(id: &str) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            run_date: "2026-01-01T00:00:00+00:00".to_string(),
            scm_revision: "abc".to_string(),
            run_description: "{}".to_string(),
        }
    }

    fn metric(session_id: &str, env_id: &str) -> Metric {
        Metric {
            session_id: session_id.to_string(),
            environment_id: env_id.to_string(),
            item: "test_ok".to_string(),
            item_path: "pkg.mod".to_string(),
            item_variant: "".to_string(),
            item_location: "tests/mod.rs".to_string(),
            kind: Kind::Function,
            component: "core".to_string(),
            start_time: "2026-01-01T00:00:01+00:00".to_string(),
            total_time: 0.5,
            user_time: 0.3,
            kernel_time: 0.1,
            cpu_usage: 0.8,
            memory_usage: 20.0,
        }
    }

    #[test]
    fn test_open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(".testmon.db");
        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.insert_session(&session("s1")).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.count_rows(Table::Sessions).unwrap(), 1);
    }

    #[test]
    fn test_environment_lookup() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let e = env();
        assert_eq!(store.query_environment_by_hash(&e.hash()).unwrap(), None);
        let id = store.insert_environment(&e).unwrap();
        assert_eq!(id, e.hash());
        assert_eq!(store.query_environment_by_hash(&e.hash()).unwrap(), Some(id.clone()));
        assert_eq!(store.environment(&id).unwrap(), Some(e));
    }

    #[test]
    fn test_duplicate_environment_rejected() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.insert_environment(&env()).unwrap();
        assert!(store.insert_environment(&env()).is_err());
        assert_eq!(store.count_rows(Table::Environments).unwrap(), 1);
    }

    #[test]
    fn test_metric_roundtrip() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let env_id = store.insert_environment(&env()).unwrap();
        store.insert_session(&session("s1")).unwrap();
        store.insert_metric(&metric("s1", &env_id)).unwrap();

        let stored = store.metrics_for_session("s1").unwrap();
        assert_eq!(stored, vec![metric("s1", &env_id)]);
        assert!(store.metrics_for_session("other").unwrap().is_empty());
    }

    #[test]
    fn test_metric_requires_existing_session() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let env_id = store.insert_environment(&env()).unwrap();
        let err = store.insert_metric(&metric("missing", &env_id));
        assert!(err.is_err());
        assert_eq!(store.count_rows(Table::Metrics).unwrap(), 0);
    }

    #[test]
    fn test_metric_requires_existing_environment() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.insert_session(&session("s1")).unwrap();
        assert!(store.insert_metric(&metric("s1", "nope")).is_err());
    }

    #[test]
    fn test_sessions_newest_first() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut old = session("old");
        old.run_date = "2025-01-01T00:00:00+00:00".to_string();
        store.insert_session(&old).unwrap();
        store.insert_session(&session("new")).unwrap();
        let ids: Vec<String> = store
            .sessions()
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[test]
    fn test_unwritable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain-file");
        std::fs::write(&file, b"x").unwrap();
        // A regular file cannot be used as a parent directory.
        assert!(SqliteStore::open(file.join("db.sqlite")).is_err());
    }
}
