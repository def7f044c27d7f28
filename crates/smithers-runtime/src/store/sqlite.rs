use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use rusqlite::{params_from_iter, Connection, ToSql};
use smithers_common::errors::{StoreError, StoreErrorKind};

use super::{classify_sqlite_error, tables_touched_by, NotifyCallback, Row, SqlValue, Store, StoreTx, SubscriptionId};

struct Subscription {
    id: SubscriptionId,
    tables: BTreeSet<String>,
    callback: NotifyCallback,
}

/// Default `Store` implementation backed by `rusqlite` (bundled SQLite):
/// open-or-create, `PRAGMA` setup, one `execute_batch` of `CREATE TABLE IF
/// NOT EXISTS` statements covering the full schema.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    subscriptions: Mutex<Vec<Subscription>>,
    next_sub_id: AtomicU64,
    closed: AtomicBool,
}

fn to_sql_value(v: &SqlValue) -> Box<dyn ToSql + '_> {
    match v {
        SqlValue::Null => Box::new(Option::<i64>::None),
        SqlValue::Integer(n) => Box::new(*n),
        SqlValue::Real(f) => Box::new(*f),
        SqlValue::Text(s) => Box::new(s.clone()),
        SqlValue::Blob(b) => Box::new(b.clone()),
    }
}

fn row_to_owned(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    let count = row.as_ref().column_count();
    let mut columns = Vec::with_capacity(count);
    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let name = row.as_ref().column_name(i)?.to_string();
        let value: rusqlite::types::Value = row.get(i)?;
        let v = match value {
            rusqlite::types::Value::Null => SqlValue::Null,
            rusqlite::types::Value::Integer(n) => SqlValue::Integer(n),
            rusqlite::types::Value::Real(f) => SqlValue::Real(f),
            rusqlite::types::Value::Text(s) => SqlValue::Text(s),
            rusqlite::types::Value::Blob(b) => SqlValue::Blob(b),
        };
        columns.push(name);
        values.push(v);
    }
    Ok(Row::new(columns, values))
}

impl SqliteStore {
    /// Opens (or creates) the store file at `path` and runs migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| {
            StoreError::with_source(StoreErrorKind::Io, "failed to open store file", e.into())
        })?;
        Self::from_connection(conn)
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::with_source(StoreErrorKind::Io, "failed to open in-memory store", e.into())
        })?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
            subscriptions: Mutex::new(Vec::new()),
            next_sub_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store connection mutex poisoned");
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .map_err(|e| {
                StoreError::with_source(StoreErrorKind::Schema, "failed to set pragmas", e.into())
            })?;
        conn.execute_batch(MIGRATIONS).map_err(|e| {
            StoreError::with_source(StoreErrorKind::Schema, "failed to run migrations", e.into())
        })?;
        Ok(())
    }

    fn notify(&self, tables: &BTreeSet<String>) {
        if tables.is_empty() {
            return;
        }
        let subs = self.subscriptions.lock().expect("subscriptions mutex poisoned");
        for sub in subs.iter() {
            if sub.tables.intersection(tables).next().is_some() {
                (sub.callback)(tables);
            }
        }
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::new(StoreErrorKind::Closed, "store is closed"));
        }
        Ok(())
    }
}

impl Store for SqliteStore {
    fn run(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        self.check_open()?;
        let conn = self.conn.lock().expect("store connection mutex poisoned");
        let bound: Vec<_> = params.iter().map(to_sql_value).collect();
        let refs: Vec<&dyn ToSql> = bound.iter().map(|b| b.as_ref()).collect();
        let affected = conn
            .execute(sql, params_from_iter(refs))
            .map_err(|e| StoreError::with_source(classify_sqlite_error(&e), "write failed", e.into()))?;
        drop(conn);
        self.notify(&tables_touched_by(sql));
        Ok(affected as u64)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        self.check_open()?;
        let conn = self.conn.lock().expect("store connection mutex poisoned");
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| StoreError::with_source(classify_sqlite_error(&e), "failed to prepare query", e.into()))?;
        let bound: Vec<_> = params.iter().map(to_sql_value).collect();
        let refs: Vec<&dyn ToSql> = bound.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(params_from_iter(refs), |row| row_to_owned(row))
            .map_err(|e| StoreError::with_source(classify_sqlite_error(&e), "query failed", e.into()))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| {
                StoreError::with_source(classify_sqlite_error(&e), "failed to read row", e.into())
            })?);
        }
        Ok(out)
    }

    fn transaction(
        &self,
        f: &mut dyn FnMut(&dyn StoreTx) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.check_open()?;
        let mut conn = self.conn.lock().expect("store connection mutex poisoned");
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::with_source(StoreErrorKind::Io, "failed to begin transaction", e.into()))?;
        let touched = RefCell::new(BTreeSet::new());
        let wrapper = SqliteTx {
            tx: &tx,
            touched: &touched,
        };
        f(&wrapper)?;
        tx.commit()
            .map_err(|e| StoreError::with_source(StoreErrorKind::Io, "failed to commit transaction", e.into()))?;
        drop(conn);
        self.notify(&touched.into_inner());
        Ok(())
    }

    fn subscribe(&self, tables: &[&str], callback: NotifyCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_sub_id.fetch_add(1, Ordering::SeqCst));
        let tables = tables.iter().map(|t| t.to_ascii_lowercase()).collect();
        self.subscriptions
            .lock()
            .expect("subscriptions mutex poisoned")
            .push(Subscription { id, tables, callback });
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions
            .lock()
            .expect("subscriptions mutex poisoned")
            .retain(|s| s.id != id);
    }

    fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct SqliteTx<'conn, 'tx> {
    tx: &'tx rusqlite::Transaction<'conn>,
    touched: &'tx RefCell<BTreeSet<String>>,
}

impl StoreTx for SqliteTx<'_, '_> {
    fn run(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        let bound: Vec<_> = params.iter().map(to_sql_value).collect();
        let refs: Vec<&dyn ToSql> = bound.iter().map(|b| b.as_ref()).collect();
        let affected = self
            .tx
            .execute(sql, params_from_iter(refs))
            .map_err(|e| StoreError::with_source(classify_sqlite_error(&e), "write failed", e.into()))?;
        self.touched.borrow_mut().extend(tables_touched_by(sql));
        Ok(affected as u64)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        let mut stmt = self
            .tx
            .prepare(sql)
            .map_err(|e| StoreError::with_source(classify_sqlite_error(&e), "failed to prepare query", e.into()))?;
        let bound: Vec<_> = params.iter().map(to_sql_value).collect();
        let refs: Vec<&dyn ToSql> = bound.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(params_from_iter(refs), |row| row_to_owned(row))
            .map_err(|e| StoreError::with_source(classify_sqlite_error(&e), "query failed", e.into()))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| {
                StoreError::with_source(classify_sqlite_error(&e), "failed to read row", e.into())
            })?);
        }
        Ok(out)
    }
}

/// Tables mirror §3 exactly. `TEXT` timestamps are RFC3339, matching `chrono`'s
/// default `Serialize` for `DateTime<Utc>`.
const MIGRATIONS: &str = "
CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    script_path TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    scope_rev INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS state_entries (
    execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    value_json TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (execution_id, key)
);

CREATE TABLE IF NOT EXISTS state_transitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    old_json TEXT,
    new_json TEXT,
    trigger TEXT,
    at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS phases (
    id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT,
    duration_ms INTEGER,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS steps (
    id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
    phase_id TEXT NOT NULL REFERENCES phases(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT,
    duration_ms INTEGER,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_runs (
    id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
    phase_id TEXT REFERENCES phases(id) ON DELETE CASCADE,
    step_id TEXT REFERENCES steps(id) ON DELETE CASCADE,
    prompt TEXT NOT NULL,
    model TEXT NOT NULL,
    allowed_tools TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL,
    tokens_input INTEGER,
    tokens_output INTEGER,
    error TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tool_calls (
    id TEXT PRIMARY KEY,
    agent_run_id TEXT NOT NULL REFERENCES agent_runs(id) ON DELETE CASCADE,
    tool_name TEXT NOT NULL,
    input_json TEXT NOT NULL,
    status TEXT NOT NULL,
    output TEXT,
    error TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS render_frames (
    execution_id TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
    sequence_number INTEGER NOT NULL,
    tree_xml TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (execution_id, sequence_number)
);

CREATE TABLE IF NOT EXISTS module_versions (
    version_id TEXT PRIMARY KEY,
    module_hash TEXT NOT NULL,
    parent_version_id TEXT REFERENCES module_versions(version_id),
    code TEXT NOT NULL,
    code_sha256 TEXT NOT NULL,
    trigger TEXT NOT NULL,
    analysis_json TEXT,
    vcs_commit_id TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS active_overrides (
    module_hash TEXT PRIMARY KEY,
    version_id TEXT NOT NULL REFERENCES module_versions(version_id),
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_phases_execution ON phases(execution_id);
CREATE INDEX IF NOT EXISTS idx_steps_phase ON steps(phase_id);
CREATE INDEX IF NOT EXISTS idx_agent_runs_execution ON agent_runs(execution_id);
CREATE INDEX IF NOT EXISTS idx_tool_calls_agent_run ON tool_calls(agent_run_id);
CREATE INDEX IF NOT EXISTS idx_render_frames_execution ON render_frames(execution_id);
CREATE INDEX IF NOT EXISTS idx_state_transitions_execution ON state_transitions(execution_id, key);
";

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn migrations_create_expected_tables() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rows = store
            .query("SELECT name FROM sqlite_master WHERE type = 'table'", &[])
            .unwrap();
        let names: Vec<&str> = rows.iter().filter_map(|r| r.get_text("name")).collect();
        for expected in [
            "executions",
            "state_entries",
            "state_transitions",
            "phases",
            "steps",
            "agent_runs",
            "tool_calls",
            "render_frames",
            "module_versions",
            "active_overrides",
        ] {
            assert!(names.contains(&expected), "missing table {expected}");
        }
    }

    #[test]
    fn run_and_query_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .run(
                "INSERT INTO executions (id, name, script_path, status, started_at, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                &[
                    "exec-1".into(),
                    "demo".into(),
                    "/w/demo.rs".into(),
                    "running".into(),
                    "2026-01-01T00:00:00Z".into(),
                    "2026-01-01T00:00:00Z".into(),
                ],
            )
            .unwrap();
        let rows = store
            .query("SELECT name FROM executions WHERE id = ?1", &["exec-1".into()])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_text("name"), Some("demo"));
    }

    #[test]
    fn subscribers_fire_once_after_commit_not_mid_transaction() {
        let store = SqliteStore::open_in_memory().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        store.subscribe(&["executions"], Box::new(move |_tables| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        store
            .transaction(&mut |tx| {
                tx.run(
                    "INSERT INTO executions (id, name, script_path, status, started_at, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    &[
                        "exec-2".into(),
                        "demo".into(),
                        "/w/demo.rs".into(),
                        "running".into(),
                        "2026-01-01T00:00:00Z".into(),
                        "2026-01-01T00:00:00Z".into(),
                    ],
                )?;
                assert_eq!(calls.load(Ordering::SeqCst), 0, "must not fire mid-transaction");
                Ok(())
            })
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_store_rejects_operations() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.close().unwrap();
        assert!(store.is_closed());
        let err = store.query("SELECT 1", &[]).unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Closed);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let store = SqliteStore::open_in_memory().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let id = store.subscribe(&["executions"], Box::new(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));
        store.unsubscribe(id);
        store
            .run(
                "INSERT INTO executions (id, name, script_path, status, started_at, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                &[
                    "exec-3".into(),
                    "demo".into(),
                    "/w/demo.rs".into(),
                    "running".into(),
                    "2026-01-01T00:00:00Z".into(),
                    "2026-01-01T00:00:00Z".into(),
                ],
            )
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
