//! Durable embedded storage with change notification.
//!
//! `Store` is a plain (non-async) trait: the engine's single-writer discipline
//! means a call to `run`/`query`/`transaction` never spans an `.await`, so
//! there is nothing async about the storage layer itself — the driver is the one
//! wrapping calls to it in a `tokio::sync::Mutex` guard that is held only across
//! the synchronous call, never across a suspension point.

pub mod sqlite;

pub use sqlite::SqliteStore;

use std::collections::BTreeSet;

use regex::Regex;
use std::sync::OnceLock;

use smithers_common::errors::{StoreError, StoreErrorKind};

/// A single bound parameter. Mirrors the handful of SQLite storage classes; a
/// richer value is pre-serialised to `Text` (JSON) by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(if v { 1 } else { 0 })
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => SqlValue::Null,
        }
    }
}

/// One result row, detached from the connection.
#[derive(Debug, Clone, Default)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    pub fn get_text(&self, column: &str) -> Option<&str> {
        match self.get(column) {
            Some(SqlValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        match self.get(column) {
            Some(SqlValue::Integer(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_json(&self, column: &str) -> Option<serde_json::Value> {
        self.get_text(column)
            .and_then(|s| serde_json::from_str(s).ok())
    }

    /// The first column's value, for single-scalar queries (`queryValue`).
    pub fn first(&self) -> Option<&SqlValue> {
        self.values.first()
    }
}

impl SqlValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SqlValue::Null => serde_json::Value::Null,
            SqlValue::Integer(n) => serde_json::Value::from(*n),
            SqlValue::Real(f) => serde_json::Value::from(*f),
            SqlValue::Text(s) => {
                serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone()))
            }
            SqlValue::Blob(b) => serde_json::Value::String(hex::encode(b)),
        }
    }
}

pub type NotifyCallback = Box<dyn Fn(&BTreeSet<String>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Durable storage with SQL-shaped access and post-commit change notification.
///
/// Open-or-create, run migrations, expose typed CRUD, but generalised to a
/// fixed schema via a thin SQL passthrough, since the schema here is owned by
/// this crate rather than by each caller.
pub trait Store: Send + Sync {
    fn run(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError>;
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError>;
    fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>, StoreError> {
        Ok(self.query(sql, params)?.into_iter().next())
    }
    /// Runs `f` inside a single transaction; notifications for all tables touched
    /// fire once, after commit.
    fn transaction(
        &self,
        f: &mut dyn FnMut(&dyn StoreTx) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
    fn subscribe(&self, tables: &[&str], callback: NotifyCallback) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId);
    fn close(&self) -> Result<(), StoreError>;
    fn is_closed(&self) -> bool;
}

/// The subset of `Store` available inside a `transaction` closure. Deliberately
/// has no `transaction` method of its own: nested transactions are not supported.
pub trait StoreTx {
    fn run(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError>;
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError>;
}

fn table_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:from|join|into|update)\s+([a-zA-Z_][a-zA-Z0-9_]*)").unwrap()
    })
}

/// Lightweight regex scan over `FROM`/`JOIN`/`INTO`/`UPDATE` clauses: favours a
/// conservative superset over a full SQL grammar. Shared between the store's
/// mutation-tracking and the reactive layer's dependency extraction.
pub fn tables_touched_by(sql: &str) -> BTreeSet<String> {
    table_regex()
        .captures_iter(sql)
        .map(|c| c[1].to_ascii_lowercase())
        .collect()
}

pub(crate) fn classify_sqlite_error(err: &rusqlite::Error) -> StoreErrorKind {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            rusqlite::ErrorCode::ConstraintViolation => StoreErrorKind::Constraint,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                StoreErrorKind::Io
            }
            _ => StoreErrorKind::Schema,
        },
        rusqlite::Error::InvalidColumnName(_) | rusqlite::Error::InvalidColumnType(..) => {
            StoreErrorKind::Schema
        }
        _ => StoreErrorKind::Schema,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_simple_select() {
        let tables = tables_touched_by("SELECT * FROM phases WHERE execution_id = ?1");
        assert!(tables.contains("phases"));
    }

    #[test]
    fn extracts_join_targets() {
        let tables = tables_touched_by(
            "SELECT a.id FROM agent_runs a JOIN tool_calls t ON t.agent_run_id = a.id",
        );
        assert!(tables.contains("agent_runs"));
        assert!(tables.contains("tool_calls"));
    }

    #[test]
    fn extracts_insert_and_update() {
        let tables = tables_touched_by("INSERT INTO state_entries (execution_id) VALUES (?1)");
        assert!(tables.contains("state_entries"));
        let tables = tables_touched_by("UPDATE phases SET status = ?1 WHERE id = ?2");
        assert!(tables.contains("phases"));
    }

    #[test]
    fn unparseable_sql_yields_empty_set() {
        let tables = tables_touched_by("garbage not sql");
        assert!(tables.is_empty());
    }
}
