//! `Ctx` — the handle threaded through `render()` instead of per-call hooks.
//! One `Ctx` is built per Execution and lives for the RalphLoop's whole
//! lifetime; author code reads and writes state through it instead of
//! holding its own connection.

use std::sync::Arc;

use chrono::Utc;
use smithers_common::errors::StoreError;
use smithers_common::model::{StateEntry, StateTransition};
use smithers_runtime::reactive::ReactiveQueries;
use smithers_runtime::store::{tables_touched_by, SqlValue, Store};

/// Durable key/value state scoped to one Execution, backing `state.get` and
/// `state.set`. Every write appends a `StateTransition` row
/// so `history()` can replay how a key evolved, mirroring the append-only log
/// the reactive layer and SuperSmithers both read from.
pub struct StateApi<'a> {
    store: &'a dyn Store,
    execution_id: &'a str,
}

impl<'a> StateApi<'a> {
    fn new(store: &'a dyn Store, execution_id: &'a str) -> Self {
        Self { store, execution_id }
    }

    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let row = self.store.query_one(
            "SELECT value_json FROM state_entries WHERE execution_id = ?1 AND key = ?2",
            &[self.execution_id.into(), key.into()],
        )?;
        Ok(row
            .and_then(|r| r.get_json("value_json"))
            .and_then(|v| serde_json::from_value(v).ok()))
    }

    pub fn has(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .store
            .query_one(
                "SELECT 1 FROM state_entries WHERE execution_id = ?1 AND key = ?2",
                &[self.execution_id.into(), key.into()],
            )?
            .is_some())
    }

    /// Upserts `key`, appending a `state_transitions` row recording the prior
    /// value (`None` on first write). `trigger` names what caused the write
    /// (e.g. `"agent_run:abc"`) for later inspection via `history()`.
    pub fn set(&self, key: &str, value: impl serde::Serialize, trigger: Option<&str>) -> Result<(), StoreError> {
        let new_json = serde_json::to_value(value).expect("state value must serialize");
        let now = Utc::now().to_rfc3339();
        let old: Option<serde_json::Value> = self
            .store
            .query_one(
                "SELECT value_json FROM state_entries WHERE execution_id = ?1 AND key = ?2",
                &[self.execution_id.into(), key.into()],
            )?
            .and_then(|r| r.get_json("value_json"));

        self.store.run(
            "INSERT INTO state_entries (execution_id, key, value_json, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(execution_id, key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            &[
                self.execution_id.into(),
                key.into(),
                new_json.clone().into(),
                now.clone().into(),
            ],
        )?;
        self.store.run(
            "INSERT INTO state_transitions (execution_id, key, old_json, new_json, trigger, at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            &[
                self.execution_id.into(),
                key.into(),
                old.into(),
                new_json.into(),
                trigger.into(),
                now.into(),
            ],
        )?;
        Ok(())
    }

    /// Convenience for setting several keys under one `trigger`.
    pub fn set_many(&self, entries: &[(&str, serde_json::Value)], trigger: Option<&str>) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.set(key, value.clone(), trigger)?;
        }
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let old: Option<serde_json::Value> = self
            .store
            .query_one(
                "SELECT value_json FROM state_entries WHERE execution_id = ?1 AND key = ?2",
                &[self.execution_id.into(), key.into()],
            )?
            .and_then(|r| r.get_json("value_json"));
        if old.is_none() {
            return Ok(());
        }
        self.store.run(
            "DELETE FROM state_entries WHERE execution_id = ?1 AND key = ?2",
            &[self.execution_id.into(), key.into()],
        )?;
        self.store.run(
            "INSERT INTO state_transitions (execution_id, key, old_json, new_json, trigger, at) VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
            &[self.execution_id.into(), key.into(), old.into(), SqlValue::Null, now.into()],
        )?;
        Ok(())
    }

    /// Full transition history for `key`, oldest first.
    pub fn history(&self, key: &str) -> Result<Vec<StateTransition>, StoreError> {
        let rows = self.store.query(
            "SELECT execution_id, key, old_json, new_json, trigger, at FROM state_transitions
             WHERE execution_id = ?1 AND key = ?2 ORDER BY id ASC",
            &[self.execution_id.into(), key.into()],
        )?;
        Ok(rows
            .iter()
            .map(|r| StateTransition {
                execution_id: r.get_text("execution_id").unwrap_or_default().to_string(),
                key: r.get_text("key").unwrap_or_default().to_string(),
                old_json: r.get_json("old_json"),
                new_json: r.get_json("new_json"),
                trigger: r.get_text("trigger").map(str::to_string),
                at: r
                    .get_text("at")
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
            })
            .collect())
    }

    /// Every currently-set key/value pair, for snapshotting or debugging.
    pub fn all(&self) -> Result<Vec<StateEntry>, StoreError> {
        let rows = self.store.query(
            "SELECT execution_id, key, value_json, updated_at FROM state_entries WHERE execution_id = ?1 ORDER BY key ASC",
            &[self.execution_id.into()],
        )?;
        Ok(rows
            .iter()
            .map(|r| StateEntry {
                execution_id: r.get_text("execution_id").unwrap_or_default().to_string(),
                key: r.get_text("key").unwrap_or_default().to_string(),
                value_json: r.get_json("value_json").unwrap_or(serde_json::Value::Null),
                updated_at: r
                    .get_text("updated_at")
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
            })
            .collect())
    }
}

/// The handle passed to every `render()` call. Wraps the same
/// `Store`/`ReactiveQueries` the RalphLoop itself drives, so author code and
/// the engine observe one consistent view.
pub struct Ctx {
    store: Arc<dyn Store>,
    reactive: Arc<ReactiveQueries>,
    execution_id: String,
}

impl Ctx {
    pub fn new(store: Arc<dyn Store>, reactive: Arc<ReactiveQueries>, execution_id: impl Into<String>) -> Self {
        Self {
            store,
            reactive,
            execution_id: execution_id.into(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn reactive(&self) -> &ReactiveQueries {
        &self.reactive
    }

    pub fn state(&self) -> StateApi<'_> {
        StateApi::new(self.store.as_ref(), &self.execution_id)
    }

    /// Runs `sql` and notifies the reactive layer as if the Store itself had
    /// issued the notification. Author code that writes custom tables through
    /// `ctx.store()` directly should call this afterwards; `state().set()`
    /// above already does so implicitly via the RalphLoop's own subscription
    /// on `state_entries`/`state_transitions`.
    pub fn notify_write(&self, sql: &str) {
        self.reactive.handle_store_notification(&tables_touched_by(sql));
    }
}
