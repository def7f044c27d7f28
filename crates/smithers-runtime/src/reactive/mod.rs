//! Memoised queries that recompute when their dependent tables change.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use smithers_common::errors::StoreError;

use crate::store::{tables_touched_by, Row, SqlValue, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueryId(u64);

type RecomputeFn = dyn Fn() -> Result<Option<serde_json::Value>, StoreError> + Send + Sync;
type SubscriberFn = dyn Fn(&Option<serde_json::Value>) + Send + Sync;

struct QueryEntry {
    tables: BTreeSet<String>,
    recompute: Arc<RecomputeFn>,
    last_value: Option<serde_json::Value>,
    subscribers: Vec<Arc<SubscriberFn>>,
}

/// Owns a live set of registered queries and drives recomputation off `Store`
/// notifications. One instance is created per Execution and fed every table
/// mutation the driver's Store emits.
pub struct ReactiveQueries {
    store: Arc<dyn Store>,
    known_tables: BTreeSet<String>,
    entries: Mutex<BTreeMap<QueryId, QueryEntry>>,
    next_id: AtomicU64,
    draining: AtomicBool,
    pending: Mutex<VecDeque<BTreeSet<String>>>,
}

impl ReactiveQueries {
    pub fn new(store: Arc<dyn Store>, known_tables: &[&str]) -> Self {
        Self {
            store,
            known_tables: known_tables.iter().map(|t| t.to_ascii_lowercase()).collect(),
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            draining: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Registers a query, eagerly computing its initial value. `map_row` projects
    /// a `Row` into the caller's type; the projected value is what subscribers see
    /// and what deep-equality is compared against.
    pub fn register<T, F>(&self, sql: impl Into<String>, params: Vec<SqlValue>, map_row: F) -> QueryId
    where
        T: Serialize + 'static,
        F: Fn(&Row) -> T + Send + Sync + 'static,
    {
        let sql = sql.into();
        let mut tables = tables_touched_by(&sql);
        if tables.is_empty() {
            tables = self.known_tables.clone();
        }
        let store = self.store.clone();
        let recompute: Arc<RecomputeFn> = Arc::new(move || {
            let row = store.query_one(&sql, &params)?;
            Ok(row.map(|r| serde_json::to_value(map_row(&r)).expect("reactive query result must serialize")))
        });
        let initial = recompute().unwrap_or(None);
        let id = QueryId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.entries.lock().expect("reactive entries mutex poisoned").insert(
            id,
            QueryEntry {
                tables,
                recompute,
                last_value: initial,
                subscribers: Vec::new(),
            },
        );
        id
    }

    pub fn unregister(&self, id: QueryId) {
        self.entries.lock().expect("reactive entries mutex poisoned").remove(&id);
    }

    /// Current cached value, deserialised as `T`. Returns `None` if the query has
    /// never matched a row, or `id` is unknown.
    pub fn current<T: DeserializeOwned>(&self, id: QueryId) -> Option<T> {
        let entries = self.entries.lock().expect("reactive entries mutex poisoned");
        let value = entries.get(&id)?.last_value.clone()?;
        serde_json::from_value(value).ok()
    }

    /// Subscribes to changes in `id`'s value. Subscribers of one query are
    /// invoked in registration order; must be non-blocking.
    pub fn subscribe<F>(&self, id: QueryId, callback: F)
    where
        F: Fn(&Option<serde_json::Value>) + Send + Sync + 'static,
    {
        if let Some(entry) = self.entries.lock().expect("reactive entries mutex poisoned").get_mut(&id) {
            entry.subscribers.push(Arc::new(callback));
        }
    }

    /// One-shot convenience for a single scalar, no persistent registration.
    pub fn query_value<T: DeserializeOwned>(
        store: &dyn Store,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<T>, StoreError> {
        let row = store.query_one(sql, params)?;
        let Some(row) = row else { return Ok(None) };
        let Some(value) = row.first() else { return Ok(None) };
        Ok(serde_json::from_value(value.to_json()).ok())
    }

    /// Entry point fed by the Store's post-commit notification. Re-entrant calls
    /// (a subscriber writes to the Store) are queued as a fresh batch rather than
    /// run synchronously inside the current one.
    pub fn handle_store_notification(&self, tables: &BTreeSet<String>) {
        if tables.is_empty() {
            return;
        }
        if self.draining.swap(true, Ordering::SeqCst) {
            self.pending.lock().expect("pending mutex poisoned").push_back(tables.clone());
            return;
        }
        self.drain_batch(tables);
        loop {
            let next = self.pending.lock().expect("pending mutex poisoned").pop_front();
            match next {
                Some(batch) => self.drain_batch(&batch),
                None => break,
            }
        }
        self.draining.store(false, Ordering::SeqCst);
    }

    fn drain_batch(&self, tables: &BTreeSet<String>) {
        let affected: Vec<QueryId> = {
            let entries = self.entries.lock().expect("reactive entries mutex poisoned");
            entries
                .iter()
                .filter(|(_, e)| e.tables.intersection(tables).next().is_some())
                .map(|(id, _)| *id)
                .collect()
        };
        for id in affected {
            self.recompute_and_notify(id);
        }
    }

    fn recompute_and_notify(&self, id: QueryId) {
        let (recompute, old_value) = {
            let entries = self.entries.lock().expect("reactive entries mutex poisoned");
            let Some(entry) = entries.get(&id) else { return };
            (entry.recompute.clone(), entry.last_value.clone())
        };
        let new_value = match recompute() {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(query_id = id.0, error = %err, "reactive query recompute failed");
                return;
            }
        };
        if new_value == old_value {
            return;
        }
        let subscribers = {
            let mut entries = self.entries.lock().expect("reactive entries mutex poisoned");
            let Some(entry) = entries.get_mut(&id) else { return };
            entry.last_value = new_value.clone();
            entry.subscribers.clone()
        };
        for subscriber in subscribers {
            subscriber(&new_value);
        }
    }
}
