#![allow(dead_code)]

//! In-memory remote store double with a call log.
//!
//! Behaves like the real backend: assigns server ids to id-less upsert rows,
//! echoes stored rows back in input order, and applies id filters to deletes.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use rollcall_core::remote::{Filter, RemoteError, RemoteStore};
use rollcall_core::store::Collection;
use rollcall_core::{MemoryStore, StaticSessionProvider, SyncEngine};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Select { collection: String },
    Upsert { collection: String, rows: usize },
    Delete { collection: String, ids: Vec<String> },
}

#[derive(Default)]
pub struct MockRemote {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    calls: Mutex<Vec<RemoteCall>>,
    failing: AtomicBool,
    next_id: AtomicU64,
}

fn matches_filter(row: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::All => true,
        Filter::Eq(column, value) => row
            .get(*column)
            .and_then(Value::as_str)
            .is_some_and(|v| v == value),
        Filter::AnyOf(column, values) => row
            .get(*column)
            .and_then(Value::as_str)
            .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
    }
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put rows into a table directly, as if another device had synced them.
    pub async fn seed(&self, collection: Collection, rows: Vec<Value>) {
        self.tables
            .lock()
            .await
            .entry(collection.remote_table().to_string())
            .or_default()
            .extend(rows);
    }

    pub async fn table(&self, collection: Collection) -> Vec<Value> {
        self.tables
            .lock()
            .await
            .get(collection.remote_table())
            .cloned()
            .unwrap_or_default()
    }

    pub async fn table_ids(&self, collection: Collection) -> Vec<String> {
        let mut ids: Vec<String> = self
            .table(collection)
            .await
            .iter()
            .filter_map(|row| row.get("id").and_then(Value::as_str).map(str::to_string))
            .collect();
        ids.sort();
        ids
    }

    pub async fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// Sizes of upsert batches sent to one collection, in call order.
    pub async fn upsert_batches(&self, collection: Collection) -> Vec<usize> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                RemoteCall::Upsert { collection: c, rows }
                    if c == collection.remote_table() =>
                {
                    Some(*rows)
                }
                _ => None,
            })
            .collect()
    }

    /// Ids targeted by delete calls against one collection, flattened.
    pub async fn deleted_ids(&self, collection: Collection) -> Vec<String> {
        let mut ids: Vec<String> = self
            .calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                RemoteCall::Delete { collection: c, ids }
                    if c == collection.remote_table() =>
                {
                    Some(ids.clone())
                }
                _ => None,
            })
            .flatten()
            .collect();
        ids.sort();
        ids
    }

    /// When failing, every call returns a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    fn assign_id(&self, collection: Collection) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", collection.remote_table(), n)
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn select(
        &self,
        _token: &str,
        collection: Collection,
        filter: Filter,
    ) -> Result<Vec<Value>, RemoteError> {
        self.check_reachable()?;
        self.calls.lock().await.push(RemoteCall::Select {
            collection: collection.remote_table().to_string(),
        });
        Ok(self
            .tables
            .lock()
            .await
            .get(collection.remote_table())
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches_filter(row, &filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert(
        &self,
        _token: &str,
        collection: Collection,
        rows: Vec<Value>,
    ) -> Result<Vec<Value>, RemoteError> {
        self.check_reachable()?;
        self.calls.lock().await.push(RemoteCall::Upsert {
            collection: collection.remote_table().to_string(),
            rows: rows.len(),
        });

        let mut tables = self.tables.lock().await;
        let table = tables
            .entry(collection.remote_table().to_string())
            .or_default();
        let mut returned = Vec::with_capacity(rows.len());
        for mut row in rows {
            let id = match row.get("id").and_then(Value::as_str) {
                Some(id) => id.to_string(),
                None => {
                    let id = self.assign_id(collection);
                    if let Some(map) = row.as_object_mut() {
                        map.insert("id".to_string(), Value::String(id.clone()));
                    }
                    id
                }
            };
            match table
                .iter_mut()
                .find(|stored| stored.get("id").and_then(Value::as_str) == Some(id.as_str()))
            {
                Some(stored) => *stored = row.clone(),
                None => table.push(row.clone()),
            }
            returned.push(row);
        }
        Ok(returned)
    }

    async fn delete(
        &self,
        _token: &str,
        collection: Collection,
        filter: Filter,
    ) -> Result<(), RemoteError> {
        self.check_reachable()?;
        let mut tables = self.tables.lock().await;
        let table = tables
            .entry(collection.remote_table().to_string())
            .or_default();
        let mut removed = Vec::new();
        table.retain(|row| {
            if matches_filter(row, &filter) {
                if let Some(id) = row.get("id").and_then(Value::as_str) {
                    removed.push(id.to_string());
                }
                false
            } else {
                true
            }
        });
        removed.sort();
        self.calls.lock().await.push(RemoteCall::Delete {
            collection: collection.remote_table().to_string(),
            ids: removed,
        });
        Ok(())
    }
}

fn contains_temp_id(value: &Value) -> bool {
    match value {
        Value::String(s) => s.starts_with("local-"),
        Value::Array(items) => items.iter().any(contains_temp_id),
        Value::Object(map) => map.values().any(contains_temp_id),
        _ => false,
    }
}

/// Assert that no entity collection still references a temporary id.
pub async fn assert_no_temp_ids(store: &MemoryStore) {
    use rollcall_core::LocalStore;
    for collection in Collection::ALL {
        if let Some(value) = store.get(collection.storage_key()).await.expect("store get") {
            assert!(
                !contains_temp_id(&value),
                "{} still references a temporary id: {value}",
                collection
            );
        }
    }
}

/// Raw JSON of one persisted collection.
pub async fn collection_json(store: &MemoryStore, collection: Collection) -> Value {
    use rollcall_core::LocalStore;
    store
        .get(collection.storage_key())
        .await
        .expect("store get")
        .unwrap_or(Value::Array(Vec::new()))
}

/// Engine wired to a shared store and mock remote with a signed-in session.
pub fn engine_signed_in(
    store: Arc<MemoryStore>,
    remote: Arc<MockRemote>,
    user_id: &str,
) -> SyncEngine {
    SyncEngine::new(
        store,
        remote,
        Arc::new(StaticSessionProvider::signed_in(user_id, "token")),
    )
}

pub fn engine_signed_out(store: Arc<MemoryStore>, remote: Arc<MockRemote>) -> SyncEngine {
    SyncEngine::new(store, remote, Arc::new(StaticSessionProvider::signed_out()))
}
