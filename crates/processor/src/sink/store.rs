//! Storage collaborator
//!
//! Two logical tables are written: raw trades keyed by
//! `symbol/partition/offset/entry`, and minute aggregates keyed by
//! `symbol/window_end`. Every write is an upsert, so replaying a batch
//! overwrites rows with identical values instead of duplicating them.

use crate::error::{SinkResult, SinkWriteError, StateError};
use crate::state::StateBackend;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Logical output tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// Raw trades
    Trades,
    /// Per-minute aggregates
    MinuteTrades,
}

impl Table {
    /// Table name; also the stream id of the path writing it
    pub fn name(&self) -> &'static str {
        match self {
            Table::Trades => "trades",
            Table::MinuteTrades => "minute_trades",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A keyed row ready to be written
pub type Row = (String, Value);

/// Storage that provides per-key atomic upsert
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Insert or overwrite one row
    async fn upsert(&self, table: Table, key: &str, row: &Value) -> SinkResult<()>;

    /// Insert or overwrite a batch of rows
    ///
    /// Implementations may apply the batch atomically; the default writes rows
    /// one at a time, which is still safe to retry.
    async fn upsert_batch(&self, table: Table, rows: &[Row]) -> SinkResult<()> {
        for (key, row) in rows {
            self.upsert(table, key, row).await?;
        }
        Ok(())
    }

    /// Read one row
    async fn get(&self, table: Table, key: &str) -> SinkResult<Option<Value>>;

    /// Number of rows in a table
    async fn count(&self, table: Table) -> SinkResult<usize>;
}

/// Table store held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryTableStore {
    rows: Arc<DashMap<(Table, String), Value>>,
    upserts: Arc<AtomicU64>,
}

impl MemoryTableStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows of a table, ordered by key
    pub fn rows(&self, table: Table) -> BTreeMap<String, Value> {
        self.rows
            .iter()
            .filter(|entry| entry.key().0 == table)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect()
    }

    /// Total upserts applied, including overwrites
    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn upsert(&self, table: Table, key: &str, row: &Value) -> SinkResult<()> {
        self.rows.insert((table, key.to_string()), row.clone());
        self.upserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, table: Table, key: &str) -> SinkResult<Option<Value>> {
        Ok(self
            .rows
            .get(&(table, key.to_string()))
            .map(|row| row.value().clone()))
    }

    async fn count(&self, table: Table) -> SinkResult<usize> {
        Ok(self.rows.iter().filter(|e| e.key().0 == table).count())
    }
}

/// Table store layered on a [`StateBackend`]
///
/// Rows are stored as JSON under `keyspace/table/key`.
pub struct BackendTableStore<B: StateBackend> {
    backend: B,
    keyspace: String,
}

impl<B: StateBackend> BackendTableStore<B> {
    /// Create a store writing under `keyspace`
    pub fn new(backend: B, keyspace: impl Into<String>) -> Self {
        Self {
            backend,
            keyspace: keyspace.into(),
        }
    }

    /// The underlying backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn prefix(&self, table: Table) -> String {
        format!("{}/{}/", self.keyspace, table.name())
    }

    fn storage_key(&self, table: Table, key: &str) -> Vec<u8> {
        format!("{}{}", self.prefix(table), key).into_bytes()
    }

    fn encode(table: Table, row: &Value) -> SinkResult<Vec<u8>> {
        serde_json::to_vec(row).map_err(|e| SinkWriteError::Permanent {
            table: table.name().to_string(),
            reason: e.to_string(),
        })
    }
}

fn backend_error(table: Table, err: StateError) -> SinkWriteError {
    match err {
        StateError::StorageError { .. } => SinkWriteError::Transient {
            table: table.name().to_string(),
            reason: err.to_string(),
        },
        other => SinkWriteError::Permanent {
            table: table.name().to_string(),
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl<B: StateBackend> TableStore for BackendTableStore<B> {
    async fn upsert(&self, table: Table, key: &str, row: &Value) -> SinkResult<()> {
        let value = Self::encode(table, row)?;
        self.backend
            .put(&self.storage_key(table, key), &value)
            .await
            .map_err(|e| backend_error(table, e))
    }

    async fn upsert_batch(&self, table: Table, rows: &[Row]) -> SinkResult<()> {
        let entries = rows
            .iter()
            .map(|(key, row)| Ok((self.storage_key(table, key), Self::encode(table, row)?)))
            .collect::<SinkResult<Vec<_>>>()?;

        trace!(table = %table, rows = entries.len(), "Writing batch to backend");
        self.backend
            .put_batch(&entries)
            .await
            .map_err(|e| backend_error(table, e))
    }

    async fn get(&self, table: Table, key: &str) -> SinkResult<Option<Value>> {
        let bytes = self
            .backend
            .get(&self.storage_key(table, key))
            .await
            .map_err(|e| backend_error(table, e))?;

        bytes
            .map(|b| serde_json::from_slice(&b))
            .transpose()
            .map_err(|e| SinkWriteError::Permanent {
                table: table.name().to_string(),
                reason: format!("stored row is not valid JSON: {}", e),
            })
    }

    async fn count(&self, table: Table) -> SinkResult<usize> {
        self.backend
            .list_keys(self.prefix(table).as_bytes())
            .await
            .map(|keys| keys.len())
            .map_err(|e| backend_error(table, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MemoryStateBackend, SledConfig, SledStateBackend};
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_upsert_overwrites() {
        let store = MemoryTableStore::new();
        store
            .upsert(Table::Trades, "AAA/0/7/0", &json!({"price": 100.0}))
            .await
            .unwrap();
        store
            .upsert(Table::Trades, "AAA/0/7/0", &json!({"price": 100.0}))
            .await
            .unwrap();

        assert_eq!(store.count(Table::Trades).await.unwrap(), 1);
        assert_eq!(store.count(Table::MinuteTrades).await.unwrap(), 0);
        assert_eq!(store.upsert_count(), 2);
    }

    #[tokio::test]
    async fn test_backend_store_namespaces_tables() {
        let backend = MemoryStateBackend::new();
        let store = BackendTableStore::new(backend.clone(), "market");
        store
            .upsert_batch(
                Table::MinuteTrades,
                &[("AAA/60000".to_string(), json!({"total": 2}))],
            )
            .await
            .unwrap();

        assert!(backend
            .contains(b"market/minute_trades/AAA/60000")
            .await
            .unwrap());
        assert_eq!(store.count(Table::MinuteTrades).await.unwrap(), 1);
        assert_eq!(store.count(Table::Trades).await.unwrap(), 0);
        assert_eq!(
            store.get(Table::MinuteTrades, "AAA/60000").await.unwrap(),
            Some(json!({"total": 2}))
        );
    }

    #[tokio::test]
    async fn test_sled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");

        {
            let backend = SledStateBackend::open(SledConfig::new(&path)).await.unwrap();
            let store = BackendTableStore::new(backend, "market");
            store
                .upsert_batch(Table::Trades, &[("BBB/0/1/0".to_string(), json!({"v": 1}))])
                .await
                .unwrap();
        }

        let backend = SledStateBackend::open(SledConfig::new(&path)).await.unwrap();
        let store = BackendTableStore::new(backend, "market");
        assert_eq!(
            store.get(Table::Trades, "BBB/0/1/0").await.unwrap(),
            Some(json!({"v": 1}))
        );
    }

    #[test]
    fn test_table_names() {
        assert_eq!(Table::Trades.to_string(), "trades");
        assert_eq!(Table::MinuteTrades.name(), "minute_trades");
    }
}
