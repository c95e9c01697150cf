//! In-memory state backend implementation
//!
//! This module provides an in-memory state backend using DashMap for
//! concurrent access. Nothing survives a restart; it backs the `memory`
//! storage mode and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::StateBackend;
use crate::error::StateResult;

/// Statistics about the memory state backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryBackendStats {
    /// Total number of entries
    pub total_entries: usize,
    /// Total bytes stored
    pub total_bytes: usize,
    /// Number of get operations
    pub get_count: u64,
    /// Number of put operations
    pub put_count: u64,
    /// Number of delete operations
    pub delete_count: u64,
}

#[derive(Debug, Default)]
struct Counters {
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
}

/// In-memory state backend using DashMap
///
/// Cloning shares the underlying map.
///
/// ## Example
///
/// ```rust,no_run
/// use processor::state::{MemoryStateBackend, StateBackend};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let backend = MemoryStateBackend::new();
///     backend.put(b"minute_trades/AAA/60000", b"row").await?;
///     assert_eq!(backend.stats().total_entries, 1);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStateBackend {
    data: Arc<DashMap<Vec<u8>, Vec<u8>>>,
    counters: Arc<Counters>,
}

impl MemoryStateBackend {
    /// Create a new in-memory state backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Get backend statistics
    pub fn stats(&self) -> MemoryBackendStats {
        MemoryBackendStats {
            total_entries: self.data.len(),
            total_bytes: self
                .data
                .iter()
                .map(|entry| entry.key().len() + entry.value().len())
                .sum(),
            get_count: self.counters.gets.load(Ordering::Relaxed),
            put_count: self.counters.puts.load(Ordering::Relaxed),
            delete_count: self.counters.deletes.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of every entry
    pub fn snapshot(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        trace!("Getting key: {:?}", key);
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.data.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> StateResult<()> {
        trace!("Putting key: {:?}, value size: {} bytes", key, value.len());
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        self.data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StateResult<()> {
        trace!("Deleting key: {:?}", key);
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.data.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &[u8]) -> StateResult<Vec<Vec<u8>>> {
        Ok(self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn clear(&self) -> StateResult<()> {
        debug!("Clearing all state");
        self.data.clear();
        Ok(())
    }

    async fn count(&self) -> StateResult<usize> {
        Ok(self.data.len())
    }

    async fn contains(&self, key: &[u8]) -> StateResult<bool> {
        Ok(self.data.contains_key(key))
    }
}
