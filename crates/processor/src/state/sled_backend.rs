//! Sled-based persistent state backend
//!
//! This module provides a persistent state backend using the Sled embedded
//! database. It backs the `sled` storage mode so that table rows survive
//! restarts.

use async_trait::async_trait;
use sled::Db;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::backend::StateBackend;
use crate::error::{StateError, StateResult};

/// Configuration for the Sled backend
#[derive(Debug, Clone)]
pub struct SledConfig {
    /// Database directory
    pub path: PathBuf,
    /// Page cache capacity in bytes
    pub cache_capacity: u64,
    /// Flush after every batch write
    pub flush_on_batch: bool,
}

impl Default for SledConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/tradeflow_store"),
            cache_capacity: 128 * 1024 * 1024, // 128MB
            flush_on_batch: true,
        }
    }
}

impl SledConfig {
    /// Create a configuration for the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Set the page cache capacity
    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity = capacity;
        self
    }
}

/// Persistent state backend using Sled
pub struct SledStateBackend {
    db: Arc<Db>,
    config: SledConfig,
    flush_count: AtomicU64,
}

fn storage_error(details: String) -> StateError {
    StateError::StorageError {
        backend_type: "sled".to_string(),
        details,
    }
}

impl SledStateBackend {
    /// Open (or create) a database
    pub async fn open(config: SledConfig) -> StateResult<Self> {
        info!("Opening Sled database at {:?}", config.path);

        tokio::fs::create_dir_all(&config.path)
            .await
            .map_err(|e| storage_error(format!("Failed to create directory: {}", e)))?;

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_capacity)
            .open()
            .map_err(|e| storage_error(format!("Failed to open database: {}", e)))?;

        info!("Sled database opened successfully, {} keys", db.len());

        Ok(Self {
            db: Arc::new(db),
            config,
            flush_count: AtomicU64::new(0),
        })
    }

    /// Flush pending writes to disk, returning the bytes flushed
    pub async fn flush_to_disk(&self) -> StateResult<usize> {
        trace!("Flushing Sled database");
        let db = Arc::clone(&self.db);
        let flushed = tokio::task::spawn_blocking(move || db.flush())
            .await
            .map_err(|e| storage_error(format!("Flush task failed: {}", e)))?
            .map_err(|e| storage_error(format!("Flush failed: {}", e)))?;

        self.flush_count.fetch_add(1, Ordering::Relaxed);
        debug!("Flushed {} bytes to disk", flushed);
        Ok(flushed)
    }

    /// Number of completed flushes
    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Relaxed)
    }

    /// Database directory
    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

#[async_trait]
impl StateBackend for SledStateBackend {
    async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        trace!("Getting key from Sled: {:?}", key);
        self.db
            .get(key)
            .map(|value| value.map(|v| v.to_vec()))
            .map_err(|e| storage_error(format!("Get failed: {}", e)))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> StateResult<()> {
        trace!(
            "Putting key to Sled: {:?}, value size: {} bytes",
            key,
            value.len()
        );
        self.db
            .insert(key, value)
            .map(|_| ())
            .map_err(|e| storage_error(format!("Insert failed: {}", e)))
    }

    async fn delete(&self, key: &[u8]) -> StateResult<()> {
        self.db
            .remove(key)
            .map(|_| ())
            .map_err(|e| storage_error(format!("Remove failed: {}", e)))
    }

    async fn list_keys(&self, prefix: &[u8]) -> StateResult<Vec<Vec<u8>>> {
        self.db
            .scan_prefix(prefix)
            .keys()
            .map(|key| {
                key.map(|k| k.to_vec())
                    .map_err(|e| storage_error(format!("Scan failed: {}", e)))
            })
            .collect()
    }

    async fn put_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> StateResult<()> {
        let mut batch = sled::Batch::default();
        for (key, value) in entries {
            batch.insert(key.as_slice(), value.as_slice());
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| storage_error(format!("Batch failed: {}", e)))?;

        if self.config.flush_on_batch {
            self.flush_to_disk().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> StateResult<()> {
        self.flush_to_disk().await.map(|_| ())
    }

    async fn clear(&self) -> StateResult<()> {
        self.db
            .clear()
            .map_err(|e| storage_error(format!("Clear failed: {}", e)))
    }

    async fn count(&self) -> StateResult<usize> {
        Ok(self.db.len())
    }

    async fn contains(&self, key: &[u8]) -> StateResult<bool> {
        self.db
            .contains_key(key)
            .map_err(|e| storage_error(format!("Lookup failed: {}", e)))
    }
}
