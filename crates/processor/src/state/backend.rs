//! State backend trait definition
//!
//! This module defines the `StateBackend` trait that the durable table stores
//! are built on. The trait provides a simple byte-oriented key-value interface
//! with prefix listing and batched writes.

use async_trait::async_trait;

use crate::error::StateResult;

/// Core trait for state backend implementations
///
/// ## Implementation Requirements
///
/// Implementations must ensure:
///
/// - **Thread safety**: Concurrent access from multiple tasks
/// - **Atomicity**: Individual operations are atomic
/// - **Durability** (optional): Persistent backends should make `flush` durable
///
/// ## Example
///
/// ```rust,no_run
/// # use processor::state::{StateBackend, MemoryStateBackend};
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let backend = MemoryStateBackend::new();
/// backend.put(b"trades/AAA/0/7/0", b"row").await?;
///
/// match backend.get(b"trades/AAA/0/7/0").await? {
///     Some(value) => println!("Found: {:?}", value),
///     None => println!("Not found"),
/// }
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Retrieve a value for the given key
    ///
    /// Returns `Ok(None)` if the key does not exist.
    async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>>;

    /// Store a value for the given key, overwriting any existing value
    async fn put(&self, key: &[u8], value: &[u8]) -> StateResult<()>;

    /// Delete a key; deleting a non-existent key is not an error
    async fn delete(&self, key: &[u8]) -> StateResult<()>;

    /// List all keys with the given prefix. Empty prefix matches all keys.
    async fn list_keys(&self, prefix: &[u8]) -> StateResult<Vec<Vec<u8>>>;

    /// Store several entries
    ///
    /// The default writes entries one by one. Backends with native batches
    /// override this to apply the whole batch atomically.
    async fn put_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> StateResult<()> {
        for (key, value) in entries {
            self.put(key, value).await?;
        }
        Ok(())
    }

    /// Make previous writes durable
    async fn flush(&self) -> StateResult<()> {
        Ok(())
    }

    /// Clear all state from the backend
    async fn clear(&self) -> StateResult<()> {
        let keys = self.list_keys(b"").await?;
        for key in keys {
            self.delete(&key).await?;
        }
        Ok(())
    }

    /// Get the number of keys in the backend
    async fn count(&self) -> StateResult<usize> {
        Ok(self.list_keys(b"").await?.len())
    }

    /// Check if a key exists
    async fn contains(&self, key: &[u8]) -> StateResult<bool> {
        Ok(self.get(key).await?.is_some())
    }
}
