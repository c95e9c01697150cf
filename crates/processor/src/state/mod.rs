//! State management for stream processing
//!
//! This module provides:
//!
//! - **StateBackend Trait**: byte-oriented key-value interface the table stores build on
//! - **Backend Implementations**: in-memory ([`MemoryStateBackend`]) and persistent Sled
//!   ([`SledStateBackend`]) storage
//! - **Checkpoint Coordination**: durable per-path source progress that turns
//!   at-least-once delivery into exactly-once effect
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use processor::state::{CheckpointCoordinator, FileCheckpointStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(FileCheckpointStore::new("/tmp/checkpoint_trades"));
//!     let coordinator = CheckpointCoordinator::new("trades", store, Duration::from_secs(5));
//!
//!     if let Some(record) = coordinator.restore().await? {
//!         println!("Resuming from {:?}", record.offsets);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod checkpoint;
pub mod memory;
pub mod sled_backend;

// Re-export main types
pub use backend::StateBackend;
pub use checkpoint::{
    BatchProgress, CheckpointCoordinator, CheckpointRecord, CheckpointStats, CheckpointStore,
    FileCheckpointStore, MemoryCheckpointStore, PartitionProgress, SinkCommitToken,
};
pub use memory::MemoryStateBackend;
pub use sled_backend::{SledConfig, SledStateBackend};

pub use crate::error::StateResult;
