//! Source collaborators
//!
//! The engine reads from a partitioned, at-least-once log. A
//! [`SourceConnector`] lists partitions and opens one [`PartitionSource`] per
//! shard; each partition source polls batches of [`RawEvent`]s and accepts
//! offset commits for its own partition.
//!
//! - [`memory`]: in-process log with retention and fault injection
//! - [`kafka`]: one rdkafka consumer per assigned partition

pub mod kafka;
pub mod memory;

pub use kafka::KafkaConnector;
pub use memory::{MemoryConnector, MemoryLog};

use crate::error::{ProcessorError, Result, SourceResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tradeflow_types::{PartitionId, RawEvent};

/// Where consumption starts on a partition without a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartingOffsets {
    /// Oldest retained offset
    Earliest,
    /// Only events appended after start
    Latest,
    /// Refuse to start without a checkpoint
    Checkpoint,
}

impl Default for StartingOffsets {
    fn default() -> Self {
        StartingOffsets::Earliest
    }
}

/// Resolved start position of one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Earliest,
    Latest,
    Offset(u64),
}

impl StartingOffsets {
    /// Resolve the start of a partition given its committed resume offset
    ///
    /// A checkpointed offset always wins over the policy.
    pub fn resolve(self, committed: Option<u64>, partition: PartitionId) -> Result<StartPosition> {
        match (committed, self) {
            (Some(offset), _) => Ok(StartPosition::Offset(offset)),
            (None, StartingOffsets::Earliest) => Ok(StartPosition::Earliest),
            (None, StartingOffsets::Latest) => Ok(StartPosition::Latest),
            (None, StartingOffsets::Checkpoint) => Err(ProcessorError::Configuration {
                source: format!(
                    "starting_offsets is 'checkpoint' but partition {} has no checkpoint",
                    partition
                )
                .into(),
            }),
        }
    }
}

/// Source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Comma-separated bootstrap servers
    #[serde(default = "default_brokers")]
    pub brokers: String,

    /// Topic to consume
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Application/consumer identity
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Start position policy for partitions without a checkpoint
    #[serde(default)]
    pub starting_offsets: StartingOffsets,

    /// Fail the stream on gaps in the log instead of skipping them
    #[serde(default)]
    pub fail_on_data_loss: bool,

    /// How long a poll waits for the first event (milliseconds)
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,

    /// Extra client properties passed through verbatim
    #[serde(default)]
    pub extra_config: HashMap<String, String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            topic: default_topic(),
            group_id: default_group_id(),
            starting_offsets: StartingOffsets::default(),
            fail_on_data_loss: false,
            poll_timeout_ms: default_poll_timeout(),
            extra_config: HashMap::new(),
        }
    }
}

impl SourceConfig {
    /// Validate the source configuration
    pub fn validate(&self) -> Result<()> {
        if self.brokers.trim().is_empty() {
            return Err(ProcessorError::Configuration {
                source: "source brokers must not be empty".into(),
            });
        }
        if self.topic.trim().is_empty() {
            return Err(ProcessorError::Configuration {
                source: "source topic must not be empty".into(),
            });
        }
        if self.group_id.trim().is_empty() {
            return Err(ProcessorError::Configuration {
                source: "source group_id must not be empty".into(),
            });
        }
        if self.poll_timeout_ms == 0 {
            return Err(ProcessorError::Configuration {
                source: "poll_timeout_ms must be greater than 0".into(),
            });
        }
        Ok(())
    }

    /// Get poll timeout as Duration
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_topic() -> String {
    "market".to_string()
}

fn default_group_id() -> String {
    "tradeflow".to_string()
}

fn default_poll_timeout() -> u64 {
    1_000
}

/// Lists partitions and opens per-partition readers
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Partitions of the configured topic
    async fn partitions(&self) -> SourceResult<Vec<PartitionId>>;

    /// Open a reader positioned at `start`
    async fn open(
        &self,
        partition: PartitionId,
        start: StartPosition,
    ) -> SourceResult<Box<dyn PartitionSource>>;
}

/// Reader of a single partition, owned by one shard
#[async_trait]
pub trait PartitionSource: Send {
    /// Partition this reader consumes
    fn partition(&self) -> PartitionId;

    /// Next offset this reader will return
    fn position(&self) -> u64;

    /// Up to `max_batch` events in offset order; empty if none arrived in time
    async fn poll(&mut self, max_batch: usize) -> SourceResult<Vec<RawEvent>>;

    /// Record that every offset below `next_offset` is fully processed
    async fn commit_offsets(&mut self, next_offset: u64) -> SourceResult<()>;
}
