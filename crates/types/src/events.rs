//! Source events and decoded trade records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a source partition (shard)
pub type PartitionId = u32;

/// An undecoded event as delivered by the source
///
/// Produced by the source collaborator and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Opaque binary payload
    pub payload: Vec<u8>,
    /// Offset of the event inside its partition
    pub source_offset: u64,
    /// Partition the event was read from
    pub source_partition: PartitionId,
}

impl RawEvent {
    /// Create a new raw event
    pub fn new(payload: Vec<u8>, source_partition: PartitionId, source_offset: u64) -> Self {
        Self {
            payload,
            source_offset,
            source_partition,
        }
    }
}

/// A single trade decoded from a [`RawEvent`]
///
/// One payload may fan out into several records; siblings share the
/// partition and offset and are told apart by `entry_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Instrument symbol
    pub symbol: String,
    /// Trade price
    pub price: f64,
    /// Traded volume
    pub volume: f64,
    /// Event time of the trade
    pub event_time: DateTime<Utc>,
    /// Offset of the payload this record was decoded from
    pub source_offset: u64,
    /// Partition of the payload this record was decoded from
    pub source_partition: PartitionId,
    /// Position of the entry inside its payload
    pub entry_index: u32,
    /// Trade conditions reported by the venue
    #[serde(default)]
    pub conditions: Vec<String>,
}

impl TradeRecord {
    /// Natural key of the record in the raw trades table
    pub fn natural_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.symbol, self.source_partition, self.source_offset, self.entry_index
        )
    }

    /// Event time in milliseconds since epoch
    pub fn event_time_millis(&self) -> i64 {
        self.event_time.timestamp_millis()
    }
}

impl fmt::Display for TradeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} p={} v={} [{}:{}#{}]",
            self.symbol,
            self.event_time.format("%Y-%m-%dT%H:%M:%S%.3f"),
            self.price,
            self.volume,
            self.source_partition,
            self.source_offset,
            self.entry_index
        )
    }
}
