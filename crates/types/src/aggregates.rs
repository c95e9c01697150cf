//! Finalized window aggregates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-symbol, per-window aggregate as written to the `minute_trades` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteAggregate {
    /// Instrument symbol
    pub symbol: String,
    /// End of the window the aggregate covers
    pub event_time: DateTime<Utc>,
    /// Mean trade price over the window
    pub avg_price: f64,
    /// Number of trades in the window
    pub total: u64,
    /// Highest source offset that contributed to the window
    pub offset: u64,
}

impl MinuteAggregate {
    /// Natural key of the aggregate in the `minute_trades` table
    pub fn natural_key(&self) -> String {
        format!("{}/{}", self.symbol, self.event_time.timestamp_millis())
    }
}
