//! Window assignment
//!
//! Maps an event time onto the tumbling window grid by floor division, so
//! timestamps before the epoch land in the window that contains them.

use super::types::WindowKey;
use std::time::Duration;
use tradeflow_types::TradeRecord;

/// Tumbling window assigner
///
/// Creates fixed-size, non-overlapping windows. Each event belongs to exactly
/// one window.
///
/// # Example
/// ```text
/// Size: 60s
/// Windows: [00:00-01:00) [01:00-02:00) [02:00-03:00)
/// Events:      e1  e2         e3             e4
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TumblingWindowAssigner {
    /// Size of each window in milliseconds
    size_ms: i64,
    /// Offset for window alignment in milliseconds
    offset_ms: i64,
}

impl TumblingWindowAssigner {
    /// Create a new tumbling window assigner
    ///
    /// Sizes below one millisecond are raised to one millisecond.
    pub fn new(size: Duration) -> Self {
        Self {
            size_ms: i64::try_from(size.as_millis()).unwrap_or(i64::MAX).max(1),
            offset_ms: 0,
        }
    }

    /// Create a tumbling window assigner with an offset
    pub fn with_offset(mut self, offset: Duration) -> Self {
        self.offset_ms = i64::try_from(offset.as_millis()).unwrap_or(0) % self.size_ms;
        self
    }

    /// Window size in milliseconds
    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    /// Start of the window containing `timestamp_ms`
    pub fn window_start(&self, timestamp_ms: i64) -> i64 {
        let shifted = timestamp_ms.saturating_sub(self.offset_ms);
        shifted.div_euclid(self.size_ms) * self.size_ms + self.offset_ms
    }

    /// Window of a symbol containing `timestamp_ms`
    pub fn assign_millis(&self, symbol: &str, timestamp_ms: i64) -> WindowKey {
        let start = self.window_start(timestamp_ms);
        WindowKey::new(symbol, start, start.saturating_add(self.size_ms))
    }

    /// Window a trade record belongs to
    pub fn assign(&self, record: &TradeRecord) -> WindowKey {
        self.assign_millis(&record.symbol, record.event_time_millis())
    }
}
