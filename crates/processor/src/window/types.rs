//! Window types and bounds
//!
//! Windows are identified by symbol plus their half-open millisecond range.
//! Millisecond integers are the working representation; [`WindowBounds`]
//! converts to timestamps for output and display.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Time bounds of a window, start inclusive, end exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowBounds {
    /// Start time of the window (inclusive)
    pub start: DateTime<Utc>,
    /// End time of the window (exclusive)
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    /// Check if a timestamp falls within this window
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

impl fmt::Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} - {})",
            self.start.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.end.format("%Y-%m-%d %H:%M:%S%.3f")
        )
    }
}

/// Key of one per-symbol tumbling window
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    /// Instrument symbol
    pub symbol: String,
    /// Window start in epoch milliseconds (inclusive)
    pub start_ms: i64,
    /// Window end in epoch milliseconds (exclusive)
    pub end_ms: i64,
}

impl WindowKey {
    /// Create a window key
    pub fn new(symbol: impl Into<String>, start_ms: i64, end_ms: i64) -> Self {
        Self {
            symbol: symbol.into(),
            start_ms,
            end_ms,
        }
    }

    /// Check if an epoch-millisecond timestamp falls within this window
    pub fn contains_millis(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.start_ms && timestamp_ms < self.end_ms
    }

    /// Watermark at which this window closes
    pub fn close_at(&self, allowed_lateness_ms: i64) -> i64 {
        self.end_ms.saturating_add(allowed_lateness_ms)
    }

    /// Whether a close frontier has passed this window
    pub fn is_closed_by(&self, frontier: i64, allowed_lateness_ms: i64) -> bool {
        self.close_at(allowed_lateness_ms) <= frontier
    }

    /// Timestamp bounds, if representable
    pub fn bounds(&self) -> Option<WindowBounds> {
        Some(WindowBounds {
            start: DateTime::from_timestamp_millis(self.start_ms)?,
            end: DateTime::from_timestamp_millis(self.end_ms)?,
        })
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bounds() {
            Some(bounds) => write!(f, "{}{}", self.symbol, bounds),
            None => write!(f, "{}[{} - {})", self.symbol, self.start_ms, self.end_ms),
        }
    }
}
