//! Event-time watermark tracking
//!
//! The watermark of a stream is the largest event time observed so far minus a
//! fixed lateness tolerance. It only ever moves forward, and it is the sole
//! input to window closure: any window whose end (plus allowed lateness) lies at
//! or below the watermark can no longer receive valid contributions.
//!
//! # Example
//!
//! ```rust
//! use processor::watermark::WatermarkTracker;
//! use std::time::Duration;
//!
//! let tracker = WatermarkTracker::new(Duration::from_secs(1));
//! tracker.observe(61_000, 0);
//! assert_eq!(tracker.current().timestamp, 60_000);
//! assert!(tracker.is_late(59_999));
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A watermark timestamp in milliseconds since epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    /// The watermark timestamp in milliseconds since epoch
    pub timestamp: i64,
}

impl Watermark {
    /// Creates a new watermark with the given timestamp
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    /// Creates a watermark from a DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            timestamp: dt.timestamp_millis(),
        }
    }

    /// Converts the watermark to a DateTime, clamped to the representable range
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp).unwrap_or(if self.timestamp < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
    }

    /// Returns the minimum possible watermark (beginning of time)
    pub fn min() -> Self {
        Self { timestamp: i64::MIN }
    }

    /// Returns true if this is the minimum watermark
    pub fn is_min(&self) -> bool {
        self.timestamp == i64::MIN
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::min()
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_min() {
            write!(f, "Watermark(-inf)")
        } else {
            write!(
                f,
                "Watermark({})",
                self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f")
            )
        }
    }
}

/// Bounded out-of-orderness watermark for one logical stream
///
/// Shared by every shard feeding the stream; the stream watermark is the max
/// over all shards. Per-partition maxima are kept for diagnostics only.
#[derive(Debug)]
pub struct WatermarkTracker {
    max_delay_ms: i64,
    current: AtomicI64,
    partition_max: DashMap<u32, i64>,
}

impl WatermarkTracker {
    /// Create a tracker with the given lateness tolerance
    pub fn new(max_delay: Duration) -> Self {
        Self {
            max_delay_ms: i64::try_from(max_delay.as_millis()).unwrap_or(i64::MAX),
            current: AtomicI64::new(i64::MIN),
            partition_max: DashMap::new(),
        }
    }

    /// Observe an event time, returning the resulting watermark
    ///
    /// The watermark becomes `max(current, event_time - max_delay)`.
    pub fn observe(&self, event_time: i64, partition: u32) -> Watermark {
        self.partition_max
            .entry(partition)
            .and_modify(|max| *max = (*max).max(event_time))
            .or_insert(event_time);

        let candidate = event_time.saturating_sub(self.max_delay_ms);
        let previous = self.current.fetch_max(candidate, Ordering::AcqRel);
        let current = previous.max(candidate);

        if candidate > previous {
            trace!(
                partition = partition,
                event_time = event_time,
                watermark = current,
                "Watermark advanced"
            );
        }

        Watermark::new(current)
    }

    /// True iff the event time is below the current watermark
    pub fn is_late(&self, event_time: i64) -> bool {
        event_time < self.current.load(Ordering::Acquire)
    }

    /// Current watermark without advancing it
    pub fn current(&self) -> Watermark {
        Watermark::new(self.current.load(Ordering::Acquire))
    }

    /// Highest event time observed on a partition
    pub fn partition_max_event_time(&self, partition: u32) -> Option<i64> {
        self.partition_max.get(&partition).map(|v| *v)
    }

    /// Raise the watermark to a restored value; never lowers it
    pub fn restore(&self, watermark: Watermark) {
        let previous = self.current.fetch_max(watermark.timestamp, Ordering::AcqRel);
        debug!(
            restored = %watermark,
            previous = %Watermark::new(previous),
            "Watermark restored from checkpoint"
        );
    }

    /// Lateness tolerance in milliseconds
    pub fn max_delay_ms(&self) -> i64 {
        self.max_delay_ms
    }
}

/// Counters for records that arrived behind the watermark
#[derive(Debug, Default)]
pub struct LateDataStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    total_lateness_ms: AtomicU64,
}

impl LateDataStats {
    /// Creates empty statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// A late record whose window was still open and accepted it
    pub fn record_accepted(&self, lateness_ms: i64) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.total_lateness_ms
            .fetch_add(lateness_ms.max(0) as u64, Ordering::Relaxed);
    }

    /// A record rejected because its window had closed
    pub fn record_rejected(&self, symbol: &str, event_time: i64, window_end: i64) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(
            symbol = symbol,
            event_time = event_time,
            window_end = window_end,
            "Late record for closed window routed to dead letter"
        );
    }

    /// Snapshot of the counters
    pub fn snapshot(&self) -> LateDataSnapshot {
        let accepted = self.accepted.load(Ordering::Relaxed);
        let total = self.total_lateness_ms.load(Ordering::Relaxed);
        LateDataSnapshot {
            accepted_count: accepted,
            rejected_count: self.rejected.load(Ordering::Relaxed),
            average_lateness_ms: if accepted > 0 { total / accepted } else { 0 },
        }
    }
}

/// Point-in-time view of [`LateDataStats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LateDataSnapshot {
    /// Late records applied to a still-open window
    pub accepted_count: u64,
    /// Late records rejected for a closed window
    pub rejected_count: u64,
    /// Average lateness of accepted records in milliseconds
    pub average_lateness_ms: u64,
}
