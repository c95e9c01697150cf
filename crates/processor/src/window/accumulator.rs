//! Per-window accumulator
//!
//! A plain struct with pure `apply`/`merge` functions. The average price is
//! derived only in [`WindowAccumulator::finalize`], from the exact running sum.

use super::types::WindowKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tradeflow_types::{MinuteAggregate, PartitionId, TradeRecord};

/// Lifecycle of a window accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowState {
    /// Accepting records
    Open,
    /// Closed by the watermark, awaiting flush
    Closed,
    /// Flushed to the sink
    Emitted,
}

/// Aggregation state of one (symbol, window)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowAccumulator {
    key: WindowKey,
    count: u64,
    price_sum: f64,
    max_offset: u64,
    state: WindowState,
    /// Smallest contributing offset per source partition
    min_offsets: BTreeMap<PartitionId, u64>,
}

impl WindowAccumulator {
    /// Create an empty open accumulator
    pub fn new(key: WindowKey) -> Self {
        Self {
            key,
            count: 0,
            price_sum: 0.0,
            max_offset: 0,
            state: WindowState::Open,
            min_offsets: BTreeMap::new(),
        }
    }

    /// Add a record; returns false and leaves state untouched unless open
    #[must_use]
    pub fn apply(&mut self, record: &TradeRecord) -> bool {
        if self.state != WindowState::Open {
            return false;
        }

        self.count += 1;
        self.price_sum += record.price;
        self.max_offset = self.max_offset.max(record.source_offset);
        self.min_offsets
            .entry(record.source_partition)
            .and_modify(|min| *min = (*min).min(record.source_offset))
            .or_insert(record.source_offset);
        true
    }

    /// Fold another accumulator for the same key into this one
    pub fn merge(&mut self, other: &WindowAccumulator) {
        debug_assert_eq!(self.key, other.key);
        self.count += other.count;
        self.price_sum += other.price_sum;
        self.max_offset = self.max_offset.max(other.max_offset);
        for (&partition, &offset) in &other.min_offsets {
            self.min_offsets
                .entry(partition)
                .and_modify(|min| *min = (*min).min(offset))
                .or_insert(offset);
        }
    }

    /// OPEN -> CLOSED
    pub fn close(&mut self) {
        if self.state == WindowState::Open {
            self.state = WindowState::Closed;
        }
    }

    /// CLOSED -> EMITTED
    pub fn mark_emitted(&mut self) {
        if self.state == WindowState::Closed {
            self.state = WindowState::Emitted;
        }
    }

    /// Output row; `None` for an empty accumulator or unrepresentable bounds
    pub fn finalize(&self) -> Option<MinuteAggregate> {
        if self.count == 0 {
            return None;
        }
        let bounds = self.key.bounds()?;
        Some(MinuteAggregate {
            symbol: self.key.symbol.clone(),
            event_time: bounds.end,
            avg_price: self.price_sum / self.count as f64,
            total: self.count,
            offset: self.max_offset,
        })
    }

    pub fn key(&self) -> &WindowKey {
        &self.key
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn price_sum(&self) -> f64 {
        self.price_sum
    }

    pub fn max_offset(&self) -> u64 {
        self.max_offset
    }

    /// Smallest offset from `partition` that contributed to this window
    pub fn min_offset(&self, partition: PartitionId) -> Option<u64> {
        self.min_offsets.get(&partition).copied()
    }

    /// Smallest contributing offset for every partition
    pub fn min_offsets(&self) -> impl Iterator<Item = (PartitionId, u64)> + '_ {
        self.min_offsets.iter().map(|(&p, &o)| (p, o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn trade(price: f64, t: i64, partition: PartitionId, offset: u64) -> TradeRecord {
        TradeRecord {
            symbol: "AAA".to_string(),
            price,
            volume: 1.0,
            event_time: Utc.timestamp_millis_opt(t).unwrap(),
            source_offset: offset,
            source_partition: partition,
            entry_index: 0,
            conditions: vec![],
        }
    }

    #[test]
    fn test_apply_and_finalize() {
        let mut acc = WindowAccumulator::new(WindowKey::new("AAA", 0, 60_000));
        assert!(acc.apply(&trade(100.0, 0, 0, 7)));
        assert!(acc.apply(&trade(102.0, 500, 0, 7)));

        let row = acc.finalize().unwrap();
        assert_eq!(row.symbol, "AAA");
        assert_eq!(row.avg_price, 101.0);
        assert_eq!(row.total, 2);
        assert_eq!(row.offset, 7);
        assert_eq!(row.event_time.timestamp_millis(), 60_000);
    }

    #[test]
    fn test_closed_accumulator_rejects() {
        let mut acc = WindowAccumulator::new(WindowKey::new("AAA", 0, 60_000));
        assert!(acc.apply(&trade(1.0, 0, 0, 1)));
        acc.close();
        assert!(!acc.apply(&trade(5.0, 1, 0, 2)));
        assert_eq!(acc.count(), 1);
        assert_eq!(acc.state(), WindowState::Closed);

        acc.mark_emitted();
        assert_eq!(acc.state(), WindowState::Emitted);
        assert!(!acc.apply(&trade(5.0, 1, 0, 3)));
    }

    #[test]
    fn test_merge_matches_sequential_apply() {
        let key = WindowKey::new("AAA", 0, 60_000);
        let trades = [
            trade(10.0, 1, 0, 4),
            trade(20.0, 2, 1, 9),
            trade(30.0, 3, 0, 2),
            trade(40.0, 4, 1, 11),
        ];

        let mut whole = WindowAccumulator::new(key.clone());
        for t in &trades {
            assert!(whole.apply(t));
        }

        let mut left = WindowAccumulator::new(key.clone());
        let mut right = WindowAccumulator::new(key);
        for t in &trades[..2] {
            assert!(left.apply(t));
        }
        for t in &trades[2..] {
            assert!(right.apply(t));
        }
        left.merge(&right);

        assert_eq!(left.count(), whole.count());
        assert_eq!(left.price_sum(), whole.price_sum());
        assert_eq!(left.max_offset(), 11);
        assert_eq!(left.min_offset(0), Some(2));
        assert_eq!(left.min_offset(1), Some(9));
        assert_eq!(left.min_offset(2), None);
    }

    #[test]
    fn test_empty_accumulator_has_no_row() {
        let acc = WindowAccumulator::new(WindowKey::new("AAA", 0, 60_000));
        assert!(acc.finalize().is_none());
    }
}
