//! Shared windowed aggregation state
//!
//! Accumulators live in a lock-striped arena: a symbol hashes to one stripe,
//! and each stripe maps window keys to slots of a dense accumulator table with
//! a free list for evicted slots. Shards call [`WindowAggregator::apply`]
//! concurrently; only records for symbols in the same stripe contend.
//!
//! Closure is driven by a close frontier. [`WindowAggregator::advance_watermark`]
//! raises the frontier before it sweeps the stripes, and `apply` reads the
//! frontier while holding its stripe lock, so a record either lands in a window
//! before the sweep closes it or is rejected after.

use super::accumulator::{WindowAccumulator, WindowState};
use super::assigner::TumblingWindowAssigner;
use super::types::WindowKey;
use crate::config::WindowConfig;
use crate::error::LateDataError;
use crate::watermark::Watermark;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, trace, warn};
use tradeflow_types::{MinuteAggregate, PartitionId, TradeRecord};

#[derive(Debug, Default)]
struct Stripe {
    index: HashMap<WindowKey, usize>,
    slots: Vec<Option<WindowAccumulator>>,
    free: Vec<usize>,
}

impl Stripe {
    fn get_or_insert(&mut self, key: &WindowKey) -> &mut WindowAccumulator {
        let slot = match self.index.get(key) {
            Some(&slot) => slot,
            None => {
                let slot = match self.free.pop() {
                    Some(slot) => slot,
                    None => {
                        self.slots.push(None);
                        self.slots.len() - 1
                    }
                };
                self.index.insert(key.clone(), slot);
                slot
            }
        };
        self.slots[slot].get_or_insert_with(|| WindowAccumulator::new(key.clone()))
    }

    fn evict(&mut self, key: &WindowKey) -> Option<WindowAccumulator> {
        let slot = self.index.remove(key)?;
        self.free.push(slot);
        self.slots[slot].take()
    }

    fn accumulators(&self) -> impl Iterator<Item = &WindowAccumulator> {
        self.slots.iter().flatten()
    }

    fn accumulators_mut(&mut self) -> impl Iterator<Item = &mut WindowAccumulator> {
        self.slots.iter_mut().flatten()
    }
}

/// A closed window ready to be written
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWindow {
    pub key: WindowKey,
    pub row: MinuteAggregate,
}

/// Keyed, windowed accumulator state shared by all shards of a stream
#[derive(Debug)]
pub struct WindowAggregator {
    assigner: TumblingWindowAssigner,
    allowed_lateness_ms: i64,
    stripes: Vec<Mutex<Stripe>>,
    /// Windows with `end + allowed_lateness <= close_frontier` are closed
    close_frontier: AtomicI64,
    /// Every window at or below this frontier has been flushed
    emitted_frontier: AtomicI64,
}

impl WindowAggregator {
    /// Create an aggregator from window configuration
    pub fn new(config: &WindowConfig) -> Self {
        let stripes = (0..config.lock_partitions.max(1))
            .map(|_| Mutex::new(Stripe::default()))
            .collect();
        Self {
            assigner: TumblingWindowAssigner::new(Duration::from_millis(config.size_ms)),
            allowed_lateness_ms: config.allowed_lateness_millis(),
            stripes,
            close_frontier: AtomicI64::new(i64::MIN),
            emitted_frontier: AtomicI64::new(i64::MIN),
        }
    }

    fn stripe_for(&self, symbol: &str) -> &Mutex<Stripe> {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        let index = (hasher.finish() % self.stripes.len() as u64) as usize;
        &self.stripes[index]
    }

    /// The window a record belongs to
    pub fn window_for(&self, record: &TradeRecord) -> WindowKey {
        self.assigner.assign(record)
    }

    /// Whether the window has been closed by the current frontier
    pub fn is_window_closed(&self, key: &WindowKey) -> bool {
        key.is_closed_by(
            self.close_frontier.load(Ordering::Acquire),
            self.allowed_lateness_ms,
        )
    }

    /// Apply a record to its window, creating the window if needed
    ///
    /// Fails with [`LateDataError`] if the window is already closed or emitted.
    pub fn apply(&self, record: &TradeRecord) -> Result<WindowKey, LateDataError> {
        let key = self.assigner.assign(record);
        let mut stripe = self.stripe_for(&record.symbol).lock();

        let frontier = self.close_frontier.load(Ordering::Acquire);
        let late = || LateDataError {
            symbol: record.symbol.clone(),
            event_time: record.event_time_millis(),
            window_end: key.end_ms,
            watermark: frontier,
        };

        if key.is_closed_by(frontier, self.allowed_lateness_ms) {
            return Err(late());
        }

        if !stripe.get_or_insert(&key).apply(record) {
            return Err(late());
        }

        trace!(
            symbol = %record.symbol,
            window_end = key.end_ms,
            offset = record.source_offset,
            "Applied record to window"
        );
        Ok(key)
    }

    /// Close every open window whose `end + allowed_lateness <= watermark`
    ///
    /// Returns the number of windows that transitioned to CLOSED.
    pub fn advance_watermark(&self, watermark: Watermark) -> usize {
        let previous = self
            .close_frontier
            .fetch_max(watermark.timestamp, Ordering::AcqRel);
        let frontier = previous.max(watermark.timestamp);

        let mut closed = 0;
        for stripe in &self.stripes {
            let mut stripe = stripe.lock();
            for acc in stripe.accumulators_mut() {
                if acc.state() == WindowState::Open
                    && acc.key().is_closed_by(frontier, self.allowed_lateness_ms)
                {
                    acc.close();
                    closed += 1;
                }
            }
        }

        if closed > 0 {
            debug!(
                watermark = %Watermark::new(frontier),
                closed = closed,
                "Closed windows"
            );
        }
        closed
    }

    /// All closed windows awaiting flush, ordered by symbol then window end
    pub fn pending_windows(&self) -> Vec<PendingWindow> {
        let mut pending = Vec::new();
        for stripe in &self.stripes {
            let mut stripe = stripe.lock();
            let mut unrepresentable = Vec::new();
            for acc in stripe.accumulators() {
                if acc.state() != WindowState::Closed {
                    continue;
                }
                match acc.finalize() {
                    Some(row) => pending.push(PendingWindow {
                        key: acc.key().clone(),
                        row,
                    }),
                    None => unrepresentable.push(acc.key().clone()),
                }
            }
            for key in unrepresentable {
                warn!(window = %key, "Evicting window with no representable output");
                stripe.evict(&key);
            }
        }
        pending.sort_by(|a, b| a.key.cmp(&b.key));
        pending
    }

    /// Mark flushed windows EMITTED and evict them
    pub fn mark_emitted(&self, keys: &[WindowKey]) -> usize {
        let mut evicted = 0;
        for key in keys {
            let mut stripe = self.stripe_for(&key.symbol).lock();
            let closed = stripe
                .index
                .get(key)
                .and_then(|&slot| stripe.slots[slot].as_ref())
                .map_or(false, |acc| acc.state() == WindowState::Closed);
            if !closed {
                continue;
            }
            if let Some(mut acc) = stripe.evict(key) {
                acc.mark_emitted();
                evicted += 1;
            }
        }
        evicted
    }

    /// Record that every window closed at or below `watermark` is flushed
    pub fn commit_frontier(&self, watermark: Watermark) {
        self.emitted_frontier
            .fetch_max(watermark.timestamp, Ordering::AcqRel);
    }

    /// Close frontier in effect
    pub fn close_frontier(&self) -> Watermark {
        Watermark::new(self.close_frontier.load(Ordering::Acquire))
    }

    /// Highest frontier whose windows are all flushed
    pub fn emitted_frontier(&self) -> Watermark {
        Watermark::new(self.emitted_frontier.load(Ordering::Acquire))
    }

    /// Restore both frontiers from a committed checkpoint
    pub fn restore_frontier(&self, watermark: Watermark) {
        self.close_frontier
            .fetch_max(watermark.timestamp, Ordering::AcqRel);
        self.emitted_frontier
            .fetch_max(watermark.timestamp, Ordering::AcqRel);
    }

    /// Smallest offset from `partition` still held by an unflushed window
    pub fn retained_offset(&self, partition: PartitionId) -> Option<u64> {
        self.stripes
            .iter()
            .filter_map(|stripe| {
                stripe
                    .lock()
                    .accumulators()
                    .filter_map(|acc| acc.min_offset(partition))
                    .min()
            })
            .min()
    }

    /// Number of open windows
    pub fn open_windows(&self) -> usize {
        self.count_in_state(WindowState::Open)
    }

    /// Number of closed windows awaiting flush
    pub fn closed_windows(&self) -> usize {
        self.count_in_state(WindowState::Closed)
    }

    fn count_in_state(&self, state: WindowState) -> usize {
        self.stripes
            .iter()
            .map(|stripe| {
                stripe
                    .lock()
                    .accumulators()
                    .filter(|acc| acc.state() == state)
                    .count()
            })
            .sum()
    }

    /// Allowed lateness in milliseconds
    pub fn allowed_lateness_ms(&self) -> i64 {
        self.allowed_lateness_ms
    }
}
