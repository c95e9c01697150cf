//! Windowed aggregation path
//!
//! Records advance the shared watermark and land in the shared aggregator.
//! Once per batch the path takes the flush gate, closes every window the
//! watermark allows, writes all closed windows, marks them emitted and commits
//! its checkpoint. The gate orders flushes from different shards, so the
//! emitted high watermark in any checkpoint covers only windows that are
//! stored. A failed flush leaves its windows closed; the next flush from any
//! shard writes them.
//!
//! After a restart the windows held by the checkpoint are rebuilt by replaying
//! each partition from its resume offset. Until every restored partition has
//! re-read through its recorded read offset, the close frontier stays at the
//! emitted watermark of the checkpoint, so a fast partition cannot close a
//! window that a slower partition is still rebuilding.

use crate::config::ProcessorConfig;
use crate::error::Result;
use crate::metrics::PipelineMetrics;
use crate::sink::{send_within, DeadLetter, DeadLetterSink, SinkDispatcher};
use crate::state::{BatchProgress, CheckpointCoordinator, CheckpointRecord};
use crate::watermark::{LateDataSnapshot, LateDataStats, Watermark, WatermarkTracker};
use crate::window::{WindowAggregator, WindowKey};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};
use tradeflow_types::{PartitionId, TradeRecord};

/// What the last committed checkpoint says was already read and emitted
#[derive(Debug, Default)]
struct ReplayHorizon {
    read_through: BTreeMap<PartitionId, u64>,
    emitted: Option<Watermark>,
    /// Partitions still rebuilding retained windows, with their read offset
    rebuilding: BTreeMap<PartitionId, u64>,
}

impl ReplayHorizon {
    fn from_record(record: &CheckpointRecord) -> Self {
        Self {
            read_through: record
                .offsets
                .iter()
                .map(|(partition, progress)| (*partition, progress.read_through))
                .collect(),
            emitted: record.emitted_watermark(),
            rebuilding: record
                .offsets
                .iter()
                .filter(|(_, progress)| progress.resume_from <= progress.read_through)
                .map(|(partition, progress)| (*partition, progress.read_through))
                .collect(),
        }
    }

    /// Note that `partition` has read through `batch_end`
    ///
    /// Returns true when this lifts the last hold on the frontier.
    fn advance(&mut self, partition: PartitionId, batch_end: u64) -> bool {
        let caught_up = self
            .rebuilding
            .get(&partition)
            .map_or(false, |&through| batch_end >= through);
        caught_up && self.release(partition)
    }

    /// Stop waiting on `partition`; true when nothing is left to wait for
    fn release(&mut self, partition: PartitionId) -> bool {
        self.rebuilding.remove(&partition).is_some() && self.rebuilding.is_empty()
    }

    /// Watermark the aggregator may close windows up to
    fn clamp(&self, watermark: Watermark) -> Watermark {
        if self.rebuilding.is_empty() {
            watermark
        } else {
            watermark.min(self.emitted.unwrap_or_else(Watermark::min))
        }
    }

    /// A record read before the restart whose window was already emitted
    fn is_replay(&self, record: &TradeRecord, key: &WindowKey, allowed_lateness_ms: i64) -> bool {
        let read = self
            .read_through
            .get(&record.source_partition)
            .map_or(false, |&through| record.source_offset <= through);
        let emitted = self
            .emitted
            .map_or(false, |wm| key.is_closed_by(wm.timestamp, allowed_lateness_ms));
        read && emitted
    }
}

/// Output path writing per-minute aggregates
pub struct WindowedPath {
    aggregator: WindowAggregator,
    tracker: WatermarkTracker,
    late_stats: LateDataStats,
    dispatcher: Arc<SinkDispatcher>,
    checkpoint: CheckpointCoordinator,
    dead_letters: Arc<dyn DeadLetterSink>,
    dead_letter_timeout: Duration,
    metrics: PipelineMetrics,
    flush_gate: Mutex<()>,
    replay: RwLock<ReplayHorizon>,
}

impl WindowedPath {
    pub fn new(
        config: &ProcessorConfig,
        dispatcher: Arc<SinkDispatcher>,
        checkpoint: CheckpointCoordinator,
        dead_letters: Arc<dyn DeadLetterSink>,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            aggregator: WindowAggregator::new(&config.window),
            tracker: WatermarkTracker::new(config.watermark.max_delay()),
            late_stats: LateDataStats::new(),
            dispatcher,
            checkpoint,
            dead_letters,
            dead_letter_timeout: config.sink.write_timeout(),
            metrics,
            flush_gate: Mutex::new(()),
            replay: RwLock::new(ReplayHorizon::default()),
        }
    }

    /// Reload the committed checkpoint and the frontiers it recorded
    pub async fn restore(&self) -> Result<Option<CheckpointRecord>> {
        let record = self.checkpoint.restore().await?;
        match &record {
            Some(record) => {
                if let Some(watermark) = record.emitted_watermark() {
                    self.aggregator.restore_frontier(watermark);
                    self.tracker.restore(watermark);
                    self.metrics.watermark_ms.set(watermark.timestamp);
                }
                *self.replay.write() = ReplayHorizon::from_record(record);
            }
            None => *self.replay.write() = ReplayHorizon::default(),
        }
        Ok(record)
    }

    /// Aggregate a batch, flush closed windows and commit progress
    ///
    /// Returns the committed resume offset of the partition.
    pub async fn process(
        &self,
        partition: PartitionId,
        records: &[TradeRecord],
        batch_end: u64,
    ) -> Result<u64> {
        for record in records {
            self.apply(partition, record).await?;
        }
        self.flush(partition, batch_end).await
    }

    async fn apply(&self, partition: PartitionId, record: &TradeRecord) -> Result<()> {
        let event_time = record.event_time_millis();
        let behind = self.tracker.is_late(event_time);
        self.tracker.observe(event_time, partition);

        let err = match self.aggregator.apply(record) {
            Ok(_) => {
                if behind {
                    let lateness = self.tracker.current().timestamp.saturating_sub(event_time);
                    self.late_stats.record_accepted(lateness);
                }
                return Ok(());
            }
            Err(err) => err,
        };

        let key = self.aggregator.window_for(record);
        let replayed =
            self.replay
                .read()
                .is_replay(record, &key, self.aggregator.allowed_lateness_ms());
        if replayed {
            trace!(
                symbol = %record.symbol,
                partition = partition,
                offset = record.source_offset,
                window_end = key.end_ms,
                "Skipping replayed record of emitted window"
            );
            self.metrics.replayed_records_skipped.inc();
            return Ok(());
        }

        self.late_stats
            .record_rejected(&record.symbol, event_time, err.window_end);
        self.metrics.late_records.inc();
        let letter = DeadLetter::late(record, &err);
        send_within(self.dead_letters.as_ref(), letter, self.dead_letter_timeout).await?;
        Ok(())
    }

    async fn flush(&self, partition: PartitionId, batch_end: u64) -> Result<u64> {
        let _gate = self.flush_gate.lock().await;

        let watermark = {
            let mut replay = self.replay.write();
            if replay.advance(partition, batch_end) {
                info!(partition = partition, "Retained windows rebuilt on every partition");
            }
            replay.clamp(self.tracker.current())
        };
        self.aggregator.advance_watermark(watermark);
        let frontier = self.aggregator.close_frontier();

        let pending = self.aggregator.pending_windows();
        let token = self.dispatcher.write_windows(&pending, frontier).await?;

        let keys: Vec<WindowKey> = pending.into_iter().map(|window| window.key).collect();
        let emitted = self.aggregator.mark_emitted(&keys);
        self.aggregator.commit_frontier(frontier);

        let resume_from = self
            .aggregator
            .retained_offset(partition)
            .map_or(batch_end + 1, |offset| offset.min(batch_end + 1));
        let progress = BatchProgress {
            partition,
            resume_from,
            read_through: batch_end,
        };
        self.checkpoint.commit(progress, token).await?;
        self.metrics.checkpoints_committed.inc();

        if !frontier.is_min() {
            self.metrics.watermark_ms.set(frontier.timestamp);
        }
        self.metrics
            .open_windows
            .set(self.aggregator.open_windows() as i64);

        debug!(
            partition = partition,
            watermark = %frontier,
            emitted = emitted,
            resume_from = resume_from,
            read_through = batch_end,
            "Windowed batch committed"
        );
        Ok(resume_from)
    }

    /// Drop rebuild holds of partitions the source no longer has
    pub fn retain_replay(&self, partitions: &[PartitionId]) {
        let mut replay = self.replay.write();
        let gone: Vec<PartitionId> = replay
            .rebuilding
            .keys()
            .filter(|partition| !partitions.contains(partition))
            .copied()
            .collect();
        for partition in gone {
            debug!(partition = partition, "Checkpointed partition missing from source");
            replay.release(partition);
        }
    }

    /// Stop holding the close frontier for `partition`
    ///
    /// Called when its shard exits; the next flush from any shard closes what
    /// the watermark allows.
    pub fn release_replay(&self, partition: PartitionId) {
        if self.replay.write().release(partition) {
            debug!(partition = partition, "Released last rebuild hold");
        }
    }

    /// Partitions still rebuilding retained windows
    pub fn rebuilding_partitions(&self) -> Vec<PartitionId> {
        self.replay.read().rebuilding.keys().copied().collect()
    }

    /// Current watermark of the stream
    pub fn watermark(&self) -> Watermark {
        self.tracker.current()
    }

    /// Shared window state
    pub fn aggregator(&self) -> &WindowAggregator {
        &self.aggregator
    }

    /// Late-data counters
    pub fn late_data(&self) -> LateDataSnapshot {
        self.late_stats.snapshot()
    }

    /// The path's checkpoint coordinator
    pub fn checkpoint(&self) -> &CheckpointCoordinator {
        &self.checkpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemoryDeadLetterSink, MemoryTableStore, Table, TableStore};
    use crate::state::{CheckpointStore, MemoryCheckpointStore, PartitionProgress};
    use chrono::{TimeZone, Utc};
    use tradeflow_types::MinuteAggregate;

    fn trade(symbol: &str, t: i64, partition: PartitionId, offset: u64) -> TradeRecord {
        TradeRecord {
            symbol: symbol.to_string(),
            price: 10.0,
            volume: 1.0,
            event_time: Utc.timestamp_millis_opt(t).unwrap(),
            source_offset: offset,
            source_partition: partition,
            entry_index: 0,
            conditions: vec![],
        }
    }

    struct Fixture {
        path: WindowedPath,
        store: Arc<MemoryTableStore>,
        dead_letters: Arc<MemoryDeadLetterSink>,
    }

    /// A path restored from a checkpoint where both partitions still hold
    /// offset 0 in an open window
    async fn restored(partitions: &[PartitionId]) -> Fixture {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let mut record = CheckpointRecord::empty(Table::MinuteTrades.name());
        for &partition in partitions {
            record.offsets.insert(
                partition,
                PartitionProgress {
                    resume_from: 0,
                    read_through: 0,
                },
            );
        }
        record.sequence = 4;
        checkpoints.save(&record).await.unwrap();

        let config = ProcessorConfig::default();
        let store = Arc::new(MemoryTableStore::new());
        let dead_letters = Arc::new(MemoryDeadLetterSink::new());
        let metrics = PipelineMetrics::new();
        let dispatcher = Arc::new(SinkDispatcher::new(
            store.clone(),
            config.sink.clone(),
            metrics.clone(),
        ));
        let path = WindowedPath::new(
            &config,
            dispatcher,
            CheckpointCoordinator::new(
                Table::MinuteTrades.name(),
                checkpoints,
                Duration::from_secs(1),
            ),
            dead_letters.clone(),
            metrics,
        );
        path.restore().await.unwrap();
        Fixture {
            path,
            store,
            dead_letters,
        }
    }

    async fn minute(store: &MemoryTableStore, key: &str) -> Option<MinuteAggregate> {
        store
            .get(Table::MinuteTrades, key)
            .await
            .unwrap()
            .map(|row| serde_json::from_value(row).unwrap())
    }

    #[tokio::test]
    async fn test_fast_partition_waits_for_rebuild() {
        let fixture = restored(&[0, 1]).await;
        assert_eq!(fixture.path.rebuilding_partitions(), vec![0, 1]);

        // Partition 1 replays its held record and moves the watermark far ahead
        let batch = [trade("AAA", 2_000, 1, 0), trade("BBB", 200_000, 1, 1)];
        fixture.path.process(1, &batch, 1).await.unwrap();

        assert_eq!(fixture.path.rebuilding_partitions(), vec![0]);
        assert!(minute(&fixture.store, "AAA/60000").await.is_none());
        assert!(!fixture.path.aggregator().is_window_closed(
            &fixture.path.aggregator().window_for(&batch[0])
        ));

        // Partition 0 rebuilds its share of the same window
        fixture
            .path
            .process(0, &[trade("AAA", 1_000, 0, 0)], 0)
            .await
            .unwrap();

        assert!(fixture.path.rebuilding_partitions().is_empty());
        assert!(fixture.dead_letters.is_empty());
        let aggregate = minute(&fixture.store, "AAA/60000").await.unwrap();
        assert_eq!(aggregate.total, 2);
    }

    #[tokio::test]
    async fn test_released_partition_stops_holding_frontier() {
        let fixture = restored(&[0, 1]).await;
        let batch = [trade("AAA", 2_000, 1, 0), trade("BBB", 200_000, 1, 1)];
        fixture.path.process(1, &batch, 1).await.unwrap();
        assert!(minute(&fixture.store, "AAA/60000").await.is_none());

        fixture.path.release_replay(0);
        fixture.path.process(1, &[], 1).await.unwrap();

        let aggregate = minute(&fixture.store, "AAA/60000").await.unwrap();
        assert_eq!(aggregate.total, 1);
    }

    #[tokio::test]
    async fn test_missing_partitions_are_not_awaited() {
        let fixture = restored(&[0, 1, 2]).await;
        fixture.path.retain_replay(&[1]);
        assert_eq!(fixture.path.rebuilding_partitions(), vec![1]);

        let batch = [trade("AAA", 2_000, 1, 0), trade("BBB", 200_000, 1, 1)];
        fixture.path.process(1, &batch, 1).await.unwrap();
        assert!(minute(&fixture.store, "AAA/60000").await.is_some());
    }

    #[tokio::test]
    async fn test_fresh_start_closes_without_hold() {
        let fixture = restored(&[]).await;
        let batch = [trade("AAA", 2_000, 0, 0), trade("BBB", 200_000, 0, 1)];
        fixture.path.process(0, &batch, 1).await.unwrap();
        assert!(minute(&fixture.store, "AAA/60000").await.is_some());
    }
}
