//! End-to-end pipeline tests over the in-memory source, store and checkpoints

mod common;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use common::{envelope, eventually, trade, FlakyStore, Harness, Trade};
use processor::error::CheckpointResult;
use processor::{
    CheckpointError, CheckpointRecord, CheckpointStore, DeadLetterReason, FileCheckpointStore,
    MemoryCheckpointStore, MemoryTableStore, ProcessorError, SinkWriteError, StartingOffsets,
    Table, TableStore,
};
use std::sync::Arc;

/// Seven empty envelopes so the next payload lands at offset 7
fn fill_to_offset_seven(harness: &Harness) {
    for _ in 0..7 {
        harness.append(0, &[]);
    }
}

fn aaa_pair() -> Vec<Trade> {
    vec![
        Trade {
            symbol: "AAA",
            price: 100.0,
            volume: 10.0,
            t: 0,
        },
        Trade {
            symbol: "AAA",
            price: 102.0,
            volume: 5.0,
            t: 500,
        },
    ]
}

#[tokio::test]
async fn test_minute_aggregate_emitted_after_watermark_passes() {
    let harness = Harness::new(1);
    fill_to_offset_seven(&harness);
    assert_eq!(harness.append(0, &aaa_pair()), 7);

    let handle = harness.start().await;

    eventually("raw rows of offset 7", || async {
        harness.count(Table::Trades).await == 2
    })
    .await;
    assert!(harness.minute("AAA", 60_000).await.is_none());

    // Watermark 61s closes [0s, 60s) with 1s lateness
    harness.append(0, &[trade("BBB", 5.0, 62_000)]);
    eventually("AAA minute", || async {
        harness.minute("AAA", 60_000).await.is_some()
    })
    .await;

    let report = handle.shutdown().await.unwrap();
    let minute = harness.minute("AAA", 60_000).await.unwrap();
    assert_eq!(minute.symbol, "AAA");
    assert_eq!(minute.avg_price, 101.0);
    assert_eq!(minute.total, 2);
    assert_eq!(minute.offset, 7);
    assert_eq!(minute.event_time, Utc.timestamp_millis_opt(60_000).unwrap());

    let raw = harness
        .store
        .get(Table::Trades, "AAA/0/7/1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw["price"], 102.0);
    assert_eq!(raw["entry_index"], 1);
    assert_eq!(harness.count(Table::Trades).await, 3);

    assert_eq!(report.shards, 1);
    assert_eq!(report.metrics.windows_emitted, 1);
    assert_eq!(report.watermark.timestamp, 61_000);
    assert_eq!(report.windowed_checkpoint.last_emitted_window_high_watermark, Some(61_000));
    assert!(harness.dead_letters.is_empty());
}

#[tokio::test]
async fn test_late_record_goes_to_dead_letters() {
    let harness = Harness::new(1);
    harness.append(0, &aaa_pair());
    harness.append(0, &[trade("BBB", 5.0, 62_000)]);

    let handle = harness.start().await;
    eventually("AAA minute", || async {
        harness.minute("AAA", 60_000).await.is_some()
    })
    .await;

    let late_offset = harness.append(0, &[trade("AAA", 500.0, 30_000)]);
    eventually("late dead letter", || async { !harness.dead_letters.is_empty() }).await;
    let report = handle.shutdown().await.unwrap();

    let letters = harness.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert!(matches!(letters[0].reason, DeadLetterReason::LateData));
    assert_eq!(letters[0].offset, late_offset);
    assert_eq!(letters[0].record.as_ref().unwrap().price, 500.0);

    // The emitted aggregate is final
    let minute = harness.minute("AAA", 60_000).await.unwrap();
    assert_eq!(minute.total, 2);
    assert_eq!(minute.avg_price, 101.0);

    // Late records still reach the raw table
    assert!(harness
        .store
        .get(Table::Trades, &format!("AAA/0/{}/0", late_offset))
        .await
        .unwrap()
        .is_some());
    assert_eq!(report.metrics.late_records, 1);
    assert_eq!(report.late_data.rejected_count, 1);
}

#[tokio::test]
async fn test_transient_sink_failures_are_retried() {
    let raw_checkpoints = MemoryCheckpointStore::new();
    let store = Arc::new(FlakyStore::transient(Table::Trades, 2));
    let harness = Harness::new(1).with_store(store).with_checkpoint_stores(
        Arc::new(raw_checkpoints.clone()),
        Arc::new(MemoryCheckpointStore::new()),
    );
    fill_to_offset_seven(&harness);
    harness.append(0, &aaa_pair());

    let handle = harness.start().await;
    eventually("raw checkpoint past offset 7", || async {
        raw_checkpoints
            .current()
            .and_then(|record| record.progress(0))
            .map_or(false, |progress| progress.resume_from == 8)
    })
    .await;
    let report = handle.shutdown().await.unwrap();

    assert_eq!(raw_checkpoints.save_count(), 1);
    assert_eq!(harness.count(Table::Trades).await, 2);
    assert_eq!(report.metrics.sink_retries, 2);
    assert_eq!(report.metrics.raw_rows_written, 2);
    // The open AAA window still holds offset 7
    assert_eq!(harness.log.committed(0), Some(7));
}

#[tokio::test]
async fn test_permanent_sink_failure_stops_without_checkpoint() {
    let raw_checkpoints = MemoryCheckpointStore::new();
    let harness = Harness::new(1)
        .with_store(Arc::new(FlakyStore::permanent(Table::Trades)))
        .with_checkpoint_stores(
            Arc::new(raw_checkpoints.clone()),
            Arc::new(MemoryCheckpointStore::new()),
        );
    harness.append(0, &aaa_pair());

    let handle = harness.start().await;
    let err = handle.wait().await.unwrap_err();

    assert!(matches!(
        err,
        ProcessorError::SinkWrite(SinkWriteError::Permanent { .. })
    ));
    assert!(raw_checkpoints.current().is_none());
    assert_eq!(harness.log.committed(0), None);
}

#[tokio::test]
async fn test_undecodable_payload_is_dead_lettered() {
    let harness = Harness::new(1);
    harness.log.append(0, vec![0x02]).unwrap();
    harness.append(0, &[trade("AAA", 10.0, 1_000)]);

    let handle = harness.start().await;
    eventually("decoded trade", || async {
        harness.count(Table::Trades).await == 1
    })
    .await;
    let report = handle.shutdown().await.unwrap();

    let letters = harness.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert!(matches!(letters[0].reason, DeadLetterReason::Decode));
    assert_eq!(letters[0].partition, 0);
    assert_eq!(letters[0].offset, 0);
    assert_eq!(letters[0].payload.as_deref(), Some(&[0x02][..]));
    assert_eq!(report.metrics.decode_failures, 1);
    assert_eq!(report.raw_checkpoint.progress(0).unwrap().resume_from, 2);
}

#[tokio::test]
async fn test_fan_out_writes_one_row_per_entry() {
    let harness = Harness::new(1);
    let entries: Vec<Trade> = (0..5).map(|i| trade("CCC", 10.0 + i as f64, i * 10)).collect();
    harness.append(0, &entries);
    harness.append(0, &[trade("CCC", 1.0, 70_000)]);

    let handle = harness.start().await;
    eventually("CCC minute", || async {
        harness.minute("CCC", 60_000).await.is_some()
    })
    .await;
    handle.shutdown().await.unwrap();

    for index in 0..5 {
        let key = format!("CCC/0/0/{}", index);
        assert!(harness.store.get(Table::Trades, &key).await.unwrap().is_some());
    }
    let minute = harness.minute("CCC", 60_000).await.unwrap();
    assert_eq!(minute.total, 5);
    assert_eq!(minute.avg_price, 12.0);
}

#[tokio::test]
async fn test_partitions_share_one_watermark() {
    let windowed_checkpoints = MemoryCheckpointStore::new();
    let harness = Harness::new(2).with_checkpoint_stores(
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(windowed_checkpoints.clone()),
    );
    harness.append(0, &[trade("AAA", 100.0, 0)]);
    harness.append(1, &[trade("AAA", 200.0, 10_000)]);

    let handle = harness.start().await;
    eventually("both partitions aggregated", || async {
        windowed_checkpoints
            .current()
            .map_or(false, |record| record.offsets.len() == 2)
    })
    .await;

    // Only partition 0 moves past the window; the merged aggregate still closes
    harness.append(0, &[trade("ZZZ", 1.0, 70_000)]);
    eventually("AAA minute", || async {
        harness.minute("AAA", 60_000).await.is_some()
    })
    .await;
    let report = handle.shutdown().await.unwrap();

    let minute = harness.minute("AAA", 60_000).await.unwrap();
    assert_eq!(minute.total, 2);
    assert_eq!(minute.avg_price, 150.0);
    assert_eq!(report.shards, 2);
    assert!(harness.dead_letters.is_empty());
}

#[tokio::test]
async fn test_replay_without_checkpoint_is_idempotent() {
    let store = Arc::new(MemoryTableStore::new());
    let first = Harness::new(1).with_store(store.clone());
    first.append(0, &aaa_pair());
    first.append(0, &[trade("BBB", 5.0, 30_000), trade("AAA", 104.0, 59_000)]);
    first.append(0, &[trade("BBB", 7.0, 62_000)]);

    let handle = first.start().await;
    eventually("both minutes", || async {
        store.rows(Table::MinuteTrades).len() == 2
    })
    .await;
    handle.shutdown().await.unwrap();

    let trades = store.rows(Table::Trades);
    let minutes = store.rows(Table::MinuteTrades);
    let writes = store.upsert_count();

    // Same log, same store, checkpoints lost
    let mut second = Harness::new(1).with_store(store.clone());
    second.log = Arc::clone(&first.log);
    let handle = second.start().await;
    eventually("replay complete", || async {
        store.rows(Table::MinuteTrades).len() == 2
            && store.upsert_count() >= writes * 2
    })
    .await;
    handle.shutdown().await.unwrap();

    assert_eq!(store.rows(Table::Trades), trades);
    assert_eq!(store.rows(Table::MinuteTrades), minutes);
}

#[tokio::test]
async fn test_restart_resumes_open_windows() {
    let dir = tempfile::tempdir().unwrap();
    let raw_dir = dir.path().join("trades");
    let windowed_dir = dir.path().join("minute_trades");
    let store = Arc::new(MemoryTableStore::new());

    let first = Harness::new(1)
        .with_store(store.clone())
        .with_checkpoint_stores(
            Arc::new(FileCheckpointStore::new(&raw_dir)),
            Arc::new(FileCheckpointStore::new(&windowed_dir)),
        );
    first.append(0, &[trade("AAA", 10.0, 1_000)]);
    first.append(0, &[trade("AAA", 20.0, 2_000)]);
    first.append(0, &[trade("AAA", 30.0, 65_000)]);
    first.append(0, &[trade("BBB", 7.0, 3_000)]);

    let handle = first.start().await;
    eventually("first minutes", || async {
        store.rows(Table::MinuteTrades).len() == 2
    })
    .await;
    let report = handle.shutdown().await.unwrap();
    assert_eq!(report.raw_checkpoint.progress(0).unwrap().resume_from, 4);
    assert_eq!(report.windowed_checkpoint.progress(0).unwrap().resume_from, 2);
    assert_eq!(first.log.committed(0), Some(2));

    let second = Harness {
        log: Arc::clone(&first.log),
        store: store.clone(),
        dead_letters: Arc::new(processor::MemoryDeadLetterSink::new()),
        raw_checkpoints: Arc::new(FileCheckpointStore::new(&raw_dir)),
        windowed_checkpoints: Arc::new(FileCheckpointStore::new(&windowed_dir)),
    };
    second.append(0, &[trade("AAA", 50.0, 125_000)]);

    let handle = second
        .builder()
        .with_starting_offsets(StartingOffsets::Checkpoint)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    eventually("reopened minute", || async {
        second.minute("AAA", 120_000).await.is_some()
    })
    .await;
    let report = handle.shutdown().await.unwrap();

    let minute = second.minute("AAA", 120_000).await.unwrap();
    assert_eq!(minute.total, 1);
    assert_eq!(minute.avg_price, 30.0);
    assert_eq!(minute.offset, 2);

    let first_minute = second.minute("AAA", 60_000).await.unwrap();
    assert_eq!(first_minute.total, 2);
    assert_eq!(first_minute.avg_price, 15.0);
    assert_eq!(second.minute("BBB", 60_000).await.unwrap().total, 1);

    // Offset 3 was replayed for the open AAA window; its own window was emitted
    assert!(second.dead_letters.is_empty());
    assert_eq!(report.metrics.replayed_records_skipped, 1);
    assert_eq!(report.metrics.raw_rows_written, 1);
    assert_eq!(store.rows(Table::Trades).len(), 5);
    assert_eq!(
        report.windowed_checkpoint.last_emitted_window_high_watermark,
        Some(124_000)
    );
    assert_eq!(second.log.committed(0), Some(4));
}

#[tokio::test]
async fn test_restart_rebuilds_windows_across_partitions() {
    let first = Harness::new(2);
    first.append(0, &[trade("AAA", 10.0, 1_000)]);
    first.append(1, &[trade("AAA", 30.0, 2_000)]);

    let handle = first.start().await;
    eventually("both partitions checkpointed", || async {
        first
            .windowed_checkpoints
            .load()
            .await
            .unwrap()
            .map_or(false, |record| record.offsets.len() == 2)
    })
    .await;
    handle.shutdown().await.unwrap();
    assert_eq!(first.count(Table::MinuteTrades).await, 0);

    let second = Harness {
        log: Arc::clone(&first.log),
        store: Arc::clone(&first.store),
        dead_letters: Arc::new(processor::MemoryDeadLetterSink::new()),
        raw_checkpoints: Arc::clone(&first.raw_checkpoints),
        windowed_checkpoints: Arc::clone(&first.windowed_checkpoints),
    };
    second.append(1, &[trade("BBB", 5.0, 200_000)]);

    // Partition 1 replays and jumps the watermark before partition 0 reads
    let handle = second
        .builder_with_slow_partition(0, std::time::Duration::from_millis(300))
        .with_starting_offsets(StartingOffsets::Checkpoint)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    eventually("rebuilt minute", || async {
        second.minute("AAA", 60_000).await.is_some()
    })
    .await;
    let report = handle.shutdown().await.unwrap();

    let minute = second.minute("AAA", 60_000).await.unwrap();
    assert_eq!(minute.total, 2);
    assert_eq!(minute.avg_price, 20.0);
    assert!(second.dead_letters.is_empty());
    assert_eq!(report.metrics.late_records, 0);
    assert_eq!(report.metrics.replayed_records_skipped, 0);
}

#[tokio::test]
async fn test_checkpoint_policy_requires_checkpoint() {
    let harness = Harness::new(1);
    harness.append(0, &aaa_pair());

    let handle = harness
        .builder()
        .with_starting_offsets(StartingOffsets::Checkpoint)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, ProcessorError::Configuration { .. }));
    assert_eq!(harness.count(Table::Trades).await, 0);
}

#[tokio::test]
async fn test_source_outage_is_retried() {
    let harness = Harness::new(1);
    harness.log.inject_unavailable(3);
    harness.append(0, &[trade("AAA", 10.0, 1_000)]);

    let handle = harness.start().await;
    eventually("trade after outage", || async {
        harness.count(Table::Trades).await == 1
    })
    .await;
    let report = handle.shutdown().await.unwrap();

    assert!(report.metrics.source_retries >= 1);
}

struct BrokenCheckpointStore;

#[async_trait]
impl CheckpointStore for BrokenCheckpointStore {
    async fn load(&self) -> CheckpointResult<Option<CheckpointRecord>> {
        Ok(None)
    }

    async fn save(&self, _record: &CheckpointRecord) -> CheckpointResult<()> {
        Err(CheckpointError::Write {
            location: self.location(),
            reason: "disk full".to_string(),
        })
    }

    fn location(&self) -> String {
        "broken".to_string()
    }
}

#[tokio::test]
async fn test_checkpoint_failure_stops_every_shard() {
    let harness = Harness::new(2).with_checkpoint_stores(
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(BrokenCheckpointStore),
    );
    harness.append(0, &[trade("AAA", 10.0, 1_000)]);

    let handle = harness.start().await;
    let err = handle.wait().await.unwrap_err();

    assert!(err.is_fatal_for_process());
    assert!(matches!(err, ProcessorError::Checkpoint(CheckpointError::Write { .. })));
}

#[test]
fn test_envelope_helper_matches_bundled_schema() {
    let payload = envelope(&aaa_pair());
    assert!(!payload.is_empty());
}
