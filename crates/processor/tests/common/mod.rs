//! Shared fixtures for pipeline integration tests

#![allow(dead_code)]

use apache_avro::types::Value as AvroValue;
use apache_avro::to_avro_datum;
use async_trait::async_trait;
use processor::error::{SinkResult, SourceResult};
use processor::sink::Row;
use processor::{
    AvroTradeDecoder, CheckpointStore, MemoryCheckpointStore, MemoryConnector,
    MemoryDeadLetterSink, MemoryLog, MemoryTableStore, PartitionSource, PipelineBuilder,
    PipelineHandle, ProcessorConfig, SinkWriteError, SourceConnector, StartPosition, Table,
    TableStore,
};
use tradeflow_types::{PartitionId, RawEvent};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tradeflow_types::MinuteAggregate;

/// One entry of a trade envelope
pub struct Trade {
    pub symbol: &'static str,
    pub price: f64,
    pub volume: f64,
    pub t: i64,
}

pub fn trade(symbol: &'static str, price: f64, t: i64) -> Trade {
    Trade {
        symbol,
        price,
        volume: 1.0,
        t,
    }
}

/// Encode a `{data, type}` envelope with the bundled schema
pub fn envelope(trades: &[Trade]) -> Vec<u8> {
    let decoder = AvroTradeDecoder::bundled().unwrap();
    let entries = trades
        .iter()
        .map(|trade| {
            AvroValue::Record(vec![
                ("c".to_string(), AvroValue::Union(0, Box::new(AvroValue::Null))),
                ("p".to_string(), AvroValue::Double(trade.price)),
                ("s".to_string(), AvroValue::String(trade.symbol.to_string())),
                ("t".to_string(), AvroValue::Long(trade.t)),
                ("v".to_string(), AvroValue::Double(trade.volume)),
            ])
        })
        .collect();
    let value = AvroValue::Record(vec![
        ("data".to_string(), AvroValue::Array(entries)),
        ("type".to_string(), AvroValue::String("trade".to_string())),
    ]);
    to_avro_datum(decoder.schema(), value).unwrap()
}

/// Configuration with short backoffs and polls
pub fn test_config() -> ProcessorConfig {
    let mut config = ProcessorConfig::default();
    config.max_batch_size = 500;
    config.sink.base_backoff_ms = 1;
    config.sink.max_backoff_ms = 5;
    config.sink.write_timeout_ms = 2_000;
    config.source_retry.base_backoff_ms = 1;
    config.source_retry.max_backoff_ms = 10;
    config
}

/// In-memory collaborators of one pipeline run
pub struct Harness {
    pub log: Arc<MemoryLog>,
    pub store: Arc<dyn TableStore>,
    pub dead_letters: Arc<MemoryDeadLetterSink>,
    pub raw_checkpoints: Arc<dyn CheckpointStore>,
    pub windowed_checkpoints: Arc<dyn CheckpointStore>,
}

/// Route engine logs to the test output; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Harness {
    pub fn new(partitions: u32) -> Self {
        init_tracing();
        Self {
            log: MemoryLog::new(partitions),
            store: Arc::new(MemoryTableStore::new()),
            dead_letters: Arc::new(MemoryDeadLetterSink::new()),
            raw_checkpoints: Arc::new(MemoryCheckpointStore::new()),
            windowed_checkpoints: Arc::new(MemoryCheckpointStore::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TableStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_checkpoint_stores(
        mut self,
        raw: Arc<dyn CheckpointStore>,
        windowed: Arc<dyn CheckpointStore>,
    ) -> Self {
        self.raw_checkpoints = raw;
        self.windowed_checkpoints = windowed;
        self
    }

    fn connector(&self) -> MemoryConnector {
        MemoryConnector::new(Arc::clone(&self.log)).with_poll_timeout(Duration::from_millis(10))
    }

    pub fn builder(&self) -> PipelineBuilder {
        PipelineBuilder::new(test_config())
            .with_source(Arc::new(self.connector()))
            .with_table_store(Arc::clone(&self.store))
            .with_dead_letters(self.dead_letters.clone())
            .with_checkpoint_stores(
                Arc::clone(&self.raw_checkpoints),
                Arc::clone(&self.windowed_checkpoints),
            )
    }

    /// Builder whose reader of `partition` stalls before its first poll
    pub fn builder_with_slow_partition(
        &self,
        partition: PartitionId,
        delay: Duration,
    ) -> PipelineBuilder {
        self.builder().with_source(Arc::new(SlowStartConnector {
            inner: self.connector(),
            partition,
            delay,
        }))
    }

    pub async fn start(&self) -> PipelineHandle {
        self.builder().build().unwrap().start().await.unwrap()
    }

    pub fn append(&self, partition: u32, trades: &[Trade]) -> u64 {
        self.log.append(partition, envelope(trades)).unwrap()
    }

    pub async fn minute(&self, symbol: &str, end_ms: i64) -> Option<MinuteAggregate> {
        let key = format!("{}/{}", symbol, end_ms);
        self.store
            .get(Table::MinuteTrades, &key)
            .await
            .unwrap()
            .map(|row| serde_json::from_value(row).unwrap())
    }

    pub async fn count(&self, table: Table) -> usize {
        self.store.count(table).await.unwrap()
    }
}

/// Poll `check` until it holds or the deadline passes
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Table store whose first writes to one table fail
pub struct FlakyStore {
    inner: MemoryTableStore,
    table: Table,
    remaining: AtomicU32,
    permanent: bool,
}

impl FlakyStore {
    pub fn transient(table: Table, failures: u32) -> Self {
        Self {
            inner: MemoryTableStore::new(),
            table,
            remaining: AtomicU32::new(failures),
            permanent: false,
        }
    }

    pub fn permanent(table: Table) -> Self {
        Self {
            inner: MemoryTableStore::new(),
            table,
            remaining: AtomicU32::new(u32::MAX),
            permanent: true,
        }
    }

    fn should_fail(&self, table: Table) -> Option<SinkWriteError> {
        if table != self.table {
            return None;
        }
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()?;
        let reason = "injected failure".to_string();
        Some(if self.permanent {
            SinkWriteError::Permanent {
                table: table.name().to_string(),
                reason,
            }
        } else {
            SinkWriteError::Transient {
                table: table.name().to_string(),
                reason,
            }
        })
    }
}

#[async_trait]
impl TableStore for FlakyStore {
    async fn upsert(&self, table: Table, key: &str, row: &Value) -> SinkResult<()> {
        if let Some(err) = self.should_fail(table) {
            return Err(err);
        }
        self.inner.upsert(table, key, row).await
    }

    async fn upsert_batch(&self, table: Table, rows: &[Row]) -> SinkResult<()> {
        if let Some(err) = self.should_fail(table) {
            return Err(err);
        }
        self.inner.upsert_batch(table, rows).await
    }

    async fn get(&self, table: Table, key: &str) -> SinkResult<Option<Value>> {
        self.inner.get(table, key).await
    }

    async fn count(&self, table: Table) -> SinkResult<usize> {
        self.inner.count(table).await
    }
}

/// Connector delaying the first poll of one partition
pub struct SlowStartConnector {
    inner: MemoryConnector,
    partition: PartitionId,
    delay: Duration,
}

#[async_trait]
impl SourceConnector for SlowStartConnector {
    async fn partitions(&self) -> SourceResult<Vec<PartitionId>> {
        self.inner.partitions().await
    }

    async fn open(
        &self,
        partition: PartitionId,
        start: StartPosition,
    ) -> SourceResult<Box<dyn PartitionSource>> {
        let inner = self.inner.open(partition, start).await?;
        if partition != self.partition {
            return Ok(inner);
        }
        Ok(Box::new(SlowStartSource {
            inner,
            delay: Some(self.delay),
        }))
    }
}

struct SlowStartSource {
    inner: Box<dyn PartitionSource>,
    delay: Option<Duration>,
}

#[async_trait]
impl PartitionSource for SlowStartSource {
    fn partition(&self) -> PartitionId {
        self.inner.partition()
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    async fn poll(&mut self, max_batch: usize) -> SourceResult<Vec<RawEvent>> {
        if let Some(delay) = self.delay.take() {
            tokio::time::sleep(delay).await;
        }
        self.inner.poll(max_batch).await
    }

    async fn commit_offsets(&mut self, next_offset: u64) -> SourceResult<()> {
        self.inner.commit_offsets(next_offset).await
    }
}
