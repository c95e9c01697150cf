//! In-process partitioned log
//!
//! Mirrors the behaviour the engine relies on from a real log: per-partition
//! offsets, retention that can drop old offsets, committed offsets, and
//! at-least-once redelivery after a reader is reopened. Transient outages can
//! be injected to exercise reconnection.

use super::{PartitionSource, SourceConnector, StartPosition};
use crate::error::{SourceError, SourceResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};
use tradeflow_types::{PartitionId, RawEvent};

#[derive(Debug, Default)]
struct PartitionLog {
    /// Offset of the first retained event
    base_offset: u64,
    events: VecDeque<Vec<u8>>,
    committed: Option<u64>,
}

impl PartitionLog {
    fn end_offset(&self) -> u64 {
        self.base_offset + self.events.len() as u64
    }
}

/// A partitioned, append-only event log held in memory
#[derive(Debug)]
pub struct MemoryLog {
    partitions: Vec<Mutex<PartitionLog>>,
    appended: Notify,
    unavailable: AtomicU32,
}

impl MemoryLog {
    /// Create a log with `partitions` empty partitions
    pub fn new(partitions: u32) -> Arc<Self> {
        Arc::new(Self {
            partitions: (0..partitions.max(1))
                .map(|_| Mutex::new(PartitionLog::default()))
                .collect(),
            appended: Notify::new(),
            unavailable: AtomicU32::new(0),
        })
    }

    fn partition_log(&self, partition: PartitionId) -> SourceResult<&Mutex<PartitionLog>> {
        self.partitions
            .get(partition as usize)
            .ok_or_else(|| SourceError::Configuration {
                reason: format!("unknown partition {}", partition),
            })
    }

    /// Number of partitions
    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Append a payload, returning its offset
    pub fn append(&self, partition: PartitionId, payload: Vec<u8>) -> SourceResult<u64> {
        let offset = {
            let mut log = self.partition_log(partition)?.lock();
            log.events.push_back(payload);
            log.end_offset() - 1
        };
        self.appended.notify_waiters();
        Ok(offset)
    }

    /// Drop every event below `offset`, as log retention would
    pub fn truncate_before(&self, partition: PartitionId, offset: u64) -> SourceResult<()> {
        let mut log = self.partition_log(partition)?.lock();
        while log.base_offset < offset && log.events.pop_front().is_some() {
            log.base_offset += 1;
        }
        if log.events.is_empty() && log.base_offset < offset {
            log.base_offset = offset;
        }
        Ok(())
    }

    /// Next offset to be assigned on a partition
    pub fn end_offset(&self, partition: PartitionId) -> SourceResult<u64> {
        Ok(self.partition_log(partition)?.lock().end_offset())
    }

    /// Last committed offset of a partition
    pub fn committed(&self, partition: PartitionId) -> Option<u64> {
        self.partition_log(partition)
            .ok()
            .and_then(|log| log.lock().committed)
    }

    /// Committed offsets of every partition that has one
    pub fn committed_offsets(&self) -> BTreeMap<PartitionId, u64> {
        self.partitions
            .iter()
            .enumerate()
            .filter_map(|(p, log)| log.lock().committed.map(|c| (p as PartitionId, c)))
            .collect()
    }

    /// Make the next `polls` polls fail with [`SourceError::Unavailable`]
    pub fn inject_unavailable(&self, polls: u32) {
        self.unavailable.store(polls, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.unavailable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Connector over a [`MemoryLog`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    log: Arc<MemoryLog>,
    fail_on_data_loss: bool,
    poll_timeout: Duration,
}

impl MemoryConnector {
    /// Create a connector
    pub fn new(log: Arc<MemoryLog>) -> Self {
        Self {
            log,
            fail_on_data_loss: false,
            poll_timeout: Duration::from_millis(50),
        }
    }

    /// Fail instead of skipping when requested offsets were truncated
    pub fn with_fail_on_data_loss(mut self, fail: bool) -> Self {
        self.fail_on_data_loss = fail;
        self
    }

    /// How long an empty poll waits for new events
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// The underlying log
    pub fn log(&self) -> &Arc<MemoryLog> {
        &self.log
    }
}

#[async_trait]
impl SourceConnector for MemoryConnector {
    async fn partitions(&self) -> SourceResult<Vec<PartitionId>> {
        Ok((0..self.log.partition_count()).collect())
    }

    async fn open(
        &self,
        partition: PartitionId,
        start: StartPosition,
    ) -> SourceResult<Box<dyn PartitionSource>> {
        let position = {
            let log = self.log.partition_log(partition)?.lock();
            match start {
                StartPosition::Earliest => log.base_offset,
                StartPosition::Latest => log.end_offset(),
                StartPosition::Offset(offset) => offset,
            }
        };
        debug!(partition = partition, position = position, "Opened memory partition");

        Ok(Box::new(MemoryPartitionSource {
            log: Arc::clone(&self.log),
            partition,
            position,
            fail_on_data_loss: self.fail_on_data_loss,
            poll_timeout: self.poll_timeout,
        }))
    }
}

/// Reader of one partition of a [`MemoryLog`]
#[derive(Debug)]
pub struct MemoryPartitionSource {
    log: Arc<MemoryLog>,
    partition: PartitionId,
    position: u64,
    fail_on_data_loss: bool,
    poll_timeout: Duration,
}

impl MemoryPartitionSource {
    fn read_batch(&mut self, max_batch: usize) -> SourceResult<Vec<RawEvent>> {
        let log = self.log.partition_log(self.partition)?.lock();

        if self.position < log.base_offset {
            if self.fail_on_data_loss {
                return Err(SourceError::DataLoss {
                    partition: self.partition,
                    requested: self.position,
                    available: log.base_offset,
                });
            }
            warn!(
                partition = self.partition,
                requested = self.position,
                available = log.base_offset,
                "Offsets no longer available, skipping ahead"
            );
            self.position = log.base_offset;
        }

        let start = (self.position - log.base_offset) as usize;
        let batch: Vec<RawEvent> = log
            .events
            .iter()
            .skip(start)
            .take(max_batch)
            .enumerate()
            .map(|(i, payload)| RawEvent::new(payload.clone(), self.partition, self.position + i as u64))
            .collect();
        self.position += batch.len() as u64;
        Ok(batch)
    }
}

#[async_trait]
impl PartitionSource for MemoryPartitionSource {
    fn partition(&self) -> PartitionId {
        self.partition
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn poll(&mut self, max_batch: usize) -> SourceResult<Vec<RawEvent>> {
        if self.log.take_injected_failure() {
            return Err(SourceError::Unavailable {
                reason: "injected outage".to_string(),
            });
        }

        let log = Arc::clone(&self.log);
        let notified = log.appended.notified();
        let batch = self.read_batch(max_batch)?;
        if !batch.is_empty() {
            return Ok(batch);
        }

        let _ = tokio::time::timeout(self.poll_timeout, notified).await;
        self.read_batch(max_batch)
    }

    async fn commit_offsets(&mut self, next_offset: u64) -> SourceResult<()> {
        let mut log = self.log.partition_log(self.partition)?.lock();
        log.committed = Some(log.committed.map_or(next_offset, |c| c.max(next_offset)));
        Ok(())
    }
}
