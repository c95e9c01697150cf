//! Checkpointing and recovery of source progress
//!
//! Each output path owns one checkpoint location holding a single
//! [`CheckpointRecord`]: per-partition source progress plus the highest
//! watermark whose windows have all been flushed. The record is rewritten
//! atomically (temp file, fsync, rename) after every batch whose sink writes
//! have committed, so a crash at any point leaves either the previous or the
//! next record on disk, never a torn one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use tradeflow_types::PartitionId;

use crate::error::{CheckpointError, CheckpointResult};
use crate::sink::Table;
use crate::watermark::Watermark;

/// Version of the checkpoint format
pub const CHECKPOINT_VERSION: u32 = 1;

const CHECKPOINT_FILE: &str = "checkpoint";
const CHECKPOINT_TMP_FILE: &str = "checkpoint.tmp";

/// Committed progress of one output path on one source partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionProgress {
    /// First offset whose effect is not yet durable; consumption resumes here
    pub resume_from: u64,
    /// Highest offset read by a committed batch
    pub read_through: u64,
}

/// The durable checkpoint of one output path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Format version
    pub version: u32,
    /// Output path this record belongs to
    pub stream_id: String,
    /// Source progress per partition
    pub offsets: BTreeMap<PartitionId, PartitionProgress>,
    /// Every window closed at or below this watermark has been flushed
    pub last_emitted_window_high_watermark: Option<i64>,
    /// Monotonic commit sequence number
    pub sequence: u64,
    /// When the record was committed
    pub committed_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// An empty record for a stream that has never committed
    pub fn empty(stream_id: impl Into<String>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            stream_id: stream_id.into(),
            offsets: BTreeMap::new(),
            last_emitted_window_high_watermark: None,
            sequence: 0,
            committed_at: Utc::now(),
        }
    }

    /// Progress on a partition, if any was committed
    pub fn progress(&self, partition: PartitionId) -> Option<PartitionProgress> {
        self.offsets.get(&partition).copied()
    }

    /// Restored emitted high watermark
    pub fn emitted_watermark(&self) -> Option<Watermark> {
        self.last_emitted_window_high_watermark.map(Watermark::new)
    }
}

/// On-disk envelope: the encoded record plus its SHA-256 checksum
#[derive(Debug, Serialize, Deserialize)]
struct StoredCheckpoint {
    checksum: String,
    record: Vec<u8>,
}

fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Encode a record for durable storage
pub fn encode_record(record: &CheckpointRecord) -> Result<Vec<u8>, String> {
    let body = bincode::serialize(record).map_err(|e| e.to_string())?;
    bincode::serialize(&StoredCheckpoint {
        checksum: checksum(&body),
        record: body,
    })
    .map_err(|e| e.to_string())
}

/// Decode and validate a stored record
pub fn decode_record(bytes: &[u8]) -> Result<CheckpointRecord, String> {
    let stored: StoredCheckpoint = bincode::deserialize(bytes).map_err(|e| e.to_string())?;
    let calculated = checksum(&stored.record);
    if calculated != stored.checksum {
        return Err(format!(
            "Checksum mismatch: expected {}, got {}",
            stored.checksum, calculated
        ));
    }

    let record: CheckpointRecord =
        bincode::deserialize(&stored.record).map_err(|e| e.to_string())?;
    if record.version != CHECKPOINT_VERSION {
        return Err(format!("unsupported checkpoint version {}", record.version));
    }
    Ok(record)
}

/// Durable key-value location holding the latest record of one stream
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the latest committed record, if any
    async fn load(&self) -> CheckpointResult<Option<CheckpointRecord>>;

    /// Atomically replace the stored record
    async fn save(&self, record: &CheckpointRecord) -> CheckpointResult<()>;

    /// Human-readable location for logs and errors
    fn location(&self) -> String;
}

/// Checkpoint store backed by a directory on the local filesystem
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store rooted at `dir`; the directory is created on first save
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the checkpoint
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_error(&self, reason: impl std::fmt::Display) -> CheckpointError {
        CheckpointError::Write {
            location: self.location(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> CheckpointResult<Option<CheckpointRecord>> {
        let path = self.dir.join(CHECKPOINT_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CheckpointError::Read {
                    location: self.location(),
                    reason: e.to_string(),
                })
            }
        };

        let record = decode_record(&bytes).map_err(|reason| CheckpointError::Corrupted {
            location: self.location(),
            reason,
        })?;

        debug!(
            location = %self.location(),
            sequence = record.sequence,
            "Loaded checkpoint"
        );
        Ok(Some(record))
    }

    async fn save(&self, record: &CheckpointRecord) -> CheckpointResult<()> {
        let bytes = encode_record(record).map_err(|e| self.write_error(e))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| self.write_error(format!("Failed to create directory: {}", e)))?;

        let tmp_path = self.dir.join(CHECKPOINT_TMP_FILE);
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| self.write_error(e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| self.write_error(e))?;
        file.sync_all().await.map_err(|e| self.write_error(e))?;
        drop(file);

        tokio::fs::rename(&tmp_path, self.dir.join(CHECKPOINT_FILE))
            .await
            .map_err(|e| self.write_error(format!("Failed to publish checkpoint: {}", e)))?;

        // Persist the rename itself
        let dir = tokio::fs::File::open(&self.dir)
            .await
            .map_err(|e| self.write_error(e))?;
        dir.sync_all().await.map_err(|e| self.write_error(e))?;

        Ok(())
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

/// Checkpoint store kept in memory, for tests and ephemeral runs
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    record: Arc<SyncMutex<Option<CheckpointRecord>>>,
    saves: Arc<AtomicU64>,
}

impl MemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored record
    pub fn current(&self) -> Option<CheckpointRecord> {
        self.record.lock().clone()
    }

    /// Number of successful saves
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> CheckpointResult<Option<CheckpointRecord>> {
        Ok(self.record.lock().clone())
    }

    async fn save(&self, record: &CheckpointRecord) -> CheckpointResult<()> {
        *self.record.lock() = Some(record.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

/// Progress of one completed batch on one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    /// Partition the batch was read from
    pub partition: PartitionId,
    /// First offset whose effect is not yet durable after this batch
    pub resume_from: u64,
    /// Last offset read by this batch
    pub read_through: u64,
}

/// Proof that the sink writes of a batch have committed
///
/// Only the sink dispatcher creates tokens, and only after a successful write,
/// so a checkpoint can never be committed ahead of its output.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkCommitToken {
    table: Table,
    rows: usize,
    emitted_through: Option<Watermark>,
}

impl SinkCommitToken {
    pub(crate) fn new(table: Table, rows: usize) -> Self {
        Self {
            table,
            rows,
            emitted_through: None,
        }
    }

    /// Attach the frontier whose windows this commit completed
    pub(crate) fn with_emitted_through(mut self, watermark: Watermark) -> Self {
        self.emitted_through = Some(watermark);
        self
    }

    /// Table the rows were written to
    pub fn table(&self) -> Table {
        self.table
    }

    /// Number of rows written
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Emitted high watermark established by the commit
    pub fn emitted_through(&self) -> Option<Watermark> {
        self.emitted_through
    }
}

/// Statistics about checkpointing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Total number of checkpoints committed
    pub checkpoints_committed: u64,
    /// Total number of checkpoint failures
    pub checkpoint_failures: u64,
    /// Last checkpoint duration in milliseconds
    pub last_checkpoint_duration_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct StatsCounters {
    committed: AtomicU64,
    failures: AtomicU64,
    last_duration_ms: AtomicU64,
}

/// Checkpoint coordinator of one output path
///
/// Shards of the path commit through the same coordinator; commits are
/// serialised and each one rewrites the whole record with the committing
/// partition's progress replaced.
pub struct CheckpointCoordinator {
    stream_id: String,
    store: Arc<dyn CheckpointStore>,
    committed: Mutex<CheckpointRecord>,
    write_timeout: Duration,
    stats: StatsCounters,
}

impl CheckpointCoordinator {
    /// Create a coordinator for a stream
    pub fn new(
        stream_id: impl Into<String>,
        store: Arc<dyn CheckpointStore>,
        write_timeout: Duration,
    ) -> Self {
        let stream_id = stream_id.into();
        Self {
            committed: Mutex::new(CheckpointRecord::empty(stream_id.clone())),
            stream_id,
            store,
            write_timeout,
            stats: StatsCounters::default(),
        }
    }

    /// Stream this coordinator commits for
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Store location
    pub fn location(&self) -> String {
        self.store.location()
    }

    /// Reload the last committed record, discarding in-memory progress
    pub async fn restore(&self) -> CheckpointResult<Option<CheckpointRecord>> {
        let loaded = self.store.load().await?;
        let mut committed = self.committed.lock().await;

        match &loaded {
            Some(record) => {
                if record.stream_id != self.stream_id {
                    return Err(CheckpointError::Corrupted {
                        location: self.store.location(),
                        reason: format!(
                            "checkpoint belongs to stream '{}', expected '{}'",
                            record.stream_id, self.stream_id
                        ),
                    });
                }
                info!(
                    stream = %self.stream_id,
                    location = %self.store.location(),
                    sequence = record.sequence,
                    partitions = record.offsets.len(),
                    emitted_watermark = ?record.last_emitted_window_high_watermark,
                    "Restored checkpoint"
                );
                *committed = record.clone();
            }
            None => {
                info!(
                    stream = %self.stream_id,
                    location = %self.store.location(),
                    "No checkpoint found, starting fresh"
                );
                *committed = CheckpointRecord::empty(self.stream_id.clone());
            }
        }

        Ok(loaded)
    }

    /// Durably advance the checkpoint after a committed batch
    ///
    /// The record on disk is unchanged if this fails.
    pub async fn commit(
        &self,
        progress: BatchProgress,
        token: SinkCommitToken,
    ) -> CheckpointResult<CheckpointRecord> {
        if token.table().name() != self.stream_id {
            return Err(CheckpointError::Write {
                location: self.store.location(),
                reason: format!(
                    "commit token for '{}' presented to stream '{}'",
                    token.table().name(),
                    self.stream_id
                ),
            });
        }

        let mut committed = self.committed.lock().await;

        if let Some(previous) = committed.progress(progress.partition) {
            if progress.resume_from < previous.resume_from {
                return Err(CheckpointError::Regression {
                    stream_id: self.stream_id.clone(),
                    partition: progress.partition,
                    committed: previous.resume_from,
                    proposed: progress.resume_from,
                });
            }
        }

        let mut next = committed.clone();
        let read_through = next
            .progress(progress.partition)
            .map_or(progress.read_through, |p| p.read_through.max(progress.read_through));
        next.offsets.insert(
            progress.partition,
            PartitionProgress {
                resume_from: progress.resume_from,
                read_through,
            },
        );
        if let Some(watermark) = token.emitted_through() {
            next.last_emitted_window_high_watermark = Some(
                next.last_emitted_window_high_watermark
                    .map_or(watermark.timestamp, |w| w.max(watermark.timestamp)),
            );
        }
        next.sequence += 1;
        next.committed_at = Utc::now();

        let start = Instant::now();
        let saved = tokio::time::timeout(self.write_timeout, self.store.save(&next)).await;
        let result = match saved {
            Ok(result) => result,
            Err(_) => Err(CheckpointError::Timeout {
                location: self.store.location(),
                timeout_ms: self.write_timeout.as_millis() as u64,
            }),
        };

        if let Err(e) = result {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            error!(
                stream = %self.stream_id,
                partition = progress.partition,
                error = %e,
                "Checkpoint commit failed"
            );
            return Err(e);
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        self.stats.committed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_duration_ms
            .store(elapsed_ms, Ordering::Relaxed);

        debug!(
            stream = %self.stream_id,
            partition = progress.partition,
            resume_from = progress.resume_from,
            read_through = read_through,
            rows = token.rows(),
            sequence = next.sequence,
            "Checkpoint committed"
        );

        *committed = next.clone();
        Ok(next)
    }

    /// Snapshot of the last committed record
    pub async fn latest(&self) -> CheckpointRecord {
        self.committed.lock().await.clone()
    }

    /// Checkpointing statistics
    pub fn stats(&self) -> CheckpointStats {
        let committed = self.stats.committed.load(Ordering::Relaxed);
        CheckpointStats {
            checkpoints_committed: committed,
            checkpoint_failures: self.stats.failures.load(Ordering::Relaxed),
            last_checkpoint_duration_ms: (committed > 0)
                .then(|| self.stats.last_duration_ms.load(Ordering::Relaxed)),
        }
    }
}
