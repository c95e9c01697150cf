//! Dead-letter destinations
//!
//! Undecodable payloads and records for closed windows are never dropped
//! silently: each one becomes a [`DeadLetter`] entry. Delivery is
//! at-least-once; an entry may repeat after a crash replays its batch.

use crate::error::{DecodeError, DeadLetterError, LateDataError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use tradeflow_types::{PartitionId, TradeRecord};
use uuid::Uuid;

/// Why an input was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Payload failed schema validation
    Decode,
    /// Record arrived after its window was closed
    LateData,
}

/// One dead-lettered input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub reason: DeadLetterReason,
    pub partition: PartitionId,
    pub offset: u64,
    /// Original payload, for decode failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    /// Decoded record, for late data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<TradeRecord>,
    pub detail: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Entry for a payload that could not be decoded
    pub fn decode(err: &DecodeError) -> Self {
        Self {
            id: Uuid::new_v4(),
            reason: DeadLetterReason::Decode,
            partition: err.partition,
            offset: err.offset,
            payload: Some(err.payload.clone()),
            record: None,
            detail: err.cause.clone(),
            failed_at: Utc::now(),
        }
    }

    /// Entry for a record rejected by a closed window
    pub fn late(record: &TradeRecord, err: &LateDataError) -> Self {
        Self {
            id: Uuid::new_v4(),
            reason: DeadLetterReason::LateData,
            partition: record.source_partition,
            offset: record.source_offset,
            payload: None,
            record: Some(record.clone()),
            detail: err.to_string(),
            failed_at: Utc::now(),
        }
    }
}

/// Destination for dead-lettered inputs
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Durably record an entry
    async fn send(&self, letter: DeadLetter) -> Result<(), DeadLetterError>;
}

/// Send `letter`, giving up once `timeout` elapses
pub async fn send_within(
    sink: &dyn DeadLetterSink,
    letter: DeadLetter,
    timeout: Duration,
) -> Result<(), DeadLetterError> {
    match tokio::time::timeout(timeout, sink.send(letter)).await {
        Ok(result) => result,
        Err(_) => Err(DeadLetterError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Dead-letter sink kept in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryDeadLetterSink {
    letters: Arc<SyncMutex<Vec<DeadLetter>>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries received so far
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        self.letters.lock().push(letter);
        Ok(())
    }
}

const FILE_PREFIX: &str = "dead_letters";
const FILE_EXTENSION: &str = "jsonl";

struct ActiveFile {
    file: File,
    index: u32,
    size: u64,
}

/// Dead-letter sink writing JSON lines to size-rotated files
///
/// Files are named `dead_letters.<n>.jsonl` inside the configured directory;
/// numbering continues from the highest existing file after a restart.
pub struct FileDeadLetterSink {
    dir: PathBuf,
    max_file_size: u64,
    active: Mutex<Option<ActiveFile>>,
}

impl FileDeadLetterSink {
    /// Create a sink writing into `dir`, rotating files above `max_file_size` bytes
    pub fn new(dir: impl Into<PathBuf>, max_file_size: u64) -> Self {
        Self {
            dir: dir.into(),
            max_file_size: max_file_size.max(1),
            active: Mutex::new(None),
        }
    }

    /// Directory holding the files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, index: u32) -> PathBuf {
        self.dir
            .join(format!("{}.{:05}.{}", FILE_PREFIX, index, FILE_EXTENSION))
    }

    /// Dead-letter files in rotation order
    pub async fn files(&self) -> Result<Vec<PathBuf>, DeadLetterError> {
        let mut indices = self.existing_indices().await?;
        indices.sort_unstable();
        Ok(indices.into_iter().map(|i| self.file_path(i)).collect())
    }

    async fn existing_indices(&self) -> Result<Vec<u32>, DeadLetterError> {
        let mut indices = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(indices),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let index = name
                .to_str()
                .and_then(|n| n.strip_prefix(FILE_PREFIX))
                .and_then(|n| n.strip_prefix('.'))
                .and_then(|n| n.strip_suffix(FILE_EXTENSION))
                .and_then(|n| n.strip_suffix('.'))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(index) = index {
                indices.push(index);
            }
        }
        Ok(indices)
    }

    async fn open(&self, index: u32) -> Result<ActiveFile, DeadLetterError> {
        let path = self.file_path(index);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let size = file.metadata().await?.len();
        debug!(path = %path.display(), size = size, "Opened dead-letter file");
        Ok(ActiveFile { file, index, size })
    }
}

#[async_trait]
impl DeadLetterSink for FileDeadLetterSink {
    async fn send(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        let mut line = serde_json::to_vec(&letter)
            .map_err(|e| DeadLetterError::Serialization(e.to_string()))?;
        line.push(b'\n');

        let mut active = self.active.lock().await;

        let current = match active.take() {
            Some(current) => current,
            None => {
                tokio::fs::create_dir_all(&self.dir).await?;
                let index = self.existing_indices().await?.into_iter().max().unwrap_or(0);
                self.open(index).await?
            }
        };

        let mut current = if current.size > 0 && current.size + line.len() as u64 > self.max_file_size
        {
            let next = current.index + 1;
            info!(
                dir = %self.dir.display(),
                index = next,
                "Rotating dead-letter file"
            );
            self.open(next).await?
        } else {
            current
        };

        current.file.write_all(&line).await?;
        current.file.sync_data().await?;
        current.size += line.len() as u64;
        *active = Some(current);
        Ok(())
    }
}
