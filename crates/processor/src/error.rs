//! Error types for the stream processor
//!
//! Every failure the engine can observe maps onto one of these kinds. Decode
//! and late-data errors are recovered locally by routing the offending input to
//! the dead-letter sink; sink and checkpoint errors fail the enclosing batch;
//! source unavailability is retried until shutdown.

use thiserror::Error;

/// Main processor error type
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Payload failed schema validation
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Record arrived for a window that is already closed
    #[error("late data: {0}")]
    LateData(#[from] LateDataError),

    /// Storage collaborator rejected a write
    #[error("sink write error: {0}")]
    SinkWrite(#[from] SinkWriteError),

    /// Checkpoint durability failure
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Source collaborator failure
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// Dead-letter sink failure
    #[error("dead letter error: {0}")]
    DeadLetter(#[from] DeadLetterError),

    /// State backend errors
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Configuration errors
    #[error("configuration error: {source}")]
    Configuration {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Execution errors
    #[error("execution error: {source}")]
    Execution {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessorError {
    /// Whether the error must stop every shard, not only the one that hit it
    ///
    /// Only checkpoint durability qualifies: without it no shard can make
    /// progress safely.
    pub fn is_fatal_for_process(&self) -> bool {
        matches!(self, ProcessorError::Checkpoint(_))
    }
}

/// A payload that does not conform to the trade schema
#[derive(Error, Debug, Clone)]
#[error("failed to decode payload at {partition}:{offset} ({} bytes): {cause}", payload.len())]
pub struct DecodeError {
    /// Partition of the rejected payload
    pub partition: u32,
    /// Offset of the rejected payload
    pub offset: u64,
    /// The rejected payload
    pub payload: Vec<u8>,
    /// Why validation failed
    pub cause: String,
}

/// A record whose window has already been closed by the watermark
#[derive(Error, Debug, Clone, PartialEq)]
#[error("record for {symbol} at {event_time} targets window ending {window_end}, closed at watermark {watermark}")]
pub struct LateDataError {
    /// Symbol of the rejected record
    pub symbol: String,
    /// Event time of the record in milliseconds
    pub event_time: i64,
    /// End of the target window in milliseconds
    pub window_end: i64,
    /// Close frontier that rejected the record
    pub watermark: i64,
}

/// Storage write failures
#[derive(Error, Debug, Clone)]
pub enum SinkWriteError {
    /// Failure that may succeed on retry
    #[error("transient failure writing to {table}: {reason}")]
    Transient { table: String, reason: String },

    /// Failure that will not succeed on retry
    #[error("permanent failure writing to {table}: {reason}")]
    Permanent { table: String, reason: String },

    /// Write did not complete in time
    #[error("write to {table} timed out after {timeout_ms}ms")]
    Timeout { table: String, timeout_ms: u64 },

    /// Retry budget spent
    #[error("write to {table} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        table: String,
        attempts: u32,
        last_error: String,
    },
}

impl SinkWriteError {
    /// Whether a retry may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SinkWriteError::Transient { .. } | SinkWriteError::Timeout { .. }
        )
    }
}

/// Checkpoint store failures
#[derive(Error, Debug, Clone)]
pub enum CheckpointError {
    /// Durable write failed
    #[error("failed to write checkpoint to {location}: {reason}")]
    Write { location: String, reason: String },

    /// Durable read failed
    #[error("failed to read checkpoint from {location}: {reason}")]
    Read { location: String, reason: String },

    /// Stored record failed integrity validation
    #[error("corrupted checkpoint at {location}: {reason}")]
    Corrupted { location: String, reason: String },

    /// A checkpoint was required but none exists
    #[error("no checkpoint found for stream {stream_id}")]
    Missing { stream_id: String },

    /// Durable write did not complete in time
    #[error("checkpoint write to {location} timed out after {timeout_ms}ms")]
    Timeout { location: String, timeout_ms: u64 },

    /// Commit would move progress backwards
    #[error("checkpoint regression for {stream_id} partition {partition}: {committed} -> {proposed}")]
    Regression {
        stream_id: String,
        partition: u32,
        committed: u64,
        proposed: u64,
    },
}

/// Source collaborator failures
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    /// Source cannot be reached right now
    #[error("source unavailable: {reason}")]
    Unavailable { reason: String },

    /// Requested offsets are no longer in the log
    #[error("data loss on partition {partition}: requested offset {requested}, earliest available {available}")]
    DataLoss {
        partition: u32,
        requested: u64,
        available: u64,
    },

    /// Offset commit was rejected
    #[error("failed to commit offset {offset} on partition {partition}: {reason}")]
    Commit {
        partition: u32,
        offset: u64,
        reason: String,
    },

    /// Source is misconfigured
    #[error("invalid source configuration: {reason}")]
    Configuration { reason: String },
}

impl SourceError {
    /// Whether the operation should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SourceError::Unavailable { .. } | SourceError::Commit { .. }
        )
    }
}

/// Dead-letter sink failures
#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("dead letter I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dead letter serialization error: {0}")]
    Serialization(String),

    #[error("dead letter write timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// State backend operation errors
#[derive(Error, Debug)]
pub enum StateError {
    /// State serialization failed
    #[error("state serialization failed for key '{key}': {reason}")]
    SerializationFailed { key: String, reason: String },

    /// State deserialization failed
    #[error("state deserialization failed for key '{key}': {reason}")]
    DeserializationFailed { key: String, reason: String },

    /// State backend storage error
    #[error("storage error in {backend_type}: {details}")]
    StorageError {
        backend_type: String,
        details: String,
    },
}

/// Result type alias for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Result type alias for state operations
pub type StateResult<T> = std::result::Result<T, StateError>;

/// Result type alias for checkpoint operations
pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;

/// Result type alias for sink operations
pub type SinkResult<T> = std::result::Result<T, SinkWriteError>;

/// Result type alias for source operations
pub type SourceResult<T> = std::result::Result<T, SourceError>;

impl From<serde_json::Error> for ProcessorError {
    fn from(err: serde_json::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ProcessorError {
    fn from(err: tokio::task::JoinError) -> Self {
        ProcessorError::Execution {
            source: Box::new(err),
        }
    }
}
