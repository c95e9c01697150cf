//! Streaming aggregation engine for trade events
//!
//! Consumes an at-least-once, partitioned feed of binary trade envelopes,
//! writes every decoded trade to a raw table, and aggregates trades into
//! per-symbol, per-minute event-time windows that are emitted exactly once.
//! Progress of each output path is checkpointed only after its rows are
//! stored, and all writes are upserts by natural key, so a crash followed by
//! replay has no visible effect.

pub mod backoff;
pub mod config;
pub mod decode;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod state;
pub mod watermark;
pub mod window;

// Re-export commonly used types
pub use config::{
    CheckpointConfig, ProcessorConfig, SinkConfig, SourceRetryConfig, WatermarkConfig,
    WindowConfig,
};

pub use error::{
    CheckpointError, DecodeError, DeadLetterError, LateDataError, ProcessorError,
    Result as ProcessorResult, SinkWriteError, SourceError, StateError,
};

pub use decode::{AvroTradeDecoder, RecordDecoder};

pub use pipeline::{PipelineBuilder, PipelineDriver, PipelineHandle, PipelineReport};

pub use sink::{
    BackendTableStore, DeadLetter, DeadLetterReason, DeadLetterSink, FileDeadLetterSink,
    MemoryDeadLetterSink, MemoryTableStore, SinkDispatcher, Table, TableStore,
};

pub use source::{
    KafkaConnector, MemoryConnector, MemoryLog, PartitionSource, SourceConfig, SourceConnector,
    StartPosition, StartingOffsets,
};

pub use state::{
    CheckpointCoordinator, CheckpointRecord, CheckpointStore, FileCheckpointStore,
    MemoryCheckpointStore, MemoryStateBackend, SledConfig, SledStateBackend, StateBackend,
};

pub use watermark::{Watermark, WatermarkTracker};

pub use window::{PendingWindow, TumblingWindowAssigner, WindowAggregator, WindowKey};

pub use metrics::{MetricsRegistry, PipelineMetrics};
