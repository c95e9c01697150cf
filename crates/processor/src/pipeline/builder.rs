//! Pipeline builder for fluent API configuration
//!
//! Collaborators are injected here: the source, the storage collaborator, the
//! dead-letter sink and, optionally, the decoder and checkpoint stores. Missing
//! optional pieces default to the bundled Avro schema and file checkpoints at
//! the configured locations.

use super::driver::PipelineDriver;
use super::raw::RawPath;
use super::windowed::WindowedPath;
use crate::config::ProcessorConfig;
use crate::decode::{AvroTradeDecoder, RecordDecoder};
use crate::error::{ProcessorError, Result};
use crate::metrics::PipelineMetrics;
use crate::sink::{DeadLetterSink, SinkDispatcher, Table, TableStore};
use crate::source::{SourceConnector, StartingOffsets};
use crate::state::{CheckpointCoordinator, CheckpointStore, FileCheckpointStore};
use std::sync::Arc;

/// Builder for a [`PipelineDriver`]
///
/// # Example
///
/// ```rust,no_run
/// use processor::pipeline::PipelineBuilder;
/// use processor::sink::{MemoryDeadLetterSink, MemoryTableStore};
/// use processor::source::{MemoryConnector, MemoryLog};
/// use processor::ProcessorConfig;
/// use std::sync::Arc;
///
/// # async fn example() -> anyhow::Result<()> {
/// let log = MemoryLog::new(2);
/// let driver = PipelineBuilder::new(ProcessorConfig::default())
///     .with_source(Arc::new(MemoryConnector::new(log)))
///     .with_table_store(Arc::new(MemoryTableStore::new()))
///     .with_dead_letters(Arc::new(MemoryDeadLetterSink::new()))
///     .build()?;
/// let handle = driver.start().await?;
/// handle.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct PipelineBuilder {
    config: ProcessorConfig,
    starting_offsets: StartingOffsets,
    connector: Option<Arc<dyn SourceConnector>>,
    decoder: Option<Arc<dyn RecordDecoder>>,
    store: Option<Arc<dyn TableStore>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    raw_checkpoints: Option<Arc<dyn CheckpointStore>>,
    windowed_checkpoints: Option<Arc<dyn CheckpointStore>>,
    metrics: Option<PipelineMetrics>,
}

impl PipelineBuilder {
    /// Start from a processor configuration
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            starting_offsets: StartingOffsets::default(),
            connector: None,
            decoder: None,
            store: None,
            dead_letters: None,
            raw_checkpoints: None,
            windowed_checkpoints: None,
            metrics: None,
        }
    }

    /// Source to consume
    pub fn with_source(mut self, connector: Arc<dyn SourceConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Start policy for partitions without a checkpoint
    pub fn with_starting_offsets(mut self, starting_offsets: StartingOffsets) -> Self {
        self.starting_offsets = starting_offsets;
        self
    }

    /// Payload decoder
    pub fn with_decoder(mut self, decoder: Arc<dyn RecordDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Storage collaborator for both tables
    pub fn with_table_store(mut self, store: Arc<dyn TableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Destination for undecodable and late inputs
    pub fn with_dead_letters(mut self, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Checkpoint stores of the raw and windowed paths
    pub fn with_checkpoint_stores(
        mut self,
        raw: Arc<dyn CheckpointStore>,
        windowed: Arc<dyn CheckpointStore>,
    ) -> Self {
        self.raw_checkpoints = Some(raw);
        self.windowed_checkpoints = Some(windowed);
        self
    }

    /// Metrics to update
    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and assemble the driver
    pub fn build(self) -> Result<PipelineDriver> {
        self.config.validate()?;

        let connector = self.connector.ok_or_else(|| missing("source"))?;
        let store = self.store.ok_or_else(|| missing("table store"))?;
        let dead_letters = self.dead_letters.ok_or_else(|| missing("dead-letter sink"))?;
        let decoder: Arc<dyn RecordDecoder> = match self.decoder {
            Some(decoder) => decoder,
            None => Arc::new(AvroTradeDecoder::bundled()?),
        };
        let raw_checkpoints = self.raw_checkpoints.unwrap_or_else(|| {
            Arc::new(FileCheckpointStore::new(&self.config.checkpoint.raw_location))
        });
        let windowed_checkpoints = self.windowed_checkpoints.unwrap_or_else(|| {
            Arc::new(FileCheckpointStore::new(
                &self.config.checkpoint.windowed_location,
            ))
        });
        let metrics = self.metrics.unwrap_or_default();

        let timeout = self.config.checkpoint.write_timeout();
        let dispatcher = Arc::new(SinkDispatcher::new(
            store,
            self.config.sink.clone(),
            metrics.clone(),
        ));

        let raw = RawPath::new(
            Arc::clone(&dispatcher),
            CheckpointCoordinator::new(Table::Trades.name(), raw_checkpoints, timeout),
            metrics.clone(),
        );
        let windowed = WindowedPath::new(
            &self.config,
            dispatcher,
            CheckpointCoordinator::new(Table::MinuteTrades.name(), windowed_checkpoints, timeout),
            Arc::clone(&dead_letters),
            metrics.clone(),
        );

        Ok(PipelineDriver {
            config: self.config,
            starting_offsets: self.starting_offsets,
            connector,
            decoder,
            dead_letters,
            raw: Arc::new(raw),
            windowed: Arc::new(windowed),
            metrics,
        })
    }
}

fn missing(what: &str) -> ProcessorError {
    ProcessorError::Configuration {
        source: format!("pipeline requires a {}", what).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemoryDeadLetterSink, MemoryTableStore};
    use crate::source::{MemoryConnector, MemoryLog};

    #[test]
    fn test_build_requires_source() {
        let result = PipelineBuilder::new(ProcessorConfig::default())
            .with_table_store(Arc::new(MemoryTableStore::new()))
            .with_dead_letters(Arc::new(MemoryDeadLetterSink::new()))
            .build();
        assert!(matches!(result, Err(ProcessorError::Configuration { .. })));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = ProcessorConfig::default();
        config.window.size_ms = 0;
        let result = PipelineBuilder::new(config)
            .with_source(Arc::new(MemoryConnector::new(MemoryLog::new(1))))
            .with_table_store(Arc::new(MemoryTableStore::new()))
            .with_dead_letters(Arc::new(MemoryDeadLetterSink::new()))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_build_with_defaults() {
        let driver = PipelineBuilder::new(ProcessorConfig::default())
            .with_source(Arc::new(MemoryConnector::new(MemoryLog::new(1))))
            .with_table_store(Arc::new(MemoryTableStore::new()))
            .with_dead_letters(Arc::new(MemoryDeadLetterSink::new()))
            .build();
        assert!(driver.is_ok());
    }
}
