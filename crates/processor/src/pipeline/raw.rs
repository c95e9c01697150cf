//! Raw pass-through path
//!
//! Decoded trades go straight to the `trades` table; every batch is committed
//! as soon as its rows are stored.

use crate::error::Result;
use crate::metrics::PipelineMetrics;
use crate::sink::SinkDispatcher;
use crate::state::{BatchProgress, CheckpointCoordinator, CheckpointRecord};
use std::sync::Arc;
use tracing::debug;
use tradeflow_types::{PartitionId, TradeRecord};

/// Output path writing raw trades
pub struct RawPath {
    dispatcher: Arc<SinkDispatcher>,
    checkpoint: CheckpointCoordinator,
    metrics: PipelineMetrics,
}

impl RawPath {
    pub fn new(
        dispatcher: Arc<SinkDispatcher>,
        checkpoint: CheckpointCoordinator,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            dispatcher,
            checkpoint,
            metrics,
        }
    }

    /// Reload the committed checkpoint
    pub async fn restore(&self) -> Result<Option<CheckpointRecord>> {
        Ok(self.checkpoint.restore().await?)
    }

    /// Store a batch and commit its progress
    ///
    /// Returns the committed resume offset of the partition.
    pub async fn process(
        &self,
        partition: PartitionId,
        records: &[TradeRecord],
        batch_end: u64,
    ) -> Result<u64> {
        let token = self.dispatcher.write_raw(records).await?;
        let progress = BatchProgress {
            partition,
            resume_from: batch_end + 1,
            read_through: batch_end,
        };
        self.checkpoint.commit(progress, token).await?;
        self.metrics.checkpoints_committed.inc();

        debug!(
            partition = partition,
            rows = records.len(),
            resume_from = progress.resume_from,
            "Raw batch committed"
        );
        Ok(progress.resume_from)
    }

    /// The path's checkpoint coordinator
    pub fn checkpoint(&self) -> &CheckpointCoordinator {
        &self.checkpoint
    }
}
