//! Pipeline driver
//!
//! One shard per source partition. Each shard polls a batch, decodes it,
//! dead-letters undecodable payloads, then runs the raw and windowed paths
//! over the batch concurrently. The source cursor of the partition only
//! advances to the smaller of the two committed resume offsets, so neither
//! path can lose replay safety because the other moved ahead.
//!
//! A shard that fails stops on its own; a checkpoint failure stops every
//! shard. Shutdown is observed between batches, so an in-flight batch always
//! finishes its commit or fails it before the shard exits.

use super::raw::RawPath;
use super::windowed::WindowedPath;
use crate::backoff::ExponentialBackoff;
use crate::config::ProcessorConfig;
use crate::decode::RecordDecoder;
use crate::error::{ProcessorError, Result, SourceResult};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::sink::{send_within, DeadLetter, DeadLetterSink};
use crate::source::{PartitionSource, SourceConnector, StartPosition, StartingOffsets};
use crate::state::CheckpointRecord;
use crate::watermark::{LateDataSnapshot, Watermark};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tradeflow_types::{PartitionId, RawEvent, TradeRecord};

/// Final state of a pipeline run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Number of shards that ran
    pub shards: usize,
    /// Metric values at exit
    pub metrics: MetricsSnapshot,
    /// Late-data counters at exit
    pub late_data: LateDataSnapshot,
    /// Stream watermark at exit
    pub watermark: Watermark,
    /// Last committed raw-path checkpoint
    pub raw_checkpoint: CheckpointRecord,
    /// Last committed windowed-path checkpoint
    pub windowed_checkpoint: CheckpointRecord,
}

/// The assembled pipeline, ready to start
pub struct PipelineDriver {
    pub(super) config: ProcessorConfig,
    pub(super) starting_offsets: StartingOffsets,
    pub(super) connector: Arc<dyn SourceConnector>,
    pub(super) decoder: Arc<dyn RecordDecoder>,
    pub(super) dead_letters: Arc<dyn DeadLetterSink>,
    pub(super) raw: Arc<RawPath>,
    pub(super) windowed: Arc<WindowedPath>,
    pub(super) metrics: PipelineMetrics,
}

impl PipelineDriver {
    /// Restore both checkpoints and start consuming
    ///
    /// Checkpoint restore failures are returned here; everything after that,
    /// including partition discovery, is reported by [`PipelineHandle::wait`].
    pub async fn start(self) -> Result<PipelineHandle> {
        let raw_record = self.raw.restore().await?;
        let windowed_record = self.windowed.restore().await?;

        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let metrics = self.metrics.clone();
        let task = tokio::spawn(self.supervise(Arc::clone(&shutdown), raw_record, windowed_record));

        Ok(PipelineHandle {
            shutdown,
            task,
            metrics,
        })
    }

    /// Run until `signal` resolves or the pipeline fails
    pub async fn run_until<F>(self, signal: F) -> Result<PipelineReport>
    where
        F: Future<Output = ()>,
    {
        let mut handle = self.start().await?;
        let finished = tokio::select! {
            _ = signal => None,
            finished = &mut handle.task => Some(finished),
        };

        match finished {
            Some(finished) => finished?,
            None => {
                info!("Shutdown requested");
                handle.shutdown().await
            }
        }
    }

    fn start_position(
        &self,
        partition: PartitionId,
        raw: Option<&CheckpointRecord>,
        windowed: Option<&CheckpointRecord>,
    ) -> Result<StartPosition> {
        let committed = [raw, windowed]
            .into_iter()
            .flatten()
            .filter_map(|record| record.progress(partition))
            .map(|progress| progress.resume_from)
            .min();
        self.starting_offsets.resolve(committed, partition)
    }

    async fn supervise(
        self,
        shutdown: Arc<watch::Sender<bool>>,
        raw_record: Option<CheckpointRecord>,
        windowed_record: Option<CheckpointRecord>,
    ) -> Result<PipelineReport> {
        let mut stop = shutdown.subscribe();
        let backoff = ExponentialBackoff::new(
            self.config.source_retry.base_backoff_ms,
            self.config.source_retry.max_backoff_ms,
        );

        let connector: &dyn SourceConnector = self.connector.as_ref();
        let partitions = match retry_source(&backoff, &self.metrics, &mut stop, "discover partitions", move || {
            connector.partitions()
        })
        .await?
        {
            Some(partitions) => partitions,
            None => return self.report(0).await,
        };

        if partitions.is_empty() {
            warn!("Source has no partitions");
        }
        self.windowed.retain_replay(&partitions);

        let starts = partitions
            .iter()
            .map(|&partition| {
                self.start_position(partition, raw_record.as_ref(), windowed_record.as_ref())
                    .map(|start| (partition, start))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut shards = JoinSet::new();
        for (partition, start) in starts {
            let source = match retry_source(&backoff, &self.metrics, &mut stop, "open partition", move || {
                connector.open(partition, start)
            })
            .await?
            {
                Some(source) => source,
                None => break,
            };

            let raw_resume = raw_record
                .as_ref()
                .and_then(|r| r.progress(partition))
                .map(|p| p.resume_from);
            let windowed_resume = windowed_record
                .as_ref()
                .and_then(|r| r.progress(partition))
                .map(|p| p.resume_from);

            info!(
                partition = partition,
                start = ?start,
                raw_resume = ?raw_resume,
                windowed_resume = ?windowed_resume,
                "Starting shard"
            );

            let shard = Shard {
                partition,
                source,
                decoder: Arc::clone(&self.decoder),
                dead_letters: Arc::clone(&self.dead_letters),
                dead_letter_timeout: self.config.sink.write_timeout(),
                raw: Arc::clone(&self.raw),
                windowed: Arc::clone(&self.windowed),
                metrics: self.metrics.clone(),
                max_batch: self.config.max_batch_size,
                backoff,
                shutdown: shutdown.subscribe(),
                raw_floor: raw_resume.unwrap_or(0),
                windowed_floor: windowed_resume.unwrap_or(0),
                raw_resume,
                windowed_resume,
                committed_cursor: None,
            };
            shards.spawn(shard.run());
        }

        let mut first_error: Option<ProcessorError> = None;
        while let Some(joined) = shards.join_next().await {
            let result = joined.map_err(ProcessorError::from).and_then(|r| r);
            if let Err(err) = result {
                error!(error = %err, "Shard stopped with error");
                if err.is_fatal_for_process() {
                    error!("Checkpoint durability lost, stopping all shards");
                    shutdown.send_replace(true);
                }
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => self.report(partitions.len()).await,
        }
    }

    async fn report(&self, shards: usize) -> Result<PipelineReport> {
        let report = PipelineReport {
            shards,
            metrics: self.metrics.snapshot(),
            late_data: self.windowed.late_data(),
            watermark: self.windowed.watermark(),
            raw_checkpoint: self.raw.checkpoint().latest().await,
            windowed_checkpoint: self.windowed.checkpoint().latest().await,
        };
        info!(
            shards = shards,
            events = report.metrics.events_polled,
            windows = report.metrics.windows_emitted,
            watermark = %report.watermark,
            "Pipeline stopped"
        );
        Ok(report)
    }
}

/// Handle to a running pipeline
pub struct PipelineHandle {
    shutdown: Arc<watch::Sender<bool>>,
    task: JoinHandle<Result<PipelineReport>>,
    metrics: PipelineMetrics,
}

impl PipelineHandle {
    /// Ask every shard to stop after its in-flight batch
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait for the pipeline to finish
    ///
    /// Resolves with the first shard error, if any shard failed.
    pub async fn wait(self) -> Result<PipelineReport> {
        self.task.await?
    }

    /// Stop and wait
    pub async fn shutdown(self) -> Result<PipelineReport> {
        self.stop();
        self.wait().await
    }

    /// Whether the pipeline has finished
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Live pipeline metrics
    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }
}

/// Retry a source operation while the source is unavailable
///
/// Returns `None` if shutdown was requested while waiting.
async fn retry_source<T, F, Fut>(
    backoff: &ExponentialBackoff,
    metrics: &PipelineMetrics,
    stop: &mut watch::Receiver<bool>,
    operation: &str,
    mut attempt: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SourceResult<T>>,
{
    let mut retries = 0;
    loop {
        if *stop.borrow() {
            return Ok(None);
        }
        match attempt().await {
            Ok(value) => return Ok(Some(value)),
            Err(err) if err.is_retryable() => {
                metrics.source_retries.inc();
                let delay = backoff.delay(retries);
                retries += 1;
                warn!(
                    operation = operation,
                    attempt = retries,
                    error = %err,
                    "Source unavailable, retrying in {:?}",
                    delay
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    changed = stop.changed() => {
                        if changed.is_err() {
                            return Ok(None);
                        }
                    }
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Consumption loop of one partition
struct Shard {
    partition: PartitionId,
    source: Box<dyn PartitionSource>,
    decoder: Arc<dyn RecordDecoder>,
    dead_letters: Arc<dyn DeadLetterSink>,
    dead_letter_timeout: Duration,
    raw: Arc<RawPath>,
    windowed: Arc<WindowedPath>,
    metrics: PipelineMetrics,
    max_batch: usize,
    backoff: ExponentialBackoff,
    shutdown: watch::Receiver<bool>,
    /// First offset the raw path has not processed in this run
    raw_floor: u64,
    /// First offset the windowed path has not processed in this run
    windowed_floor: u64,
    /// Last committed raw resume offset
    raw_resume: Option<u64>,
    /// Last committed windowed resume offset
    windowed_resume: Option<u64>,
    committed_cursor: Option<u64>,
}

impl Shard {
    async fn run(mut self) -> Result<()> {
        let result = self.consume().await;
        // A stopped shard no longer holds back window emission after a restart
        self.windowed.release_replay(self.partition);
        result
    }

    async fn consume(&mut self) -> Result<()> {
        let mut retries = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                polled = self.source.poll(self.max_batch) => polled,
            };

            let events = match polled {
                Ok(events) => {
                    retries = 0;
                    events
                }
                Err(err) if err.is_retryable() => {
                    self.metrics.source_retries.inc();
                    let delay = self.backoff.delay(retries);
                    retries += 1;
                    warn!(
                        partition = self.partition,
                        attempt = retries,
                        error = %err,
                        "Source unavailable, retrying in {:?}",
                        delay
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        changed = self.shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }
                Err(err) => {
                    error!(partition = self.partition, error = %err, "Source failed");
                    return Err(err.into());
                }
            };

            if events.is_empty() {
                continue;
            }

            if let Err(err) = self.process_batch(&events).await {
                error!(
                    partition = self.partition,
                    first_offset = events.first().map(|e| e.source_offset),
                    last_offset = events.last().map(|e| e.source_offset),
                    error = %err,
                    "Batch failed, checkpoint not advanced"
                );
                return Err(err);
            }
        }

        info!(partition = self.partition, position = self.source.position(), "Shard stopped");
        Ok(())
    }

    async fn process_batch(&mut self, events: &[RawEvent]) -> Result<()> {
        let Some(batch_end) = events.last().map(|e| e.source_offset) else {
            return Ok(());
        };
        self.metrics.events_polled.inc_by(events.len() as u64);

        // Offsets below both floors belong to a batch that already completed,
        // including its dead-letter writes
        let covered = self.raw_floor.max(self.windowed_floor);
        let mut records: Vec<TradeRecord> = Vec::with_capacity(events.len());
        for event in events {
            match self.decoder.decode(event) {
                Ok(decoded) => records.extend(decoded),
                Err(err) => {
                    self.metrics.decode_failures.inc();
                    warn!(
                        partition = err.partition,
                        offset = err.offset,
                        cause = %err.cause,
                        "Undecodable payload"
                    );
                    if event.source_offset >= covered {
                        let letter = DeadLetter::decode(&err);
                        send_within(self.dead_letters.as_ref(), letter, self.dead_letter_timeout)
                            .await?;
                    }
                }
            }
        }
        self.metrics.records_decoded.inc_by(records.len() as u64);

        let raw_records = &records[records.partition_point(|r| r.source_offset < self.raw_floor)..];
        let windowed_records =
            &records[records.partition_point(|r| r.source_offset < self.windowed_floor)..];
        let raw_due = batch_end >= self.raw_floor;
        let windowed_due = batch_end >= self.windowed_floor;
        let partition = self.partition;
        let raw_path = Arc::clone(&self.raw);
        let windowed_path = Arc::clone(&self.windowed);

        let raw = async {
            if raw_due {
                raw_path.process(partition, raw_records, batch_end).await.map(Some)
            } else {
                Ok(None)
            }
        };
        let windowed = async {
            if windowed_due {
                windowed_path
                    .process(partition, windowed_records, batch_end)
                    .await
                    .map(Some)
            } else {
                Ok(None)
            }
        };

        let (raw_resume, windowed_resume) = match tokio::join!(raw, windowed) {
            (Ok(raw), Ok(windowed)) => (raw, windowed),
            (Err(err), Ok(_)) | (Ok(_), Err(err)) => return Err(err),
            (Err(raw), Err(windowed)) => {
                return Err(if windowed.is_fatal_for_process() { windowed } else { raw });
            }
        };

        if let Some(resume) = raw_resume {
            self.raw_floor = batch_end + 1;
            self.raw_resume = Some(resume);
        }
        if let Some(resume) = windowed_resume {
            self.windowed_floor = batch_end + 1;
            self.windowed_resume = Some(resume);
        }

        debug!(
            partition = self.partition,
            events = events.len(),
            records = records.len(),
            batch_end = batch_end,
            "Batch complete"
        );

        self.commit_cursor().await;
        Ok(())
    }

    /// Advance the shared source cursor to what both paths have committed
    async fn commit_cursor(&mut self) {
        let (Some(raw), Some(windowed)) = (self.raw_resume, self.windowed_resume) else {
            return;
        };
        let cursor = raw.min(windowed);
        if self.committed_cursor.map_or(false, |committed| cursor <= committed) {
            return;
        }

        match self.source.commit_offsets(cursor).await {
            Ok(()) => self.committed_cursor = Some(cursor),
            Err(err) => warn!(
                partition = self.partition,
                offset = cursor,
                error = %err,
                "Source offset commit failed, retrying after next batch"
            ),
        }
    }
}
