//! Delivery of finalized rows to the storage collaborator
//!
//! A batch is written as a unit and retried as a unit: transient failures and
//! timeouts back off exponentially until the attempt budget is spent, permanent
//! failures fail the batch at once. A [`SinkCommitToken`] is only handed out
//! after the whole batch is stored.

use super::store::{Row, Table, TableStore};
use crate::backoff::ExponentialBackoff;
use crate::config::SinkConfig;
use crate::error::{SinkResult, SinkWriteError};
use crate::metrics::PipelineMetrics;
use crate::state::SinkCommitToken;
use crate::watermark::Watermark;
use crate::window::PendingWindow;
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};
use tradeflow_types::TradeRecord;

/// Writes raw trades and window aggregates with bounded retry
pub struct SinkDispatcher {
    store: Arc<dyn TableStore>,
    config: SinkConfig,
    backoff: ExponentialBackoff,
    metrics: PipelineMetrics,
}

impl SinkDispatcher {
    /// Create a dispatcher over a table store
    pub fn new(store: Arc<dyn TableStore>, config: SinkConfig, metrics: PipelineMetrics) -> Self {
        Self {
            backoff: ExponentialBackoff::new(config.base_backoff_ms, config.max_backoff_ms),
            store,
            config,
            metrics,
        }
    }

    /// Upsert raw trades keyed by `symbol/partition/offset/entry`
    pub async fn write_raw(&self, records: &[TradeRecord]) -> SinkResult<SinkCommitToken> {
        let rows = records
            .iter()
            .map(|record| {
                serde_json::to_value(record)
                    .map(|row| (record.natural_key(), row))
                    .map_err(|e| permanent(Table::Trades, e))
            })
            .collect::<SinkResult<Vec<Row>>>()?;

        self.write_with_retry(Table::Trades, &rows).await?;
        self.metrics.raw_rows_written.inc_by(rows.len() as u64);
        Ok(SinkCommitToken::new(Table::Trades, rows.len()))
    }

    /// Upsert closed windows keyed by `symbol/window_end`
    ///
    /// `frontier` is the close frontier the windows were drained at; the
    /// returned token carries it as the new emitted high watermark.
    pub async fn write_windows(
        &self,
        windows: &[PendingWindow],
        frontier: Watermark,
    ) -> SinkResult<SinkCommitToken> {
        let rows = windows
            .iter()
            .map(|window| {
                serde_json::to_value(&window.row)
                    .map(|row| (window.row.natural_key(), row))
                    .map_err(|e| permanent(Table::MinuteTrades, e))
            })
            .collect::<SinkResult<Vec<Row>>>()?;

        self.write_with_retry(Table::MinuteTrades, &rows).await?;
        self.metrics.windows_emitted.inc_by(rows.len() as u64);

        let token = SinkCommitToken::new(Table::MinuteTrades, rows.len());
        if frontier.is_min() {
            Ok(token)
        } else {
            Ok(token.with_emitted_through(frontier))
        }
    }

    async fn write_with_retry(&self, table: Table, rows: &[Row]) -> SinkResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match timeout(self.config.write_timeout(), self.store.upsert_batch(table, rows))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(SinkWriteError::Timeout {
                    table: table.name().to_string(),
                    timeout_ms: self.config.write_timeout_ms,
                }),
            };

            match result {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(table = %table, attempt = attempt, "Sink write succeeded after retry");
                    }
                    return Ok(());
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    self.metrics.sink_retries.inc();
                    let delay = self.backoff.delay(attempt - 1);
                    warn!(
                        table = %table,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        rows = rows.len(),
                        error = %err,
                        "Sink write failed, retrying in {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    error!(table = %table, attempts = attempt, error = %err, "Sink retries exhausted");
                    return Err(SinkWriteError::Exhausted {
                        table: table.name().to_string(),
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
                Err(err) => {
                    error!(table = %table, attempt = attempt, error = %err, "Permanent sink failure");
                    return Err(err);
                }
            }
        }
    }
}

fn permanent(table: Table, err: serde_json::Error) -> SinkWriteError {
    SinkWriteError::Permanent {
        table: table.name().to_string(),
        reason: format!("row serialization failed: {}", err),
    }
}
