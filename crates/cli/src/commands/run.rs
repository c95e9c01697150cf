//! Run command - consume the log until interrupted
//!
//! Wires the configured source, storage and dead-letter directory into a
//! pipeline, runs it until Ctrl-C and prints what it did.

use anyhow::Context;
use clap::Args;
use colored::Colorize;
use processor::{
    AvroTradeDecoder, BackendTableStore, FileDeadLetterSink, KafkaConnector, MemoryTableStore,
    MetricsRegistry, PipelineBuilder, PipelineMetrics, PipelineReport, RecordDecoder, SledConfig,
    SledStateBackend, StartingOffsets, TableStore,
};
use std::sync::Arc;
use tracing::{info, warn};
use tradeflow_config::{AppConfig, StorageBackend};

/// Arguments of `tradeflow run`
#[derive(Args, Debug, Clone)]
pub struct RunCommand {
    /// Override the start policy for partitions without a checkpoint
    #[arg(long, value_name = "POLICY", value_parser = parse_starting_offsets)]
    starting_offsets: Option<StartingOffsets>,

    /// Print the metrics snapshot in Prometheus text format on exit
    #[arg(long)]
    dump_metrics: bool,
}

impl RunCommand {
    /// Execute the run command
    pub async fn execute(&self, mut config: AppConfig) -> anyhow::Result<()> {
        if let Some(policy) = self.starting_offsets {
            config.source.starting_offsets = policy;
        }

        info!(
            service = %config.service.name,
            topic = %config.source.topic,
            brokers = %config.source.brokers,
            "Starting pipeline"
        );

        let decoder: Arc<dyn RecordDecoder> = match &config.service.schema_path {
            Some(path) => Arc::new(
                AvroTradeDecoder::from_file(path)
                    .with_context(|| format!("loading schema {}", path.display()))?,
            ),
            None => Arc::new(AvroTradeDecoder::bundled()?),
        };

        let store = open_store(&config).await?;
        let dead_letters = Arc::new(FileDeadLetterSink::new(
            &config.dead_letter.path,
            config.dead_letter.max_file_size_bytes(),
        ));

        let registry = MetricsRegistry::global();
        let metrics = PipelineMetrics::registered(&registry);

        let driver = PipelineBuilder::new(config.processor.clone())
            .with_source(Arc::new(KafkaConnector::new(config.source.clone())))
            .with_starting_offsets(config.source.starting_offsets)
            .with_decoder(decoder)
            .with_table_store(store)
            .with_dead_letters(dead_letters)
            .with_metrics(metrics)
            .build()?;

        let report = driver
            .run_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            })
            .await?;

        print_report(&report);

        if self.dump_metrics {
            match registry.encode() {
                Ok(text) => println!("{}", text),
                Err(e) => warn!(error = %e, "Failed to encode metrics"),
            }
        }

        Ok(())
    }
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn TableStore>> {
    match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Memory storage selected; rows are lost on exit");
            Ok(Arc::new(MemoryTableStore::new()))
        }
        StorageBackend::Sled => {
            let backend = SledStateBackend::open(SledConfig::new(&config.storage.path))
                .await
                .with_context(|| format!("opening {}", config.storage.path.display()))?;
            Ok(Arc::new(BackendTableStore::new(
                backend,
                config.storage.keyspace.clone(),
            )))
        }
    }
}

fn print_report(report: &PipelineReport) {
    let metrics = &report.metrics;
    println!("{}", "Pipeline stopped".bold().cyan());
    println!("  {:<26} {}", "shards".dimmed(), report.shards);
    println!("  {:<26} {}", "events polled".dimmed(), metrics.events_polled);
    println!("  {:<26} {}", "records decoded".dimmed(), metrics.records_decoded);
    println!("  {:<26} {}", "raw rows written".dimmed(), metrics.raw_rows_written);
    println!("  {:<26} {}", "windows emitted".dimmed(), metrics.windows_emitted);
    println!(
        "  {:<26} {}",
        "decode failures".dimmed(),
        metrics.decode_failures.to_string().yellow()
    );
    println!(
        "  {:<26} {}",
        "late records".dimmed(),
        metrics.late_records.to_string().yellow()
    );
    println!(
        "  {:<26} {}",
        "replayed records skipped".dimmed(),
        metrics.replayed_records_skipped
    );
    println!("  {:<26} {}", "watermark".dimmed(), report.watermark);
    println!(
        "  {:<26} raw #{}, windowed #{}",
        "checkpoint sequence".dimmed(),
        report.raw_checkpoint.sequence,
        report.windowed_checkpoint.sequence
    );
}

fn parse_starting_offsets(value: &str) -> Result<StartingOffsets, String> {
    match value.to_ascii_lowercase().as_str() {
        "earliest" => Ok(StartingOffsets::Earliest),
        "latest" => Ok(StartingOffsets::Latest),
        "checkpoint" => Ok(StartingOffsets::Checkpoint),
        other => Err(format!(
            "unknown policy '{}', expected earliest, latest or checkpoint",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_starting_offsets() {
        assert_eq!(
            parse_starting_offsets("Latest").unwrap(),
            StartingOffsets::Latest
        );
        assert_eq!(
            parse_starting_offsets("checkpoint").unwrap(),
            StartingOffsets::Checkpoint
        );
        assert!(parse_starting_offsets("newest").is_err());
    }

    #[tokio::test]
    async fn test_open_memory_store() {
        let mut config = AppConfig::default();
        config.storage.backend = StorageBackend::Memory;
        let store = open_store(&config).await.unwrap();
        assert_eq!(store.count(processor::Table::Trades).await.unwrap(), 0);
    }
}
