//! Counters and gauges of the streaming pipeline

use super::MetricsRegistry;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;

/// Pipeline metrics, cheap to clone and shared by every shard
///
/// Metrics are live as soon as they are created; [`PipelineMetrics::register`]
/// only makes them visible in a registry's encoded output.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    pub events_polled: Counter,
    pub records_decoded: Counter,
    pub decode_failures: Counter,
    pub late_records: Counter,
    pub replayed_records_skipped: Counter,
    pub raw_rows_written: Counter,
    pub windows_emitted: Counter,
    pub sink_retries: Counter,
    pub checkpoints_committed: Counter,
    pub source_retries: Counter,
    pub watermark_ms: Gauge,
    pub open_windows: Gauge,
}

/// Point-in-time copy of the pipeline metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events_polled: u64,
    pub records_decoded: u64,
    pub decode_failures: u64,
    pub late_records: u64,
    pub replayed_records_skipped: u64,
    pub raw_rows_written: u64,
    pub windows_emitted: u64,
    pub sink_retries: u64,
    pub checkpoints_committed: u64,
    pub source_retries: u64,
    pub watermark_ms: i64,
    pub open_windows: i64,
}

impl PipelineMetrics {
    /// Create unregistered metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Create metrics registered in `registry`
    pub fn registered(registry: &MetricsRegistry) -> Self {
        let metrics = Self::new();
        metrics.register(registry);
        metrics
    }

    /// Register every metric in `registry`
    pub fn register(&self, registry: &MetricsRegistry) {
        registry.register_with(|registry| {
            registry.register(
                "events_polled",
                "Raw events polled from the source",
                self.events_polled.clone(),
            );
            registry.register(
                "records_decoded",
                "Trade records produced by the decoder",
                self.records_decoded.clone(),
            );
            registry.register(
                "decode_failures",
                "Payloads routed to the dead-letter sink as undecodable",
                self.decode_failures.clone(),
            );
            registry.register(
                "late_records",
                "Records routed to the dead-letter sink because their window had closed",
                self.late_records.clone(),
            );
            registry.register(
                "replayed_records_skipped",
                "Replayed records whose window was already emitted",
                self.replayed_records_skipped.clone(),
            );
            registry.register(
                "raw_rows_written",
                "Rows upserted into the raw trades table",
                self.raw_rows_written.clone(),
            );
            registry.register(
                "windows_emitted",
                "Minute aggregates upserted into the aggregates table",
                self.windows_emitted.clone(),
            );
            registry.register(
                "sink_retries",
                "Sink write attempts retried after a transient failure",
                self.sink_retries.clone(),
            );
            registry.register(
                "checkpoints_committed",
                "Checkpoints durably committed across both output paths",
                self.checkpoints_committed.clone(),
            );
            registry.register(
                "source_retries",
                "Source polls retried after the source was unavailable",
                self.source_retries.clone(),
            );
            registry.register(
                "watermark_ms",
                "Current event-time watermark in milliseconds since epoch",
                self.watermark_ms.clone(),
            );
            registry.register(
                "open_windows",
                "Windows still accepting records",
                self.open_windows.clone(),
            );
        });
    }

    /// Copy current values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_polled: self.events_polled.get(),
            records_decoded: self.records_decoded.get(),
            decode_failures: self.decode_failures.get(),
            late_records: self.late_records.get(),
            replayed_records_skipped: self.replayed_records_skipped.get(),
            raw_rows_written: self.raw_rows_written.get(),
            windows_emitted: self.windows_emitted.get(),
            sink_retries: self.sink_retries.get(),
            checkpoints_committed: self.checkpoints_committed.get(),
            source_retries: self.source_retries.get(),
            watermark_ms: self.watermark_ms.get(),
            open_windows: self.open_windows.get(),
        }
    }
}
