//! Prometheus metrics for the stream processor
//!
//! Counters and gauges live in [`PipelineMetrics`]; they are registered into a
//! [`MetricsRegistry`] (usually the global one) and encoded in the Prometheus
//! text format on demand.

mod pipeline;
mod registry;

pub use pipeline::{MetricsSnapshot, PipelineMetrics};
pub use registry::MetricsRegistry;

use thiserror::Error;

/// Errors that can occur in the metrics subsystem
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metric encoding error: {0}")]
    EncodingError(String),
}

pub type Result<T> = std::result::Result<T, MetricsError>;
