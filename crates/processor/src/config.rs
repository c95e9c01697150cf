//! Configuration types for the stream processor
//!
//! This module provides configuration structures for the engine components:
//! windows, watermarks, sink retries, checkpoints and source reconnection.

use crate::error::{ProcessorError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Window configuration
    #[serde(default)]
    pub window: WindowConfig,

    /// Watermark configuration
    #[serde(default)]
    pub watermark: WatermarkConfig,

    /// Sink retry configuration
    #[serde(default)]
    pub sink: SinkConfig,

    /// Checkpoint configuration
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Source reconnection backoff
    #[serde(default)]
    pub source_retry: SourceRetryConfig,

    /// Maximum events pulled from a partition per batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            watermark: WatermarkConfig::default(),
            sink: SinkConfig::default(),
            checkpoint: CheckpointConfig::default(),
            source_retry: SourceRetryConfig::default(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl ProcessorConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        self.watermark.validate()?;
        self.sink.validate()?;
        self.checkpoint.validate()?;
        self.source_retry.validate()?;

        if self.max_batch_size == 0 {
            return Err(ProcessorError::Configuration {
                source: "max_batch_size must be greater than 0".into(),
            });
        }

        Ok(())
    }
}

/// Tumbling window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window size in milliseconds
    #[serde(default = "default_window_size")]
    pub size_ms: u64,

    /// Extra time past the window end before the window closes (milliseconds)
    #[serde(default = "default_allowed_lateness")]
    pub allowed_lateness_ms: u64,

    /// Number of lock stripes in the accumulator arena
    #[serde(default = "default_lock_partitions")]
    pub lock_partitions: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size_ms: default_window_size(),
            allowed_lateness_ms: default_allowed_lateness(),
            lock_partitions: default_lock_partitions(),
        }
    }
}

impl WindowConfig {
    /// Create a tumbling window configuration of the given size
    pub fn tumbling(size_ms: u64) -> Self {
        Self {
            size_ms,
            ..Default::default()
        }
    }

    /// Validate the window configuration
    pub fn validate(&self) -> Result<()> {
        if self.size_ms == 0 {
            return Err(ProcessorError::Configuration {
                source: "tumbling window size must be greater than 0".into(),
            });
        }

        if self.size_ms > i64::MAX as u64 || self.allowed_lateness_ms > i64::MAX as u64 {
            return Err(ProcessorError::Configuration {
                source: "window durations must fit in a signed 64-bit millisecond value".into(),
            });
        }

        if self.lock_partitions == 0 {
            return Err(ProcessorError::Configuration {
                source: "lock_partitions must be greater than 0".into(),
            });
        }

        Ok(())
    }

    /// Window size in signed milliseconds
    pub fn size_millis(&self) -> i64 {
        self.size_ms as i64
    }

    /// Allowed lateness in signed milliseconds
    pub fn allowed_lateness_millis(&self) -> i64 {
        self.allowed_lateness_ms as i64
    }
}

/// Watermark configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkConfig {
    /// Lateness tolerance subtracted from the max event time (milliseconds)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            max_delay_ms: default_max_delay(),
        }
    }
}

impl WatermarkConfig {
    /// Validate the watermark configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_delay_ms > i64::MAX as u64 {
            return Err(ProcessorError::Configuration {
                source: "max_delay_ms must fit in a signed 64-bit millisecond value".into(),
            });
        }
        Ok(())
    }

    /// Get max delay as Duration
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Retry policy for storage writes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Attempts per batch before the batch fails
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay (milliseconds)
    #[serde(default = "default_sink_base_backoff")]
    pub base_backoff_ms: u64,

    /// Upper bound on retry delay (milliseconds)
    #[serde(default = "default_sink_max_backoff")]
    pub max_backoff_ms: u64,

    /// Timeout for a single write attempt (milliseconds)
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_sink_base_backoff(),
            max_backoff_ms: default_sink_max_backoff(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl SinkConfig {
    /// Validate the sink configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ProcessorError::Configuration {
                source: "sink max_attempts must be greater than 0".into(),
            });
        }

        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(ProcessorError::Configuration {
                source: "sink base_backoff_ms must not exceed max_backoff_ms".into(),
            });
        }

        if self.write_timeout_ms == 0 {
            return Err(ProcessorError::Configuration {
                source: "sink write_timeout_ms must be greater than 0".into(),
            });
        }

        Ok(())
    }

    /// Get write timeout as Duration
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Checkpoint location of the raw output path
    #[serde(default = "default_raw_location")]
    pub raw_location: PathBuf,

    /// Checkpoint location of the windowed output path
    #[serde(default = "default_windowed_location")]
    pub windowed_location: PathBuf,

    /// Timeout for a durable checkpoint write (milliseconds)
    #[serde(default = "default_checkpoint_timeout")]
    pub write_timeout_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            raw_location: default_raw_location(),
            windowed_location: default_windowed_location(),
            write_timeout_ms: default_checkpoint_timeout(),
        }
    }
}

impl CheckpointConfig {
    /// Validate the checkpoint configuration
    pub fn validate(&self) -> Result<()> {
        if self.raw_location == self.windowed_location {
            return Err(ProcessorError::Configuration {
                source: "raw and windowed checkpoint locations must differ".into(),
            });
        }

        if self.write_timeout_ms == 0 {
            return Err(ProcessorError::Configuration {
                source: "checkpoint write_timeout_ms must be greater than 0".into(),
            });
        }

        Ok(())
    }

    /// Get write timeout as Duration
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Backoff used while the source is unavailable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRetryConfig {
    /// First reconnection delay (milliseconds)
    #[serde(default = "default_source_base_backoff")]
    pub base_backoff_ms: u64,

    /// Upper bound on reconnection delay (milliseconds)
    #[serde(default = "default_source_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for SourceRetryConfig {
    fn default() -> Self {
        Self {
            base_backoff_ms: default_source_base_backoff(),
            max_backoff_ms: default_source_max_backoff(),
        }
    }
}

impl SourceRetryConfig {
    /// Validate the source retry configuration
    pub fn validate(&self) -> Result<()> {
        if self.base_backoff_ms == 0 || self.base_backoff_ms > self.max_backoff_ms {
            return Err(ProcessorError::Configuration {
                source: "source_retry requires 0 < base_backoff_ms <= max_backoff_ms".into(),
            });
        }
        Ok(())
    }
}

fn default_max_batch_size() -> usize {
    500
}

fn default_window_size() -> u64 {
    60_000
}

fn default_allowed_lateness() -> u64 {
    1_000
}

fn default_lock_partitions() -> usize {
    16
}

fn default_max_delay() -> u64 {
    1_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_sink_base_backoff() -> u64 {
    100
}

fn default_sink_max_backoff() -> u64 {
    5_000
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_raw_location() -> PathBuf {
    PathBuf::from("/tmp/checkpoint_trades")
}

fn default_windowed_location() -> PathBuf {
    PathBuf::from("/tmp/checkpoint_minute_trades")
}

fn default_checkpoint_timeout() -> u64 {
    5_000
}

fn default_source_base_backoff() -> u64 {
    500
}

fn default_source_max_backoff() -> u64 {
    30_000
}
