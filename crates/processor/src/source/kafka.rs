//! Kafka source
//!
//! One consumer per partition, manually assigned, with auto-commit disabled.
//! Offsets are committed only when the pipeline says both output paths have
//! made a range durable.
//!
//! Metadata and watermark requests block inside librdkafka, so they run on the
//! blocking thread pool with a short-lived consumer of their own.

use super::{PartitionSource, SourceConfig, SourceConnector, StartPosition};
use crate::error::{SourceError, SourceResult};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Message, Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, info, warn};
use tradeflow_types::{PartitionId, RawEvent};

/// Metadata and watermark requests
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a poll keeps filling a non-empty batch
const BATCH_LINGER: Duration = Duration::from_millis(5);

/// Connector for a Kafka topic
#[derive(Debug, Clone)]
pub struct KafkaConnector {
    config: SourceConfig,
}

impl KafkaConnector {
    /// Create a connector
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    /// Build the client configuration used for every consumer
    pub fn client_config(config: &SourceConfig) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set(
                "auto.offset.reset",
                if config.fail_on_data_loss {
                    "error"
                } else {
                    "earliest"
                },
            );

        for (key, value) in &config.extra_config {
            client_config.set(key, value);
        }

        client_config
    }

    fn create_consumer(&self) -> SourceResult<StreamConsumer> {
        Self::client_config(&self.config)
            .create()
            .map_err(|e| SourceError::Configuration {
                reason: format!("failed to create consumer: {}", e),
            })
    }

    fn create_metadata_client(&self) -> SourceResult<BaseConsumer> {
        Self::client_config(&self.config)
            .create()
            .map_err(|e| SourceError::Configuration {
                reason: format!("failed to create metadata client: {}", e),
            })
    }

    /// Earliest offset still retained on `partition`
    async fn low_watermark(&self, partition: PartitionId) -> SourceResult<u64> {
        let client = self.create_metadata_client()?;
        let topic = self.config.topic.clone();
        run_blocking("watermark fetch", move || {
            let (low, _high) = client
                .fetch_watermarks(&topic, partition as i32, METADATA_TIMEOUT)
                .map_err(unavailable)?;
            Ok(low.max(0) as u64)
        })
        .await
    }
}

/// Run a blocking librdkafka call off the async workers
async fn run_blocking<T, F>(what: &'static str, call: F) -> SourceResult<T>
where
    F: FnOnce() -> SourceResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| SourceError::Unavailable {
            reason: format!("{} did not complete: {}", what, e),
        })?
}

fn unavailable(e: KafkaError) -> SourceError {
    SourceError::Unavailable {
        reason: e.to_string(),
    }
}

#[async_trait]
impl SourceConnector for KafkaConnector {
    async fn partitions(&self) -> SourceResult<Vec<PartitionId>> {
        let client = self.create_metadata_client()?;
        let topic_name = self.config.topic.clone();
        let partitions = run_blocking("metadata fetch", move || {
            let metadata = client
                .fetch_metadata(Some(topic_name.as_str()), METADATA_TIMEOUT)
                .map_err(unavailable)?;

            let topic = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic_name)
                .ok_or_else(|| SourceError::Configuration {
                    reason: format!("topic '{}' not found", topic_name),
                })?;

            if let Some(err) = topic.error() {
                return Err(SourceError::Unavailable {
                    reason: format!("topic '{}' metadata error: {:?}", topic_name, err),
                });
            }

            let mut partitions: Vec<PartitionId> = topic
                .partitions()
                .iter()
                .map(|p| p.id() as PartitionId)
                .collect();
            partitions.sort_unstable();
            Ok(partitions)
        })
        .await?;

        info!(
            topic = %self.config.topic,
            partitions = partitions.len(),
            "Discovered partitions"
        );
        Ok(partitions)
    }

    async fn open(
        &self,
        partition: PartitionId,
        start: StartPosition,
    ) -> SourceResult<Box<dyn PartitionSource>> {
        let kafka_partition = partition as i32;

        let offset = match start {
            StartPosition::Earliest => Offset::Beginning,
            StartPosition::Latest => Offset::End,
            StartPosition::Offset(requested) => {
                let low = self.low_watermark(partition).await?;
                if requested < low {
                    if self.config.fail_on_data_loss {
                        return Err(SourceError::DataLoss {
                            partition,
                            requested,
                            available: low,
                        });
                    }
                    warn!(
                        partition = partition,
                        requested = requested,
                        available = low,
                        "Checkpointed offset no longer retained, skipping ahead"
                    );
                    Offset::Offset(low as i64)
                } else {
                    Offset::Offset(requested as i64)
                }
            }
        };

        let consumer = self.create_consumer()?;
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(&self.config.topic, kafka_partition, offset)
            .map_err(|e| SourceError::Configuration {
                reason: e.to_string(),
            })?;
        consumer.assign(&assignment).map_err(unavailable)?;

        info!(
            topic = %self.config.topic,
            partition = partition,
            offset = ?offset,
            "Assigned partition"
        );

        let position = match offset {
            Offset::Offset(o) => o.max(0) as u64,
            _ => 0,
        };

        Ok(Box::new(KafkaPartitionSource {
            consumer,
            topic: self.config.topic.clone(),
            partition,
            position,
            poll_timeout: self.config.poll_timeout(),
        }))
    }
}

/// Reader of one Kafka partition
pub struct KafkaPartitionSource {
    consumer: StreamConsumer,
    topic: String,
    partition: PartitionId,
    position: u64,
    poll_timeout: Duration,
}

impl KafkaPartitionSource {
    fn map_error(&self, e: KafkaError) -> SourceError {
        match e {
            KafkaError::MessageConsumption(RDKafkaErrorCode::OffsetOutOfRange) => {
                SourceError::DataLoss {
                    partition: self.partition,
                    requested: self.position,
                    available: 0,
                }
            }
            other => unavailable(other),
        }
    }
}

#[async_trait]
impl PartitionSource for KafkaPartitionSource {
    fn partition(&self) -> PartitionId {
        self.partition
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn poll(&mut self, max_batch: usize) -> SourceResult<Vec<RawEvent>> {
        let mut batch = Vec::new();
        let mut wait = self.poll_timeout;

        while batch.len() < max_batch {
            let event = match tokio::time::timeout(wait, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    if batch.is_empty() {
                        return Err(self.map_error(e));
                    }
                    // Surface on the next poll
                    debug!(partition = self.partition, error = %e, "Ending batch early");
                    break;
                }
                Ok(Ok(message)) => {
                    let offset = message.offset().max(0) as u64;
                    RawEvent::new(
                        message.payload().unwrap_or_default().to_vec(),
                        self.partition,
                        offset,
                    )
                }
            };

            if event.source_offset > self.position && self.position != 0 {
                warn!(
                    partition = self.partition,
                    expected = self.position,
                    received = event.source_offset,
                    "Gap in partition offsets"
                );
            }
            self.position = event.source_offset + 1;
            batch.push(event);
            wait = BATCH_LINGER;
        }

        Ok(batch)
    }

    async fn commit_offsets(&mut self, next_offset: u64) -> SourceResult<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &self.topic,
                self.partition as i32,
                Offset::Offset(next_offset as i64),
            )
            .map_err(|e| SourceError::Configuration {
                reason: e.to_string(),
            })?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| SourceError::Commit {
                partition: self.partition,
                offset: next_offset,
                reason: e.to_string(),
            })?;

        debug!(
            partition = self.partition,
            offset = next_offset,
            "Committed source offset"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_disables_auto_commit() {
        let config = SourceConfig {
            brokers: "kafka:9092".to_string(),
            group_id: "streaming".to_string(),
            ..SourceConfig::default()
        };
        let client = KafkaConnector::client_config(&config);
        assert_eq!(client.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(client.get("group.id"), Some("streaming"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn test_strict_data_loss_uses_error_reset() {
        let config = SourceConfig {
            fail_on_data_loss: true,
            ..SourceConfig::default()
        };
        let client = KafkaConnector::client_config(&config);
        assert_eq!(client.get("auto.offset.reset"), Some("error"));
    }

    #[tokio::test]
    async fn test_blocking_call_result_is_returned() {
        let partitions = run_blocking("metadata fetch", || Ok(vec![2, 0, 1]))
            .await
            .unwrap();
        assert_eq!(partitions, vec![2, 0, 1]);
    }

    #[tokio::test]
    async fn test_panicked_blocking_call_is_retryable() {
        let err = run_blocking::<u64, _>("watermark fetch", || panic!("broker handle lost"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("watermark fetch"));
    }

    #[test]
    fn test_extra_config_overrides() {
        let mut config = SourceConfig::default();
        config
            .extra_config
            .insert("session.timeout.ms".to_string(), "6000".to_string());
        let client = KafkaConnector::client_config(&config);
        assert_eq!(client.get("session.timeout.ms"), Some("6000"));
    }
}
