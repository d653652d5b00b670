//! Redpanda event bus for inventory allocation sync.
//!
//! This crate provides a Redpanda-backed transport that implements the
//! [`EventBus`] trait from `allocation-sync-core`. It uses rdkafka, so any
//! Kafka-compatible broker works (Redpanda, Apache Kafka, MSK, ...).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  Upstream system │  publishes inventory envelopes
//! └────────┬─────────┘
//!          │  topic: inventory-update
//!          ▼
//! ┌──────────────────┐
//! │     Redpanda     │
//! └────────┬─────────┘
//!          │  consumer group: inventory-update-group
//!     ┌────┴────┐
//!     ▼         ▼
//! ┌───────┐ ┌───────┐
//! │worker │ │worker │  one partition set each
//! └───┬───┘ └───┬───┘
//!     └────┬────┘
//!          ▼
//! ┌──────────────────┐
//! │  Postgres store  │  conditional writes
//! └──────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits gated on the
//! consumer's decision:
//! - Each message is handed out with an
//!   [`Acknowledger`](allocation_sync_core::event_bus::Acknowledger); the next
//!   message is not handed out until it is used
//! - [`Disposition::Commit`] commits the offset
//! - [`Disposition::Redeliver`] waits `redelivery_backoff`, then seeks the
//!   partition back so the same message is delivered again
//! - A dropped acknowledger ends the subscription without committing, so the
//!   message is redelivered to whichever worker owns the partition next
//!
//! **Configuration options**:
//! - `consumer_group`: Explicit consumer group for load balancing
//! - `redelivery_backoff`: Pause before a redelivery (default: 1s)
//! - `auto_offset_reset`: Where to start reading (default: "earliest")
//!
//! # Example
//!
//! ```no_run
//! use allocation_sync_redpanda::RedpandaEventBus;
//! use allocation_sync_core::event_bus::{Disposition, EventBus};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let event_bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("inventory-update-group")
//!     .build()?;
//!
//! let mut stream = event_bus.subscribe(&["inventory-update"]).await?;
//! while let Some(result) = stream.next().await {
//!     let mut message = result?;
//!     println!("offset {}: {:?}", message.offset, message.payload());
//!     message.take_acknowledger().ack(Disposition::Commit);
//! }
//! # Ok(())
//! # }
//! ```

use allocation_sync_core::event_bus::{
    Acknowledger, Disposition, EventBus, EventBusError, InboundMessage, MessageStream,
};
use rdkafka::Offset;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Redpanda event bus implementation.
///
/// # Configuration
///
/// The event bus can be configured with:
/// - **Broker addresses**: Bootstrap servers (required)
/// - **Producer settings**: Acks, compression, timeout
/// - **Consumer group**: Explicit ID or auto-generated from topics
/// - **Redelivery backoff**: Pause before a rejected message comes back
/// - **Offset reset**: Where new groups start reading (default: "earliest")
///
/// # Example
///
/// ```no_run
/// use allocation_sync_redpanda::RedpandaEventBus;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Basic configuration
/// let event_bus = RedpandaEventBus::new("localhost:9092")?;
///
/// // Custom configuration
/// let event_bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .consumer_group("inventory-update-group")
///     .redelivery_backoff(Duration::from_millis(500))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    /// Kafka producer for publishing payloads
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer timeout, also used for seeks
    timeout: Duration,
    /// Consumer group ID (if explicitly set)
    consumer_group: Option<String>,
    /// Pause before a message is redelivered
    redelivery_backoff: Duration,
    /// Auto offset reset policy
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Create a new Redpanda event bus with default configuration.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created from the given configuration.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the event bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Explicit consumer group, if one was configured.
    #[must_use]
    pub fn consumer_group(&self) -> Option<&str> {
        self.consumer_group.as_deref()
    }

    /// Pause applied before a message is redelivered.
    #[must_use]
    pub const fn redelivery_backoff(&self) -> Duration {
        self.redelivery_backoff
    }

    /// Offset reset policy for groups without a committed offset.
    #[must_use]
    pub fn auto_offset_reset(&self) -> &str {
        &self.auto_offset_reset
    }
}

/// Builder for configuring a [`RedpandaEventBus`].
///
/// # Example
///
/// ```no_run
/// use allocation_sync_redpanda::RedpandaEventBus;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let event_bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092")
///     .producer_acks("all")
///     .timeout(Duration::from_secs(10))
///     .auto_offset_reset("latest")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    redelivery_backoff: Option<Duration>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Set the broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "1"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout. Also bounds how long a seek may block.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group ID for subscriptions.
    ///
    /// Workers sharing a group split the topic's partitions between them.
    /// If not set, the group is derived from the subscribed topics.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set the pause before a message answered with
    /// [`Disposition::Redeliver`] is delivered again.
    ///
    /// Default: 1 second
    #[must_use]
    pub const fn redelivery_backoff(mut self, backoff: Duration) -> Self {
        self.redelivery_backoff = Some(backoff);
        self
    }

    /// Set the auto offset reset policy for new consumer groups.
    ///
    /// - `"earliest"`: Start from the beginning of the topic
    /// - `"latest"`: Start from the end (only new payloads)
    /// - `"error"`: Fail if no offset exists
    ///
    /// Default: "earliest", so a fresh group replays what the producer already sent.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if:
    /// - Brokers not set
    /// - Cannot create producer
    /// - Invalid configuration
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;

        let acks = self.producer_acks.as_deref().unwrap_or("1");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let redelivery_backoff = self.redelivery_backoff.unwrap_or(Duration::from_secs(1));
        let auto_offset_reset = self.auto_offset_reset.unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            redelivery_backoff_ms = u64::try_from(redelivery_backoff.as_millis()).unwrap_or(u64::MAX),
            auto_offset_reset = %auto_offset_reset,
            "RedpandaEventBus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group: self.consumer_group,
            redelivery_backoff,
            auto_offset_reset,
        })
    }
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let key = key.map(str::to_string);
        let payload = payload.to_vec();
        let timeout = self.timeout;

        Box::pin(async move {
            let mut record = FutureRecord::<str, [u8]>::to(&topic).payload(&payload);
            if let Some(key) = key.as_deref() {
                record = record.key(key);
            }

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        bytes = payload.len(),
                        "Payload published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(topic = %topic, error = %kafka_error, "Failed to publish payload");
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    #[allow(clippy::too_many_lines)] // Ack-gated commit and seek-back live in one consumer task
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let brokers = self.brokers.clone();
        let consumer_group = self.consumer_group.clone();
        let auto_offset_reset = self.auto_offset_reset.clone();
        let redelivery_backoff = self.redelivery_backoff;
        let seek_timeout = self.timeout;

        Box::pin(async move {
            let consumer_group_id = if let Some(group) = consumer_group {
                group
            } else {
                let mut sorted_topics = topics.clone();
                sorted_topics.sort();
                format!("allocation-sync-{}", sorted_topics.join("-"))
            };

            // Offsets are committed only on an explicit Commit disposition
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &consumer_group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %consumer_group_id,
                auto_offset_reset = %auto_offset_reset,
                manual_commit = true,
                "Subscribed to topics"
            );

            // One message in flight: the next is handed out only after the
            // previous one has been acknowledged.
            let (tx, rx) = tokio::sync::mpsc::channel(1);

            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();

                while let Some(msg_result) = stream.next().await {
                    let message = match msg_result {
                        Ok(message) => message,
                        Err(e) => {
                            let err = EventBusError::TransportError(format!("Failed to receive message: {e}"));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                            continue;
                        },
                    };

                    let topic = message.topic().to_string();
                    let partition = message.partition();
                    let offset = message.offset();

                    let (acknowledger, ack_rx) = Acknowledger::channel();
                    let inbound = InboundMessage {
                        topic: topic.clone(),
                        partition,
                        offset,
                        key: message.key().map(<[u8]>::to_vec),
                        payload: message.payload().map(<[u8]>::to_vec),
                        acknowledger,
                    };

                    tracing::trace!(topic = %topic, partition, offset, "Received message");

                    if tx.send(Ok(inbound)).await.is_err() {
                        tracing::debug!("Channel receiver dropped, exiting consumer task");
                        break;
                    }

                    match ack_rx.await {
                        Ok(Disposition::Commit) => {
                            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                // The message may be seen again after a rebalance
                                tracing::warn!(
                                    topic = %topic,
                                    partition,
                                    offset,
                                    error = %e,
                                    "Failed to commit offset (message may be redelivered)"
                                );
                            }
                        },
                        Ok(Disposition::Redeliver) => {
                            tracing::warn!(
                                topic = %topic,
                                partition,
                                offset,
                                backoff_ms = u64::try_from(redelivery_backoff.as_millis()).unwrap_or(u64::MAX),
                                "Redelivery requested"
                            );
                            tokio::time::sleep(redelivery_backoff).await;
                            if let Err(e) = consumer.seek(&topic, partition, Offset::Offset(offset), seek_timeout) {
                                // Without the seek the partition would silently skip this message
                                tracing::error!(
                                    topic = %topic,
                                    partition,
                                    offset,
                                    error = %e,
                                    "Failed to seek back for redelivery, stopping subscription"
                                );
                                let err = EventBusError::TransportError(format!(
                                    "Failed to seek {topic}/{partition} to {offset}: {e}"
                                ));
                                let _ = tx.send(Err(err)).await;
                                break;
                            }
                        },
                        Err(_) => {
                            tracing::debug!(
                                topic = %topic,
                                partition,
                                offset,
                                "Acknowledger dropped, exiting consumer task without commit"
                            );
                            break;
                        },
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as MessageStream)
        })
    }
}
