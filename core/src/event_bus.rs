//! Transport abstraction for inbound inventory update messages.
//!
//! This module provides the [`EventBus`] trait the consumer subscribes
//! through. The core never depends on a particular broker client.
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: a message may be delivered more than once
//! - **No cross-partition ordering**: two updates for the same product may
//!   arrive in any order, so ordering is re-derived from the event time inside
//!   the payload
//! - **Explicit acknowledgement**: every [`InboundMessage`] carries an
//!   [`Acknowledger`]; its offset is committed only on
//!   [`Disposition::Commit`]
//!
//! ```text
//! ┌─────────────┐  InboundMessage   ┌──────────────┐
//! │  Event Bus  │ ────────────────▶ │   Consumer   │
//! │ (Redpanda)  │ ◀──────────────── │  (dispatch)  │
//! └─────────────┘    Disposition    └──────────────┘
//!        │
//!        ├─ Commit     → offset committed, next message
//!        └─ Redeliver  → seek back, same message again after backoff
//! ```
//!
//! Dropping an [`Acknowledger`] without acknowledging stops the subscription
//! without committing, so the message is redelivered after a restart.
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (`allocation-sync-testing`) - for tests
//! - `RedpandaEventBus` (`allocation-sync-redpanda`) - Kafka-compatible

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// What the consumer decided about a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Processing is finished; commit the offset.
    Commit,
    /// Processing failed transiently; deliver the same message again.
    Redeliver,
}

/// One-shot handle through which a message's [`Disposition`] is reported.
#[derive(Debug)]
pub struct Acknowledger {
    tx: Option<oneshot::Sender<Disposition>>,
}

impl Acknowledger {
    /// Create an acknowledger and the receiver the transport waits on.
    #[must_use]
    pub fn channel() -> (Self, oneshot::Receiver<Disposition>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// An acknowledger nobody listens to, for messages built by hand.
    #[must_use]
    pub const fn detached() -> Self {
        Self { tx: None }
    }

    /// Report the disposition. Consumes the acknowledger.
    pub fn ack(mut self, disposition: Disposition) {
        if let Some(tx) = self.tx.take() {
            // The transport may already have shut down; nothing left to tell it.
            let _ = tx.send(disposition);
        }
    }
}

/// A raw message delivered by the transport.
#[derive(Debug)]
pub struct InboundMessage {
    /// Topic the message was read from
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Message key, if any
    pub key: Option<Vec<u8>>,
    /// Raw payload; `None` for tombstones
    pub payload: Option<Vec<u8>>,
    /// Where to report the outcome
    pub acknowledger: Acknowledger,
}

impl InboundMessage {
    /// Build a message that is not tied to any transport.
    #[must_use]
    pub fn detached(topic: impl Into<String>, payload: Option<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            key: None,
            payload,
            acknowledger: Acknowledger::detached(),
        }
    }

    /// Payload bytes, if any.
    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Split off the acknowledger, leaving a detached one in its place.
    #[must_use]
    pub fn take_acknowledger(&mut self) -> Acknowledger {
        std::mem::replace(&mut self.acknowledger, Acknowledger::detached())
    }
}

/// Stream of delivered messages from a subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<InboundMessage, EventBusError>> + Send>>;

/// Publish/subscribe transport.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the bus can be held as
/// `Arc<dyn EventBus>` by the consumer.
pub trait EventBus: Send + Sync {
    /// Publish a raw payload to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics.
    ///
    /// The transport delivers the next message of a partition only after the
    /// previous one has been acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>>;
}
