//! Dispatch loop turning inbound inventory messages into reconcile calls.
//!
//! # Overview
//!
//! [`InventoryUpdateConsumer`] subscribes to the inventory topic, hands each
//! payload to the normalizer and the [`ReconciliationEngine`], and reports a
//! [`Disposition`] back to the transport:
//!
//! ```text
//! ┌─────────────┐  InboundMessage  ┌──────────────────────┐
//! │  Event Bus  │ ───────────────▶ │InventoryUpdateConsumer│
//! └─────────────┘ ◀─────────────── └──────────┬───────────┘
//!                    Disposition              │ UpdateIntent*
//!                                             ▼
//!                                    ┌─────────────────┐
//!                                    │ReconciliationEngine│
//!                                    └─────────────────┘
//! ```
//!
//! | Result of the payload | Disposition |
//! |---|---|
//! | every intent reconciled (including discards) | `Commit` |
//! | store unavailable | `Redeliver` |
//! | malformed, policy `DeadLetter`, parked | `Commit` |
//! | malformed, policy `DeadLetter`, parking failed | `Redeliver` |
//! | malformed, policy `Halt` | none; the loop stops |
//!
//! Intents before a malformed entry stay applied. Reprocessing the payload
//! later is harmless because the engine discards what it has already seen.
//!
//! # Workers
//!
//! Every clone of a consumer shares the engine, bus and shutdown signal. Run
//! one clone per worker; with a Kafka consumer group the partitions are spread
//! across their subscriptions.

use crate::metrics::SyncMetrics;
use allocation_sync_core::dead_letter::{DeadLetter, DeadLetterSink};
use allocation_sync_core::event_bus::{Acknowledger, Disposition, EventBus, EventBusError, InboundMessage};
use allocation_sync_core::{InventoryStore, ReconcileOutcome, ReconciliationEngine, SyncError, normalizer};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;

/// What to do with a payload that can never be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MalformedPolicy {
    /// Park it in the dead letter sink and move on.
    #[default]
    DeadLetter,
    /// Stop consuming without committing.
    Halt,
}

impl FromStr for MalformedPolicy {
    type Err = UnknownPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dead-letter" | "dead_letter" | "deadletter" | "dlq" => Ok(Self::DeadLetter),
            "halt" | "stop" => Ok(Self::Halt),
            _ => Err(UnknownPolicyError(s.to_string())),
        }
    }
}

impl fmt::Display for MalformedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeadLetter => f.write_str("dead-letter"),
            Self::Halt => f.write_str("halt"),
        }
    }
}

/// Raised when parsing an unknown [`MalformedPolicy`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown malformed policy '{0}', expected 'dead-letter' or 'halt'")]
pub struct UnknownPolicyError(String);

/// Counts of what one payload did to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Records created
    pub inserted: usize,
    /// Records replaced by a newer intent
    pub updated: usize,
    /// Intents that lost to the stored state
    pub discarded: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Inserted => self.inserted += 1,
            ReconcileOutcome::Updated { .. } => self.updated += 1,
            ReconcileOutcome::Discarded { .. } => self.discarded += 1,
        }
    }

    /// Number of intents reconciled.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.inserted + self.updated + self.discarded
    }
}

/// Errors that stop a consumer.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// The bus refused the subscription.
    #[error("Failed to subscribe: {0}")]
    Subscription(#[from] EventBusError),

    /// A payload could not be processed and could not be parked.
    #[error("Halted on {topic}[{partition}]@{offset}: {source}")]
    Halted {
        /// Topic of the offending message
        topic: String,
        /// Partition of the offending message
        partition: i32,
        /// Offset of the offending message, left uncommitted
        offset: i64,
        /// Why it failed
        #[source]
        source: SyncError,
    },
}

/// Subscribes to the inventory topic and reconciles every payload.
///
/// # Example
///
/// ```ignore
/// let (consumer, shutdown) = InventoryUpdateConsumer::new(engine, event_bus, "inventory-update");
/// let mut consumer = consumer.with_dead_letter_sink(dlq);
///
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     shutdown.send(true).ok();
/// });
///
/// consumer.start().await?;
/// ```
pub struct InventoryUpdateConsumer<S> {
    engine: Arc<ReconciliationEngine<S>>,
    event_bus: Arc<dyn EventBus>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    malformed_policy: MalformedPolicy,
    /// Topic to subscribe to
    topic: String,
    /// Shutdown signal
    shutdown: watch::Receiver<bool>,
}

impl<S> Clone for InventoryUpdateConsumer<S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            event_bus: Arc::clone(&self.event_bus),
            dead_letters: self.dead_letters.clone(),
            malformed_policy: self.malformed_policy,
            topic: self.topic.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S: InventoryStore> InventoryUpdateConsumer<S> {
    /// Create a consumer.
    ///
    /// Returns the consumer and a shutdown sender. Send `true` to stop every
    /// clone of the consumer once its in-flight message is finished.
    ///
    /// Without a dead letter sink, malformed payloads halt the consumer
    /// whatever the policy.
    #[must_use]
    pub fn new(
        engine: Arc<ReconciliationEngine<S>>,
        event_bus: Arc<dyn EventBus>,
        topic: impl Into<String>,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer = Self {
            engine,
            event_bus,
            dead_letters: None,
            malformed_policy: MalformedPolicy::default(),
            topic: topic.into(),
            shutdown: shutdown_rx,
        };

        (consumer, shutdown_tx)
    }

    /// Park malformed payloads in `sink`.
    #[must_use]
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Set the malformed payload policy.
    #[must_use]
    pub const fn with_malformed_policy(mut self, policy: MalformedPolicy) -> Self {
        self.malformed_policy = policy;
        self
    }

    /// The topic this consumer subscribes to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Parse one payload and reconcile its intents in order.
    ///
    /// An absent payload, an envelope without a list, or an empty list all
    /// yield an empty report.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Malformed`] at the first entry that cannot be
    /// parsed, or [`SyncError::StoreUnavailable`] at the first store failure.
    /// Intents before the failing one remain applied.
    pub async fn handle_payload(&self, payload: Option<&[u8]>) -> Result<BatchReport, SyncError> {
        let envelope = normalizer::parse_envelope(payload)?;
        let mut report = BatchReport::default();

        for intent in normalizer::intents(envelope.as_ref()) {
            let intent = intent?;
            let started = Instant::now();
            let outcome = self.engine.reconcile(&intent).await?;
            SyncMetrics::record_outcome(&outcome, started.elapsed());
            report.record(&outcome);
        }

        SyncMetrics::record_payload();
        Ok(report)
    }

    /// Subscribe and dispatch messages until shutdown.
    ///
    /// Also returns `Ok` when the bus ends the stream.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Subscription`] if the subscription fails, or
    /// [`ConsumerError::Halted`] when a payload can be neither processed nor
    /// parked. The halting message is left uncommitted.
    pub async fn start(&mut self) -> Result<(), ConsumerError> {
        tracing::info!(
            topic = %self.topic,
            policy = %self.malformed_policy,
            dead_letter_sink = self.dead_letters.is_some(),
            "Starting inventory update consumer"
        );

        let mut stream = self.event_bus.subscribe(&[self.topic.as_str()]).await?;

        while !*self.shutdown.borrow() {
            tokio::select! {
                next = stream.next() => match next {
                    Some(Ok(message)) => self.dispatch(message).await?,
                    Some(Err(e)) => {
                        // The bus reconnects on its own
                        tracing::error!(topic = %self.topic, error = %e, "Error receiving message from bus");
                    }
                    None => {
                        tracing::info!(topic = %self.topic, "Message stream ended");
                        break;
                    }
                },

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        tracing::info!(topic = %self.topic, "Shutdown signal received");
                        break;
                    }
                }
            }
        }

        tracing::info!(topic = %self.topic, "Inventory update consumer stopped");
        Ok(())
    }

    /// Process one message and acknowledge it.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Halted`] when the payload can be neither
    /// processed nor parked. The message is not acknowledged in that case.
    pub async fn dispatch(&self, mut message: InboundMessage) -> Result<(), ConsumerError> {
        let acknowledger = message.take_acknowledger();
        let result = self.handle_payload(message.payload()).await;

        match result {
            Ok(report) => {
                tracing::debug!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    inserted = report.inserted,
                    updated = report.updated,
                    discarded = report.discarded,
                    "Payload reconciled"
                );
                acknowledger.ack(Disposition::Commit);
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                tracing::error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Store unavailable, requesting redelivery"
                );
                SyncMetrics::record_store_error();
                SyncMetrics::record_redelivery();
                acknowledger.ack(Disposition::Redeliver);
                Ok(())
            }
            Err(e) => self.reject(message, acknowledger, e).await,
        }
    }

    async fn reject(
        &self,
        message: InboundMessage,
        acknowledger: Acknowledger,
        error: SyncError,
    ) -> Result<(), ConsumerError> {
        match &error {
            SyncError::Malformed(_) => SyncMetrics::record_malformed(),
            SyncError::StoreUnavailable(_) => SyncMetrics::record_store_error(),
        }

        let sink = match (self.malformed_policy, &self.dead_letters) {
            (MalformedPolicy::DeadLetter, Some(sink)) => sink,
            _ => {
                tracing::error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    kind = error.kind(),
                    error = %error,
                    "Unprocessable payload, halting consumer"
                );
                drop(acknowledger);
                return Err(ConsumerError::Halted {
                    topic: message.topic,
                    partition: message.partition,
                    offset: message.offset,
                    source: error,
                });
            }
        };

        let letter = DeadLetter {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            payload: message.payload,
            error_message: error.to_string(),
        };

        match sink.park(letter).await {
            Ok(id) => {
                tracing::warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    dlq_id = id,
                    kind = error.kind(),
                    error = %error,
                    "Unprocessable payload dead-lettered"
                );
                SyncMetrics::record_dead_lettered();
                acknowledger.ack(Disposition::Commit);
            }
            Err(park_error) => {
                tracing::error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %error,
                    park_error = %park_error,
                    "Failed to dead-letter payload, requesting redelivery"
                );
                SyncMetrics::record_redelivery();
                acknowledger.ack(Disposition::Redeliver);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use allocation_sync_core::DiscardReason;

    #[test]
    fn policy_parses_common_spellings() {
        assert_eq!("dead-letter".parse::<MalformedPolicy>().unwrap(), MalformedPolicy::DeadLetter);
        assert_eq!("DEAD_LETTER".parse::<MalformedPolicy>().unwrap(), MalformedPolicy::DeadLetter);
        assert_eq!("halt".parse::<MalformedPolicy>().unwrap(), MalformedPolicy::Halt);
        assert!("skip".parse::<MalformedPolicy>().is_err());
    }

    #[test]
    fn policy_display_parses_back() {
        for policy in [MalformedPolicy::DeadLetter, MalformedPolicy::Halt] {
            assert_eq!(policy.to_string().parse::<MalformedPolicy>().unwrap(), policy);
        }
    }

    #[test]
    fn report_counts_outcomes() {
        let mut report = BatchReport::default();
        report.record(&ReconcileOutcome::Inserted);
        report.record(&ReconcileOutcome::Updated { previous: None });
        report.record(&ReconcileOutcome::Discarded {
            reason: DiscardReason::Stale,
        });
        report.record(&ReconcileOutcome::Discarded {
            reason: DiscardReason::AlreadyApplied,
        });

        assert_eq!(
            report,
            BatchReport {
                inserted: 1,
                updated: 1,
                discarded: 2
            }
        );
        assert_eq!(report.total(), 4);
    }
}
