//! In-memory event bus for driving the consumer in tests.
//!
//! Mirrors the delivery contract of the Redpanda bus: one message in flight
//! per subscription, offset committed on [`Disposition::Commit`], the same
//! message delivered again on [`Disposition::Redeliver`].
//!
//! Every published message is kept. A new subscription first receives every
//! message on its topics that was never committed, like a consumer group
//! reading from `earliest`. Subscriptions do not split partitions: each one
//! sees every message.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use allocation_sync_core::event_bus::{
    Acknowledger, Disposition, EventBus, EventBusError, InboundMessage, MessageStream,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
struct Delivery {
    topic: String,
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
}

/// A recorded acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    /// Topic of the acknowledged message
    pub topic: String,
    /// Offset of the acknowledged message
    pub offset: i64,
    /// What the consumer decided
    pub disposition: Disposition,
}

#[derive(Debug, Default)]
struct BusState {
    subscribers: Vec<(Vec<String>, mpsc::UnboundedSender<Delivery>)>,
    next_offsets: HashMap<String, i64>,
    log: Vec<Delivery>,
    committed: HashSet<(String, i64)>,
    acknowledgements: Vec<Acknowledgement>,
}

/// In-memory [`EventBus`].
///
/// # Example
///
/// ```
/// use allocation_sync_testing::InMemoryEventBus;
/// use allocation_sync_core::event_bus::{Disposition, EventBus};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryEventBus::new();
/// let mut stream = bus.subscribe(&["inventory-update"]).await?;
///
/// bus.publish("inventory-update", None, b"{}").await?;
///
/// let message = stream.next().await.unwrap()?;
/// message.acknowledger.ack(Disposition::Commit);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<BusState>>,
    redelivery_delay: Duration,
}

impl InMemoryEventBus {
    /// Create a bus with immediate redelivery
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied before a redelivered message is handed out again
    #[must_use]
    pub const fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Every acknowledgement received so far, in order
    #[must_use]
    pub fn acknowledgements(&self) -> Vec<Acknowledgement> {
        self.state.lock().unwrap().acknowledgements.clone()
    }

    /// Offsets committed for a topic, in order
    #[must_use]
    pub fn committed_offsets(&self, topic: &str) -> Vec<i64> {
        self.state
            .lock()
            .unwrap()
            .acknowledgements
            .iter()
            .filter(|ack| ack.topic == topic && ack.disposition == Disposition::Commit)
            .map(|ack| ack.offset)
            .collect()
    }

    /// Number of redelivery requests received
    #[must_use]
    pub fn redeliveries(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .acknowledgements
            .iter()
            .filter(|ack| ack.disposition == Disposition::Redeliver)
            .count()
    }

    /// Drop all subscriptions; their streams end once drained
    pub fn close(&self) {
        self.state.lock().unwrap().subscribers.clear();
    }

    /// Number of messages published to a topic
    #[must_use]
    pub fn published(&self, topic: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|delivery| delivery.topic == topic)
            .count()
    }

    fn record(&self, delivery: &Delivery, disposition: Disposition) {
        let mut state = self.state.lock().unwrap();
        if disposition == Disposition::Commit {
            state.committed.insert((delivery.topic.clone(), delivery.offset));
        }
        state.acknowledgements.push(Acknowledgement {
            topic: delivery.topic.clone(),
            offset: delivery.offset,
            disposition,
        });
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let key = key.map(|k| k.as_bytes().to_vec());
        let payload = payload.to_vec();

        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            let offset = {
                let next = state.next_offsets.entry(topic.clone()).or_insert(0);
                let offset = *next;
                *next += 1;
                offset
            };
            let delivery = Delivery {
                topic: topic.clone(),
                offset,
                key,
                payload: Some(payload),
            };
            state.log.push(delivery.clone());
            state
                .subscribers
                .retain(|(topics, tx)| !topics.contains(&topic) || tx.send(delivery.clone()).is_ok());
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();

        Box::pin(async move {
            let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Delivery>();
            {
                let mut state = self.state.lock().unwrap();
                let backlog: Vec<Delivery> = state
                    .log
                    .iter()
                    .filter(|d| topics.contains(&d.topic) && !state.committed.contains(&(d.topic.clone(), d.offset)))
                    .cloned()
                    .collect();
                for delivery in backlog {
                    let _ = raw_tx.send(delivery);
                }
                state.subscribers.push((topics, raw_tx));
            }

            let (tx, rx) = mpsc::channel(1);
            let bus = self.clone();

            tokio::spawn(async move {
                let mut pending: VecDeque<Delivery> = VecDeque::new();
                loop {
                    let delivery = match pending.pop_front() {
                        Some(delivery) => delivery,
                        None => match raw_rx.recv().await {
                            Some(delivery) => delivery,
                            None => break,
                        },
                    };

                    let (acknowledger, ack_rx) = Acknowledger::channel();
                    let message = InboundMessage {
                        topic: delivery.topic.clone(),
                        partition: 0,
                        offset: delivery.offset,
                        key: delivery.key.clone(),
                        payload: delivery.payload.clone(),
                        acknowledger,
                    };
                    if tx.send(Ok(message)).await.is_err() {
                        break;
                    }

                    match ack_rx.await {
                        Ok(Disposition::Commit) => bus.record(&delivery, Disposition::Commit),
                        Ok(Disposition::Redeliver) => {
                            bus.record(&delivery, Disposition::Redeliver);
                            if !bus.redelivery_delay.is_zero() {
                                tokio::time::sleep(bus.redelivery_delay).await;
                            }
                            pending.push_front(delivery);
                        }
                        Err(_) => break,
                    }
                }
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
