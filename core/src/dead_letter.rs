//! Parking place for payloads that can never be processed.
//!
//! A malformed payload fails identically on every redelivery. Instead of
//! blocking its partition forever, the consumer may park it in a
//! [`DeadLetterSink`] for an operator to inspect, then move on.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised while recording a dead letter.
#[derive(Error, Debug, Clone)]
pub enum DeadLetterError {
    /// Backing storage rejected the write.
    #[error("Dead letter storage error: {0}")]
    Storage(String),
}

/// A payload that was rejected, with its transport coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Topic the payload came from
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Raw payload, verbatim
    pub payload: Option<Vec<u8>>,
    /// Why it was rejected
    pub error_message: String,
}

/// Destination for rejected payloads.
///
/// Uses boxed futures so it can be shared as `Arc<dyn DeadLetterSink>`.
pub trait DeadLetterSink: Send + Sync {
    /// Record a rejected payload. Returns the entry id.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the entry cannot be stored.
    fn park(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<i64, DeadLetterError>> + Send + '_>>;
}
