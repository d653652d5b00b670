//! Top-level error taxonomy for processing one inbound payload.

use crate::normalizer::MalformedEventError;
use crate::store::StoreError;
use thiserror::Error;

/// Failure while handling one inbound payload.
///
/// A discarded stale intent is not an error; it is reported through
/// [`ReconcileOutcome`](crate::reconcile::ReconcileOutcome).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The payload or one of its entries could not be parsed.
    #[error(transparent)]
    Malformed(#[from] MalformedEventError),

    /// The record store could not be read or written.
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}

impl SyncError {
    /// Whether redelivering the same payload may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(StoreError::Unavailable(_)))
    }

    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }
}
