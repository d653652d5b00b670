//! Durable per-product allocation record.

use crate::normalizer::UpdateIntent;
use serde::{Deserialize, Serialize};

/// Current authoritative allocation for one product.
///
/// `source_sync_timestamp` is the event time (epoch seconds) of the intent
/// that produced `allocation`, not the time the row was written. Over the
/// life of a record it never decreases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryRecord {
    /// Primary key
    pub product_id: String,
    /// Allocation in saleable units
    pub allocation: u64,
    /// Event time of the most recent accepted intent
    pub source_sync_timestamp: i64,
}

impl InventoryRecord {
    /// Create a record.
    #[must_use]
    pub fn new(product_id: impl Into<String>, allocation: u64, source_sync_timestamp: i64) -> Self {
        Self {
            product_id: product_id.into(),
            allocation,
            source_sync_timestamp,
        }
    }

    /// Whether `intent` is strictly newer than the state held by this record.
    ///
    /// Equal timestamps are treated as already applied.
    #[must_use]
    pub const fn is_superseded_by(&self, intent: &UpdateIntent) -> bool {
        intent.event_time() > self.source_sync_timestamp
    }
}

impl From<&UpdateIntent> for InventoryRecord {
    fn from(intent: &UpdateIntent) -> Self {
        Self::new(intent.product_id(), intent.allocation(), intent.event_time())
    }
}
