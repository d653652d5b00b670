//! # Allocation Sync Testing
//!
//! Testing utilities and helpers for allocation sync.
//!
//! This crate provides:
//! - In-memory doubles for the store, event bus and dead-letter sink
//! - Fixtures for building intents and producer payloads
//! - Property-based testing strategies
//! - A fluent harness for reconciliation scenarios
//!
//! ## Example
//!
//! ```ignore
//! use allocation_sync_testing::{intent, ReconcileTestHarness};
//!
//! #[tokio::test]
//! async fn newer_wins() {
//!     let mut harness = ReconcileTestHarness::new();
//!     harness
//!         .when_intents([intent("P1", 25, 2000), intent("P1", 10, 1000)])
//!         .await
//!         .unwrap()
//!         .then_record(InventoryRecord::new("P1", 25, 2000));
//! }
//! ```

pub mod event_bus;
pub mod store_mocks;

/// Fixtures for intents and producer payloads.
pub mod fixtures {
    use allocation_sync_core::envelope::{InventoryEnvelope, RawRecord};
    use allocation_sync_core::UpdateIntent;
    use chrono::{DateTime, SecondsFormat};

    /// Build an intent, panicking on an empty product id.
    ///
    /// # Panics
    ///
    /// Panics if `product_id` is empty.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn intent(product_id: &str, allocation: u64, event_time: i64) -> UpdateIntent {
        UpdateIntent::new(product_id, allocation, event_time).expect("fixture product id must not be empty")
    }

    /// Render epoch seconds as an RFC 3339 UTC timestamp (`1970-01-01T00:16:40Z`).
    ///
    /// # Panics
    ///
    /// Panics if `epoch_seconds` is outside chrono's supported range.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn rfc3339(epoch_seconds: i64) -> String {
        DateTime::from_timestamp(epoch_seconds, 0)
            .expect("fixture timestamp in range")
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Raw entry for `intent`, with the timestamp rendered in UTC.
    #[must_use]
    pub fn raw_record(product_id: &str, allocation: &str, epoch_seconds: i64) -> RawRecord {
        RawRecord::new(product_id, allocation, rfc3339(epoch_seconds))
    }

    /// Serialize entries into a producer payload.
    ///
    /// # Panics
    ///
    /// Panics if serialization fails, which cannot happen for these types.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn envelope_json(records: Vec<RawRecord>) -> Vec<u8> {
        serde_json::to_vec(&InventoryEnvelope::with_records(records)).expect("envelope serializes")
    }

    /// Payload carrying exactly the given intents.
    #[must_use]
    pub fn payload_for(intents: &[UpdateIntent]) -> Vec<u8> {
        envelope_json(
            intents
                .iter()
                .map(|i| raw_record(i.product_id(), &i.allocation().to_string(), i.event_time()))
                .collect(),
        )
    }
}

/// Property-based testing strategies using proptest.
pub mod properties {
    use super::fixtures::intent;
    use allocation_sync_core::UpdateIntent;
    use proptest::prelude::*;

    /// Event times within a window small enough to produce frequent ties.
    pub fn event_time() -> impl Strategy<Value = i64> {
        0_i64..50
    }

    /// An intent for one of a handful of products.
    pub fn arb_intent() -> impl Strategy<Value = UpdateIntent> {
        (prop::sample::select(vec!["P1", "P2", "P3"]), 0_u64..1_000, event_time())
            .prop_map(|(product, allocation, t)| intent(product, allocation, t))
    }

    /// A batch of intents for the same product.
    pub fn arb_intents_for(product_id: &'static str, max: usize) -> impl Strategy<Value = Vec<UpdateIntent>> {
        prop::collection::vec((0_u64..1_000, event_time()), 1..=max).prop_map(move |pairs| {
            pairs
                .into_iter()
                .map(|(allocation, t)| intent(product_id, allocation, t))
                .collect()
        })
    }
}

/// Initialise a test subscriber once; later calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use event_bus::{Acknowledgement, InMemoryEventBus};
pub use fixtures::{envelope_json, intent, payload_for, raw_record, rfc3339};
pub use store_mocks::{InMemoryDeadLetterQueue, InMemoryInventoryStore, ReconcileTestHarness};
