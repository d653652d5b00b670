//! # Allocation Sync Core
//!
//! Core types for keeping a durable, per-product "current allocation" record in
//! step with a stream of inventory allocation change events.
//!
//! ## Core Concepts
//!
//! - **Envelope**: the raw JSON batch published by the upstream producer
//! - **Intent**: one parsed, validated allocation change ([`UpdateIntent`])
//! - **Record**: the durable projection for one product ([`InventoryRecord`])
//! - **Engine**: last-writer-wins-by-event-time merge ([`ReconciliationEngine`])
//!
//! ## Data Flow
//!
//! ```text
//! transport ─▶ payload ─▶ Normalizer ─▶ UpdateIntent* ─▶ Engine ─▶ Store
//!                                                          │
//!                                          Inserted / Updated / Discarded
//! ```
//!
//! Events may arrive out of order, duplicated or replayed. Correctness comes
//! from the event time embedded in each payload: an intent is applied only if
//! it is strictly newer than the stored `source_sync_timestamp`.
//!
//! ## Example
//!
//! ```ignore
//! use allocation_sync_core::*;
//!
//! let engine = ReconciliationEngine::new(store);
//! let envelope = normalizer::parse_envelope(Some(payload))?;
//! for intent in normalizer::intents(envelope.as_ref()) {
//!     let outcome = engine.reconcile(&intent?).await?;
//!     tracing::info!(%outcome, "applied");
//! }
//! ```

pub mod dead_letter;
pub mod envelope;
pub mod error;
pub mod event_bus;
pub mod normalizer;
pub mod reconcile;
pub mod record;
pub mod store;

pub use dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
pub use envelope::{InventoryEnvelope, InventoryList, RawRecord};
pub use error::SyncError;
pub use event_bus::{
    Acknowledger, Disposition, EventBus, EventBusError, InboundMessage, MessageStream,
};
pub use normalizer::{MalformedEventError, UpdateIntent};
pub use reconcile::{DiscardReason, ReconcileOutcome, ReconciliationEngine};
pub use record::InventoryRecord;
pub use store::{InventoryStore, StoreError};
