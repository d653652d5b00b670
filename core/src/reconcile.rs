//! Reconciliation engine: last-writer-wins by event time.
//!
//! # Merge policy
//!
//! For each [`UpdateIntent`] the engine re-reads the current record and
//! decides:
//!
//! ```text
//!                 get(product_id)
//!                       │
//!          ┌────────────┴────────────┐
//!          │ absent                  │ present
//!          ▼                         ▼
//!   insert(intent)          intent.t > record.t ?
//!          │                  │ yes          │ no
//!          │                  ▼              ▼
//!          │           update(intent)    Discarded
//!          │                             (Stale / AlreadyApplied)
//!          ▼
//!   lost the insert race? ──▶ update(intent), which is itself gated on t
//! ```
//!
//! Ordering is derived from the event time embedded in the payload, never from
//! delivery order: the transport may reorder or redeliver freely.
//!
//! Because the store's writes are conditional (see [`crate::store`]), two
//! workers racing on the same product converge on the intent with the greatest
//! event time. A write rejected by the store surfaces as
//! [`DiscardReason::Superseded`].
//!
//! The engine never retries. Store failures propagate unchanged so the
//! transport can redeliver the message.

use crate::normalizer::UpdateIntent;
use crate::record::InventoryRecord;
use crate::store::{InventoryStore, Result};
use std::fmt;

/// Why an intent was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    /// Intent is older than the stored state.
    Stale,
    /// Intent carries the same event time as the stored state (re-delivery).
    AlreadyApplied,
    /// A concurrent writer stored an equal or newer state between read and write.
    Superseded,
}

impl DiscardReason {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::AlreadyApplied => "already_applied",
            Self::Superseded => "superseded",
        }
    }
}

/// Observable result of one [`ReconciliationEngine::reconcile`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No record existed; one was created from the intent.
    Inserted,
    /// The record was replaced by the intent's values.
    Updated {
        /// State before the update, when it was observed
        previous: Option<InventoryRecord>,
    },
    /// Nothing was written.
    Discarded {
        /// Why the intent lost
        reason: DiscardReason,
    },
}

impl ReconcileOutcome {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Updated { .. } => "updated",
            Self::Discarded { .. } => "discarded",
        }
    }

    /// Whether the store was mutated.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        !matches!(self, Self::Discarded { .. })
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discarded { reason } => write!(f, "discarded ({})", reason.as_str()),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Stateless reconciliation service.
///
/// Holds nothing but its store handle, so one instance can be shared by every
/// worker behind an `Arc`.
///
/// # Example
///
/// ```ignore
/// let engine = ReconciliationEngine::new(store);
/// let outcome = engine.reconcile(&intent).await?;
/// ```
#[derive(Debug, Clone)]
pub struct ReconciliationEngine<S> {
    store: S,
}

impl<S: InventoryStore> ReconciliationEngine<S> {
    /// Create an engine over the given store.
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Decide and apply one intent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::store::StoreError) if the store cannot be
    /// read or written. Nothing is retried.
    pub async fn reconcile(&self, intent: &UpdateIntent) -> Result<ReconcileOutcome> {
        let outcome = match self.store.get(intent.product_id()).await? {
            None => self.insert_new(intent).await?,
            Some(existing) => self.merge(intent, existing).await?,
        };

        tracing::debug!(
            product_id = intent.product_id(),
            allocation = intent.allocation(),
            event_time = intent.event_time(),
            outcome = %outcome,
            "Reconciled allocation intent"
        );

        Ok(outcome)
    }

    async fn insert_new(&self, intent: &UpdateIntent) -> Result<ReconcileOutcome> {
        if self.store.insert(&InventoryRecord::from(intent)).await? {
            return Ok(ReconcileOutcome::Inserted);
        }

        // Someone created the record after our read; fall back to the gated update.
        self.conditional_update(intent, None).await
    }

    async fn merge(&self, intent: &UpdateIntent, existing: InventoryRecord) -> Result<ReconcileOutcome> {
        if existing.is_superseded_by(intent) {
            return self.conditional_update(intent, Some(existing)).await;
        }

        let reason = if intent.event_time() == existing.source_sync_timestamp {
            DiscardReason::AlreadyApplied
        } else {
            DiscardReason::Stale
        };
        Ok(ReconcileOutcome::Discarded { reason })
    }

    async fn conditional_update(
        &self,
        intent: &UpdateIntent,
        previous: Option<InventoryRecord>,
    ) -> Result<ReconcileOutcome> {
        let applied = self
            .store
            .update(intent.product_id(), intent.allocation(), intent.event_time())
            .await?;

        Ok(if applied {
            ReconcileOutcome::Updated { previous }
        } else {
            ReconcileOutcome::Discarded {
                reason: DiscardReason::Superseded,
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Minimal store; `racer` is written just before our insert/update lands.
    #[derive(Default)]
    struct ScriptedStore {
        rows: Mutex<HashMap<String, InventoryRecord>>,
        racer: Mutex<Option<InventoryRecord>>,
        down: bool,
    }

    impl ScriptedStore {
        fn with(record: InventoryRecord) -> Self {
            let store = Self::default();
            store.rows.lock().unwrap().insert(record.product_id.clone(), record);
            store
        }

        fn row(&self, id: &str) -> Option<InventoryRecord> {
            self.rows.lock().unwrap().get(id).cloned()
        }

        fn land_racer(&self) {
            if let Some(racer) = self.racer.lock().unwrap().take() {
                self.rows.lock().unwrap().insert(racer.product_id.clone(), racer);
            }
        }
    }

    impl InventoryStore for ScriptedStore {
        async fn get(&self, product_id: &str) -> Result<Option<InventoryRecord>> {
            if self.down {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            Ok(self.row(product_id))
        }

        async fn insert(&self, record: &InventoryRecord) -> Result<bool> {
            self.land_racer();
            let mut rows = self.rows.lock().unwrap();
            if rows.contains_key(&record.product_id) {
                return Ok(false);
            }
            rows.insert(record.product_id.clone(), record.clone());
            Ok(true)
        }

        async fn update(&self, product_id: &str, allocation: u64, ts: i64) -> Result<bool> {
            self.land_racer();
            let mut rows = self.rows.lock().unwrap();
            match rows.get_mut(product_id) {
                Some(row) if row.source_sync_timestamp < ts => {
                    row.allocation = allocation;
                    row.source_sync_timestamp = ts;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    fn intent(allocation: u64, t: i64) -> UpdateIntent {
        UpdateIntent::new("P1", allocation, t).unwrap()
    }

    #[tokio::test]
    async fn first_write_inserts() {
        let engine = ReconciliationEngine::new(ScriptedStore::default());

        let outcome = engine.reconcile(&intent(10, 1000)).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Inserted);
        assert_eq!(engine.store().row("P1"), Some(InventoryRecord::new("P1", 10, 1000)));
    }

    #[tokio::test]
    async fn newer_intent_updates() {
        let engine = ReconciliationEngine::new(ScriptedStore::with(InventoryRecord::new("P1", 10, 1000)));

        let outcome = engine.reconcile(&intent(25, 2000)).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Updated {
                previous: Some(InventoryRecord::new("P1", 10, 1000))
            }
        );
        assert_eq!(engine.store().row("P1"), Some(InventoryRecord::new("P1", 25, 2000)));
    }

    #[tokio::test]
    async fn older_and_equal_intents_are_discarded() {
        let engine = ReconciliationEngine::new(ScriptedStore::with(InventoryRecord::new("P1", 25, 2000)));

        let stale = engine.reconcile(&intent(99, 1500)).await.unwrap();
        let tie = engine.reconcile(&intent(99, 2000)).await.unwrap();

        assert_eq!(stale, ReconcileOutcome::Discarded { reason: DiscardReason::Stale });
        assert_eq!(tie, ReconcileOutcome::Discarded { reason: DiscardReason::AlreadyApplied });
        assert_eq!(engine.store().row("P1"), Some(InventoryRecord::new("P1", 25, 2000)));
    }

    #[tokio::test]
    async fn lost_insert_race_falls_back_to_gated_update() {
        let store = ScriptedStore::default();
        *store.racer.lock().unwrap() = Some(InventoryRecord::new("P1", 5, 500));
        let engine = ReconciliationEngine::new(store);

        let outcome = engine.reconcile(&intent(10, 1000)).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Updated { previous: None });
        assert_eq!(engine.store().row("P1"), Some(InventoryRecord::new("P1", 10, 1000)));
    }

    #[tokio::test]
    async fn newer_concurrent_write_wins_race() {
        let store = ScriptedStore::with(InventoryRecord::new("P1", 10, 1000));
        *store.racer.lock().unwrap() = Some(InventoryRecord::new("P1", 40, 3000));
        let engine = ReconciliationEngine::new(store);

        let outcome = engine.reconcile(&intent(25, 2000)).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Discarded { reason: DiscardReason::Superseded });
        assert_eq!(engine.store().row("P1"), Some(InventoryRecord::new("P1", 40, 3000)));
    }

    #[tokio::test]
    async fn store_errors_propagate() {
        let store = ScriptedStore { down: true, ..ScriptedStore::default() };
        let engine = ReconciliationEngine::new(store);

        let err = engine.reconcile(&intent(10, 1000)).await.unwrap_err();

        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
