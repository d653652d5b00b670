//! In-memory store and dead-letter doubles
//!
//! Provides fast, deterministic testing infrastructure for the engine and the
//! consumer:
//! - [`InMemoryInventoryStore`]: HashMap-backed record store with failure injection
//! - [`InMemoryDeadLetterQueue`]: captures parked payloads
//! - [`ReconcileTestHarness`]: Fluent API for reconciliation tests

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use allocation_sync_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use allocation_sync_core::store::{InventoryStore, Result, StoreError};
use allocation_sync_core::{InventoryRecord, ReconcileOutcome, ReconciliationEngine, UpdateIntent};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// In-memory record store for fast, deterministic testing.
///
/// Writes are conditional exactly like the production store, and every call
/// is counted so tests can assert that nothing touched the store.
///
/// # Example
///
/// ```
/// use allocation_sync_testing::InMemoryInventoryStore;
/// use allocation_sync_core::{InventoryRecord, InventoryStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryInventoryStore::new();
///
/// assert!(store.insert(&InventoryRecord::new("P1", 10, 1000)).await?);
/// assert!(!store.update("P1", 5, 900).await?); // older, rejected
///
/// assert_eq!(store.record("P1"), Some(InventoryRecord::new("P1", 10, 1000)));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryInventoryStore {
    records: Arc<RwLock<HashMap<String, InventoryRecord>>>,
    gets: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
    failures_remaining: Arc<AtomicUsize>,
}

impl InMemoryInventoryStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with records
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = InventoryRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.put(record);
        }
        store
    }

    /// Write a record directly, bypassing the conditional checks and counters
    pub fn put(&self, record: InventoryRecord) {
        self.records
            .write()
            .unwrap()
            .insert(record.product_id.clone(), record);
    }

    /// Current record for a product
    #[must_use]
    pub fn record(&self, product_id: &str) -> Option<InventoryRecord> {
        self.records.read().unwrap().get(product_id).cloned()
    }

    /// All records, sorted by product id
    #[must_use]
    pub fn records(&self) -> Vec<InventoryRecord> {
        let mut records: Vec<_> = self.records.read().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        records
    }

    /// Number of stored records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    /// Clear all records (for test isolation)
    pub fn clear(&self) {
        self.records.write().unwrap().clear();
    }

    /// Number of `get` calls served
    #[must_use]
    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of `insert`/`update` calls served (applied or not)
    #[must_use]
    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every operation fail with [`StoreError::Unavailable`] until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` operations, then recover
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".to_string()));
        }
        let took_failure = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took_failure {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

impl InventoryStore for InMemoryInventoryStore {
    async fn get(&self, product_id: &str) -> Result<Option<InventoryRecord>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.record(product_id))
    }

    async fn insert(&self, record: &InventoryRecord) -> Result<bool> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut records = self.records.write().unwrap();
        if records.contains_key(&record.product_id) {
            return Ok(false);
        }
        records.insert(record.product_id.clone(), record.clone());
        Ok(true)
    }

    async fn update(&self, product_id: &str, allocation: u64, source_sync_timestamp: i64) -> Result<bool> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut records = self.records.write().unwrap();
        match records.get_mut(product_id) {
            Some(record) if record.source_sync_timestamp < source_sync_timestamp => {
                record.allocation = allocation;
                record.source_sync_timestamp = source_sync_timestamp;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// In-memory dead-letter sink capturing every parked payload.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDeadLetterQueue {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryDeadLetterQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parked letters, oldest first
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap().clone()
    }

    /// Number of parked letters
    #[must_use]
    pub fn len(&self) -> usize {
        self.letters.lock().unwrap().len()
    }

    /// Check if nothing was parked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.letters.lock().unwrap().is_empty()
    }

    /// Make `park` fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl DeadLetterSink for InMemoryDeadLetterQueue {
    fn park(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<i64, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(DeadLetterError::Storage("dead letter queue marked failing".to_string()));
            }
            let mut letters = self.letters.lock().unwrap();
            letters.push(letter);
            #[allow(clippy::cast_possible_wrap)] // Test queues never hold 2^63 entries
            Ok(letters.len() as i64)
        })
    }
}

/// Test harness for the reconciliation engine providing a fluent testing API.
///
/// # Example
///
/// ```
/// use allocation_sync_testing::{intent, ReconcileTestHarness};
/// use allocation_sync_core::{InventoryRecord, ReconcileOutcome};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut harness = ReconcileTestHarness::new();
/// harness
///     .given_record(InventoryRecord::new("P1", 10, 1000))
///     .when_intent(intent("P1", 25, 2000))
///     .await?
///     .then_record(InventoryRecord::new("P1", 25, 2000))
///     .then_last_outcome_is("updated");
/// # Ok(())
/// # }
/// ```
pub struct ReconcileTestHarness {
    store: Arc<InMemoryInventoryStore>,
    engine: ReconciliationEngine<Arc<InMemoryInventoryStore>>,
    outcomes: Vec<ReconcileOutcome>,
}

impl ReconcileTestHarness {
    /// Create a harness over an empty store.
    #[must_use]
    pub fn new() -> Self {
        let store = Arc::new(InMemoryInventoryStore::new());
        Self {
            engine: ReconciliationEngine::new(Arc::clone(&store)),
            store,
            outcomes: Vec::new(),
        }
    }

    /// Seed the store with an existing record.
    pub fn given_record(&mut self, record: InventoryRecord) -> &mut Self {
        self.store.put(record);
        self
    }

    /// Reconcile one intent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store fails.
    pub async fn when_intent(&mut self, intent: UpdateIntent) -> Result<&mut Self> {
        let outcome = self.engine.reconcile(&intent).await?;
        self.outcomes.push(outcome);
        Ok(self)
    }

    /// Reconcile several intents in order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store fails.
    pub async fn when_intents(&mut self, intents: impl IntoIterator<Item = UpdateIntent>) -> Result<&mut Self> {
        for intent in intents {
            self.when_intent(intent).await?;
        }
        Ok(self)
    }

    /// Assert the stored record for a product.
    ///
    /// # Panics
    ///
    /// Panics if the stored record differs (this is a test assertion).
    pub fn then_record(&mut self, expected: InventoryRecord) -> &mut Self {
        let actual = self.store.record(&expected.product_id);
        assert_eq!(actual.as_ref(), Some(&expected), "unexpected stored record");
        self
    }

    /// Assert no record exists for a product.
    ///
    /// # Panics
    ///
    /// Panics if a record is found (this is a test assertion).
    pub fn then_no_record(&mut self, product_id: &str) -> &mut Self {
        assert_eq!(self.store.record(product_id), None, "expected no record for {product_id}");
        self
    }

    /// Assert the label of the most recent outcome (`inserted`, `updated`, `discarded`).
    ///
    /// # Panics
    ///
    /// Panics if no intent was reconciled or the label differs.
    pub fn then_last_outcome_is(&mut self, label: &str) -> &mut Self {
        let last = self.outcomes.last().map(ReconcileOutcome::as_str);
        assert_eq!(last, Some(label), "unexpected last outcome");
        self
    }

    /// All outcomes so far, in order.
    #[must_use]
    pub fn outcomes(&self) -> &[ReconcileOutcome] {
        &self.outcomes
    }

    /// The backing store.
    #[must_use]
    pub const fn store(&self) -> &Arc<InMemoryInventoryStore> {
        &self.store
    }
}

impl Default for ReconcileTestHarness {
    fn default() -> Self {
        Self::new()
    }
}
