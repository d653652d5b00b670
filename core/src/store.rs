//! Record store contract.
//!
//! The store is the only shared mutable resource in the system. The
//! reconciliation engine reads through [`InventoryStore::get`] on every call
//! and never caches records.
//!
//! # Conditional writes
//!
//! Both write operations are conditional so that two workers racing on the
//! same product cannot regress a record:
//!
//! | Operation | Applies when | Otherwise |
//! |---|---|---|
//! | [`insert`](InventoryStore::insert) | no record exists for the key | returns `false` |
//! | [`update`](InventoryStore::update) | stored `source_sync_timestamp` < new one | returns `false` |
//!
//! `update` writes allocation and source-sync timestamp in one atomic
//! operation; the two fields are never observable out of step.
//!
//! # Implementations
//!
//! - `PostgresInventoryStore` (`allocation-sync-postgres`) - production
//! - `InMemoryInventoryStore` (`allocation-sync-testing`) - tests

use crate::record::InventoryRecord;
use std::future::Future;
use thiserror::Error;

/// Errors raised by a record store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot be reached or the operation failed in transit.
    ///
    /// Retryable through transport redelivery.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be mapped to an [`InventoryRecord`].
    #[error("Invalid stored record: {0}")]
    InvalidRecord(String),

    /// The store was set up with settings it cannot work with.
    #[error("Invalid store configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Key-value store holding one [`InventoryRecord`] per product.
///
/// Implementations must be `Send + Sync`; a single instance is shared by
/// every consumer worker.
pub trait InventoryStore: Send + Sync {
    /// Fetch the record for `product_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the store cannot be read.
    fn get(&self, product_id: &str) -> impl Future<Output = Result<Option<InventoryRecord>>> + Send;

    /// Insert a record if none exists for its product.
    ///
    /// Returns `true` if the record was created, `false` if another writer
    /// created one first (nothing is written in that case).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the store cannot be written.
    fn insert(&self, record: &InventoryRecord) -> impl Future<Output = Result<bool>> + Send;

    /// Set allocation and source-sync timestamp together, only if the stored
    /// timestamp is strictly older than `source_sync_timestamp`.
    ///
    /// Returns `true` if the record changed, `false` if it is missing or
    /// already at an equal or newer timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the store cannot be written.
    fn update(
        &self,
        product_id: &str,
        allocation: u64,
        source_sync_timestamp: i64,
    ) -> impl Future<Output = Result<bool>> + Send;
}

impl<S: InventoryStore> InventoryStore for std::sync::Arc<S> {
    fn get(&self, product_id: &str) -> impl Future<Output = Result<Option<InventoryRecord>>> + Send {
        (**self).get(product_id)
    }

    fn insert(&self, record: &InventoryRecord) -> impl Future<Output = Result<bool>> + Send {
        (**self).insert(record)
    }

    fn update(
        &self,
        product_id: &str,
        allocation: u64,
        source_sync_timestamp: i64,
    ) -> impl Future<Output = Result<bool>> + Send {
        (**self).update(product_id, allocation, source_sync_timestamp)
    }
}
