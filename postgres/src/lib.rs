//! `PostgreSQL` storage for inventory allocation sync.
//!
//! This crate provides:
//!
//! - [`PostgresInventoryStore`]: the production [`InventoryStore`](allocation_sync_core::InventoryStore),
//!   with conditional insert/update so concurrent workers converge
//! - [`PostgresDeadLetterQueue`]: a [`DeadLetterSink`](allocation_sync_core::DeadLetterSink)
//!   plus operator queries over parked payloads
//! - Bundled migrations (`migrations/`) run by [`PostgresInventoryStore::migrate`]
//!
//! # Example
//!
//! ```no_run
//! use allocation_sync_postgres::{PostgresDeadLetterQueue, PostgresInventoryStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresInventoryStore::connect(
//!     "postgres://localhost/inventory",
//!     "inventory_records".to_string(),
//!     10,
//! )
//! .await?;
//! store.migrate().await?;
//!
//! let dlq = PostgresDeadLetterQueue::new(store.pool().clone());
//! println!("pending dead letters: {}", dlq.count_pending().await?);
//! # Ok(())
//! # }
//! ```

mod dead_letter_queue;
mod inventory_store;

pub use dead_letter_queue::{DLQStatus, FailedPayload, PostgresDeadLetterQueue};
pub use inventory_store::{DEFAULT_TABLE, PostgresInventoryStore, is_valid_table_name};
