//! `PostgreSQL` implementation of [`InventoryStore`].
//!
//! # Schema
//!
//! The record table is named by configuration, so it is created by
//! [`PostgresInventoryStore::migrate`] rather than by a bundled migration:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS <table> (
//!     product_id TEXT PRIMARY KEY,
//!     allocation BIGINT NOT NULL CHECK (allocation >= 0),
//!     source_sync_timestamp BIGINT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```
//!
//! Both writes are single statements whose `WHERE`/`ON CONFLICT` clause
//! carries the merge condition, so concurrent workers cannot regress a row
//! between their read and their write.

use allocation_sync_core::InventoryRecord;
use allocation_sync_core::store::{InventoryStore, Result, StoreError};
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Record table used when none is configured.
pub const DEFAULT_TABLE: &str = "inventory_records";

/// PostgreSQL-backed record store.
///
/// The table name is interpolated into SQL and must come from trusted
/// configuration; use [`is_valid_table_name`] to check it.
///
/// # Example
///
/// ```no_run
/// use allocation_sync_postgres::PostgresInventoryStore;
/// use allocation_sync_core::{InventoryRecord, InventoryStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresInventoryStore::connect(
///     "postgres://localhost/inventory",
///     "inventory_records".to_string(),
///     10,
/// )
/// .await?;
/// store.migrate().await?;
///
/// store.insert(&InventoryRecord::new("P1", 10, 1000)).await?;
/// let record = store.get("P1").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresInventoryStore {
    pool: PgPool,
    table_name: String,
}

impl PostgresInventoryStore {
    /// Create a store using an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool, table_name: String) -> Self {
        Self { pool, table_name }
    }

    /// Connect a new pool and create a store over it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the connection fails, or
    /// [`StoreError::InvalidConfiguration`] if `table_name` is not a plain identifier.
    pub async fn connect(database_url: &str, table_name: String, max_connections: u32) -> Result<Self> {
        if !is_valid_table_name(&table_name) {
            return Err(StoreError::InvalidConfiguration(format!(
                "Invalid table name: {table_name}"
            )));
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect: {e}")))?;

        tracing::info!(table = %table_name, max_connections, "Connected inventory store");

        Ok(Self::new(pool, table_name))
    }

    /// Run the bundled migrations, then make sure the configured table exists.
    ///
    /// The bundled migrations only create the `failed_payloads` table used by
    /// [`PostgresDeadLetterQueue`](crate::PostgresDeadLetterQueue). No other
    /// record table than the configured one is created.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Migration failed: {e}")))?;

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                product_id TEXT PRIMARY KEY,
                allocation BIGINT NOT NULL CHECK (allocation >= 0),
                source_sync_timestamp BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            self.table_name
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("Failed to create table", &e))?;

        tracing::debug!(table = %self.table_name, "Inventory table ready");
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get the table name for this store.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

/// Whether `name` can be interpolated into SQL as a table name.
///
/// Accepts `[A-Za-z_][A-Za-z0-9_]*`, up to 63 bytes.
#[must_use]
pub fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 63
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Decode failures mean the row is bad; everything else is the database being unreachable.
fn store_error(context: &str, e: &sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. } => StoreError::InvalidRecord(format!("{context}: {e}")),
        _ => StoreError::Unavailable(format!("{context}: {e}")),
    }
}

fn to_bigint(product_id: &str, allocation: u64) -> Result<i64> {
    i64::try_from(allocation).map_err(|_| {
        StoreError::InvalidRecord(format!("Allocation {allocation} for {product_id} exceeds BIGINT"))
    })
}

impl InventoryStore for PostgresInventoryStore {
    async fn get(&self, product_id: &str) -> Result<Option<InventoryRecord>> {
        let query = format!(
            "SELECT product_id, allocation, source_sync_timestamp FROM {} WHERE product_id = $1",
            self.table_name
        );

        let row: Option<(String, i64, i64)> = sqlx::query_as(&query)
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error("Failed to get", &e))?;

        row.map(|(product_id, allocation, source_sync_timestamp)| {
            let allocation = u64::try_from(allocation).map_err(|_| {
                StoreError::InvalidRecord(format!("Negative allocation {allocation} stored for {product_id}"))
            })?;
            Ok(InventoryRecord::new(product_id, allocation, source_sync_timestamp))
        })
        .transpose()
    }

    async fn insert(&self, record: &InventoryRecord) -> Result<bool> {
        let allocation = to_bigint(&record.product_id, record.allocation)?;
        let query = format!(
            "INSERT INTO {} (product_id, allocation, source_sync_timestamp, created_at, updated_at)
             VALUES ($1, $2, $3, now(), now())
             ON CONFLICT (product_id) DO NOTHING",
            self.table_name
        );

        let result = sqlx::query(&query)
            .bind(&record.product_id)
            .bind(allocation)
            .bind(record.source_sync_timestamp)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("Failed to insert", &e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn update(&self, product_id: &str, allocation: u64, source_sync_timestamp: i64) -> Result<bool> {
        let allocation = to_bigint(product_id, allocation)?;
        let query = format!(
            "UPDATE {}
             SET allocation = $2, source_sync_timestamp = $3, updated_at = now()
             WHERE product_id = $1 AND source_sync_timestamp < $3",
            self.table_name
        );

        let result = sqlx::query(&query)
            .bind(product_id)
            .bind(allocation)
            .bind(source_sync_timestamp)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("Failed to update", &e))?;

        Ok(result.rows_affected() == 1)
    }
}
