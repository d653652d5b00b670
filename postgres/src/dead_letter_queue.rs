//! Dead Letter Queue (DLQ) for payloads that cannot be processed.
//!
//! Provides persistent storage and management of inbound payloads that were
//! rejected as malformed. Parking them keeps their partition moving while
//! leaving the raw bytes available for incident response and replay.

use allocation_sync_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// Status of a parked payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for investigation or replay
    Pending,
    /// An operator is working on it
    Processing,
    /// Replayed or otherwise fixed
    Resolved,
    /// Permanently discarded
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, DeadLetterError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(DeadLetterError::Storage(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// An entry in the Dead Letter Queue.
#[derive(Debug, Clone)]
pub struct FailedPayload {
    /// Unique identifier for this DLQ entry
    pub id: i64,
    /// Topic the payload was read from
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Raw payload bytes, verbatim
    pub payload: Option<Vec<u8>>,
    /// Why it was rejected
    pub error_message: String,
    /// How many times the same message was parked (redeliveries included)
    pub failure_count: i32,
    /// When this payload first failed
    pub first_failed_at: DateTime<Utc>,
    /// When this payload most recently failed
    pub last_failed_at: DateTime<Utc>,
    /// Current processing status
    pub status: DLQStatus,
    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it
    pub resolved_by: Option<String>,
    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-based Dead Letter Queue for rejected payloads.
///
/// Parking is keyed on `(topic, partition, offset)`: parking the same message
/// again bumps `failure_count` instead of adding a row.
///
/// # Example
///
/// ```no_run
/// use allocation_sync_postgres::{DLQStatus, PostgresDeadLetterQueue};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = PostgresDeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// println!("Pending payloads: {}", pending.len());
///
/// if let Some(entry) = pending.first() {
///     dlq.update_status(entry.id, DLQStatus::Processing).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresDeadLetterQueue {
    pool: PgPool,
}

const SELECT_COLUMNS: &str = r"
    SELECT
        id, topic, partition, message_offset, payload, error_message, failure_count,
        first_failed_at, last_failed_at, status,
        resolved_at, resolved_by, resolution_notes
    FROM failed_payloads
";

impl PostgresDeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Park a rejected payload and return its entry id.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the insert fails.
    pub async fn add_entry(&self, letter: &DeadLetter) -> Result<i64, DeadLetterError> {
        let (id, failure_count): (i64, i32) = sqlx::query_as(
            r"
            INSERT INTO failed_payloads (topic, partition, message_offset, payload, error_message)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (topic, partition, message_offset) DO UPDATE
            SET failure_count = failed_payloads.failure_count + 1,
                last_failed_at = NOW(),
                error_message = EXCLUDED.error_message
            RETURNING id, failure_count
            ",
        )
        .bind(&letter.topic)
        .bind(letter.partition)
        .bind(letter.offset)
        .bind(letter.payload.as_deref())
        .bind(&letter.error_message)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

        tracing::warn!(
            dlq_id = id,
            topic = %letter.topic,
            partition = letter.partition,
            offset = letter.offset,
            failure_count,
            error = %letter.error_message,
            "Payload added to Dead Letter Queue"
        );

        Ok(id)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedPayload>, DeadLetterError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List entries by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedPayload>, DeadLetterError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let query = format!("{SELECT_COLUMNS} WHERE status = $1 ORDER BY first_failed_at ASC, id ASC LIMIT $2");

        let rows = sqlx::query(&query)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

        rows.iter().map(Self::row_to_failed_payload).collect()
    }

    /// Get a specific entry by ID.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails or the entry is not found.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedPayload, DeadLetterError> {
        let query = format!("{SELECT_COLUMNS} WHERE id = $1");

        let row = sqlx::query(&query)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

        Self::row_to_failed_payload(&row)
    }

    /// Update the status of an entry.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), DeadLetterError> {
        sqlx::query("UPDATE failed_payloads SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");

        Ok(())
    }

    /// Mark an entry as resolved, typically after the payload was fixed and republished.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DeadLetterError> {
        sqlx::query(
            r"
            UPDATE failed_payloads
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

        tracing::info!(dlq_id = id, resolved_by, "DLQ entry marked as resolved");

        metrics::counter!("inventory_sync_dlq_resolved_total").increment(1);

        Ok(())
    }

    /// Mark an entry as permanently discarded.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), DeadLetterError> {
        sqlx::query(
            r"
            UPDATE failed_payloads
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

        tracing::warn!(dlq_id = id, reason, "DLQ entry marked as discarded");

        metrics::counter!("inventory_sync_dlq_discarded_total").increment(1);

        Ok(())
    }

    /// Count pending entries. Useful for health checks.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, DeadLetterError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM failed_payloads WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DeadLetterError::Storage(e.to_string()))?;

        Ok(count)
    }

    fn row_to_failed_payload(row: &sqlx::postgres::PgRow) -> Result<FailedPayload, DeadLetterError> {
        fn column<'r, T>(row: &'r sqlx::postgres::PgRow, name: &str) -> Result<T, DeadLetterError>
        where
            T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
        {
            row.try_get(name)
                .map_err(|e| DeadLetterError::Storage(format!("Failed to read column {name}: {e}")))
        }

        let status: String = column(row, "status")?;

        Ok(FailedPayload {
            id: column(row, "id")?,
            topic: column(row, "topic")?,
            partition: column(row, "partition")?,
            offset: column(row, "message_offset")?,
            payload: column(row, "payload")?,
            error_message: column(row, "error_message")?,
            failure_count: column(row, "failure_count")?,
            first_failed_at: column(row, "first_failed_at")?,
            last_failed_at: column(row, "last_failed_at")?,
            status: DLQStatus::parse(&status)?,
            resolved_at: column(row, "resolved_at")?,
            resolved_by: column(row, "resolved_by")?,
            resolution_notes: column(row, "resolution_notes")?,
        })
    }
}

impl DeadLetterSink for PostgresDeadLetterQueue {
    fn park(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<i64, DeadLetterError>> + Send + '_>> {
        Box::pin(async move { self.add_entry(&letter).await })
    }
}
