//! Event normalizer: raw envelope entries → canonical [`UpdateIntent`]s.
//!
//! # Overview
//!
//! The normalizer is a pure transformation. It never touches the store and
//! keeps no state between calls:
//!
//! ```text
//! payload bytes ──parse_envelope──▶ Option<InventoryEnvelope>
//!                                          │
//!                                       intents()
//!                                          │
//!                                          ▼
//!                      Result<UpdateIntent, MalformedEventError> (one per entry)
//! ```
//!
//! An absent envelope (no payload, JSON `null`, or missing inner levels)
//! normalizes to nothing. Any unparseable entry yields a
//! [`MalformedEventError`] carrying the offending entry; callers stop at the
//! first error, so entries before it may already have been applied.
//!
//! # Example
//!
//! ```
//! use allocation_sync_core::envelope::{InventoryEnvelope, RawRecord};
//! use allocation_sync_core::normalizer::normalize;
//!
//! let envelope = InventoryEnvelope::with_records(vec![
//!     RawRecord::new("P1", "10", "1970-01-01T00:16:40Z"),
//! ]);
//!
//! let intents = normalize(Some(&envelope)).unwrap();
//! assert_eq!(intents[0].product_id(), "P1");
//! assert_eq!(intents[0].allocation(), 10);
//! assert_eq!(intents[0].event_time(), 1000);
//! ```

use crate::envelope::{InventoryEnvelope, RawRecord};
use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// A raw event could not be turned into an [`UpdateIntent`].
///
/// Non-retryable: redelivering the same bytes fails the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedEventError {
    /// The payload is not a decodable envelope.
    #[error("Malformed envelope: {0}")]
    Envelope(String),

    /// One entry of an otherwise decodable envelope is invalid.
    #[error("Malformed entry #{index} ({field}): {reason}")]
    Entry {
        /// Position of the entry inside the envelope
        index: usize,
        /// The offending entry, verbatim
        entry: Box<RawRecord>,
        /// Which field failed to parse
        field: &'static str,
        /// Parser message
        reason: String,
    },

    /// An intent was built from parts that violate its invariants.
    #[error("Invalid update intent: {0}")]
    InvalidIntent(String),
}

impl MalformedEventError {
    fn entry(index: usize, entry: &RawRecord, field: &'static str, reason: impl Into<String>) -> Self {
        Self::Entry {
            index,
            entry: Box::new(entry.clone()),
            field,
            reason: reason.into(),
        }
    }

    /// The offending entry, when the failure is attributable to one.
    #[must_use]
    pub fn offending_entry(&self) -> Option<&RawRecord> {
        match self {
            Self::Envelope(_) | Self::InvalidIntent(_) => None,
            Self::Entry { entry, .. } => Some(entry),
        }
    }
}

/// Canonical, validated allocation change for one product.
///
/// Immutable once constructed. `event_time` is the producer's own generation
/// time in epoch seconds (UTC), never the arrival time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpdateIntent {
    product_id: String,
    allocation: u64,
    event_time: i64,
}

impl UpdateIntent {
    /// Create an intent from already-validated parts.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedEventError::InvalidIntent`] if `product_id` is empty.
    pub fn new(
        product_id: impl Into<String>,
        allocation: u64,
        event_time: i64,
    ) -> Result<Self, MalformedEventError> {
        let product_id = product_id.into();
        if product_id.is_empty() {
            return Err(MalformedEventError::InvalidIntent(
                "product id must not be empty".to_string(),
            ));
        }
        Ok(Self {
            product_id,
            allocation,
            event_time,
        })
    }

    /// Product identifier (opaque, non-empty).
    #[must_use]
    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    /// Allocation quantity in saleable units.
    #[must_use]
    pub const fn allocation(&self) -> u64 {
        self.allocation
    }

    /// Event time in epoch seconds, UTC.
    #[must_use]
    pub const fn event_time(&self) -> i64 {
        self.event_time
    }
}

impl fmt::Display for UpdateIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}, allocation={}, t={}}}",
            self.product_id, self.allocation, self.event_time
        )
    }
}

/// Decode an inbound payload into an envelope.
///
/// `None`, an empty payload and a JSON `null` are all "no envelope".
///
/// # Errors
///
/// Returns [`MalformedEventError::Envelope`] if the bytes are not a valid envelope.
pub fn parse_envelope(payload: Option<&[u8]>) -> Result<Option<InventoryEnvelope>, MalformedEventError> {
    let Some(bytes) = payload else {
        return Ok(None);
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice::<Option<InventoryEnvelope>>(bytes)
        .map_err(|e| MalformedEventError::Envelope(e.to_string()))
}

/// Lazily normalize each entry of an envelope, in producer order.
///
/// Yields exactly one item per raw entry. Consumers that must stop at the
/// first malformed entry simply stop iterating.
pub fn intents(
    envelope: Option<&InventoryEnvelope>,
) -> impl Iterator<Item = Result<UpdateIntent, MalformedEventError>> + '_ {
    envelope
        .map(InventoryEnvelope::records)
        .unwrap_or_default()
        .iter()
        .enumerate()
        .map(|(index, raw)| normalize_record(index, raw))
}

/// Normalize a whole envelope, failing on the first malformed entry.
///
/// # Errors
///
/// Returns the first [`MalformedEventError`] encountered.
pub fn normalize(envelope: Option<&InventoryEnvelope>) -> Result<Vec<UpdateIntent>, MalformedEventError> {
    intents(envelope).collect()
}

/// Normalize one raw entry.
///
/// Absent, `null` and wrong-typed fields are reported against the entry, the
/// same way unparseable values are.
///
/// # Errors
///
/// Returns [`MalformedEventError::Entry`] naming the field that failed.
pub fn normalize_record(index: usize, raw: &RawRecord) -> Result<UpdateIntent, MalformedEventError> {
    let product_id = scalar_text(raw.product_id.as_ref())
        .and_then(|text| {
            if text.is_empty() {
                Err("must not be empty".to_string())
            } else {
                Ok(text)
            }
        })
        .map_err(|reason| MalformedEventError::entry(index, raw, "productId", reason))?;

    let allocation = scalar_text(raw.allocation.as_ref())
        .and_then(|text| parse_allocation(&text))
        .map_err(|reason| MalformedEventError::entry(index, raw, "allocation", reason))?;

    let event_time = match raw.allocation_timestamp.as_ref() {
        Some(Value::String(text)) => parse_event_time(text),
        other => Err(type_mismatch("a string", other)),
    }
    .map_err(|reason| MalformedEventError::entry(index, raw, "allocationTimestamp", reason))?;

    Ok(UpdateIntent {
        product_id,
        allocation,
        event_time,
    })
}

/// Text of a string or number field, numbers in their JSON rendering.
fn scalar_text(value: Option<&Value>) -> Result<String, String> {
    match value {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Number(number)) => Ok(number.to_string()),
        other => Err(type_mismatch("a string or a number", other)),
    }
}

fn type_mismatch(expected: &str, found: Option<&Value>) -> String {
    match found {
        None | Some(Value::Null) => "missing".to_string(),
        Some(value) => format!("expected {expected}, found {value}"),
    }
}

fn parse_allocation(text: &str) -> Result<u64, String> {
    let value: i64 = text
        .parse()
        .map_err(|e| format!("'{text}' is not a base-10 integer: {e}"))?;
    u64::try_from(value).map_err(|_| format!("'{text}' is negative"))
}

/// Parse an ISO-8601 date-time with an explicit offset or `Z` into epoch seconds.
///
/// Accepts RFC 3339 and the shorter `YYYY-MM-DDTHH:MM<offset>` form.
/// Fractional seconds round toward the earlier second.
///
/// # Errors
///
/// Returns a description of the parse failure. Local date-times without an
/// offset are rejected.
pub fn parse_event_time(text: &str) -> Result<i64, String> {
    parse_offset_date_time(text)
        .map(|dt| dt.timestamp())
        .map_err(|e| format!("'{text}' is not an ISO-8601 date-time with offset: {e}"))
}

fn parse_offset_date_time(text: &str) -> Result<DateTime<FixedOffset>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text).or_else(|rfc_err| {
        let normalized = match text.strip_suffix(['Z', 'z']) {
            Some(rest) => format!("{rest}+00:00"),
            None => text.to_string(),
        };
        DateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M%:z").map_err(|_| rfc_err)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    fn entry_failure(err: &MalformedEventError) -> (usize, &'static str) {
        match err {
            MalformedEventError::Entry { index, field, .. } => (*index, *field),
            other => unreachable!("expected entry error, got {other:?}"),
        }
    }

    #[test]
    fn absent_envelope_is_empty() {
        assert_eq!(parse_envelope(None).unwrap(), None);
        assert_eq!(parse_envelope(Some(b"")).unwrap(), None);
        assert_eq!(parse_envelope(Some(b"null")).unwrap(), None);
        assert!(normalize(None).unwrap().is_empty());
    }

    #[test]
    fn garbage_payload_is_malformed_envelope() {
        let err = parse_envelope(Some(b"<inventory/>")).unwrap_err();
        assert!(matches!(err, MalformedEventError::Envelope(_)));
        assert!(err.offending_entry().is_none());
    }

    #[test]
    fn normalizes_entries_in_order() {
        let envelope = InventoryEnvelope::with_records(vec![
            RawRecord::new("P1", "10", "1970-01-01T00:16:40Z"),
            RawRecord::new("P2", "0", "1970-01-01T02:16:40+02:00"),
        ]);

        let intents = normalize(Some(&envelope)).unwrap();

        assert_eq!(intents.len(), 2);
        assert_eq!(intents[0], UpdateIntent::new("P1", 10, 1000).unwrap());
        assert_eq!(intents[1], UpdateIntent::new("P2", 0, 1000).unwrap());
    }

    #[test]
    fn rejects_unparseable_timestamp() {
        let raw = RawRecord::new("P1", "10", "not-a-date");
        let err = normalize_record(3, &raw).unwrap_err();

        match &err {
            MalformedEventError::Entry { index, field, .. } => {
                assert_eq!(*index, 3);
                assert_eq!(*field, "allocationTimestamp");
            }
            other => unreachable!("expected entry error, got {other:?}"),
        }
        assert_eq!(err.offending_entry(), Some(&raw));
    }

    #[test]
    fn rejects_local_time_without_offset() {
        assert!(parse_event_time("2024-05-01T10:15:30").is_err());
    }

    #[test]
    fn accepts_short_iso_forms() {
        assert_eq!(parse_event_time("1970-01-01T00:01Z").unwrap(), 60);
        assert_eq!(parse_event_time("1970-01-01T01:01+01:00").unwrap(), 60);
    }

    #[test]
    fn fractional_seconds_truncate() {
        assert_eq!(parse_event_time("1970-01-01T00:00:01.999Z").unwrap(), 1);
    }

    #[test]
    fn rejects_bad_allocations() {
        for bad in ["ten", "-1", "1.5", ""] {
            let raw = RawRecord::new("P1", bad, "1970-01-01T00:00:00Z");
            let err = normalize_record(0, &raw).unwrap_err();
            assert!(
                matches!(err, MalformedEventError::Entry { field: "allocation", .. }),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_empty_product_id() {
        let raw = RawRecord::new("", "1", "1970-01-01T00:00:00Z");
        assert!(matches!(
            normalize_record(0, &raw),
            Err(MalformedEventError::Entry { field: "productId", .. })
        ));
    }

    #[test]
    fn lazy_iteration_stops_at_first_error() {
        let envelope = InventoryEnvelope::with_records(vec![
            RawRecord::new("P1", "1", "1970-01-01T00:00:00Z"),
            RawRecord::new("P2", "x", "1970-01-01T00:00:00Z"),
            RawRecord::new("P3", "3", "1970-01-01T00:00:00Z"),
        ]);

        let mut it = intents(Some(&envelope));
        assert!(it.next().unwrap().is_ok());
        assert!(it.next().unwrap().is_err());
        assert!(normalize(Some(&envelope)).is_err());
    }

    #[test]
    fn null_allocation_fails_at_its_entry() {
        let payload = br#"{"inventoryList": {"records": [
            {"productId": "P1", "allocation": "5", "allocationTimestamp": "1970-01-01T00:16:40Z"},
            {"productId": "P2", "allocation": null, "allocationTimestamp": "1970-01-01T00:16:40Z"}
        ]}}"#;

        let envelope = parse_envelope(Some(payload)).unwrap();
        let mut it = intents(envelope.as_ref());

        assert_eq!(it.next().unwrap().unwrap(), UpdateIntent::new("P1", 5, 1000).unwrap());
        let err = it.next().unwrap().unwrap_err();
        assert_eq!(entry_failure(&err), (1, "allocation"));
        assert_eq!(
            err.offending_entry().and_then(|raw| raw.product_id.clone()),
            Some(Value::String("P2".to_string()))
        );
    }

    #[test]
    fn missing_timestamp_fails_at_its_entry() {
        let payload = br#"{"inventoryList": {"records": [
            {"productId": "P1", "allocation": "5", "allocationTimestamp": "1970-01-01T00:16:40Z"},
            {"productId": "P2", "allocation": "6"}
        ]}}"#;

        let envelope = parse_envelope(Some(payload)).unwrap();
        let err = normalize(envelope.as_ref()).unwrap_err();

        assert_eq!(entry_failure(&err), (1, "allocationTimestamp"));
    }

    #[test]
    fn non_scalar_fields_fail_at_their_entry() {
        let payload = br#"{"inventoryList": {"records": [
            {"productId": true, "allocation": "5", "allocationTimestamp": "1970-01-01T00:16:40Z"},
            {"productId": "P2", "allocation": [6], "allocationTimestamp": "1970-01-01T00:16:40Z"},
            {"productId": "P3", "allocation": "7", "allocationTimestamp": 1000}
        ]}}"#;

        let envelope = parse_envelope(Some(payload)).unwrap();
        let failures: Vec<_> = intents(envelope.as_ref())
            .map(|result| entry_failure(&result.unwrap_err()))
            .collect();

        assert_eq!(
            failures,
            vec![(0, "productId"), (1, "allocation"), (2, "allocationTimestamp")]
        );
    }

    #[test]
    fn numeric_scalars_are_accepted() {
        let payload = br#"{"inventoryList": {"records": [
            {"productId": 42, "allocation": 7, "allocationTimestamp": "1970-01-01T00:16:40Z"}
        ]}}"#;

        let envelope = parse_envelope(Some(payload)).unwrap();

        assert_eq!(
            normalize(envelope.as_ref()).unwrap(),
            vec![UpdateIntent::new("42", 7, 1000).unwrap()]
        );
    }

    #[test]
    fn empty_intent_id_is_invalid_intent() {
        let err = UpdateIntent::new("", 1, 0).unwrap_err();
        assert!(matches!(err, MalformedEventError::InvalidIntent(_)));
        assert!(err.offending_entry().is_none());
    }

    #[test]
    fn rejects_padded_timestamps() {
        for padded in [" 1970-01-01T00:00:00Z", "1970-01-01T00:00:00Z ", "\t1970-01-01T00:01Z\n"] {
            assert!(parse_event_time(padded).is_err(), "{padded:?} should be rejected");
        }
    }

    proptest! {
        #[test]
        fn rendered_instants_parse_back(
            secs in -2_208_988_800_i64..7_258_118_400_i64,
            offset_minutes in -(23 * 60 + 59)..=(23 * 60 + 59),
        ) {
            let offset = FixedOffset::east_opt(offset_minutes * 60).unwrap();
            let instant = DateTime::<Utc>::from_timestamp(secs, 0).unwrap().with_timezone(&offset);

            prop_assert_eq!(parse_event_time(&instant.to_rfc3339()).unwrap(), secs);
            prop_assert_eq!(
                parse_event_time(&instant.format("%Y-%m-%dT%H:%M%:z").to_string()).unwrap(),
                secs - secs.rem_euclid(60)
            );
        }
    }
}
