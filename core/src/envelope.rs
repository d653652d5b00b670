//! Raw inventory update envelope as published by the upstream producer.
//!
//! The producer contract is a JSON document of the shape:
//!
//! ```json
//! {
//!   "inventoryList": {
//!     "records": [
//!       {
//!         "productId": "P1",
//!         "allocation": "10",
//!         "allocationTimestamp": "2024-05-01T10:15:30Z"
//!       }
//!     ]
//!   }
//! }
//! ```
//!
//! These types only mirror the wire shape. Nothing here interprets the
//! allocation or the timestamp; that is the job of the
//! [`normalizer`](crate::normalizer).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level envelope carried by one inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryEnvelope {
    /// Wrapper around the record entries. May be absent.
    #[serde(default)]
    pub inventory_list: Option<InventoryList>,
}

impl InventoryEnvelope {
    /// Build an envelope around the given entries.
    #[must_use]
    pub fn with_records(records: Vec<RawRecord>) -> Self {
        Self {
            inventory_list: Some(InventoryList {
                records: Some(records),
            }),
        }
    }

    /// The raw entries, or an empty slice when any level of the envelope is absent.
    #[must_use]
    pub fn records(&self) -> &[RawRecord] {
        self.inventory_list
            .as_ref()
            .and_then(|list| list.records.as_deref())
            .unwrap_or_default()
    }
}

/// Ordered list of raw record entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryList {
    /// Record entries in producer order. May be absent.
    #[serde(default)]
    pub records: Option<Vec<RawRecord>>,
}

/// One raw allocation change, exactly as received.
///
/// Fields are kept as untyped JSON so that a missing or wrong-typed field is
/// reported against this entry by the normalizer instead of failing the
/// whole envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    /// Product identifier. Producers send either a string or a number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<Value>,
    /// Allocation quantity, normally decimal text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<Value>,
    /// ISO-8601 date-time of the allocation change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_timestamp: Option<Value>,
}

impl RawRecord {
    /// Convenience constructor using textual fields.
    #[must_use]
    pub fn new(
        product_id: impl Into<String>,
        allocation: impl Into<String>,
        allocation_timestamp: impl Into<String>,
    ) -> Self {
        Self {
            product_id: Some(Value::String(product_id.into())),
            allocation: Some(Value::String(allocation.into())),
            allocation_timestamp: Some(Value::String(allocation_timestamp.into())),
        }
    }
}
