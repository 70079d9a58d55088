//! Sync wire contract
//!
//! Shapes exchanged with point-of-sale devices over push/pull, the
//! per-event status taxonomy, and the lenient payload coercion the field
//! devices require (money as strings or numbers, missing fields, odd
//! timestamp forms).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use uuid::Uuid;

use crate::db::{Customer, Expense, Product, Sale};

/// A batch of events pushed by a device
#[derive(Debug, Clone, Deserialize)]
pub struct PushRequest {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

/// One client-submitted event, as received.
///
/// Key fields stay optional so a malformed event yields a per-event
/// `invalid` status instead of failing the whole batch.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub event_id: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub operation: Option<String>,
    #[serde(default)]
    pub payload_json: Map<String, Value>,
}

/// Terminal status of one event.
///
/// Every event reaches exactly one of these and never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Applied,
    Duplicate,
    Conflict,
    Ignored,
    Invalid,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Applied => "applied",
            EventStatus::Duplicate => "duplicate",
            EventStatus::Conflict => "conflict",
            EventStatus::Ignored => "ignored",
            EventStatus::Invalid => "invalid",
        }
    }
}

/// Entity families that can sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Product,
    Customer,
    Sale,
    Expense,
}

impl EntityKind {
    /// Parse a lowercased entity_type. Unknown kinds are the caller's
    /// problem (they classify as invalid, but still get a ledger row).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "product" => Some(EntityKind::Product),
            "customer" => Some(EntityKind::Customer),
            "sale" => Some(EntityKind::Sale),
            "expense" => Some(EntityKind::Expense),
            _ => None,
        }
    }
}

/// Classification of a rejected or merged event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    VersionConflict,
    StockQtyConflict,
    AppendOnly,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::VersionConflict => "version_conflict",
            ConflictType::StockQtyConflict => "stock_qty_conflict",
            ConflictType::AppendOnly => "append_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "version_conflict" => Some(ConflictType::VersionConflict),
            "stock_qty_conflict" => Some(ConflictType::StockQtyConflict),
            "append_only" => Some(ConflictType::AppendOnly),
            _ => None,
        }
    }
}

/// Per-event outcome, echoing the submitted event_id verbatim
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResult {
    pub event_id: Option<String>,
    pub status: EventStatus,
}

/// Response to a push batch: one result per event, same order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub server_time: String,
    pub results: Vec<EventResult>,
}

/// Response to a pull: full snapshots of everything changed after `since`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub server_time: String,
    pub products: Vec<Product>,
    pub customers: Vec<Customer>,
    pub sales: Vec<Sale>,
    pub expenses: Vec<Expense>,
}

/// Get a string field from a payload. Absent, null or non-string → None.
pub(crate) fn str_field(payload: &Map<String, Value>, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Get a money field. Accepts strings and numbers; a present but
/// unparseable value coerces to zero rather than poisoning the event.
pub(crate) fn decimal_field(payload: &Map<String, Value>, key: &str) -> Option<Decimal> {
    let value = payload.get(key)?;
    match value {
        Value::Null => None,
        Value::String(s) => Some(Decimal::from_str(s.trim()).unwrap_or_default()),
        Value::Number(n) => Some(Decimal::from_str(&n.to_string()).unwrap_or_default()),
        _ => Some(Decimal::ZERO),
    }
}

/// Get an integer field. Accepts numbers and numeric strings.
pub(crate) fn int_field(payload: &Map<String, Value>, key: &str) -> Option<i64> {
    let value = payload.get(key)?;
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// The submitted logical version, defaulting to 1 when absent or unreadable
pub(crate) fn version_field(payload: &Map<String, Value>) -> i64 {
    int_field(payload, "version").unwrap_or(1)
}

/// Get a UUID field. Absent or unparseable → None.
pub(crate) fn uuid_field(payload: &Map<String, Value>, key: &str) -> Option<Uuid> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// Get an RFC 3339 timestamp field
pub(crate) fn datetime_field(payload: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn decimal_field_accepts_strings_and_numbers() {
        let p = payload(json!({"a": "1000", "b": 2500.50, "c": "garbage", "d": null}));
        assert_eq!(decimal_field(&p, "a"), Some(dec!(1000)));
        assert_eq!(decimal_field(&p, "b"), Some(dec!(2500.50)));
        assert_eq!(decimal_field(&p, "c"), Some(Decimal::ZERO));
        assert_eq!(decimal_field(&p, "d"), None);
        assert_eq!(decimal_field(&p, "missing"), None);
    }

    #[test]
    fn version_field_defaults_to_one() {
        assert_eq!(version_field(&payload(json!({"version": 3}))), 3);
        assert_eq!(version_field(&payload(json!({"version": "4"}))), 4);
        assert_eq!(version_field(&payload(json!({}))), 1);
        assert_eq!(version_field(&payload(json!({"version": null}))), 1);
    }

    #[test]
    fn event_status_wire_format_is_lowercase() {
        assert_eq!(serde_json::to_string(&EventStatus::Applied).unwrap(), "\"applied\"");
        assert_eq!(
            serde_json::to_string(&ConflictType::StockQtyConflict).unwrap(),
            "\"stock_qty_conflict\""
        );
    }

    #[test]
    fn raw_event_tolerates_missing_fields() {
        let raw: RawEvent = serde_json::from_value(json!({"operation": "CREATE"})).unwrap();
        assert!(raw.event_id.is_none());
        assert!(raw.entity_type.is_none());
        assert!(raw.payload_json.is_empty());
    }
}
