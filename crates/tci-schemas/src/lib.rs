//! Shared wire and domain types for the trade-capture ingress pipeline.
//!
//! Kept dependency-light (no sqlx, no rdkafka) so every other crate in the
//! workspace can depend on it without dragging in a transport or a driver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current wire schema version produced by this build's [`MessageClassifier`]
/// (defined in `tci-classify`). Carried on every decoded record so a replay
/// can pick the right decoder even after the schema has moved on.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Sentinel `tradeId` stamped onto `AuditRecord`s for invalid messages,
/// where no real trade identity exists.
pub const INVALID_TRADE_ID_SENTINEL: &str = "__invalid__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Decoded trade event. `tradeId` is globally unique across all time;
/// `portfolioId` is the downstream-bus ordering key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub trade_id: String,
    pub portfolio_id: String,
    pub symbol: String,
    pub side: Side,
    pub price_per_stock: f64,
    pub quantity: i64,
    pub event_timestamp: DateTime<Utc>,
}

/// Wire envelope produced by the classifier and stored as `OutboxEntry.payload`.
/// `schema_version` lets a future decoder reject or migrate payloads encoded
/// by an older build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEventEnvelope {
    pub schema_version: i32,
    pub event: TradeEvent,
}

impl TradeEventEnvelope {
    pub fn new(event: TradeEvent) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            event,
        }
    }
}

/// Why a raw message failed classification. Carried alongside the raw bytes
/// so the audit trail and quarantine entry can explain the rejection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum InvalidReason {
    #[error("decode failure: {0}")]
    DecodeFailure(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("field constraint violated: {0}")]
    ConstraintViolation(String),
}

/// Either side of classification: a decoded event, or why it was rejected.
#[derive(Debug, Clone)]
pub enum Classified {
    Valid(TradeEvent),
    Invalid(InvalidReason),
}

/// An in-flight message pulled off the source stream, not yet persisted.
/// Immutable after construction; dropped once the batch containing it is
/// flushed and its offset acknowledged.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub classified: PendingClassified,
    pub raw_bytes: Vec<u8>,
    /// Source-stream offset. `-1` marks an admin-replay injection with no
    /// corresponding offset to commit.
    pub offset: i64,
    /// Opaque ack-handle passed back to `StreamAdapter::store_offset`.
    /// `None` for admin-replay injections and for any message whose offset
    /// must not be committed.
    pub ack_handle: Option<AckHandle>,
}

#[derive(Debug, Clone)]
pub enum PendingClassified {
    Valid(TradeEvent),
    Invalid(InvalidReason),
}

impl From<Classified> for PendingClassified {
    fn from(c: Classified) -> Self {
        match c {
            Classified::Valid(e) => PendingClassified::Valid(e),
            Classified::Invalid(r) => PendingClassified::Invalid(r),
        }
    }
}

/// Opaque handle a `StreamAdapter` implementation uses to durably store an
/// offset. Carries only what `tci-stream`'s Kafka binding needs: the
/// partition and the offset to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHandle {
    pub partition: i32,
    pub offset: i64,
}

/// Durable audit trail row. One per received message, valid or not, written
/// before the offset is acknowledged.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub id: i64,
    pub received_at: DateTime<Utc>,
    pub portfolio_id: String,
    pub trade_id: String,
    pub raw_payload: Vec<u8>,
    pub symbol: Option<String>,
    pub side: Option<Side>,
    pub price_per_stock: Option<f64>,
    pub quantity: Option<i64>,
    pub event_timestamp: Option<DateTime<Utc>>,
    pub schema_version: i32,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Sent,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sent => "SENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OutboxStatus::Pending),
            "SENT" => Some(OutboxStatus::Sent),
            _ => None,
        }
    }
}

/// Row in the transactional outbox. Created atomically with its
/// `AuditRecord` iff the record is valid; transitions PENDING -> SENT once.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub portfolio_id: String,
    pub trade_id: String,
    pub payload: Vec<u8>,
    /// Materialized `portfolioId` used directly as the downstream-bus
    /// partition key, so the dispatcher never re-derives it from `payload`.
    pub publish_partition_key: String,
    pub status: OutboxStatus,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Append-only terminal holding area for messages that cannot be published.
#[derive(Debug, Clone)]
pub struct QuarantineEntry {
    pub id: i64,
    pub failed_at: DateTime<Utc>,
    pub raw_message: Vec<u8>,
    pub error_detail: String,
    /// Which persistence/dispatch level produced this entry. Operational
    /// triage only; never read by correctness-critical code.
    pub source: &'static str,
}

/// Truncate an error detail string to the `quarantine.error_detail` column
/// limit of 4096 chars.
pub fn truncate_error_detail(detail: &str) -> String {
    const MAX: usize = 4096;
    if detail.chars().count() <= MAX {
        detail.to_string()
    } else {
        detail.chars().take(MAX).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_round_trips() {
        assert_eq!(Side::parse("BUY"), Some(Side::Buy));
        assert_eq!(Side::parse("SELL"), Some(Side::Sell));
        assert_eq!(Side::parse("HOLD"), None);
        assert_eq!(Side::Buy.as_str(), "BUY");
    }

    #[test]
    fn outbox_status_round_trips() {
        assert_eq!(OutboxStatus::parse("PENDING"), Some(OutboxStatus::Pending));
        assert_eq!(OutboxStatus::parse("SENT"), Some(OutboxStatus::Sent));
        assert_eq!(OutboxStatus::parse("BOGUS"), None);
    }

    #[test]
    fn truncate_error_detail_respects_limit() {
        let long = "x".repeat(5000);
        let truncated = truncate_error_detail(&long);
        assert_eq!(truncated.chars().count(), 4096);

        let short = "short error";
        assert_eq!(truncate_error_detail(short), short);
    }

    #[test]
    fn trade_event_envelope_round_trips_through_json() {
        let event = TradeEvent {
            trade_id: "t-1".to_string(),
            portfolio_id: "p-1".to_string(),
            symbol: "AAPL".to_string(),
            side: Side::Buy,
            price_per_stock: 189.5,
            quantity: 100,
            event_timestamp: "2026-07-28T12:00:00Z".parse().unwrap(),
        };
        let envelope = TradeEventEnvelope::new(event.clone());

        let encoded = serde_json::to_vec(&envelope).unwrap();
        let decoded: TradeEventEnvelope = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(decoded.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(decoded.event, event);
    }
}
