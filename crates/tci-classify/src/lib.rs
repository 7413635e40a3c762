//! Message classifier: a pure function from raw bytes to a decoded
//! [`TradeEvent`] or an [`InvalidReason`]. No retries, no side effects,
//! no I/O.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tci_schemas::{Classified, InvalidReason, Side, TradeEvent};

/// Decode a raw message. Produces `Invalid` when: the payload doesn't parse
/// as JSON; required fields (`portfolioId`, `tradeId`) are empty; or a field
/// violates a documented constraint.
pub fn classify(raw_bytes: &[u8]) -> Classified {
    let value: Value = match serde_json::from_slice(raw_bytes) {
        Ok(v) => v,
        Err(e) => return Classified::Invalid(InvalidReason::DecodeFailure(e.to_string())),
    };

    match decode_fields(&value) {
        Ok(event) => Classified::Valid(event),
        Err(reason) => Classified::Invalid(reason),
    }
}

fn decode_fields(v: &Value) -> Result<TradeEvent, InvalidReason> {
    let trade_id = required_str(v, "tradeId")?;
    if trade_id.is_empty() {
        return Err(InvalidReason::ConstraintViolation(
            "tradeId must be non-empty".to_string(),
        ));
    }

    let portfolio_id = required_str(v, "portfolioId")?;
    if portfolio_id.is_empty() {
        return Err(InvalidReason::ConstraintViolation(
            "portfolioId must be non-empty".to_string(),
        ));
    }

    let symbol = required_str(v, "symbol")?;

    let side_str = required_str(v, "side")?;
    let side = Side::parse(&side_str).ok_or_else(|| {
        InvalidReason::ConstraintViolation(format!("side must be BUY or SELL, got '{side_str}'"))
    })?;

    let price_per_stock = required_f64(v, "pricePerStock")?;
    if !price_per_stock.is_finite() || price_per_stock < 0.0 {
        return Err(InvalidReason::ConstraintViolation(
            "pricePerStock must be a finite, non-negative number".to_string(),
        ));
    }

    let quantity = required_i64(v, "quantity")?;
    if quantity < 0 {
        return Err(InvalidReason::ConstraintViolation(
            "quantity must be >= 0".to_string(),
        ));
    }

    let event_timestamp = required_timestamp(v, "eventTimestamp")?;

    Ok(TradeEvent {
        trade_id,
        portfolio_id,
        symbol,
        side,
        price_per_stock,
        quantity,
        event_timestamp,
    })
}

fn required_str(v: &Value, field: &'static str) -> Result<String, InvalidReason> {
    v.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(InvalidReason::MissingField(field))
}

fn required_f64(v: &Value, field: &'static str) -> Result<f64, InvalidReason> {
    v.get(field)
        .and_then(Value::as_f64)
        .ok_or(InvalidReason::MissingField(field))
}

fn required_i64(v: &Value, field: &'static str) -> Result<i64, InvalidReason> {
    v.get(field)
        .and_then(Value::as_i64)
        .ok_or(InvalidReason::MissingField(field))
}

fn required_timestamp(v: &Value, field: &'static str) -> Result<DateTime<Utc>, InvalidReason> {
    let raw = required_str(v, field)?;
    raw.parse::<DateTime<Utc>>().map_err(|e| {
        InvalidReason::ConstraintViolation(format!("{field} is not a valid RFC3339 timestamp: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_json() -> serde_json::Value {
        serde_json::json!({
            "tradeId": "t-1",
            "portfolioId": "p-1",
            "symbol": "AAPL",
            "side": "BUY",
            "pricePerStock": 189.50,
            "quantity": 100,
            "eventTimestamp": "2026-07-28T12:00:00Z",
        })
    }

    #[test]
    fn classifies_valid_payload() {
        let bytes = serde_json::to_vec(&valid_json()).unwrap();
        match classify(&bytes) {
            Classified::Valid(ev) => {
                assert_eq!(ev.trade_id, "t-1");
                assert_eq!(ev.portfolio_id, "p-1");
                assert_eq!(ev.side, Side::Buy);
            }
            Classified::Invalid(r) => panic!("expected valid, got {r:?}"),
        }
    }

    #[test]
    fn rejects_malformed_json() {
        match classify(b"not json") {
            Classified::Invalid(InvalidReason::DecodeFailure(_)) => {}
            other => panic!("expected DecodeFailure, got {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_portfolio_id() {
        let mut v = valid_json();
        v["portfolioId"] = serde_json::json!("");
        let bytes = serde_json::to_vec(&v).unwrap();
        match classify(&bytes) {
            Classified::Invalid(InvalidReason::ConstraintViolation(msg)) => {
                assert!(msg.contains("portfolioId"));
            }
            other => panic!("expected ConstraintViolation, got {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_trade_id() {
        let mut v = valid_json();
        v["tradeId"] = serde_json::json!("");
        let bytes = serde_json::to_vec(&v).unwrap();
        assert!(matches!(
            classify(&bytes),
            Classified::Invalid(InvalidReason::ConstraintViolation(_))
        ));
    }

    #[test]
    fn rejects_missing_field() {
        let mut v = valid_json();
        v.as_object_mut().unwrap().remove("symbol");
        let bytes = serde_json::to_vec(&v).unwrap();
        match classify(&bytes) {
            Classified::Invalid(InvalidReason::MissingField("symbol")) => {}
            other => panic!("expected MissingField(symbol), got {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_side() {
        let mut v = valid_json();
        v["side"] = serde_json::json!("HOLD");
        let bytes = serde_json::to_vec(&v).unwrap();
        assert!(matches!(
            classify(&bytes),
            Classified::Invalid(InvalidReason::ConstraintViolation(_))
        ));
    }

    #[test]
    fn rejects_negative_quantity() {
        let mut v = valid_json();
        v["quantity"] = serde_json::json!(-5);
        let bytes = serde_json::to_vec(&v).unwrap();
        assert!(matches!(
            classify(&bytes),
            Classified::Invalid(InvalidReason::ConstraintViolation(_))
        ));
    }

    #[test]
    fn rejects_non_finite_price() {
        let mut v = valid_json();
        v["pricePerStock"] = serde_json::json!(-1.0);
        let bytes = serde_json::to_vec(&v).unwrap();
        assert!(matches!(
            classify(&bytes),
            Classified::Invalid(InvalidReason::ConstraintViolation(_))
        ));
    }
}
