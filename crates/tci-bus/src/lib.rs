//! Downstream bus adapter: a partitioned log keyed by `portfolioId`,
//! publish synchronous-with-timeout, idempotent producer. Concretely
//! `rdkafka::producer::FutureProducer` configured for
//! `enable.idempotence=true`, `acks=all`,
//! `max.in.flight.requests.per.connection=1`, unbounded client-level
//! retries.

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tci_schemas::{TradeEventEnvelope, CURRENT_SCHEMA_VERSION};
use thiserror::Error;

/// Failure surfaced by [`BusProducer::publish`]. `tci-publish`'s failure
/// classifier maps these onto PoisonPill/SystemFailure.
#[derive(Debug, Error)]
pub enum BusPublishError {
    /// The stored payload doesn't decode, or carries a `schema_version`
    /// this build doesn't recognize. Schema-incompatible payloads surface
    /// as serialization failures. PoisonPill.
    #[error("schema-incompatible payload: {0}")]
    SchemaIncompatible(String),

    /// The publish future didn't resolve within the configured timeout.
    /// SystemFailure.
    #[error("publish timed out")]
    Timeout,

    /// The payload exceeds the destination's configured message-size limit.
    /// No retry will ever shrink it. PoisonPill.
    #[error("payload too large for destination: {0}")]
    PayloadTooLarge(String),

    /// Broker/network/leader-election errors from `rdkafka`. SystemFailure.
    #[error("kafka producer error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

pub trait BusProducer: Send + Sync {
    /// Publish `payload` (the outbox row's stored bytes) to the
    /// configured topic, keyed by `partition_key` (= `portfolioId`), with a
    /// hard deadline of `timeout`.
    fn publish(
        &self,
        partition_key: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), BusPublishError>> + Send + '_>>;
}

pub struct KafkaBusProducer {
    producer: FutureProducer,
    topic: String,
}

impl KafkaBusProducer {
    pub fn connect(bootstrap_servers: &str, topic: &str) -> anyhow::Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "1")
            .set("message.send.max.retries", i32::MAX.to_string())
            .create()?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }

    /// Reject payloads whose schema version this build doesn't recognize
    /// before attempting a send, giving the same fail-closed behavior a
    /// live schema registry would without requiring one.
    fn check_schema_version(payload: &[u8]) -> Result<(), BusPublishError> {
        let envelope: TradeEventEnvelope = serde_json::from_slice(payload)
            .map_err(|e| BusPublishError::SchemaIncompatible(e.to_string()))?;
        if envelope.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(BusPublishError::SchemaIncompatible(format!(
                "unrecognized schema_version {}",
                envelope.schema_version
            )));
        }
        Ok(())
    }
}

impl BusProducer for KafkaBusProducer {
    fn publish(
        &self,
        partition_key: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), BusPublishError>> + Send + '_>>
    {
        let topic = self.topic.clone();
        let key = partition_key.to_string();
        let payload = payload.to_vec();
        let producer = &self.producer;

        Box::pin(async move {
            Self::check_schema_version(&payload)?;

            let record = FutureRecord::to(&topic).key(&key).payload(&payload);

            match producer.send(record, Timeout::After(timeout)).await {
                Ok(_delivery) => Ok(()),
                Err((kafka_err, _owned_msg)) => match kafka_err {
                    rdkafka::error::KafkaError::MessageProduction(
                        rdkafka::types::RDKafkaErrorCode::MessageTimedOut,
                    ) => Err(BusPublishError::Timeout),
                    rdkafka::error::KafkaError::MessageProduction(
                        rdkafka::types::RDKafkaErrorCode::MsgSizeTooLarge,
                    ) => Err(BusPublishError::PayloadTooLarge(format!(
                        "payload of {} bytes exceeds destination limit",
                        payload.len()
                    ))),
                    other => Err(BusPublishError::Kafka(other)),
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_version_mismatch_is_rejected() {
        let mut envelope = serde_json::json!({
            "schema_version": CURRENT_SCHEMA_VERSION + 1,
            "event": {
                "trade_id": "t1",
                "portfolio_id": "p1",
                "symbol": "AAPL",
                "side": "Buy",
                "price_per_stock": 100.0,
                "quantity": 1,
                "event_timestamp": "2026-01-01T00:00:00Z",
            }
        });
        let bytes = serde_json::to_vec(&mut envelope).unwrap();
        let err = KafkaBusProducer::check_schema_version(&bytes).unwrap_err();
        assert!(matches!(err, BusPublishError::SchemaIncompatible(_)));
    }

    #[test]
    fn current_schema_version_passes() {
        let envelope = TradeEventEnvelope::new(tci_schemas::TradeEvent {
            trade_id: "t1".to_string(),
            portfolio_id: "p1".to_string(),
            symbol: "AAPL".to_string(),
            side: tci_schemas::Side::Buy,
            price_per_stock: 100.0,
            quantity: 1,
            event_timestamp: chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
        });
        let bytes = serde_json::to_vec(&envelope).unwrap();
        assert!(KafkaBusProducer::check_schema_version(&bytes).is_ok());
    }
}
