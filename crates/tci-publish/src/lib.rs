//! Publication engine and failure classifier.
//!
//! `process_batch` walks one portfolio's outbox entries in order and stops
//! at the first failure, returning a *contiguous prefix* of the ids that
//! made it to the bus — the prefix-safety invariant dispatch relies on to
//! know which ids it may mark SENT.

use std::time::Duration;

use tci_bus::{BusProducer, BusPublishError};
use tci_schemas::OutboxEntry;
use tracing::warn;

/// Outcome of classifying a publish failure's root cause.
/// The policy: anything a retry might fix is `SystemFailure`; anything a
/// retry cannot fix is `PoisonPill`. Unrecognized errors default to
/// `SystemFailure` — a false retry is cheap, a false quarantine is data
/// loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    PoisonPill,
    SystemFailure,
}

pub fn classify_failure(err: &BusPublishError) -> FailureClass {
    match err {
        BusPublishError::SchemaIncompatible(_) => FailureClass::PoisonPill,
        BusPublishError::PayloadTooLarge(_) => FailureClass::PoisonPill,
        BusPublishError::Timeout => FailureClass::SystemFailure,
        // Network/connectivity errors, broker unavailability, leader
        // election in progress, and anything else `rdkafka` surfaces that
        // isn't named above: fail-safe default is SystemFailure, since a
        // false retry is cheap and a false quarantine is data loss.
        BusPublishError::Kafka(_) => FailureClass::SystemFailure,
    }
}

/// A poison pill discovered mid-batch: the entry plus why it can never be
/// published.
#[derive(Debug, Clone)]
pub struct PoisonPillEntry {
    pub outbox_id: i64,
    pub reason: String,
}

/// Result of [`process_batch`]. `successful_ids` is always a contiguous
/// prefix of the input, ending at the first failure or at the end on full
/// success.
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    /// Every entry in the batch published successfully.
    Success { successful_ids: Vec<i64> },
    /// A SystemFailure stopped the batch; entries at and after the failure
    /// stay PENDING for the next iteration.
    SystemFailure { successful_ids: Vec<i64> },
    /// A PoisonPill stopped the batch; the caller quarantines it and may
    /// continue with the next portfolio group.
    PoisonPill {
        successful_ids: Vec<i64>,
        pill: PoisonPillEntry,
    },
}

/// Publishes one portfolio's worth of outbox entries in order. `entries`
/// must already be one portfolio's group, in `(created_at, id)` order.
pub async fn process_batch(
    producer: &dyn BusProducer,
    entries: &[OutboxEntry],
    publish_timeout: Duration,
) -> BatchOutcome {
    let mut successful_ids = Vec::with_capacity(entries.len());

    for entry in entries {
        let result = producer
            .publish(&entry.publish_partition_key, &entry.payload, publish_timeout)
            .await;

        match result {
            Ok(()) => successful_ids.push(entry.id),
            Err(err) => {
                return match classify_failure(&err) {
                    FailureClass::PoisonPill => {
                        warn!(outbox_id = entry.id, %err, "poison pill during publish");
                        BatchOutcome::PoisonPill {
                            successful_ids,
                            pill: PoisonPillEntry {
                                outbox_id: entry.id,
                                reason: err.to_string(),
                            },
                        }
                    }
                    FailureClass::SystemFailure => {
                        warn!(outbox_id = entry.id, %err, "system failure during publish, batch paused");
                        BatchOutcome::SystemFailure { successful_ids }
                    }
                };
            }
        }
    }

    BatchOutcome::Success { successful_ids }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProducer {
        calls: AtomicUsize,
        // index -> outcome
        outcomes: Vec<Result<(), BusPublishError>>,
    }

    impl BusProducer for ScriptedProducer {
        fn publish(
            &self,
            _partition_key: &str,
            _payload: &[u8],
            _timeout: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<(), BusPublishError>> + Send + '_>> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = match &self.outcomes[i] {
                Ok(()) => Ok(()),
                Err(BusPublishError::Timeout) => Err(BusPublishError::Timeout),
                Err(BusPublishError::SchemaIncompatible(s)) => {
                    Err(BusPublishError::SchemaIncompatible(s.clone()))
                }
                Err(BusPublishError::PayloadTooLarge(s)) => {
                    Err(BusPublishError::PayloadTooLarge(s.clone()))
                }
                Err(BusPublishError::Kafka(_)) => Err(BusPublishError::Timeout),
            };
            Box::pin(async move { outcome })
        }
    }

    fn entry(id: i64) -> OutboxEntry {
        OutboxEntry {
            id,
            created_at: chrono::Utc::now(),
            portfolio_id: "p1".to_string(),
            trade_id: format!("t{id}"),
            payload: b"{}".to_vec(),
            publish_partition_key: "p1".to_string(),
            status: tci_schemas::OutboxStatus::Pending,
            sent_at: None,
        }
    }

    #[tokio::test]
    async fn full_success_returns_all_ids_in_order() {
        let producer = ScriptedProducer {
            calls: AtomicUsize::new(0),
            outcomes: vec![Ok(()), Ok(()), Ok(())],
        };
        let entries = vec![entry(1), entry(2), entry(3)];
        let outcome = process_batch(&producer, &entries, Duration::from_secs(1)).await;
        match outcome {
            BatchOutcome::Success { successful_ids } => {
                assert_eq!(successful_ids, vec![1, 2, 3]);
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn poison_pill_mid_batch_yields_prefix_and_pill() {
        let producer = ScriptedProducer {
            calls: AtomicUsize::new(0),
            outcomes: vec![
                Ok(()),
                Err(BusPublishError::SchemaIncompatible("bad".to_string())),
                Ok(()),
            ],
        };
        let entries = vec![entry(1), entry(2), entry(3)];
        let outcome = process_batch(&producer, &entries, Duration::from_secs(1)).await;
        match outcome {
            BatchOutcome::PoisonPill {
                successful_ids,
                pill,
            } => {
                assert_eq!(successful_ids, vec![1]);
                assert_eq!(pill.outbox_id, 2);
            }
            other => panic!("expected PoisonPill, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn system_failure_stops_batch_without_advancing() {
        let producer = ScriptedProducer {
            calls: AtomicUsize::new(0),
            outcomes: vec![Ok(()), Err(BusPublishError::Timeout), Ok(())],
        };
        let entries = vec![entry(1), entry(2), entry(3)];
        let outcome = process_batch(&producer, &entries, Duration::from_secs(1)).await;
        match outcome {
            BatchOutcome::SystemFailure { successful_ids } => {
                assert_eq!(successful_ids, vec![1]);
            }
            other => panic!("expected SystemFailure, got {other:?}"),
        }
    }

    #[test]
    fn payload_too_large_classifies_as_poison_pill() {
        assert_eq!(
            classify_failure(&BusPublishError::PayloadTooLarge("too big".to_string())),
            FailureClass::PoisonPill
        );
    }

    #[test]
    fn schema_incompatible_classifies_as_poison_pill() {
        assert_eq!(
            classify_failure(&BusPublishError::SchemaIncompatible("bad".to_string())),
            FailureClass::PoisonPill
        );
    }

    #[test]
    fn timeout_classifies_as_system_failure() {
        assert_eq!(classify_failure(&BusPublishError::Timeout), FailureClass::SystemFailure);
    }
}
