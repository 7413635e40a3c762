//! DispatchWorker: one long-running loop per process,
//! correctness across concurrently-running processes preserved by
//! `tci-db`'s per-portfolio advisory lock rather than any in-process
//! coordination. State machine: `Idle -> Fetching -> Dispatching ->
//! Committing -> Idle | BackingOff -> Idle`, terminal `Stopped`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use sqlx::PgPool;
use tci_buffer::AdaptiveBatchSizer;
use tci_bus::BusProducer;
use tci_publish::BatchOutcome;
use tci_schemas::OutboxEntry;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Fetching,
    Dispatching,
    Committing,
    BackingOff,
    Stopped,
}

pub struct DispatchConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub idle_interval: Duration,
    pub publish_timeout: Duration,
}

pub struct DispatchWorker {
    pool: PgPool,
    producer: Arc<dyn BusProducer>,
    sizer: AdaptiveBatchSizer,
    config: DispatchConfig,
    running: AtomicBool,
    state: RwLock<DispatchState>,
    current_backoff: RwLock<Duration>,
}

impl DispatchWorker {
    pub fn new(
        pool: PgPool,
        producer: Arc<dyn BusProducer>,
        sizer: AdaptiveBatchSizer,
        config: DispatchConfig,
    ) -> Self {
        Self {
            pool,
            producer,
            sizer,
            config,
            running: AtomicBool::new(true),
            state: RwLock::new(DispatchState::Idle),
            current_backoff: RwLock::new(Duration::ZERO),
        }
    }

    pub fn state(&self) -> DispatchState {
        *self.state.read().expect("dispatch state lock poisoned")
    }

    /// Sets the running flag; the loop exits at the next iteration boundary,
    /// always after committing any in-progress transaction.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn set_state(&self, s: DispatchState) {
        *self.state.write().expect("dispatch state lock poisoned") = s;
    }

    /// Runs until `stop()` is called. One iteration = one transaction.
    pub async fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            let backoff = *self.current_backoff.read().expect("backoff lock poisoned");
            if backoff > Duration::ZERO {
                self.set_state(DispatchState::BackingOff);
                tokio::time::sleep(backoff).await;
            }

            match self.run_iteration().await {
                Ok(IterationOutcome::Empty) => {
                    self.sizer.reset();
                    tokio::time::sleep(self.config.idle_interval).await;
                }
                Ok(IterationOutcome::Progressed) => {
                    *self.current_backoff.write().expect("backoff lock poisoned") = Duration::ZERO;
                }
                Ok(IterationOutcome::SystemFailurePaused) => {
                    let mut backoff = self.current_backoff.write().expect("backoff lock poisoned");
                    *backoff = next_backoff(*backoff, self.config.initial_backoff, self.config.max_backoff);
                }
                Err(e) => {
                    warn!(error = %e, "dispatch iteration failed to commit, retrying next loop");
                    let mut backoff = self.current_backoff.write().expect("backoff lock poisoned");
                    *backoff = next_backoff(*backoff, self.config.initial_backoff, self.config.max_backoff);
                }
            }
        }
        self.set_state(DispatchState::Stopped);
    }

    /// One full iteration: fetch -> group -> dispatch per portfolio -> commit.
    async fn run_iteration(&self) -> Result<IterationOutcome, sqlx::Error> {
        self.set_state(DispatchState::Fetching);
        let started = Instant::now();

        let mut tx = self.pool.begin().await?;
        let current_size = self.sizer.current_size() as i64;
        let entries = tci_db::fetch_pending_batch(&mut tx, current_size).await?;

        if entries.is_empty() {
            tx.commit().await?;
            self.set_state(DispatchState::Idle);
            return Ok(IterationOutcome::Empty);
        }

        let by_id: HashMap<i64, OutboxEntry> =
            entries.iter().map(|e| (e.id, e.clone())).collect();
        let groups = group_by_portfolio_preserving_order(entries);

        self.set_state(DispatchState::Dispatching);
        let mut batch_size_processed = 0usize;
        let mut system_failure_this_iteration = false;

        'portfolios: for (_portfolio_id, group) in groups {
            batch_size_processed += group.len();
            let outcome =
                tci_publish::process_batch(self.producer.as_ref(), &group, self.config.publish_timeout).await;

            match outcome {
                BatchOutcome::Success { successful_ids } => {
                    tci_db::mark_batch_sent(&mut tx, &successful_ids).await?;
                }
                BatchOutcome::PoisonPill {
                    successful_ids,
                    pill,
                } => {
                    tci_db::mark_batch_sent(&mut tx, &successful_ids).await?;
                    if let Some(entry) = by_id.get(&pill.outbox_id) {
                        tci_db::quarantine_outbox_entry(&mut tx, pill.outbox_id, &entry.payload, &pill.reason)
                            .await?;
                    }
                }
                BatchOutcome::SystemFailure { successful_ids } => {
                    tci_db::mark_batch_sent(&mut tx, &successful_ids).await?;
                    system_failure_this_iteration = true;
                    break 'portfolios;
                }
            }
        }

        self.set_state(DispatchState::Committing);
        tx.commit().await?;

        if system_failure_this_iteration {
            return Ok(IterationOutcome::SystemFailurePaused);
        }

        let observed_latency = started.elapsed();
        self.sizer.record_flush(observed_latency, batch_size_processed);
        info!(batch_size_processed, latency_ms = observed_latency.as_millis(), "dispatch iteration committed");
        Ok(IterationOutcome::Progressed)
    }
}

enum IterationOutcome {
    Empty,
    Progressed,
    SystemFailurePaused,
}

fn next_backoff(current: Duration, initial: Duration, max: Duration) -> Duration {
    let doubled = current.checked_mul(2).unwrap_or(max);
    doubled.max(initial).min(max)
}

/// Groups entries by `portfolio_id`, preserving the insertion order of each
/// group's first appearance — which preserves per-portfolio chronological
/// order since `entries` arrives sorted `(created_at, id)`.
fn group_by_portfolio_preserving_order(entries: Vec<OutboxEntry>) -> Vec<(String, Vec<OutboxEntry>)> {
    let mut order: Vec<String> = Vec::new();
    let mut map: HashMap<String, Vec<OutboxEntry>> = HashMap::new();

    for entry in entries {
        map.entry(entry.portfolio_id.clone())
            .or_insert_with(|| {
                order.push(entry.portfolio_id.clone());
                Vec::new()
            })
            .push(entry);
    }

    order
        .into_iter()
        .map(|portfolio_id| {
            let group = map.remove(&portfolio_id).expect("group populated above");
            (portfolio_id, group)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tci_schemas::OutboxStatus;

    fn entry(id: i64, portfolio_id: &str) -> OutboxEntry {
        OutboxEntry {
            id,
            created_at: chrono::Utc::now(),
            portfolio_id: portfolio_id.to_string(),
            trade_id: format!("t{id}"),
            payload: vec![],
            publish_partition_key: portfolio_id.to_string(),
            status: OutboxStatus::Pending,
            sent_at: None,
        }
    }

    #[test]
    fn groups_preserve_first_seen_portfolio_order() {
        let entries = vec![
            entry(1, "A"),
            entry(2, "B"),
            entry(3, "A"),
            entry(4, "C"),
            entry(5, "B"),
        ];
        let groups = group_by_portfolio_preserving_order(entries);
        let keys: Vec<&str> = groups.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["A", "B", "C"]);
        assert_eq!(groups[0].1.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(groups[1].1.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 5]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(5);
        let b1 = next_backoff(Duration::ZERO, initial, max);
        assert_eq!(b1, initial);
        let b2 = next_backoff(b1, initial, max);
        assert_eq!(b2, Duration::from_millis(200));
        let capped = next_backoff(Duration::from_secs(10), initial, max);
        assert_eq!(capped, max);
    }
}
