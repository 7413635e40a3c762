//! PersistenceCore: four progressively-degrading failure levels wrapped by
//! a circuit breaker on levels 1-2. Level 4 is the only place an error is
//! intentionally swallowed, and it must leave a durable trace — a
//! hex-encoded, append-only disk log (`OpenOptions::append(true)`, one
//! JSON object per line).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tci_breaker::{CallNotPermitted, CircuitBreaker};
use tci_db::DbErrorClass;
use tci_schemas::PendingMessage;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum PersistError {
    /// The circuit breaker is open; caller pauses the stream, sleeps a
    /// backoff, and retries the same batch untouched.
    #[error("circuit breaker open")]
    CallNotPermitted,
    /// A durable-store system error propagated past the fallback levels.
    /// The caller retries the same batch; nothing in it has been persisted.
    #[error("system failure persisting batch: {0}")]
    SystemFailure(#[source] sqlx::Error),
}

impl From<CallNotPermitted> for PersistError {
    fn from(_: CallNotPermitted) -> Self {
        PersistError::CallNotPermitted
    }
}

#[derive(Serialize)]
struct DiskLogRecord {
    logged_at: chrono::DateTime<Utc>,
    reason: String,
    payload_hex: String,
}

/// Append-only last-resort log for level 4: a structured disk log of raw
/// bytes plus a reason. One JSON object per line.
pub struct DiskLog {
    path: PathBuf,
}

impl DiskLog {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Write one lost-to-disk record. Must emit a high-severity log record
    /// alongside it — the only place an error is intentionally swallowed.
    pub fn append_lost(&self, raw_bytes: &[u8], reason: &str) -> anyhow::Result<()> {
        let record = DiskLogRecord {
            logged_at: Utc::now(),
            reason: reason.to_string(),
            payload_hex: hex::encode(raw_bytes),
        };
        let line = serde_json::to_string(&record)?;

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")?;

        error!(reason, payload_hex = %record.payload_hex, "message lost to disk log, unrecoverable without manual replay");
        Ok(())
    }
}

pub struct PersistenceCore {
    pool: sqlx::PgPool,
    breaker: Arc<CircuitBreaker>,
    disk_log: DiskLog,
}

impl PersistenceCore {
    pub fn new(pool: sqlx::PgPool, breaker: Arc<CircuitBreaker>, disk_log: DiskLog) -> Self {
        Self {
            pool,
            breaker,
            disk_log,
        }
    }

    /// Persists a batch, walking all four failure levels. Returns `Ok(())`
    /// once every message in `batch` has
    /// been durably handled one way or another (committed, quarantined, or
    /// logged to disk) — at that point the caller may safely call
    /// `storeOffset` for the batch's last message. Returns `Err` only when
    /// the whole batch must be retried untouched.
    pub async fn persist_batch(&self, batch: &[PendingMessage]) -> Result<(), PersistError> {
        self.breaker.try_acquire()?;

        // Level 1: one transaction for the whole batch.
        match tci_db::persist_batch(&self.pool, batch).await {
            Ok(()) => {
                self.breaker.record_outcome(false);
                return Ok(());
            }
            Err(e) if tci_db::classify_db_error(&e) == DbErrorClass::SystemFailure => {
                self.breaker.record_outcome(true);
                return Err(PersistError::SystemFailure(e));
            }
            Err(_data_err) => {
                // Fall through to level 2 per-item fallback.
            }
        }

        // Level 2: per-item independent transactions.
        for msg in batch {
            match self.persist_single_safely(msg).await {
                Ok(true) => continue,
                Ok(false) => {
                    // Level 3: isolated quarantine transaction.
                    if let Err(commit_err) = self.quarantine_level3(msg).await {
                        // Level 4: swallow, but never silently.
                        let reason = format!(
                            "level3 quarantine commit failed: {commit_err}; message lost to disk"
                        );
                        if let Err(disk_err) = self.disk_log.append_lost(&msg.raw_bytes, &reason) {
                            error!(%disk_err, "disk log write itself failed; message is unrecoverable");
                        }
                    }
                }
                Err(e) => {
                    self.breaker.record_outcome(true);
                    return Err(PersistError::SystemFailure(e));
                }
            }
        }

        self.breaker.record_outcome(false);
        Ok(())
    }

    async fn persist_single_safely(&self, msg: &PendingMessage) -> Result<bool, sqlx::Error> {
        tci_db::persist_single_safely(&self.pool, msg).await
    }

    async fn quarantine_level3(&self, msg: &PendingMessage) -> Result<(), sqlx::Error> {
        tci_db::quarantine_independent(&self.pool, &msg.raw_bytes, "level2 data error", "persist-level3")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn disk_log_appends_hex_encoded_payload() {
        let dir = tempdir().unwrap();
        let log = DiskLog::new(dir.path().join("lost.jsonl")).unwrap();
        log.append_lost(b"\x01\x02\xff", "test reason").unwrap();

        let content = std::fs::read_to_string(dir.path().join("lost.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("0102ff"));
        assert!(content.contains("test reason"));
    }

    #[test]
    fn disk_log_is_append_only_across_calls() {
        let dir = tempdir().unwrap();
        let log = DiskLog::new(dir.path().join("lost.jsonl")).unwrap();
        log.append_lost(b"a", "first").unwrap();
        log.append_lost(b"b", "second").unwrap();

        let content = std::fs::read_to_string(dir.path().join("lost.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
