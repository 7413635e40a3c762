//! Durable store primitives for the ingress pipeline: audit, outbox and
//! quarantine. This crate does not decide *when* to fall back between
//! persistence levels — that progressive
//! degradation lives in `tci-persist` — it only provides the statements
//! each level needs and classifies the errors they raise.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tci_schemas::{
    truncate_error_detail, OutboxEntry, OutboxStatus, PendingClassified, PendingMessage,
    QuarantineEntry, Side,
};
use tracing::warn;

/// Connect to Postgres. `tci-config::secrets::ResolvedEnv` resolves the URL
/// from the environment; this crate only knows how to use it.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

/// Run the embedded migrations that create `audit`, `outbox` and
/// `quarantine`.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("tci-db migrate failed")
}

/// Whether a failure observed during a persistence attempt is a data
/// problem (absorb, quarantine, never retry, never trips the breaker) or a
/// system problem (retry forever, counts toward the circuit breaker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorClass {
    DataError,
    SystemFailure,
}

pub fn classify_db_error(err: &sqlx::Error) -> DbErrorClass {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            // unique_violation, check_violation, not_null_violation,
            // foreign_key_violation, restrict_violation
            Some("23505") | Some("23514") | Some("23502") | Some("23503") | Some("23001") => {
                DbErrorClass::DataError
            }
            _ => DbErrorClass::SystemFailure,
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            DbErrorClass::SystemFailure
        }
        _ => DbErrorClass::SystemFailure,
    }
}

fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(constraint)
    )
}

/// FNV-1a over the portfolio id, folded into the signed bigint
/// advisory-lock key space. The live query below lets Postgres compute its
/// own per-row hash server-side (`hashtextextended`, needed since the hash
/// varies per result row); this function gives `tci-testkit`'s in-memory
/// store the same stable, collision-tolerant key so fake-store scenario
/// tests exercise equivalent per-portfolio serialization semantics.
pub fn portfolio_lock_key(portfolio_id: &str) -> i64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in portfolio_id.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash as i64
}

/// Level 1: one transaction for the whole batch. Valid messages get an
/// AuditRecord + OutboxEntry; invalid messages get an AuditRecord with the
/// sentinel identity and a QuarantineEntry. A duplicate `trade_id` on a
/// valid record is absorbed silently (idempotent re-delivery).
///
/// Callers must inspect `classify_db_error` on `Err` to decide between the
/// per-item fallback (data error) and a retry (system error) — this
/// function does not make that decision itself.
pub async fn persist_batch(pool: &PgPool, batch: &[PendingMessage]) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for msg in batch {
        insert_one(&mut tx, msg).await?;
    }
    tx.commit().await
}

/// Level 2: the same single-message insert as `persist_batch`, but in its
/// own independent transaction, used when the batch transaction failed with
/// a data error. Returns `Ok(true)` on success, `Ok(false)` only when the
/// caller should escalate to level 3 quarantine (data error on this
/// message specifically).
pub async fn persist_single_safely(pool: &PgPool, msg: &PendingMessage) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;
    match insert_one(&mut tx, msg).await {
        Ok(()) => {
            tx.commit().await?;
            Ok(true)
        }
        Err(e) if classify_db_error(&e) == DbErrorClass::DataError => {
            // Roll back this attempt; the caller escalates to level 3 using
            // its own independent transaction.
            let _ = tx.rollback().await;
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

async fn insert_one(tx: &mut Transaction<'_, Postgres>, msg: &PendingMessage) -> Result<(), sqlx::Error> {
    match &msg.classified {
        PendingClassified::Valid(event) => {
            let inserted: Option<(i64,)> = sqlx::query_as(
                r#"
                insert into audit
                    (portfolio_id, trade_id, raw_payload, symbol, side,
                     price_per_stock, quantity, event_timestamp, schema_version, valid)
                values ($1, $2, $3, $4, $5, $6, $7, $8, $9, true)
                on conflict (trade_id) where valid do nothing
                returning id
                "#,
            )
            .bind(&event.portfolio_id)
            .bind(&event.trade_id)
            .bind(&msg.raw_bytes)
            .bind(&event.symbol)
            .bind(event.side.as_str())
            .bind(event.price_per_stock)
            .bind(event.quantity)
            .bind(event.event_timestamp)
            .bind(tci_schemas::CURRENT_SCHEMA_VERSION)
            .fetch_optional(&mut **tx)
            .await?;

            if inserted.is_none() {
                // Duplicate trade_id: absorbed, no new OutboxEntry.
                return Ok(());
            }

            // The outbox carries the schema-encoded wire envelope, not the
            // raw bytes the classifier decoded from — the downstream bus
            // producer's schema check decodes this exact payload before
            // publishing, so it must already be in `TradeEventEnvelope`
            // shape rather than the source stream's own wire format.
            let envelope_bytes = serde_json::to_vec(&tci_schemas::TradeEventEnvelope::new(event.clone()))
                .expect("TradeEventEnvelope serialization must not fail");

            sqlx::query(
                r#"
                insert into outbox (portfolio_id, trade_id, payload, publish_partition_key, status)
                values ($1, $2, $3, $4, 'PENDING')
                "#,
            )
            .bind(&event.portfolio_id)
            .bind(&event.trade_id)
            .bind(&envelope_bytes)
            .bind(&event.portfolio_id)
            .execute(&mut **tx)
            .await?;

            Ok(())
        }
        PendingClassified::Invalid(reason) => {
            sqlx::query(
                r#"
                insert into audit
                    (portfolio_id, trade_id, raw_payload, schema_version, valid)
                values ('', $1, $2, $3, false)
                "#,
            )
            .bind(tci_schemas::INVALID_TRADE_ID_SENTINEL)
            .bind(&msg.raw_bytes)
            .bind(tci_schemas::CURRENT_SCHEMA_VERSION)
            .execute(&mut **tx)
            .await?;

            sqlx::query(
                r#"
                insert into quarantine (raw_message, error_detail, source)
                values ($1, $2, $3)
                "#,
            )
            .bind(&msg.raw_bytes)
            .bind(truncate_error_detail(&reason.to_string()))
            .bind("persist-invalid")
            .execute(&mut **tx)
            .await?;

            Ok(())
        }
    }
}

/// Level 3: an isolated transaction that commits even if the surrounding
/// attempt rolled back.
pub async fn quarantine_independent(
    pool: &PgPool,
    raw_message: &[u8],
    error_detail: &str,
    source: &'static str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        insert into quarantine (raw_message, error_detail, source)
        values ($1, $2, $3)
        "#,
    )
    .bind(raw_message)
    .bind(truncate_error_detail(error_detail))
    .bind(source)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetches advisory-lock-filtered PENDING rows, ordered `(created_at, id)`.
/// Must run inside the caller's transaction —
/// the lock is transaction-scoped and auto-released on commit/rollback.
pub async fn fetch_pending_batch(
    tx: &mut Transaction<'_, Postgres>,
    limit: i64,
) -> Result<Vec<OutboxEntry>, sqlx::Error> {
    let rows: Vec<PgRow> = sqlx::query(
        r#"
        select id, created_at, portfolio_id, trade_id, payload,
               publish_partition_key, status, sent_at
        from outbox
        where status = 'PENDING'
          and pg_try_advisory_xact_lock(hashtextextended(portfolio_id, 0))
        order by created_at asc, id asc
        limit $1
        "#,
    )
    .bind(limit)
    .fetch_all(&mut **tx)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(row_to_outbox_entry(&row)?);
    }
    Ok(out)
}

fn row_to_outbox_entry(row: &PgRow) -> Result<OutboxEntry, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = OutboxStatus::parse(&status_str).unwrap_or(OutboxStatus::Pending);
    Ok(OutboxEntry {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        portfolio_id: row.try_get("portfolio_id")?,
        trade_id: row.try_get("trade_id")?,
        payload: row.try_get("payload")?,
        publish_partition_key: row.try_get("publish_partition_key")?,
        status,
        sent_at: row.try_get("sent_at")?,
    })
}

/// Marks a batch of outbox rows SENT with a single bulk `UPDATE ... WHERE id IN`.
pub async fn mark_batch_sent(
    tx: &mut Transaction<'_, Postgres>,
    ids: &[i64],
) -> Result<(), sqlx::Error> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"
        update outbox
        set status = 'SENT', sent_at = now()
        where id = any($1)
        "#,
    )
    .bind(ids)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Inserts the QuarantineEntry, then deletes the OutboxEntry, both in the
/// dispatcher's transaction.
pub async fn quarantine_outbox_entry(
    tx: &mut Transaction<'_, Postgres>,
    outbox_id: i64,
    raw_message: &[u8],
    reason: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        insert into quarantine (raw_message, error_detail, source)
        values ($1, $2, 'dispatch-poison-pill')
        "#,
    )
    .bind(raw_message)
    .bind(truncate_error_detail(reason))
    .execute(&mut **tx)
    .await?;

    sqlx::query("delete from outbox where id = $1")
        .bind(outbox_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Decoded side of an audit row, for rare ops tooling that reads the audit
/// trail back out (the hot path never needs this — it only writes).
#[derive(Debug, Clone)]
pub struct AuditRow {
    pub id: i64,
    pub received_at: DateTime<Utc>,
    pub portfolio_id: String,
    pub trade_id: String,
    pub valid: bool,
    pub side: Option<Side>,
}

pub async fn count_quarantine(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as("select count(*) from quarantine")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub fn unique_violation_on(err: &sqlx::Error, constraint: &str) -> bool {
    let hit = is_unique_constraint_violation(err, constraint);
    if hit {
        warn!(constraint, "absorbed unique constraint violation");
    }
    hit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portfolio_lock_key_is_stable() {
        let a = portfolio_lock_key("portfolio-123");
        let b = portfolio_lock_key("portfolio-123");
        assert_eq!(a, b);
    }

    #[test]
    fn portfolio_lock_key_differs_for_different_ids() {
        let a = portfolio_lock_key("portfolio-123");
        let b = portfolio_lock_key("portfolio-456");
        assert_ne!(a, b);
    }

    #[test]
    fn classify_pool_timeout_as_system_failure() {
        assert_eq!(
            classify_db_error(&sqlx::Error::PoolTimedOut),
            DbErrorClass::SystemFailure
        );
    }
}
