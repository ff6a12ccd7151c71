//! Outbox store: the relay's claim/mark/cleanup surface.
//!
//! Rows are inserted by booking transactions; this side hands them to the
//! relay. Claiming moves `next_retry_at` forward as a lease so a relay
//! replica that crashes between publish and mark re-delivers after the
//! lease instead of losing the row: at-least-once, never at-most-once.

use crate::storage_error;
use chrono::{DateTime, Utc};
use rushtix_core::repository::RepoFuture;
use rushtix_core::{DomainError, OutboxRow, OutboxStore};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;

/// PostgreSQL-backed [`OutboxStore`].
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Create the store over a shared pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_outbox(row: &PgRow) -> OutboxRow {
        OutboxRow {
            id: row.get("id"),
            aggregate_id: row.get("aggregate_id"),
            event_type: row.get("event_type"),
            payload: row.get("payload"),
            headers: row.get("headers"),
            created_at: row.get("created_at"),
            sent_at: row.get("sent_at"),
            attempts: row.get("attempts"),
            next_retry_at: row.get("next_retry_at"),
            last_error: row.get("last_error"),
        }
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn claim_batch(
        &self,
        batch_size: u32,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, Vec<OutboxRow>> {
        Box::pin(async move {
            let lease_until = now + chrono::Duration::from_std(lease).unwrap_or_default();

            // The inner select is the poll; SKIP LOCKED lets replicas
            // share the backlog without double-claiming a row mid-tick.
            let rows = sqlx::query(
                r"
                UPDATE outbox
                SET next_retry_at = $3
                WHERE id IN (
                    SELECT id FROM outbox
                    WHERE sent_at IS NULL
                      AND (next_retry_at IS NULL OR next_retry_at < $1)
                    ORDER BY created_at
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING *
                ",
            )
            .bind(now)
            .bind(i64::from(batch_size))
            .bind(lease_until)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error("failed to claim outbox batch", &e))?;

            let mut claimed: Vec<OutboxRow> = rows.iter().map(Self::row_to_outbox).collect();
            // RETURNING does not preserve the inner ORDER BY.
            claimed.sort_by_key(|r| (r.created_at, r.id));
            Ok(claimed)
        })
    }

    fn mark_sent(&self, id: i64, now: DateTime<Utc>) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("UPDATE outbox SET sent_at = $2 WHERE id = $1")
                .bind(id)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(|e| storage_error("failed to mark outbox row sent", &e))?;
            Ok(())
        })
    }

    fn mark_failed(
        &self,
        id: i64,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> RepoFuture<'_, ()> {
        let error = error.to_string();
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE outbox
                SET attempts = attempts + 1,
                    last_error = $2,
                    next_retry_at = $3
                WHERE id = $1
                ",
            )
            .bind(id)
            .bind(&error)
            .bind(next_retry_at)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("failed to mark outbox row failed", &e))?;
            Ok(())
        })
    }

    fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> RepoFuture<'_, u64> {
        Box::pin(async move {
            let result =
                sqlx::query("DELETE FROM outbox WHERE sent_at IS NOT NULL AND sent_at < $1")
                    .bind(cutoff)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| storage_error("failed to clean up outbox", &e))?;

            let removed = result.rows_affected();
            if removed > 0 {
                tracing::info!(removed, "outbox retention cleanup");
            }
            Ok(removed)
        })
    }

    fn pending_count(&self) -> RepoFuture<'_, i64> {
        Box::pin(async move {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE sent_at IS NULL")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| storage_error("failed to count pending outbox rows", &e))?;
            Ok(count)
        })
    }
}
