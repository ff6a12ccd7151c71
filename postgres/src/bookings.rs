//! Booking repository.
//!
//! Every transition is one transaction holding the booking row lock:
//! the status-gated `UPDATE`, exactly one outbox row of the matching
//! event type, and an audit-log entry. Nothing in the platform publishes
//! booking events any other way.

use crate::{is_unique_violation, storage_error};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use rand::Rng;
use rushtix_core::booking::BookingSummary;
use rushtix_core::repository::RepoFuture;
use rushtix_core::{
    Booking, BookingEventData, BookingId, BookingRepository, BookingStatus, DomainError,
    DomainEvent, EventId, NewBooking, NewOutboxRow, PaymentId, UserId,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

/// Attempts at minting a unique confirmation code before giving up.
const CONFIRMATION_CODE_ATTEMPTS: usize = 5;

/// PostgreSQL-backed [`BookingRepository`].
#[derive(Clone)]
pub struct PostgresBookingRepository {
    pool: PgPool,
}

impl PostgresBookingRepository {
    /// Create the repository over a shared pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Generate a confirmation code from the booking id, the clock and a
    /// random salt: `BK-` + 6 uppercase hex chars.
    fn confirmation_code(id: BookingId, now: DateTime<Utc>) -> String {
        let salt: u64 = rand::thread_rng().r#gen();
        let mut hasher = Md5::new();
        hasher.update(id.to_string().as_bytes());
        hasher.update(now.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
        hasher.update(salt.to_be_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(3).map(|b| format!("{b:02X}")).collect();
        format!("BK-{hex}")
    }

    fn row_to_booking(row: &PgRow) -> Result<Booking, DomainError> {
        let status: String = row.get("status");
        #[allow(clippy::cast_sign_loss)]
        Ok(Booking {
            id: BookingId::from_uuid(row.get("id")),
            tenant_id: rushtix_core::TenantId::from_uuid(row.get("tenant_id")),
            user_id: UserId::from_uuid(row.get("user_id")),
            event_id: EventId::from_uuid(row.get("event_id")),
            show_id: rushtix_core::ShowId::from_uuid(row.get("show_id")),
            zone_id: rushtix_core::ZoneId::from_uuid(row.get("zone_id")),
            quantity: row.get::<i32, _>("quantity") as u32,
            unit_price: rushtix_core::Money::from_cents(
                row.get::<i64, _>("unit_price_cents") as u64,
            ),
            total_amount: rushtix_core::Money::from_cents(
                row.get::<i64, _>("total_amount_cents") as u64,
            ),
            status: BookingStatus::parse(&status)?,
            idempotency_key: row.get("idempotency_key"),
            payment_id: row
                .get::<Option<uuid::Uuid>, _>("payment_id")
                .map(PaymentId::from_uuid),
            reserved_at: row.get("reserved_at"),
            reservation_expires_at: row.get("reservation_expires_at"),
            confirmed_at: row.get("confirmed_at"),
            confirmation_code: row.get("confirmation_code"),
        })
    }

    async fn fetch_for_update(
        tx: &mut Transaction<'_, Postgres>,
        id: BookingId,
    ) -> Result<Booking, DomainError> {
        let row = sqlx::query("SELECT * FROM bookings WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| storage_error("failed to lock booking", &e))?
            .ok_or(DomainError::BookingNotFound(id))?;
        Self::row_to_booking(&row)
    }

    async fn insert_outbox(
        tx: &mut Transaction<'_, Postgres>,
        row: &NewOutboxRow,
    ) -> Result<(), DomainError> {
        sqlx::query(
            r"
            INSERT INTO outbox (aggregate_id, event_type, payload, headers)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(row.aggregate_id)
        .bind(&row.event_type)
        .bind(&row.payload)
        .bind(&row.headers)
        .execute(&mut **tx)
        .await
        .map_err(|e| storage_error("failed to insert outbox row", &e))?;
        Ok(())
    }

    async fn insert_audit(
        tx: &mut Transaction<'_, Postgres>,
        actor: &str,
        action: &str,
        entity_id: &str,
        detail: serde_json::Value,
    ) -> Result<(), DomainError> {
        sqlx::query(
            r"
            INSERT INTO audit_logs (actor, action, entity, entity_id, detail)
            VALUES ($1, $2, 'booking', $3, $4)
            ",
        )
        .bind(actor)
        .bind(action)
        .bind(entity_id)
        .bind(detail)
        .execute(&mut **tx)
        .await
        .map_err(|e| storage_error("failed to insert audit row", &e))?;
        Ok(())
    }

    /// Build the outbox row announcing `booking` entering its current
    /// status.
    fn transition_outbox(booking: &Booking, now: DateTime<Utc>) -> Result<NewOutboxRow, DomainError> {
        let data = BookingEventData {
            booking_id: booking.id,
            user_id: booking.user_id,
            event_id: booking.event_id,
            zone_id: booking.zone_id,
            quantity: booking.quantity,
            total_amount: booking.total_amount,
            status: booking.status.as_str().to_string(),
        };
        let event = DomainEvent::new(booking.status.event_type(), now, &data)?;
        Ok(NewOutboxRow::from_event(
            *booking.id.as_uuid(),
            &event,
            serde_json::json!({}),
        )?)
    }

    /// Shared body for cancel/refund: a gated transition out of `from`
    /// into `to` plus the matching outbox and audit rows.
    async fn gated_transition(
        &self,
        id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Booking, DomainError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_error("failed to begin transaction", &e))?;

        let current = Self::fetch_for_update(&mut tx, id).await?;
        if current.status != from {
            return Err(match (current.status, to) {
                (BookingStatus::Confirmed, BookingStatus::Confirmed) => {
                    DomainError::AlreadyConfirmed(id)
                }
                (s, t) => DomainError::InvalidStatus { from: s, to: t },
            });
        }

        let row = sqlx::query(
            r"
            UPDATE bookings
            SET status = $2
            WHERE id = $1 AND status = $3
            RETURNING *
            ",
        )
        .bind(id.as_uuid())
        .bind(to.as_str())
        .bind(from.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| storage_error("failed to transition booking", &e))?;
        let booking = Self::row_to_booking(&row)?;

        Self::insert_outbox(&mut tx, &Self::transition_outbox(&booking, now)?).await?;
        Self::insert_audit(
            &mut tx,
            actor,
            to.event_type().as_str(),
            &id.to_string(),
            serde_json::json!({"from": from.as_str(), "to": to.as_str()}),
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| storage_error("failed to commit transition", &e))?;

        metrics::counter!("booking.transition", "to" => to.as_str()).increment(1);
        Ok(booking)
    }
}

impl BookingRepository for PostgresBookingRepository {
    fn create_reserved(
        &self,
        booking: NewBooking,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, Booking> {
        Box::pin(async move {
            let total = booking.total_amount()?;
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| storage_error("failed to begin transaction", &e))?;

            let row = sqlx::query(
                r"
                INSERT INTO bookings (
                    id, tenant_id, user_id, event_id, show_id, zone_id,
                    quantity, unit_price_cents, total_amount_cents, status,
                    idempotency_key, reserved_at, reservation_expires_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'RESERVED', $10, $11, $12)
                RETURNING *
                ",
            )
            .bind(booking.id.as_uuid())
            .bind(booking.tenant_id.as_uuid())
            .bind(booking.user_id.as_uuid())
            .bind(booking.event_id.as_uuid())
            .bind(booking.show_id.as_uuid())
            .bind(booking.zone_id.as_uuid())
            .bind(i32::try_from(booking.quantity).unwrap_or(i32::MAX))
            .bind(i64::try_from(booking.unit_price.cents()).unwrap_or(i64::MAX))
            .bind(i64::try_from(total.cents()).unwrap_or(i64::MAX))
            .bind(&booking.idempotency_key)
            .bind(booking.reserved_at)
            .bind(booking.reservation_expires_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| storage_error("failed to insert booking", &e))?;
            let created = Self::row_to_booking(&row)?;

            Self::insert_outbox(&mut tx, &Self::transition_outbox(&created, now)?).await?;
            Self::insert_audit(
                &mut tx,
                &created.user_id.to_string(),
                "booking.created",
                &created.id.to_string(),
                serde_json::json!({"quantity": created.quantity, "zone_id": created.zone_id}),
            )
            .await?;

            tx.commit()
                .await
                .map_err(|e| storage_error("failed to commit booking insert", &e))?;

            metrics::counter!("booking.created").increment(1);
            tracing::debug!(booking_id = %created.id, "booking persisted as RESERVED");
            Ok(created)
        })
    }

    fn confirm(
        &self,
        id: BookingId,
        user_id: UserId,
        payment_id: PaymentId,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, Booking> {
        Box::pin(async move {
            // A duplicate confirmation code aborts the transaction, so
            // the whole attempt restarts with a fresh salt.
            for attempt in 0..CONFIRMATION_CODE_ATTEMPTS {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| storage_error("failed to begin transaction", &e))?;

                let current = Self::fetch_for_update(&mut tx, id).await?;
                if !current.is_owned_by(user_id) {
                    return Err(DomainError::Forbidden);
                }
                match current.status {
                    BookingStatus::Reserved => {}
                    BookingStatus::Confirmed => return Err(DomainError::AlreadyConfirmed(id)),
                    other => {
                        return Err(DomainError::InvalidStatus {
                            from: other,
                            to: BookingStatus::Confirmed,
                        });
                    }
                }

                let code = Self::confirmation_code(id, now);
                let result = sqlx::query(
                    r"
                    UPDATE bookings
                    SET status = 'CONFIRMED',
                        confirmed_at = $2,
                        payment_id = $3,
                        confirmation_code = $4
                    WHERE id = $1 AND status = 'RESERVED'
                    RETURNING *
                    ",
                )
                .bind(id.as_uuid())
                .bind(now)
                .bind(payment_id.as_uuid())
                .bind(&code)
                .fetch_one(&mut *tx)
                .await;

                let row = match result {
                    Ok(row) => row,
                    Err(e) if is_unique_violation(&e) => {
                        tracing::warn!(booking_id = %id, attempt, "confirmation code collision");
                        drop(tx);
                        continue;
                    }
                    Err(e) => return Err(storage_error("failed to confirm booking", &e)),
                };
                let booking = Self::row_to_booking(&row)?;

                Self::insert_outbox(&mut tx, &Self::transition_outbox(&booking, now)?).await?;
                Self::insert_audit(
                    &mut tx,
                    &user_id.to_string(),
                    "booking.confirmed",
                    &id.to_string(),
                    serde_json::json!({"payment_id": payment_id, "confirmation_code": code}),
                )
                .await?;

                tx.commit()
                    .await
                    .map_err(|e| storage_error("failed to commit confirmation", &e))?;

                metrics::counter!("booking.confirmed").increment(1);
                return Ok(booking);
            }

            Err(DomainError::Internal(format!(
                "could not mint a unique confirmation code for booking {id}"
            )))
        })
    }

    fn cancel(&self, id: BookingId, now: DateTime<Utc>) -> RepoFuture<'_, Booking> {
        Box::pin(async move {
            self.gated_transition(
                id,
                BookingStatus::Reserved,
                BookingStatus::Cancelled,
                "system",
                now,
            )
            .await
        })
    }

    fn refund(&self, id: BookingId, now: DateTime<Utc>) -> RepoFuture<'_, Booking> {
        Box::pin(async move {
            self.gated_transition(
                id,
                BookingStatus::Confirmed,
                BookingStatus::Refunded,
                "system",
                now,
            )
            .await
        })
    }

    fn expire_batch(&self, now: DateTime<Utc>, limit: u32) -> RepoFuture<'_, Vec<Booking>> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| storage_error("failed to begin transaction", &e))?;

            // SKIP LOCKED keeps concurrent sweeper replicas from fighting
            // over the same rows.
            let rows = sqlx::query(
                r"
                SELECT * FROM bookings
                WHERE status = 'RESERVED' AND reservation_expires_at < $1
                ORDER BY reservation_expires_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
                ",
            )
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| storage_error("failed to claim expired bookings", &e))?;

            let mut expired = Vec::with_capacity(rows.len());
            for row in &rows {
                let booking = Self::row_to_booking(row)?;

                sqlx::query(
                    "UPDATE bookings SET status = 'EXPIRED' WHERE id = $1 AND status = 'RESERVED'",
                )
                .bind(booking.id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| storage_error("failed to expire booking", &e))?;

                let mut updated = booking;
                updated.status = BookingStatus::Expired;

                Self::insert_outbox(&mut tx, &Self::transition_outbox(&updated, now)?).await?;
                Self::insert_audit(
                    &mut tx,
                    "expiry-sweeper",
                    "booking.expired",
                    &updated.id.to_string(),
                    serde_json::json!({"expired_at": now}),
                )
                .await?;

                expired.push(updated);
            }

            tx.commit()
                .await
                .map_err(|e| storage_error("failed to commit expiry batch", &e))?;

            if !expired.is_empty() {
                metrics::counter!("booking.expired").increment(expired.len() as u64);
                tracing::info!(count = expired.len(), "expired stale reservations");
            }
            Ok(expired)
        })
    }

    fn get(&self, id: BookingId) -> RepoFuture<'_, Option<Booking>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM bookings WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| storage_error("failed to fetch booking", &e))?;
            row.as_ref().map(Self::row_to_booking).transpose()
        })
    }

    fn find_by_idempotency_key(&self, key: &str) -> RepoFuture<'_, Option<Booking>> {
        let key = key.to_string();
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM bookings WHERE idempotency_key = $1")
                .bind(&key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| storage_error("failed to fetch booking by idempotency key", &e))?;
            row.as_ref().map(Self::row_to_booking).transpose()
        })
    }

    fn summary(
        &self,
        user_id: UserId,
        event_id: EventId,
        max_allowed: u32,
    ) -> RepoFuture<'_, BookingSummary> {
        Box::pin(async move {
            let (booked,): (i64,) = sqlx::query_as(
                r"
                SELECT COALESCE(SUM(quantity), 0)
                FROM bookings
                WHERE user_id = $1 AND event_id = $2 AND status IN ('RESERVED', 'CONFIRMED')
                ",
            )
            .bind(user_id.as_uuid())
            .bind(event_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| storage_error("failed to compute booking summary", &e))?;

            let booked_count = u32::try_from(booked).unwrap_or(u32::MAX);
            Ok(BookingSummary {
                booked_count,
                max_allowed,
                remaining_slots: max_allowed.saturating_sub(booked_count),
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_code_shape() {
        let code = PostgresBookingRepository::confirmation_code(BookingId::mint(), Utc::now());
        assert!(code.starts_with("BK-"));
        assert_eq!(code.len(), 9);
        assert!(
            code[3..]
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase())
        );
    }

    #[test]
    fn confirmation_codes_vary_per_call() {
        let id = BookingId::mint();
        let now = Utc::now();
        // Same id and timestamp: the salt must still vary the code.
        let a = PostgresBookingRepository::confirmation_code(id, now);
        let b = PostgresBookingRepository::confirmation_code(id, now);
        assert_ne!(a, b);
    }
}
