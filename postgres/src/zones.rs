//! Seat-zone projection repository.
//!
//! `seat_zones.available_seats` is the eventually consistent read-side
//! copy of the Redis counter, kept fresh by the inventory-sync worker.

use crate::storage_error;
use rushtix_core::repository::{RepoFuture, ZoneReconciliation};
use rushtix_core::{DomainError, Money, Zone, ZoneId, ZoneRepository};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// PostgreSQL-backed [`ZoneRepository`].
#[derive(Clone)]
pub struct PostgresZoneRepository {
    pool: PgPool,
}

impl PostgresZoneRepository {
    /// Create the repository over a shared pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_zone(row: &PgRow) -> Zone {
        #[allow(clippy::cast_sign_loss)]
        Zone {
            id: ZoneId::from_uuid(row.get("id")),
            show_id: rushtix_core::ShowId::from_uuid(row.get("show_id")),
            event_id: rushtix_core::EventId::from_uuid(row.get("event_id")),
            total_seats: row.get::<i32, _>("total_seats") as u32,
            available_seats: row.get::<i32, _>("available_seats") as u32,
            price: Money::from_cents(row.get::<i64, _>("price_cents") as u64),
            min_per_order: row.get::<i32, _>("min_per_order") as u32,
            max_per_order: row.get::<i32, _>("max_per_order") as u32,
        }
    }
}

impl ZoneRepository for PostgresZoneRepository {
    fn get(&self, id: ZoneId) -> RepoFuture<'_, Option<Zone>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM seat_zones WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| storage_error("failed to fetch zone", &e))?;
            Ok(row.as_ref().map(Self::row_to_zone))
        })
    }

    fn apply_available_delta(&self, id: ZoneId, delta: i64) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            // GREATEST clamps the projection at zero; the Redis counter is
            // authoritative and reconciliation repairs any drift.
            sqlx::query(
                r"
                UPDATE seat_zones
                SET available_seats = GREATEST(0, available_seats + $2)
                WHERE id = $1
                ",
            )
            .bind(id.as_uuid())
            .bind(delta)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("failed to apply zone delta", &e))?;
            Ok(())
        })
    }

    fn reconciliation_counts(&self) -> RepoFuture<'_, Vec<ZoneReconciliation>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT z.id, z.event_id, z.total_seats,
                       COALESCE(SUM(b.quantity) FILTER (WHERE b.status = 'CONFIRMED'), 0)
                           AS confirmed_quantity
                FROM seat_zones z
                LEFT JOIN bookings b ON b.zone_id = z.id
                GROUP BY z.id, z.event_id, z.total_seats
                ",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error("failed to compute reconciliation counts", &e))?;

            Ok(rows
                .iter()
                .map(|row| {
                    #[allow(clippy::cast_sign_loss)]
                    ZoneReconciliation {
                        zone_id: ZoneId::from_uuid(row.get("id")),
                        event_id: rushtix_core::EventId::from_uuid(row.get("event_id")),
                        total_seats: row.get::<i32, _>("total_seats") as u32,
                        confirmed_quantity: u32::try_from(row.get::<i64, _>("confirmed_quantity"))
                            .unwrap_or(u32::MAX),
                    }
                })
                .collect())
        })
    }

    fn set_available(&self, id: ZoneId, available: u32) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("UPDATE seat_zones SET available_seats = $2 WHERE id = $1")
                .bind(id.as_uuid())
                .bind(i32::try_from(available).unwrap_or(i32::MAX))
                .execute(&self.pool)
                .await
                .map_err(|e| storage_error("failed to set zone availability", &e))?;
            Ok(())
        })
    }
}
