//! In-memory booking repository.
//!
//! Mirrors the Postgres repository's contract: status-gated transitions,
//! and exactly one outbox row per committed transition, written into the
//! shared [`MemoryOutboxStore`] under the same lock.

use crate::outbox::MemoryOutboxStore;
use chrono::{DateTime, Utc};
use rushtix_core::booking::BookingSummary;
use rushtix_core::repository::RepoFuture;
use rushtix_core::{
    Booking, BookingEventData, BookingId, BookingRepository, BookingStatus, DomainError,
    DomainEvent, EventId, NewBooking, NewOutboxRow, PaymentId, UserId, ZoneId,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Bookings in a map, transitions gated like the SQL `UPDATE`s.
pub struct MemoryBookingRepository {
    bookings: Mutex<HashMap<BookingId, Booking>>,
    outbox: Arc<MemoryOutboxStore>,
}

impl MemoryBookingRepository {
    /// Create a repository that co-writes outbox rows into `outbox`.
    #[must_use]
    pub fn new(outbox: Arc<MemoryOutboxStore>) -> Self {
        Self {
            bookings: Mutex::new(HashMap::new()),
            outbox,
        }
    }

    /// Snapshot of one booking, for assertions.
    #[must_use]
    pub fn snapshot(&self, id: BookingId) -> Option<Booking> {
        self.bookings.lock().ok()?.get(&id).cloned()
    }

    /// Every booking, for assertions.
    #[must_use]
    pub fn all(&self) -> Vec<Booking> {
        self.bookings
            .lock()
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Confirmed quantity for a zone (reconciliation support).
    #[must_use]
    pub fn confirmed_quantity(&self, zone_id: ZoneId) -> u32 {
        self.all()
            .iter()
            .filter(|b| b.zone_id == zone_id && b.status == BookingStatus::Confirmed)
            .map(|b| b.quantity)
            .sum()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<BookingId, Booking>>, DomainError> {
        self.bookings
            .lock()
            .map_err(|_| DomainError::Internal("booking store poisoned".to_string()))
    }

    fn emit(&self, booking: &Booking, now: DateTime<Utc>) -> Result<(), DomainError> {
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
        let row = NewOutboxRow::from_event(*booking.id.as_uuid(), &event, serde_json::json!({}))?;
        self.outbox.insert(row, now);
        Ok(())
    }

    fn confirmation_code(id: BookingId) -> String {
        let hex: String = id
            .as_uuid()
            .simple()
            .to_string()
            .chars()
            .take(6)
            .collect::<String>()
            .to_uppercase();
        format!("BK-{hex}")
    }
}

impl BookingRepository for MemoryBookingRepository {
    fn create_reserved(
        &self,
        booking: NewBooking,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, Booking> {
        Box::pin(async move {
            let total = booking.total_amount()?;
            let mut bookings = self.lock()?;

            if bookings
                .values()
                .any(|b| b.idempotency_key == booking.idempotency_key)
            {
                return Err(DomainError::Storage(
                    "duplicate idempotency key".to_string(),
                ));
            }

            let created = Booking {
                id: booking.id,
                tenant_id: booking.tenant_id,
                user_id: booking.user_id,
                event_id: booking.event_id,
                show_id: booking.show_id,
                zone_id: booking.zone_id,
                quantity: booking.quantity,
                unit_price: booking.unit_price,
                total_amount: total,
                status: BookingStatus::Reserved,
                idempotency_key: booking.idempotency_key,
                payment_id: None,
                reserved_at: booking.reserved_at,
                reservation_expires_at: booking.reservation_expires_at,
                confirmed_at: None,
                confirmation_code: None,
            };
            bookings.insert(created.id, created.clone());
            drop(bookings);

            self.emit(&created, now)?;
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
            let mut bookings = self.lock()?;
            let booking = bookings
                .get_mut(&id)
                .ok_or(DomainError::BookingNotFound(id))?;

            if !booking.is_owned_by(user_id) {
                return Err(DomainError::Forbidden);
            }
            match booking.status {
                BookingStatus::Reserved => {}
                BookingStatus::Confirmed => return Err(DomainError::AlreadyConfirmed(id)),
                other => {
                    return Err(DomainError::InvalidStatus {
                        from: other,
                        to: BookingStatus::Confirmed,
                    });
                }
            }

            booking.status = BookingStatus::Confirmed;
            booking.payment_id = Some(payment_id);
            booking.confirmed_at = Some(now);
            booking.confirmation_code = Some(Self::confirmation_code(id));
            let confirmed = booking.clone();
            drop(bookings);

            self.emit(&confirmed, now)?;
            Ok(confirmed)
        })
    }

    fn cancel(&self, id: BookingId, now: DateTime<Utc>) -> RepoFuture<'_, Booking> {
        Box::pin(async move { self.transition(id, BookingStatus::Reserved, BookingStatus::Cancelled, now) })
    }

    fn refund(&self, id: BookingId, now: DateTime<Utc>) -> RepoFuture<'_, Booking> {
        Box::pin(async move { self.transition(id, BookingStatus::Confirmed, BookingStatus::Refunded, now) })
    }

    fn expire_batch(&self, now: DateTime<Utc>, limit: u32) -> RepoFuture<'_, Vec<Booking>> {
        Box::pin(async move {
            let mut bookings = self.lock()?;
            let mut due: Vec<BookingId> = bookings
                .values()
                .filter(|b| {
                    b.status == BookingStatus::Reserved && b.reservation_expires_at < now
                })
                .map(|b| b.id)
                .collect();
            due.sort_by_key(|id| bookings.get(id).map(|b| b.reservation_expires_at));
            due.truncate(limit as usize);

            let mut expired = Vec::with_capacity(due.len());
            for id in due {
                if let Some(booking) = bookings.get_mut(&id) {
                    booking.status = BookingStatus::Expired;
                    expired.push(booking.clone());
                }
            }
            drop(bookings);

            for booking in &expired {
                self.emit(booking, now)?;
            }
            Ok(expired)
        })
    }

    fn get(&self, id: BookingId) -> RepoFuture<'_, Option<Booking>> {
        Box::pin(async move { Ok(self.lock()?.get(&id).cloned()) })
    }

    fn find_by_idempotency_key(&self, key: &str) -> RepoFuture<'_, Option<Booking>> {
        let key = key.to_string();
        Box::pin(async move {
            Ok(self
                .lock()?
                .values()
                .find(|b| b.idempotency_key == key)
                .cloned())
        })
    }

    fn summary(
        &self,
        user_id: UserId,
        event_id: EventId,
        max_allowed: u32,
    ) -> RepoFuture<'_, BookingSummary> {
        Box::pin(async move {
            let booked_count: u32 = self
                .lock()?
                .values()
                .filter(|b| {
                    b.user_id == user_id && b.event_id == event_id && b.status.holds_seats()
                })
                .map(|b| b.quantity)
                .sum();

            Ok(BookingSummary {
                booked_count,
                max_allowed,
                remaining_slots: max_allowed.saturating_sub(booked_count),
            })
        })
    }
}

impl MemoryBookingRepository {
    fn transition(
        &self,
        id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<Booking, DomainError> {
        let mut bookings = self.lock()?;
        let booking = bookings
            .get_mut(&id)
            .ok_or(DomainError::BookingNotFound(id))?;

        if booking.status != from {
            return Err(DomainError::InvalidStatus {
                from: booking.status,
                to,
            });
        }

        booking.status = to;
        let updated = booking.clone();
        drop(bookings);

        self.emit(&updated, now)?;
        Ok(updated)
    }
}
