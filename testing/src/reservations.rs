//! In-memory reservation store.
//!
//! One lock over the whole inventory state stands in for Redis'
//! single-threaded command loop: every operation sees and mutates a
//! consistent snapshot, so the no-overselling and user-cap invariants
//! hold under any interleaving.

use chrono::{DateTime, Utc};
use rushtix_core::repository::RepoFuture;
use rushtix_core::reservation::{ReservationOutcome, ReservationStore, ReserveRequest};
use rushtix_core::{BookingId, DomainError, EventId, PaymentId, UserId, ZoneId};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Clone, Debug)]
struct Hold {
    user_id: UserId,
    event_id: EventId,
    zone_id: ZoneId,
    quantity: u32,
    confirmed: bool,
}

#[derive(Default)]
struct Inner {
    availability: HashMap<(EventId, ZoneId), i64>,
    sold: HashMap<(EventId, ZoneId), i64>,
    holds: HashMap<BookingId, Hold>,
}

/// In-memory twin of the Lua reservation engine.
#[derive(Default)]
pub struct MemoryReservationStore {
    inner: Mutex<Inner>,
}

impl MemoryReservationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seats sold for a zone, for assertions.
    #[must_use]
    pub fn sold(&self, event_id: EventId, zone_id: ZoneId) -> i64 {
        self.inner
            .lock()
            .map(|i| i.sold.get(&(event_id, zone_id)).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, DomainError> {
        self.inner
            .lock()
            .map_err(|_| DomainError::Internal("reservation store poisoned".to_string()))
    }
}

impl ReservationStore for MemoryReservationStore {
    fn reserve(
        &self,
        request: &ReserveRequest,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, ReservationOutcome> {
        let request = request.clone();
        Box::pin(async move {
            let mut inner = self.lock()?;

            let key = (request.event_id, request.zone_id);
            let available = inner.availability.get(&key).copied().unwrap_or(0);
            if available < i64::from(request.quantity) {
                return Err(DomainError::InsufficientSeats);
            }

            let held: u32 = inner
                .holds
                .values()
                .filter(|h| h.event_id == request.event_id && h.user_id == request.user_id)
                .map(|h| h.quantity)
                .sum();
            if held + request.quantity > request.max_per_user {
                return Err(DomainError::MaxTicketsExceeded {
                    user_id: request.user_id,
                    event_id: request.event_id,
                    max_allowed: request.max_per_user,
                });
            }

            *inner.availability.entry(key).or_insert(0) -= i64::from(request.quantity);
            inner.holds.insert(
                request.booking_id,
                Hold {
                    user_id: request.user_id,
                    event_id: request.event_id,
                    zone_id: request.zone_id,
                    quantity: request.quantity,
                    confirmed: false,
                },
            );

            Ok(ReservationOutcome {
                booking_id: request.booking_id,
                expires_at: now + chrono::Duration::from_std(request.ttl).unwrap_or_default(),
            })
        })
    }

    fn confirm(
        &self,
        event_id: EventId,
        zone_id: ZoneId,
        booking_id: BookingId,
        user_id: UserId,
        _payment_id: PaymentId,
    ) -> RepoFuture<'_, u32> {
        Box::pin(async move {
            let mut inner = self.lock()?;

            let hold = inner
                .holds
                .get_mut(&booking_id)
                .ok_or(DomainError::ReservationNotFound(booking_id))?;
            if hold.user_id != user_id {
                return Err(DomainError::InvalidUserId);
            }
            if hold.confirmed {
                return Err(DomainError::AlreadyConfirmed(booking_id));
            }

            hold.confirmed = true;
            let quantity = hold.quantity;
            *inner.sold.entry((event_id, zone_id)).or_insert(0) += i64::from(quantity);
            Ok(quantity)
        })
    }

    fn release(
        &self,
        event_id: EventId,
        zone_id: ZoneId,
        booking_id: BookingId,
        user_id: UserId,
    ) -> RepoFuture<'_, u32> {
        Box::pin(async move {
            let mut inner = self.lock()?;

            let Some(hold) = inner.holds.get(&booking_id).cloned() else {
                return Err(DomainError::AlreadyReleased(booking_id));
            };
            if hold.user_id != user_id {
                return Err(DomainError::InvalidUserId);
            }

            inner.holds.remove(&booking_id);
            *inner.availability.entry((event_id, zone_id)).or_insert(0) +=
                i64::from(hold.quantity);
            if hold.confirmed {
                *inner.sold.entry((event_id, zone_id)).or_insert(0) -= i64::from(hold.quantity);
            }
            Ok(hold.quantity)
        })
    }

    fn set_availability(
        &self,
        event_id: EventId,
        zone_id: ZoneId,
        available: u32,
    ) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.lock()?;
            inner
                .availability
                .insert((event_id, zone_id), i64::from(available));
            Ok(())
        })
    }

    fn availability(
        &self,
        event_id: EventId,
        zone_id: ZoneId,
    ) -> RepoFuture<'_, Option<i64>> {
        Box::pin(async move {
            let inner = self.lock()?;
            Ok(inner.availability.get(&(event_id, zone_id)).copied())
        })
    }
}
