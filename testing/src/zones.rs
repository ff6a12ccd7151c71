//! In-memory zone repository.

use crate::bookings::MemoryBookingRepository;
use rushtix_core::repository::{RepoFuture, ZoneReconciliation};
use rushtix_core::{DomainError, Zone, ZoneId, ZoneRepository};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Zones in a map; reconciliation counts read the booking repository
/// when one is attached.
#[derive(Default)]
pub struct MemoryZoneRepository {
    zones: Mutex<HashMap<ZoneId, Zone>>,
    bookings: Option<Arc<MemoryBookingRepository>>,
}

impl MemoryZoneRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the booking repository used for reconciliation counts.
    #[must_use]
    pub fn with_bookings(mut self, bookings: Arc<MemoryBookingRepository>) -> Self {
        self.bookings = Some(bookings);
        self
    }

    /// Insert or replace a zone.
    pub fn put(&self, zone: Zone) {
        if let Ok(mut zones) = self.zones.lock() {
            zones.insert(zone.id, zone);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<ZoneId, Zone>>, DomainError> {
        self.zones
            .lock()
            .map_err(|_| DomainError::Internal("zone store poisoned".to_string()))
    }
}

impl ZoneRepository for MemoryZoneRepository {
    fn get(&self, id: ZoneId) -> RepoFuture<'_, Option<Zone>> {
        Box::pin(async move { Ok(self.lock()?.get(&id).cloned()) })
    }

    fn apply_available_delta(&self, id: ZoneId, delta: i64) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            let mut zones = self.lock()?;
            if let Some(zone) = zones.get_mut(&id) {
                let next = i64::from(zone.available_seats) + delta;
                zone.available_seats = u32::try_from(next.max(0)).unwrap_or(0);
            }
            Ok(())
        })
    }

    fn reconciliation_counts(&self) -> RepoFuture<'_, Vec<ZoneReconciliation>> {
        Box::pin(async move {
            let zones = self.lock()?;
            Ok(zones
                .values()
                .map(|zone| ZoneReconciliation {
                    zone_id: zone.id,
                    event_id: zone.event_id,
                    total_seats: zone.total_seats,
                    confirmed_quantity: self
                        .bookings
                        .as_ref()
                        .map_or(0, |b| b.confirmed_quantity(zone.id)),
                })
                .collect())
        })
    }

    fn set_available(&self, id: ZoneId, available: u32) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            let mut zones = self.lock()?;
            if let Some(zone) = zones.get_mut(&id) {
                zone.available_seats = available;
            }
            Ok(())
        })
    }
}
