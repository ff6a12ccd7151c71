//! Redis key builders.
//!
//! Keys touched by the same reservation are hash-tagged with the event id
//! so Redis Cluster routes them to one slot and the Lua scripts stay
//! single-shard. Sharding is therefore by event: one hot on-sale event
//! serializes on one instance, different events spread out.

use rushtix_core::{BookingId, EventId, UserId, ZoneId};

/// Runtime seat availability counter for a zone.
#[must_use]
pub fn availability(event_id: EventId, zone_id: ZoneId) -> String {
    format!("{{{event_id}}}:zone:availability:{zone_id}")
}

/// Seats sold counter for a zone.
#[must_use]
pub fn sold(event_id: EventId, zone_id: ZoneId) -> String {
    format!("{{{event_id}}}:zone:sold:{zone_id}")
}

/// Ephemeral reservation hash.
#[must_use]
pub fn booking(event_id: EventId, booking_id: BookingId) -> String {
    format!("{{{event_id}}}:booking:{booking_id}")
}

/// Per-user booking quantities for an event (field = booking id,
/// value = quantity). Backs the per-event ticket cap.
#[must_use]
pub fn user_bookings(event_id: EventId, user_id: UserId) -> String {
    format!("{{{event_id}}}:user:bookings:{user_id}")
}

/// Waiting-room sorted set, scored by join time.
#[must_use]
pub fn queue(event_id: EventId) -> String {
    format!("{{{event_id}}}:queue")
}

/// Single-use queue pass for a user.
#[must_use]
pub fn queue_pass(event_id: EventId, user_id: UserId) -> String {
    format!("{{{event_id}}}:queuepass:{user_id}")
}

/// Active-pass sorted set, scored by pass expiry (ms).
#[must_use]
pub fn queue_pass_active(event_id: EventId) -> String {
    format!("{{{event_id}}}:queuepass:active")
}

/// Idempotency record for a client-supplied key.
#[must_use]
pub fn idempotency(key: &str) -> String {
    format!("idempotency:{key}")
}

/// Token bucket for a client/rule pair.
#[must_use]
pub fn rate_limit(client: &str, rule: &str) -> String {
    format!("ratelimit:{rule}:{client}")
}
