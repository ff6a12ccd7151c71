//! Booking endpoints.
//!
//! The reserve path is the flash-sale hot path: verify the queue pass,
//! decrement inventory atomically in Redis, then persist the booking row
//! (RESERVED + its `booking.created` outbox row, one transaction). The
//! response is 202: confirmation arrives asynchronously once payment
//! settles.

use crate::auth::AuthedUser;
use crate::error::ApiError;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use rushtix_core::reservation::ReserveRequest;
use rushtix_core::{
    Booking, BookingId, DomainError, ErrorCode, EventId, Money, NewBooking, PaymentId, UserClaims,
    ZoneId,
};
use serde::{Deserialize, Serialize};

/// Header carrying the queue token.
pub const QUEUE_PASS_HEADER: &str = "X-Queue-Pass";

/// Request body for `POST /api/v1/bookings`.
#[derive(Debug, Deserialize)]
pub struct ReserveBody {
    /// Event being booked
    pub event_id: EventId,
    /// Zone within the event
    pub zone_id: ZoneId,
    /// Seats requested
    pub quantity: u32,
}

/// Response for a successful reservation.
#[derive(Debug, Serialize)]
pub struct ReserveResponse {
    /// The new booking
    pub booking_id: BookingId,
    /// Always `"reserved"`
    pub status: &'static str,
    /// When the hold lapses unless confirmed
    pub expires_at: DateTime<Utc>,
    /// Order total in cents
    pub total_price: Money,
}

/// `POST /api/v1/bookings`
///
/// Requires `X-Idempotency-Key` (enforced by the route's middleware) and
/// an active queue pass in `X-Queue-Pass`.
///
/// # Errors
///
/// 403 without an active pass, 404 for an unknown zone, 400 for a
/// quantity outside the zone's bounds, 409 `INSUFFICIENT_SEATS` /
/// `MAX_TICKETS_EXCEEDED` when the hold cannot be taken.
pub async fn reserve(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    headers: HeaderMap,
    Json(body): Json<ReserveBody>,
) -> Result<(StatusCode, Json<ReserveResponse>), ApiError> {
    consume_queue_pass(&state, &headers, body.event_id, &claims).await?;

    let zone = state
        .zones
        .get(body.zone_id)
        .await?
        .ok_or_else(|| ApiError::new(ErrorCode::EventNotFound, "unknown zone"))?;
    if zone.event_id != body.event_id {
        return Err(ApiError::bad_request("zone does not belong to this event"));
    }
    if body.quantity == 0 || !zone.quantity_in_bounds(body.quantity) {
        return Err(ApiError::new(
            ErrorCode::InvalidQuantity,
            format!(
                "quantity must be between {} and {}",
                zone.min_per_order, zone.max_per_order
            ),
        ));
    }

    let now = state.clock.now();
    let booking_id = BookingId::mint();
    let outcome = state
        .reservations
        .reserve(
            &ReserveRequest {
                booking_id,
                user_id: claims.user_id,
                event_id: body.event_id,
                zone_id: body.zone_id,
                quantity: body.quantity,
                max_per_user: state.settings.max_tickets_per_user,
                ttl: state.settings.reservation_ttl,
                unit_price: zone.price,
            },
            now,
        )
        .await?;

    let new_booking = NewBooking {
        id: booking_id,
        tenant_id: state.settings.tenant_id,
        user_id: claims.user_id,
        event_id: body.event_id,
        show_id: zone.show_id,
        zone_id: body.zone_id,
        quantity: body.quantity,
        unit_price: zone.price,
        idempotency_key: idempotency_key(&headers),
        reserved_at: now,
        reservation_expires_at: outcome.expires_at,
    };

    let booking = match state.bookings.create_reserved(new_booking, now).await {
        Ok(booking) => booking,
        Err(e) => {
            // The seats are held in Redis but the row never landed; give
            // them back before surfacing the failure.
            if let Err(release_err) = state
                .reservations
                .release(body.event_id, body.zone_id, booking_id, claims.user_id)
                .await
            {
                tracing::error!(
                    booking_id = %booking_id,
                    error = %release_err,
                    "failed to roll back reservation after persist failure"
                );
            }
            return Err(e.into());
        }
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(ReserveResponse {
            booking_id: booking.id,
            status: "reserved",
            expires_at: booking.reservation_expires_at,
            total_price: booking.total_amount,
        }),
    ))
}

/// Request body for `POST /api/v1/bookings/{id}/confirm`.
#[derive(Debug, Deserialize)]
pub struct ConfirmBody {
    /// Payment that settles this booking
    pub payment_id: PaymentId,
}

/// Response for a confirmation.
#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    /// The booking
    pub booking_id: BookingId,
    /// Always `"confirmed"`
    pub status: &'static str,
    /// The `BK-XXXXXX` confirmation code
    pub confirmation_code: String,
    /// When the confirmation committed
    pub confirmed_at: DateTime<Utc>,
}

/// `POST /api/v1/bookings/{id}/confirm`
///
/// # Errors
///
/// 404 unknown booking, 403 not the owner, 409 `ALREADY_CONFIRMED`,
/// 422 `INVALID_BOOKING_STATUS` outside RESERVED.
pub async fn confirm(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Path(id): Path<BookingId>,
    Json(body): Json<ConfirmBody>,
) -> Result<Json<ConfirmResponse>, ApiError> {
    let booking = fetch_owned(&state, id, &claims).await?;

    // Redis first (drops the TTL), then the durable transition; both are
    // idempotent so a crash in between is repaired by a retry.
    match state
        .reservations
        .confirm(
            booking.event_id,
            booking.zone_id,
            booking.id,
            booking.user_id,
            body.payment_id,
        )
        .await
    {
        Ok(_) | Err(DomainError::AlreadyConfirmed(_)) => {}
        Err(e) => return Err(e.into()),
    }

    let now = state.clock.now();
    let confirmed = state
        .bookings
        .confirm(booking.id, claims.user_id, body.payment_id, now)
        .await?;

    Ok(Json(ConfirmResponse {
        booking_id: confirmed.id,
        status: "confirmed",
        confirmation_code: confirmed.confirmation_code.unwrap_or_default(),
        confirmed_at: confirmed.confirmed_at.unwrap_or(now),
    }))
}

/// Response for a release.
#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    /// The booking
    pub booking_id: BookingId,
    /// Always `"released"`
    pub status: &'static str,
}

/// `POST /api/v1/bookings/{id}/release`
///
/// # Errors
///
/// 404 unknown booking, 403 not the owner, 409 `ALREADY_RELEASED`.
pub async fn release(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Path(id): Path<BookingId>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let booking = fetch_owned(&state, id, &claims).await?;

    state
        .reservations
        .release(booking.event_id, booking.zone_id, booking.id, booking.user_id)
        .await?;

    let now = state.clock.now();
    match state.bookings.cancel(booking.id, now).await {
        Ok(_) | Err(DomainError::InvalidStatus { .. }) => {}
        Err(e) => return Err(e.into()),
    }

    Ok(Json(ReleaseResponse {
        booking_id: booking.id,
        status: "released",
    }))
}

/// `GET /api/v1/bookings/{id}`
///
/// # Errors
///
/// 404 unknown booking, 403 not the owner.
pub async fn get_booking(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Path(id): Path<BookingId>,
) -> Result<Json<Booking>, ApiError> {
    let booking = fetch_owned(&state, id, &claims).await?;
    Ok(Json(booking))
}

/// Query for `GET /api/v1/bookings/summary`.
#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    /// Event to summarize for
    pub event_id: EventId,
}

/// `GET /api/v1/bookings/summary?event_id=X`
///
/// # Errors
///
/// 503 if storage is unreachable.
pub async fn summary(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<rushtix_core::BookingSummary>, ApiError> {
    let summary = state
        .bookings
        .summary(
            claims.user_id,
            query.event_id,
            state.settings.max_tickets_per_user,
        )
        .await?;
    Ok(Json(summary))
}

/// Verify + consume the single-use queue pass for this attempt.
async fn consume_queue_pass(
    state: &AppState,
    headers: &HeaderMap,
    event_id: EventId,
    claims: &UserClaims,
) -> Result<(), ApiError> {
    let token = headers
        .get(QUEUE_PASS_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::forbidden("queue pass required"))?;

    state.queue.verify_token(token, event_id, claims.user_id)?;

    let consumed = state.queue.consume_pass(event_id, claims.user_id).await?;
    if !consumed {
        return Err(ApiError::forbidden("no active queue pass for this event"));
    }
    Ok(())
}

async fn fetch_owned(
    state: &AppState,
    id: BookingId,
    claims: &UserClaims,
) -> Result<Booking, ApiError> {
    let booking = state
        .bookings
        .get(id)
        .await?
        .ok_or_else(|| ApiError::from(DomainError::BookingNotFound(id)))?;

    if !booking.is_owned_by(claims.user_id) {
        return Err(ApiError::forbidden("booking belongs to another user"));
    }
    Ok(booking)
}

fn idempotency_key(headers: &HeaderMap) -> String {
    headers
        .get(crate::middleware::IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
