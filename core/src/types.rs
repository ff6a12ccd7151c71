//! Domain identifiers and value objects shared across the workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random id
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing `Uuid`
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a user (minted by the identity provider)
    UserId
);
uuid_id!(
    /// Unique identifier for an event
    EventId
);
uuid_id!(
    /// Unique identifier for a show of an event
    ShowId
);
uuid_id!(
    /// Unique identifier for a seating zone
    ZoneId
);
uuid_id!(
    /// Unique identifier for a payment
    PaymentId
);
uuid_id!(
    /// Unique identifier for a tenant
    TenantId
);
uuid_id!(
    /// Unique identifier for a saga instance
    SagaId
);

/// Unique identifier for a booking.
///
/// Minted at the edge as a ULID so ids sort by creation time, then carried
/// as a UUID everywhere (the two share a 128-bit layout). The reservation
/// Lua script receives the id as an argument so the script itself stays
/// deterministic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookingId(Uuid);

impl BookingId {
    /// Mint a fresh, time-ordered booking id
    #[must_use]
    pub fn mint() -> Self {
        Self(Uuid::from(Ulid::new()))
    }

    /// Wrap an existing `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for BookingId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ============================================================================
// Roles
// ============================================================================

/// Role claim carried in the bearer token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Regular ticket buyer
    Customer,
    /// Event organizer
    Organizer,
    /// Platform administrator
    Admin,
    /// Cross-tenant administrator
    SuperAdmin,
}

impl Role {
    /// String form used in token claims and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Organizer => "organizer",
            Self::Admin => "admin",
            Self::SuperAdmin => "super_admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Money (cents-based to avoid floating point errors)
// ============================================================================

/// Represents money in cents to avoid floating-point arithmetic errors
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two money amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Multiplies money by a quantity with overflow checking
    #[must_use]
    pub const fn checked_multiply(self, quantity: u32) -> Option<Self> {
        match self.0.checked_mul(quantity as u64) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

// ============================================================================
// Zones
// ============================================================================

/// A seating zone, the unit of inventory.
///
/// `available_seats` here is the eventually consistent relational
/// projection; the runtime source of truth is the Redis counter
/// `zone:availability:{zone_id}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    /// Zone identifier
    pub id: ZoneId,
    /// Show this zone belongs to
    pub show_id: ShowId,
    /// Event this zone belongs to
    pub event_id: EventId,
    /// Total seat capacity
    pub total_seats: u32,
    /// Projected available seats (reconciled by the inventory-sync worker)
    pub available_seats: u32,
    /// Price per seat
    pub price: Money,
    /// Minimum seats per order
    pub min_per_order: u32,
    /// Maximum seats per order
    pub max_per_order: u32,
}

impl Zone {
    /// Validate an order quantity against this zone's per-order bounds.
    #[must_use]
    pub const fn quantity_in_bounds(&self, quantity: u32) -> bool {
        quantity >= self.min_per_order && quantity <= self.max_per_order
    }
}

/// Validated bearer-token claims consumed by the core.
///
/// Token issuance lives outside this system; only the claim shape is
/// consumed here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserClaims {
    /// Subject user id
    pub user_id: UserId,
    /// Email address
    pub email: String,
    /// Role claim
    pub role: Role,
    /// Token expiry
    pub expires_at: DateTime<Utc>,
}
