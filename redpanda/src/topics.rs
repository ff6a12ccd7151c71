//! Topic names.

/// Booking lifecycle events, keyed by booking id.
pub const BOOKING_EVENTS: &str = "booking-events";

/// Payment outcomes from the payment collaborator.
pub const PAYMENT_EVENTS: &str = "payment-events";

/// Seat-release commands issued on payment failure.
pub const SEAT_RELEASE: &str = "payment.seat-release";

/// Command topic for a named saga.
#[must_use]
pub fn saga_commands(name: &str) -> String {
    format!("saga.commands.{name}")
}

/// Reply topic for a named saga.
#[must_use]
pub fn saga_events(name: &str) -> String {
    format!("saga.events.{name}")
}

/// Dead-letter topic for any topic.
#[must_use]
pub fn dlq(topic: &str) -> String {
    format!("{topic}.dlq")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_topic_names() {
        assert_eq!(saga_commands("post-payment"), "saga.commands.post-payment");
        assert_eq!(saga_events("post-payment"), "saga.events.post-payment");
        assert_eq!(dlq(BOOKING_EVENTS), "booking-events.dlq");
    }
}
