//! Saga orchestration for the Rushtix booking platform.
//!
//! Coordinates workflows that span services. The flagship flow is
//! **post-payment**: on `payment.success`, confirm the booking, issue the
//! tickets, notify the user. Each step has a compensation so a
//! permanent failure unwinds whatever already happened.
//!
//! Pieces:
//!
//! - [`definition`]: ordered step lists with compensations, retry budgets
//!   and reply timeouts
//! - [`messages`]: the command/reply wire types, keyed by saga id for
//!   single-writer-per-instance delivery
//! - [`orchestrator`]: the stateless driver (dispatch, reply handling,
//!   reverse-order compensation, timeout sweeping, crash recovery
//!
//! Step executors live with the services that own the work (see
//! `rushtix-workers` for the booking-side executor).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod definition;
pub mod messages;
pub mod orchestrator;

pub use definition::{SagaDefinition, StepDef, post_payment};
pub use messages::{COMMAND_EVENT_TYPE, REPLY_EVENT_TYPE, SagaCommand, SagaReply};
pub use orchestrator::Orchestrator;

use rushtix_core::DomainError;
use rushtix_redpanda::{ConsumeError, EventHandler, ReceivedEvent};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Bus handler feeding saga replies into an [`Orchestrator`].
///
/// Subscribe it to `saga.events.{name}` with a dedicated consumer group;
/// partitioning by saga id keeps each instance on one member.
pub struct ReplyHandler {
    orchestrator: Arc<Orchestrator>,
}

impl ReplyHandler {
    /// Wrap an orchestrator.
    #[must_use]
    pub const fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

impl EventHandler for ReplyHandler {
    fn handle(
        &self,
        event: ReceivedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsumeError>> + Send + '_>> {
        Box::pin(async move {
            let Some(reply) = SagaReply::from_envelope(&event.event) else {
                // Not a reply (or an unknown future version): skip.
                tracing::debug!(event_type = %event.event.event_type, "ignoring non-reply on saga events topic");
                return Ok(());
            };

            self.orchestrator.handle_reply(&reply).await.map_err(|e| {
                if matches!(e, DomainError::Storage(_) | DomainError::DependencyUnavailable(_)) {
                    ConsumeError::Transient(e.to_string())
                } else {
                    ConsumeError::Permanent(e.to_string())
                }
            })
        })
    }
}
