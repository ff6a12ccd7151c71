//! Message-bus publishing contract.
//!
//! The outbox relay and the saga orchestrator publish through this trait;
//! `rushtix-redpanda` provides the production implementation and
//! `rushtix-testing` an in-memory recorder.

use crate::error::DomainError;
use crate::event::DomainEvent;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by publisher methods.
pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DomainError>> + Send + 'a>>;

/// Publish messages keyed for per-aggregate ordering.
pub trait EventPublisher: Send + Sync {
    /// Publish an envelope to `topic`, keyed by `key`.
    fn publish(&self, topic: &str, key: &str, event: &DomainEvent) -> PublishFuture<'_>;

    /// Publish pre-serialized bytes verbatim.
    ///
    /// The relay forwards outbox payloads this way so fields added by
    /// newer producers survive the hop unchanged.
    fn publish_raw(&self, topic: &str, key: &str, payload: &[u8]) -> PublishFuture<'_>;
}
