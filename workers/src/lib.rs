//! Background consumers and sweepers for the Rushtix booking platform.
//!
//! Everything here runs outside the request path:
//!
//! - [`payment_events`]: reacts to payment outcomes; success starts the
//!   post-payment saga, failure/cancel/refund releases seats
//! - [`saga_executor`]: executes the booking-side steps of the
//!   post-payment saga and replies to the orchestrator
//! - [`inventory_sync`]: batches `booking.*` events into the relational
//!   seat projection, and reconciles both stores at startup
//! - [`expiry`]: the reservation expiry sweeper
//! - [`queue_ticker`]: the queue-release ticker
//! - [`supervisor`]: the interval-loop runner that keeps one panicking
//!   tick from killing a worker
//!
//! Consumers run on `rushtix-redpanda`'s pool (consumer groups, commit
//! after processing) and are idempotent: every message may arrive twice.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod expiry;
pub mod inventory_sync;
pub mod payment_events;
pub mod queue_ticker;
pub mod saga_executor;
pub mod supervisor;

pub use expiry::ExpirySweeper;
pub use inventory_sync::{InventoryBatcher, InventoryDelta, InventorySyncHandler, reconcile};
pub use payment_events::PaymentEventsHandler;
pub use queue_ticker::QueueReleaseTicker;
pub use saga_executor::PostPaymentExecutor;
pub use supervisor::run_interval;
