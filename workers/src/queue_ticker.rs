//! Queue-release ticker.
//!
//! Every tick, each event with a non-empty waiting room admits users up
//! to its active-pass cap. Queue state lives entirely in Redis, so a
//! restarted ticker resumes exactly where the last one stopped.

use rushtix_core::{AdmissionQueue, Clock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// The queue-release ticker.
pub struct QueueReleaseTicker {
    queue: Arc<dyn AdmissionQueue>,
    clock: Arc<dyn Clock>,
    /// Tick interval (default 1 s)
    pub interval: Duration,
}

impl QueueReleaseTicker {
    /// Create a ticker.
    #[must_use]
    pub fn new(queue: Arc<dyn AdmissionQueue>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            queue,
            clock,
            interval,
        }
    }

    /// One tick over every active event.
    pub async fn tick(&self) {
        let events = match self.queue.active_events().await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(error = %e, "queue scan failed");
                return;
            }
        };

        let now = self.clock.now();
        for event_id in events {
            if let Err(e) = self.queue.release_batch(event_id, now).await {
                // One failing event must not starve the others this tick.
                tracing::error!(event_id = %event_id, error = %e, "queue release failed");
            }
        }
    }

    /// Ticker loop. Returns when `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let ticker = Arc::clone(&self);
        crate::supervisor::run_interval("queue-ticker", self.interval, shutdown, move || {
            let ticker = Arc::clone(&ticker);
            async move {
                ticker.tick().await;
            }
        })
        .await;
    }
}
