//! Interval-loop supervision.

use futures::FutureExt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Run `tick` every `interval` until `shutdown` flips to `true`.
///
/// Each tick runs under `catch_unwind`: a panicking tick is logged and
/// the loop keeps going, so one bad batch cannot take a worker down.
pub async fn run_interval<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = ()> + Send,
{
    tracing::info!(worker = name, interval_ms = interval.as_millis(), "worker started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            () = tokio::time::sleep(interval) => {
                if let Err(panic) = std::panic::AssertUnwindSafe(tick()).catch_unwind().await {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map_or("worker tick panicked", |s| s);
                    tracing::error!(worker = name, panic = msg, "worker tick panicked");
                    metrics::counter!("worker.panics", "worker" => name).increment(1);
                }
            }
        }
    }

    tracing::info!(worker = name, "worker stopped");
}
