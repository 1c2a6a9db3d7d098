//! Reconcilers: three independent periodic loops that drive observed state
//! toward desired state. Each is a `tokio::spawn`ed loop accepting a
//! `CancellationToken` for graceful shutdown.

mod healthcheck;
mod indexing;
mod startup;

pub use healthcheck::run_healthcheck;
pub use indexing::run_indexing;
pub use startup::run_startup_once;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Run `tick` once immediately, then every `interval`, until `shutdown` is
/// cancelled. `tick`'s own per-call deadline is the caller's
/// responsibility; this loop only owns the cadence.
async fn run_periodic<F, Fut>(interval: Duration, shutdown: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("reconciler loop shutting down");
                return;
            }
            () = tick() => {}
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("reconciler loop shutting down");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
