use super::manager::RetryManager;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Spawn the background loop that drains the outbox once per
/// `policy.interval`. The first pass runs one interval after startup.
///
/// Cancelling `shutdown` stops the loop before the next tick; a pass already
/// in flight finishes first, so a record is never left half-settled.
pub fn spawn_retry_worker(
    manager: Arc<RetryManager>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let period = manager.policy().interval;

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("[RETRY] worker started, interval {:?}", period);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    manager.drain().await;
                }
            }
        }

        tracing::info!("[RETRY] worker stopped");
    })
}
