// Periodic pool statistics, only spawned when debug logging is on.
use rendezvous_store::SyncStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) async fn run_pool_sampler(
    store: Arc<dyn SyncStore>,
    token: CancellationToken,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let stats = store.pool_stats();
        debug!(
            total = stats.total,
            idle = stats.idle,
            in_use = stats.in_use,
            waiting = stats.waiting,
            max_size = stats.max_size,
            timeouts = stats.timeouts,
            "store pool stats"
        );
        metrics::gauge!("rendezvous_store_pool_total").set(stats.total as f64);
        metrics::gauge!("rendezvous_store_pool_idle").set(stats.idle as f64);
        metrics::gauge!("rendezvous_store_pool_in_use").set(stats.in_use as f64);
        metrics::gauge!("rendezvous_store_pool_waiting").set(stats.waiting as f64);
    }
}
