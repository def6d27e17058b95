use app::app::run::RunApp;
use app::app::SweepConfig;
use common::util::shutdown::{ShutdownLock, ShutdownSignal};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Periodically re-enqueue PENDING runs whose enqueue was lost.
/// Returns None (and releases the lock) when the sweep is disabled.
pub fn spawn_pending_sweep(
    run_app: Arc<dyn RunApp>,
    config: Arc<SweepConfig>,
    lock: ShutdownLock,
    mut shutdown: ShutdownSignal,
) -> Option<JoinHandle<()>> {
    if config.interval_sec == 0 {
        tracing::info!("pending run sweep disabled");
        lock.unlock();
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(config.interval_sec));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match run_app.reconcile_pending(config.pending_age_sec * 1000).await {
                        Ok(0) => tracing::debug!("no stale pending runs"),
                        Ok(n) => tracing::info!("re-enqueued {} pending runs", n),
                        Err(e) => tracing::error!("failed to sweep pending runs: {:?}", e),
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("break pending run sweep");
                    break;
                }
            }
        }
        lock.unlock();
    }))
}
