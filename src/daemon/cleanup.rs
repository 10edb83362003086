use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::queue::QueueManager;

pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Deletes terminal jobs older than `retention` at startup and then every
/// [`CLEANUP_INTERVAL`] until shutdown.
pub async fn run(
    queue: Arc<dyn QueueManager>,
    retention: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(retention_secs = retention.as_secs(), "job cleanup started");

    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let queue = queue.clone();
                match tokio::task::spawn_blocking(move || queue.cleanup_old_jobs(retention)).await {
                    Ok(Ok(0)) => tracing::debug!("no old jobs to clean up"),
                    Ok(Ok(deleted)) => tracing::info!(deleted, "cleaned up old jobs"),
                    Ok(Err(e)) => tracing::error!(error = %e, "failed to clean up old jobs"),
                    Err(e) => tracing::error!(error = %e, "cleanup task panicked"),
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("job cleanup shutting down");
                break;
            }
        }
    }
}
