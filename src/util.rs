use tokio_util::sync::CancellationToken;
use tracing::info;

/// Spawn a task that watches for CTRL + C signal and cancels a [`CancellationToken`] when caught
///
/// Channels still waiting for a worker are skipped; attempts already running finish
/// within their own time limits.
pub fn spawn_ct_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Caught CTRL+C signal! Finishing running channels, skipping the rest");
        ct.cancel();
    });
}
