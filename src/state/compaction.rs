//! Background changelog compaction.

use super::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Spawns a task that compacts `store` every `interval` until `shutdown` fires.
///
/// Each run executes on the blocking pool; the store takes its own consistent
/// snapshot, so compaction never observes a key mid-update.
pub fn spawn_compaction(
    store: Arc<dyn StateStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let store = Arc::clone(&store);
            match tokio::task::spawn_blocking(move || store.compact()).await {
                Ok(Ok(stats)) if stats.entries_after < stats.entries_before => {
                    debug!(
                        entries_before = stats.entries_before,
                        entries_after = stats.entries_after,
                        "compaction run finished"
                    );
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "changelog compaction failed"),
                Err(e) => error!(error = %e, "compaction task panicked"),
            }
        }
        info!("compaction task stopped");
    })
}
