//! Periodic cursor checkpointing.
//!
//! [`CheckpointScheduler`] runs on its own timer, independent of frame
//! processing. Each tick it reads the in-memory cursor and, if one is
//! known, saves it. The orchestrator cancels it during shutdown and then
//! performs one final save itself.

use std::sync::Arc;
use std::time::Duration;

use canopy_connectors::firehose::SharedCursor;
use canopy_storage::CheckpointStore;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::stats::IngestStats;

/// Saves `seq`, logging and counting the result. Returns whether it
/// succeeded.
pub async fn save_checkpoint(store: &dyn CheckpointStore, seq: u64, stats: &IngestStats) -> bool {
    match store.save(seq).await {
        Ok(()) => {
            stats.record_checkpoint(true);
            debug!(seq, "checkpoint saved");
            true
        }
        Err(e) => {
            stats.record_checkpoint(false);
            warn!(seq, error = %e, "checkpoint save failed");
            false
        }
    }
}

/// Handle to the background checkpoint task.
#[derive(Debug)]
pub struct CheckpointScheduler {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl CheckpointScheduler {
    /// Spawns the task. The first save happens one `interval` from now.
    #[must_use]
    pub fn spawn(
        store: Arc<dyn CheckpointStore>,
        cursor: SharedCursor,
        interval: Duration,
        stats: Arc<IngestStats>,
    ) -> Self {
        let shutdown = Arc::new(Notify::new());
        let signal = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    () = signal.notified() => break,

                    _ = ticker.tick() => {
                        if let Some(seq) = cursor.get() {
                            save_checkpoint(store.as_ref(), seq, &stats).await;
                        }
                    }
                }
            }
            debug!("checkpoint scheduler stopped");
        });

        Self { shutdown, handle }
    }

    /// Stops the timer and waits for any save in progress to finish.
    pub async fn cancel(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "checkpoint scheduler task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use canopy_storage::MemoryCheckpointStore;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_saves_on_interval() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let cursor = SharedCursor::new(None);
        let stats = Arc::new(IngestStats::new(10));

        let scheduler = CheckpointScheduler::spawn(
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            cursor.clone(),
            Duration::from_secs(30),
            Arc::clone(&stats),
        );

        // Nothing observed yet: the first tick saves nothing.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(store.saves().is_empty());

        cursor.advance(10);
        tokio::time::sleep(Duration::from_secs(30)).await;
        cursor.advance(25);
        tokio::time::sleep(Duration::from_secs(30)).await;

        scheduler.cancel().await;
        assert_eq!(store.saves(), vec![10, 25]);

        // Cancelled: no further saves.
        cursor.advance(40);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(store.saves(), vec![10, 25]);
    }

    #[tokio::test]
    async fn test_cancel_before_first_tick() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let scheduler = CheckpointScheduler::spawn(
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            SharedCursor::new(Some(3)),
            Duration::from_secs(3600),
            Arc::new(IngestStats::new(10)),
        );
        scheduler.cancel().await;
        assert!(store.saves().is_empty());
    }

    #[tokio::test]
    async fn test_save_checkpoint_counts() {
        let store = MemoryCheckpointStore::new();
        let stats = IngestStats::new(10);
        assert!(save_checkpoint(&store, 5, &stats).await);
        assert_eq!(store.saves(), vec![5]);
    }
}
