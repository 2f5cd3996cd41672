// Retention sweeper
// Periodically evicts terminal executions older than the retention period

use crate::error::Result;
use crate::port::{ExecutionStore, TimeProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info};

/// Retention scheduler
///
/// Non-terminal executions are never evicted: the store only removes records
/// with a terminal status and a completion time before the cutoff.
pub struct RetentionSweeper {
    store: Arc<dyn ExecutionStore>,
    time_provider: Arc<dyn TimeProvider>,
    retention: Duration,
    sweep_interval: Duration,
}

impl RetentionSweeper {
    /// # Arguments
    /// * `retention` - Terminal records older than this are evicted
    /// * `sweep_interval` - How often to sweep
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        time_provider: Arc<dyn TimeProvider>,
        retention: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            store,
            time_provider,
            retention,
            sweep_interval,
        }
    }

    /// Sweep loop (background task); returns when `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            retention_secs = self.retention.as_secs(),
            sweep_interval_secs = self.sweep_interval.as_secs(),
            "Retention sweeper started"
        );

        let mut tick = interval(self.sweep_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.sweep_now().await {
                        error!(error = ?e, "Retention sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Retention sweeper stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Evict everything past retention now
    pub async fn sweep_now(&self) -> Result<u64> {
        let cutoff = self.time_provider.now_millis() - self.retention.as_millis() as i64;
        let evicted = self.store.evict_finished_before(cutoff).await?;
        if evicted > 0 {
            info!(evicted, cutoff, "Evicted expired executions");
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::memory_store::InMemoryExecutionStore;
    use crate::domain::ExecutionRecord;
    use crate::port::time_provider::mocks::ManualTimeProvider;

    async fn seeded_store() -> Arc<InMemoryExecutionStore> {
        let store = Arc::new(InMemoryExecutionStore::new());
        let mut old = ExecutionRecord::new("old", "echo", "alice", 0);
        store.insert(&old).await.unwrap();
        old.cancel(1_000).unwrap();
        store.save_state(&old).await.unwrap();

        store
            .insert(&ExecutionRecord::new("live", "sleep 1", "alice", 0))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_expired_terminal_records() {
        let store = seeded_store().await;
        let clock = Arc::new(ManualTimeProvider::new(1_500));
        let sweeper = RetentionSweeper::new(
            store.clone(),
            clock.clone(),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );

        assert_eq!(sweeper.sweep_now().await.unwrap(), 0);

        clock.advance(10_000);
        assert_eq!(sweeper.sweep_now().await.unwrap(), 1);
        assert!(store.find_by_id("old").await.unwrap().is_none());
        assert!(store.find_by_id("live").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeps_on_interval_and_stops() {
        let store = seeded_store().await;
        let sweeper = RetentionSweeper::new(
            store.clone(),
            Arc::new(ManualTimeProvider::new(100_000)),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(sweeper.run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.find_by_id("old").await.unwrap().is_none());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
