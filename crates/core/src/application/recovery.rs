// Startup recovery
use crate::application::manager::constants::ENGINE_FAULT_EXIT_CODE;
use crate::domain::ExecutionRecord;
use crate::port::{ExecutionStore, ProcessControl, TimeProvider};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Reason recorded on executions orphaned by an engine restart
pub const RESTART_REASON: &str = "engine restarted";

/// Recovery service
///
/// With a durable store, executions left Scheduled or Running by a previous
/// engine run have no supervisor any more. On startup they are failed, and a
/// recorded process that is still alive has its group terminated first.
pub struct RecoveryService {
    store: Arc<dyn ExecutionStore>,
    process_control: Arc<dyn ProcessControl>,
    time_provider: Arc<dyn TimeProvider>,
}

impl RecoveryService {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        process_control: Arc<dyn ProcessControl>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            process_control,
            time_provider,
        }
    }

    /// Fail every unfinished execution; must run before the manager accepts work
    ///
    /// # Returns
    /// Number of executions recovered
    pub async fn recover_orphaned_executions(&self) -> crate::error::Result<usize> {
        let orphans = self.store.find_unfinished().await?;
        if orphans.is_empty() {
            info!("No orphaned executions found");
            return Ok(0);
        }

        info!(orphaned = orphans.len(), "Recovering orphaned executions");
        let mut recovered = 0;
        for record in orphans {
            self.recover_single(record).await?;
            recovered += 1;
        }

        info!(recovered_count = %recovered, "Orphaned execution recovery complete");
        Ok(recovered)
    }

    async fn recover_single(&self, mut record: ExecutionRecord) -> crate::error::Result<()> {
        if let Some(pid) = record.pid {
            if self.process_control.is_alive(pid) {
                warn!(
                    execution_id = %record.id,
                    pid = %pid,
                    "Orphaned process still alive, terminating its group"
                );
                if let Err(e) = self.process_control.terminate_group(pid).await {
                    error!(
                        execution_id = %record.id,
                        pid = %pid,
                        error = %e,
                        "Failed to terminate orphaned process"
                    );
                }
            }
        }

        let now = self.time_provider.now_millis();
        record.fail(ENGINE_FAULT_EXIT_CODE, RESTART_REASON, now)?;
        self.store.save_state(&record).await?;

        info!(execution_id = %record.id, "Orphaned execution marked as failed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::memory_store::InMemoryExecutionStore;
    use crate::domain::ExecutionStatus;
    use crate::port::process_control::mocks::MockProcessControl;
    use crate::port::time_provider::mocks::ManualTimeProvider;

    #[tokio::test]
    async fn test_recovers_scheduled_and_running_executions() {
        let store = Arc::new(InMemoryExecutionStore::new());

        let scheduled = ExecutionRecord::new("s", "echo", "alice", 1);
        store.insert(&scheduled).await.unwrap();

        let mut running = ExecutionRecord::new("r", "sleep 100", "alice", 1);
        store.insert(&running).await.unwrap();
        running.start(2, Some(4321)).unwrap();
        store.save_state(&running).await.unwrap();

        let mut done = ExecutionRecord::new("d", "echo", "alice", 1);
        store.insert(&done).await.unwrap();
        done.start(2, Some(99)).unwrap();
        done.finish(0, 3).unwrap();
        store.save_state(&done).await.unwrap();

        let control = Arc::new(MockProcessControl::with_alive(&[4321, 99]));
        let service = RecoveryService::new(
            store.clone(),
            control.clone(),
            Arc::new(ManualTimeProvider::new(10_000)),
        );

        assert_eq!(service.recover_orphaned_executions().await.unwrap(), 2);
        assert_eq!(control.terminated(), vec![4321]);

        for id in ["s", "r"] {
            let record = store.find_by_id(id).await.unwrap().unwrap();
            assert_eq!(record.status, ExecutionStatus::Failed);
            assert_eq!(record.reason.as_deref(), Some(RESTART_REASON));
            assert_eq!(record.completed_at, Some(10_000));
        }
        let done = store.find_by_id("d").await.unwrap().unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_dead_process_is_not_signalled() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let mut running = ExecutionRecord::new("r", "sleep 100", "alice", 1);
        store.insert(&running).await.unwrap();
        running.start(2, Some(777)).unwrap();
        store.save_state(&running).await.unwrap();

        let control = Arc::new(MockProcessControl::default());
        let service = RecoveryService::new(
            store.clone(),
            control.clone(),
            Arc::new(ManualTimeProvider::new(5)),
        );

        assert_eq!(service.recover_orphaned_executions().await.unwrap(), 1);
        assert!(control.terminated().is_empty());
    }
}
