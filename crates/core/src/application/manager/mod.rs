// Execution Manager - submission, cancellation and queries
// Each accepted execution is owned by exactly one supervising task

pub mod constants;
mod supervisor;

use constants::*;
use supervisor::Supervisor;

use crate::application::policy::PolicyValidator;
use crate::application::streamer::OutputStreamer;
use crate::config::EngineConfig;
use crate::domain::{
    Caller, ExecutionEvent, ExecutionId, ExecutionRecord, ExecutionStatus, ExecutionSummary,
    PolicyDecision,
};
use crate::error::{AppError, Result};
use crate::port::{
    cancel_channel, CancelSender, ExecutionFilter, ExecutionStore, IdProvider, ProcessRunner,
    TimeProvider,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Per-execution limits applied by the manager
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    pub max_execution_time: Duration,
    pub max_output_bytes: u64,
    pub max_concurrent: usize,
    pub work_dir: Option<PathBuf>,
}

impl From<&EngineConfig> for ManagerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_execution_time: config.max_execution_time,
            max_output_bytes: config.max_output_bytes,
            max_concurrent: config.max_concurrent,
            work_dir: config.work_dir.clone(),
        }
    }
}

/// Snapshot for health checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineHealth {
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub available_slots: usize,
    pub accepting: bool,
}

/// Shared state between the manager handle and its supervising tasks
pub(crate) struct Engine {
    pub(crate) validator: PolicyValidator,
    pub(crate) runner: Arc<dyn ProcessRunner>,
    pub(crate) store: Arc<dyn ExecutionStore>,
    pub(crate) streamer: Arc<OutputStreamer>,
    pub(crate) id_provider: Arc<dyn IdProvider>,
    pub(crate) time_provider: Arc<dyn TimeProvider>,
    pub(crate) settings: ManagerSettings,
    pub(crate) slots: Arc<Semaphore>,
    cancels: Mutex<HashMap<ExecutionId, CancelSender>>,
    in_flight: AtomicUsize,
    accepting: AtomicBool,
}

impl Engine {
    /// Persist lifecycle fields, then emit the status event
    ///
    /// Store failures are logged: the supervisor keeps going so observers
    /// still see the transition.
    pub(crate) async fn commit(&self, record: &ExecutionRecord) {
        if let Err(e) = self.store.save_state(record).await {
            warn!(
                execution_id = %record.id,
                status = %record.status,
                error = %e,
                "Failed to persist execution state"
            );
        }
        self.streamer.publish(ExecutionEvent::status_of(
            record,
            self.time_provider.now_millis(),
        ));
    }

    /// Tell a still-running process to stop
    fn signal_cancel(&self, execution_id: &str) {
        if let Ok(cancels) = self.cancels.lock() {
            if let Some(tx) = cancels.get(execution_id) {
                tx.cancel();
            }
        }
    }

    fn release(&self, execution_id: &str) {
        if let Ok(mut cancels) = self.cancels.lock() {
            cancels.remove(execution_id);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Mark a record whose supervisor died as Failed
    async fn fail_orphan(&self, execution_id: &str, reason: &str) {
        let record = match self.store.find_by_id(execution_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "Cannot load execution after supervisor fault");
                return;
            }
        };
        if record.is_terminal() {
            return;
        }
        let mut record = record;
        let now = self.time_provider.now_millis();
        if record.fail(ENGINE_FAULT_EXIT_CODE, reason, now).is_ok() {
            self.commit(&record).await;
        }
    }
}

/// Execution Manager
///
/// Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct ExecutionManager {
    engine: Arc<Engine>,
}

impl ExecutionManager {
    /// Create a manager
    ///
    /// # Arguments
    /// * `validator` - Policy check applied to every submission
    /// * `runner` - Spawns OS processes
    /// * `store` - Execution records (shared with the query side)
    /// * `streamer` - Event delivery to the sink
    /// * `settings` - Timeout, output cap, concurrency and working directory
    pub fn new(
        validator: PolicyValidator,
        runner: Arc<dyn ProcessRunner>,
        store: Arc<dyn ExecutionStore>,
        streamer: Arc<OutputStreamer>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
        settings: ManagerSettings,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self {
            engine: Arc::new(Engine {
                validator,
                runner,
                store,
                streamer,
                id_provider,
                time_provider,
                settings,
                slots,
                cancels: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    /// Validate and schedule a command; returns without waiting for it to run
    ///
    /// # Errors
    /// - `PolicyRejected` if the policy denies the command (no record is created)
    /// - `InvalidState` once shutdown has begun
    /// - `Store` / `Conflict` if the record cannot be inserted
    pub async fn submit(&self, caller: &Caller, command: &str) -> Result<ExecutionId> {
        let engine = &self.engine;
        if !engine.accepting.load(Ordering::SeqCst) {
            return Err(AppError::InvalidState("engine is shutting down".to_string()));
        }

        let id = engine.id_provider.generate_id();
        let working_dir = engine.settings.work_dir.as_ref().map(|dir| dir.join(&id));

        let decision = match &working_dir {
            Some(cwd) => engine.validator.check_in(command, &caller.permissions, cwd),
            None => engine.validator.check(command, &caller.permissions),
        };
        let invocation = match decision {
            PolicyDecision::Allow(invocation) => invocation,
            PolicyDecision::Deny { reason } => {
                info!(caller_id = %caller.id, reason = %reason, "Command rejected by policy");
                return Err(AppError::PolicyRejected(reason));
            }
        };

        let record = ExecutionRecord::new(
            id.clone(),
            command,
            caller.id.clone(),
            engine.time_provider.now_millis(),
        );

        let (cancel_tx, cancel_token) = cancel_channel();
        engine
            .cancels
            .lock()
            .map_err(|_| AppError::Internal("cancel registry poisoned".to_string()))?
            .insert(id.clone(), cancel_tx);

        if let Err(e) = engine.store.insert(&record).await {
            if let Ok(mut cancels) = engine.cancels.lock() {
                cancels.remove(&id);
            }
            return Err(e);
        }

        engine.in_flight.fetch_add(1, Ordering::SeqCst);
        engine.streamer.publish(ExecutionEvent::status_of(
            &record,
            engine.time_provider.now_millis(),
        ));

        info!(
            execution_id = %id,
            caller_id = %caller.id,
            command = %command,
            "Execution scheduled"
        );

        let supervisor = Supervisor::new(
            engine.clone(),
            record,
            invocation,
            working_dir,
            cancel_token,
        );
        spawn_guarded(engine.clone(), id.clone(), supervisor);

        Ok(id)
    }

    /// Request cancellation
    ///
    /// Idempotent: once the cancel flag is set, or the execution has already
    /// finished, later calls succeed without effect. Termination is
    /// asynchronous; observe the terminal status by polling or subscribing.
    ///
    /// # Errors
    /// - `NotFound` for an unknown id
    /// - `Forbidden` if the caller did not submit the execution
    pub async fn cancel(&self, execution_id: &str, caller_id: &str) -> Result<()> {
        let engine = &self.engine;
        let record = engine
            .store
            .find_by_id(execution_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("execution {}", execution_id)))?;

        if record.caller_id != caller_id {
            return Err(AppError::Forbidden(format!(
                "execution {} belongs to another caller",
                execution_id
            )));
        }
        if record.cancel_requested || record.is_terminal() {
            return Ok(());
        }

        if engine.store.request_cancel(execution_id).await? {
            let cancels = engine
                .cancels
                .lock()
                .map_err(|_| AppError::Internal("cancel registry poisoned".to_string()))?;
            let signalled = match cancels.get(execution_id) {
                Some(tx) => {
                    tx.cancel();
                    true
                }
                None => false,
            };
            drop(cancels);
            info!(
                execution_id = %execution_id,
                caller_id = %caller_id,
                signalled,
                "Cancellation requested"
            );
        }
        Ok(())
    }

    /// Current snapshot of an execution, including its output
    ///
    /// Unknown ids and executions owned by someone else are both `NotFound`.
    pub async fn get_status(&self, execution_id: &str, caller_id: &str) -> Result<ExecutionRecord> {
        match self.engine.store.find_by_id(execution_id).await? {
            Some(record) if record.caller_id == caller_id => Ok(record),
            _ => Err(AppError::NotFound(format!("execution {}", execution_id))),
        }
    }

    /// The caller's executions, newest first
    pub async fn list(
        &self,
        caller_id: &str,
        status: Option<ExecutionStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionSummary>> {
        let filter = ExecutionFilter {
            caller_id: Some(caller_id.to_string()),
            status,
            limit: Some(limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)),
        };
        self.engine.store.list(&filter).await
    }

    pub fn health(&self) -> EngineHealth {
        let engine = &self.engine;
        EngineHealth {
            in_flight: engine.in_flight.load(Ordering::SeqCst),
            max_concurrent: engine.settings.max_concurrent,
            available_slots: engine.slots.available_permits(),
            accepting: engine.accepting.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting work, cancel everything in flight and wait for it
    ///
    /// Returns the number of executions still unfinished after `grace`.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let engine = &self.engine;
        engine.accepting.store(false, Ordering::SeqCst);

        let pending: Vec<ExecutionId> = match engine.cancels.lock() {
            Ok(cancels) => cancels.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        info!(in_flight = pending.len(), "Cancelling in-flight executions");
        for id in &pending {
            if let Err(e) = engine.store.request_cancel(id).await {
                warn!(execution_id = %id, error = %e, "Failed to flag execution for cancellation");
            }
            engine.signal_cancel(id);
        }

        let deadline = tokio::time::Instant::now() + grace;
        while engine.in_flight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if !engine.streamer.flush(remaining).await {
            warn!("Event delivery did not drain before shutdown");
        }

        engine.in_flight.load(Ordering::SeqCst)
    }
}

/// Run the supervisor on its own task; a panic fails the execution instead
/// of leaving it stuck in a non-terminal state
fn spawn_guarded(engine: Arc<Engine>, execution_id: ExecutionId, supervisor: Supervisor) {
    let task = tokio::spawn(supervisor.run());
    tokio::spawn(async move {
        if let Err(e) = task.await {
            // the process group may outlive its supervisor
            engine.signal_cancel(&execution_id);
            if e.is_panic() {
                tracing::error!(execution_id = %execution_id, "Supervising task panicked");
                engine.fail_orphan(&execution_id, SUPERVISOR_PANIC_REASON).await;
            } else {
                warn!(execution_id = %execution_id, "Supervising task aborted");
                engine.fail_orphan(&execution_id, "supervisor aborted").await;
            }
        }
        engine.release(&execution_id);
    });
}
