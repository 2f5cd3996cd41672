// Supervising task - sole writer of one execution record for its whole lifetime

use super::constants::ENGINE_FAULT_EXIT_CODE;
use super::Engine;
use crate::domain::{ExecutionEvent, ExecutionRecord, Invocation};
use crate::port::process_runner::EXIT_CODE_CANNOT_EXECUTE;
use crate::port::{CancelToken, ProcessOutcome, RunHandle, RunSpec};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};

pub(super) struct Supervisor {
    engine: Arc<Engine>,
    record: ExecutionRecord,
    invocation: Invocation,
    working_dir: Option<PathBuf>,
    cancel: CancelToken,
}

impl Supervisor {
    pub(super) fn new(
        engine: Arc<Engine>,
        record: ExecutionRecord,
        invocation: Invocation,
        working_dir: Option<PathBuf>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            engine,
            record,
            invocation,
            working_dir,
            cancel,
        }
    }

    /// Scheduled -> (slot) -> Running -> terminal
    pub(super) async fn run(mut self) {
        let Some(_permit) = self.acquire_slot().await else {
            self.cancel_scheduled().await;
            return;
        };
        if self.cancel.is_cancelled() {
            self.cancel_scheduled().await;
            return;
        }

        if let Some(dir) = &self.working_dir {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                let reason = format!("cannot create working directory {}: {}", dir.display(), e);
                self.fail_before_start(EXIT_CODE_CANNOT_EXECUTE, reason).await;
                return;
            }
        }

        let spec = RunSpec {
            execution_id: self.record.id.clone(),
            invocation: self.invocation.clone(),
            working_dir: self.working_dir.clone(),
            timeout: self.engine.settings.max_execution_time,
            max_output_bytes: self.engine.settings.max_output_bytes,
        };

        let handle = match self.engine.runner.start(spec, self.cancel.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(execution_id = %self.record.id, error = %e, "Process spawn failed");
                self.fail_before_start(e.exit_code(), e.to_string()).await;
                return;
            }
        };

        self.supervise(handle).await;
    }

    /// Wait for a concurrency slot; None if cancelled while waiting
    async fn acquire_slot(&mut self) -> Option<OwnedSemaphorePermit> {
        let slots = self.engine.slots.clone();
        let mut cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = slots.acquire_owned() => permit.ok(),
        }
    }

    async fn cancel_scheduled(&mut self) {
        let now = self.engine.time_provider.now_millis();
        if let Err(e) = self.record.cancel(now) {
            error!(execution_id = %self.record.id, error = %e, "Illegal transition");
            return;
        }
        info!(execution_id = %self.record.id, "Execution cancelled before start");
        self.engine.commit(&self.record).await;
    }

    async fn fail_before_start(&mut self, exit_code: i32, reason: String) {
        let now = self.engine.time_provider.now_millis();
        if let Err(e) = self.record.fail(exit_code, reason, now) {
            error!(execution_id = %self.record.id, error = %e, "Illegal transition");
            return;
        }
        self.engine.commit(&self.record).await;
    }

    async fn supervise(&mut self, mut handle: RunHandle) {
        let now = self.engine.time_provider.now_millis();
        if let Err(e) = self.record.start(now, handle.pid) {
            error!(execution_id = %self.record.id, error = %e, "Illegal transition");
            return;
        }
        info!(
            execution_id = %self.record.id,
            pid = ?handle.pid,
            "Execution running"
        );
        self.engine.commit(&self.record).await;

        // Output channel closes once the runner has drained both pipes
        while let Some(chunk) = handle.output.recv().await {
            if let Err(e) = self.engine.store.append_output(&self.record.id, &chunk).await {
                warn!(
                    execution_id = %self.record.id,
                    seq = chunk.seq,
                    error = %e,
                    "Failed to store output chunk"
                );
            }
            self.engine
                .streamer
                .publish(ExecutionEvent::output(self.record.id.clone(), &chunk));
        }

        let outcome = handle.exit.await;
        let now = self.engine.time_provider.now_millis();
        // a cancel observed before the exit wins over any other outcome
        let cancelled = self.cancel.is_cancelled();

        let transition = match outcome {
            _ if cancelled => self.record.cancel(now),
            Ok(ProcessOutcome::Cancelled) => self.record.cancel(now),
            Ok(ProcessOutcome::Exited { exit_code }) => self.record.finish(exit_code, now),
            Ok(ProcessOutcome::TimedOut) => {
                let timeout_ms = self.engine.settings.max_execution_time.as_millis() as u64;
                self.record.time_out(timeout_ms, now)
            }
            Ok(ProcessOutcome::OutputLimitExceeded { limit, exit_code }) => self.record.fail(
                exit_code,
                format!("output limit of {} bytes exceeded", limit),
                now,
            ),
            Err(_) => self.record.fail(
                ENGINE_FAULT_EXIT_CODE,
                "process runner stopped without reporting an exit",
                now,
            ),
        };

        if let Err(e) = transition {
            error!(execution_id = %self.record.id, error = %e, "Illegal transition");
            return;
        }

        info!(
            execution_id = %self.record.id,
            status = %self.record.status,
            exit_code = ?self.record.exit_code,
            "Execution finished"
        );
        debug!(execution_id = %self.record.id, reason = ?self.record.reason, "Terminal reason");
        self.engine.commit(&self.record).await;
    }
}
