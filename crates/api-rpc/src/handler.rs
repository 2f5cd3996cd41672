//! RPC Method Handlers
//!
//! Thin translation between wire types and the ExecutionManager.

use crate::error::to_rpc_error;
use crate::types::{
    CancelResponse, ExecutionRequest, ExecutionView, HealthResponse, ListRequest, SubmitRequest,
    SubmitResponse, SummaryView,
};
use cmdexec_core::application::{BroadcastEventSink, ExecutionManager};
use cmdexec_core::domain::{Caller, ExecutionEvent, ExecutionStatus};
use cmdexec_core::error::AppError;
use cmdexec_core::port::TimeProvider;
use jsonrpsee::types::ErrorObjectOwned;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// RPC Handler with injected dependencies
pub struct RpcHandler {
    manager: ExecutionManager,
    events: Arc<BroadcastEventSink>,
    time_provider: Arc<dyn TimeProvider>,
}

/// Live events for one execution, opened by `subscribe`
pub struct EventSubscription {
    pub execution_id: String,
    /// Set when the execution had already finished: its final status event
    pub finished: Option<ExecutionEvent>,
    pub receiver: broadcast::Receiver<ExecutionEvent>,
}

impl RpcHandler {
    pub fn new(
        manager: ExecutionManager,
        events: Arc<BroadcastEventSink>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            manager,
            events,
            time_provider,
        }
    }

    /// commands.submit.v1
    pub async fn submit(&self, params: SubmitRequest) -> Result<SubmitResponse, ErrorObjectOwned> {
        require_caller(&params.caller_id)?;

        let mut caller = Caller::new(params.caller_id);
        if let Some(permissions) = params.permissions {
            caller = caller.with_permissions(permissions);
        }

        let execution_id = self
            .manager
            .submit(&caller, &params.command)
            .await
            .map_err(to_rpc_error)?;

        Ok(SubmitResponse {
            execution_id,
            status: ExecutionStatus::Scheduled,
        })
    }

    /// commands.get.v1
    pub async fn get(&self, params: ExecutionRequest) -> Result<ExecutionView, ErrorObjectOwned> {
        require_caller(&params.caller_id)?;
        let record = self
            .manager
            .get_status(&params.execution_id, &params.caller_id)
            .await
            .map_err(to_rpc_error)?;
        Ok(ExecutionView::from(&record))
    }

    /// commands.cancel.v1
    ///
    /// Success means the cancellation is recorded; the execution reaches
    /// `cancelled` once its process group is gone. An execution that had
    /// already finished is left alone and reports its final status.
    pub async fn cancel(&self, params: ExecutionRequest) -> Result<CancelResponse, ErrorObjectOwned> {
        require_caller(&params.caller_id)?;
        self.manager
            .cancel(&params.execution_id, &params.caller_id)
            .await
            .map_err(to_rpc_error)?;
        let record = self
            .manager
            .get_status(&params.execution_id, &params.caller_id)
            .await
            .map_err(to_rpc_error)?;

        let status = if record.is_terminal() {
            record.status
        } else {
            ExecutionStatus::Cancelled
        };
        info!(
            execution_id = %params.execution_id,
            caller_id = %params.caller_id,
            status = %status,
            "Cancel accepted"
        );
        Ok(CancelResponse {
            execution_id: params.execution_id,
            status,
        })
    }

    /// commands.list.v1
    pub async fn list(&self, params: ListRequest) -> Result<Vec<SummaryView>, ErrorObjectOwned> {
        require_caller(&params.caller_id)?;
        let summaries = self
            .manager
            .list(&params.caller_id, params.status, params.limit)
            .await
            .map_err(to_rpc_error)?;
        Ok(summaries.into_iter().map(SummaryView::from).collect())
    }

    /// system.health.v1
    pub fn health(&self) -> HealthResponse {
        HealthResponse::from_health(self.manager.health(), cmdexec_core::VERSION)
    }

    /// commands.subscribe.v1 (ownership check + receiver)
    ///
    /// The receiver is opened before the status lookup so no event emitted in
    /// between is missed.
    pub async fn subscribe(&self, params: ExecutionRequest) -> Result<EventSubscription, ErrorObjectOwned> {
        require_caller(&params.caller_id)?;
        let receiver = self.events.subscribe();
        let record = self
            .manager
            .get_status(&params.execution_id, &params.caller_id)
            .await
            .map_err(to_rpc_error)?;

        let finished = record.is_terminal().then(|| {
            ExecutionEvent::status_of(&record, record.completed_at.unwrap_or(record.created_at))
        });

        Ok(EventSubscription {
            execution_id: params.execution_id,
            finished,
            receiver,
        })
    }

    /// Notice for a subscriber that fell behind the broadcast ring
    pub fn lagged_notice(&self, execution_id: &str, skipped: u64) -> ExecutionEvent {
        ExecutionEvent::truncated(execution_id, skipped, self.time_provider.now_millis())
    }
}

fn require_caller(caller_id: &str) -> Result<(), ErrorObjectOwned> {
    if caller_id.trim().is_empty() {
        return Err(to_rpc_error(AppError::Validation(
            "callerId must not be empty".to_string(),
        )));
    }
    Ok(())
}
