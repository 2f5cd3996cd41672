// Execution Store Port (Interface)

use crate::domain::{CallerId, ExecutionRecord, ExecutionStatus, ExecutionSummary, OutputChunk};
use crate::error::Result;
use async_trait::async_trait;

/// Listing filter
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub caller_id: Option<CallerId>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn for_caller(caller_id: impl Into<String>) -> Self {
        Self {
            caller_id: Some(caller_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.caller_id
            .as_deref()
            .map_or(true, |c| c == record.caller_id)
            && self.status.map_or(true, |s| s == record.status)
    }
}

/// Store interface for execution records
///
/// Shared by the supervising tasks (writers, one per record) and the query
/// side (readers). Implementations lock per record, never across records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a new record (Conflict if the id exists)
    async fn insert(&self, record: &ExecutionRecord) -> Result<()>;

    /// Snapshot of a record, including its output
    async fn find_by_id(&self, id: &str) -> Result<Option<ExecutionRecord>>;

    /// Summaries matching the filter, newest first
    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionSummary>>;

    /// Persist lifecycle fields (status, exit code, reason, timestamps, pid)
    ///
    /// Never touches the cancel flag or the output. Moving a stored terminal
    /// record to another status is an InvalidState error.
    async fn save_state(&self, record: &ExecutionRecord) -> Result<()>;

    /// Append one output chunk (sequence must increase)
    async fn append_output(&self, id: &str, chunk: &OutputChunk) -> Result<()>;

    /// Set the cancel flag; returns false if it was already set
    async fn request_cancel(&self, id: &str) -> Result<bool>;

    /// Records in Scheduled or Running (startup recovery)
    async fn find_unfinished(&self) -> Result<Vec<ExecutionRecord>>;

    /// Remove a terminal record; returns false if unknown
    ///
    /// Non-terminal records are never evicted (InvalidState).
    async fn evict(&self, id: &str) -> Result<bool>;

    /// Remove terminal records completed before `cutoff_millis`
    async fn evict_finished_before(&self, cutoff_millis: i64) -> Result<u64>;
}
