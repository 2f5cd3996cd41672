//! RPC Request/Response Types
//!
//! Wire names are camelCase; statuses are snake_case strings.

use cmdexec_core::application::EngineHealth;
use cmdexec_core::domain::{
    rfc3339_from_millis, ExecutionRecord, ExecutionStatus, ExecutionSummary, OutputChunk,
    PermissionSet, StreamKind,
};
use serde::{Deserialize, Serialize};

/// commands.submit.v1 - Submit a command for execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub caller_id: String,
    pub command: String,
    /// Caller-specific narrowing of the global policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionSet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub execution_id: String,
    pub status: ExecutionStatus,
}

/// commands.get.v1 / commands.cancel.v1 / commands.subscribe.v1
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub caller_id: String,
    pub execution_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub execution_id: String,
    /// `cancelled` while termination is pending, otherwise the final status
    pub status: ExecutionStatus,
}

/// One captured output chunk as returned by commands.get.v1
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputView {
    pub seq: u64,
    pub stream: StreamKind,
    pub data: String,
    pub timestamp: String,
}

impl From<&OutputChunk> for OutputView {
    fn from(chunk: &OutputChunk) -> Self {
        Self {
            seq: chunk.seq,
            stream: chunk.stream,
            data: chunk.text(),
            timestamp: rfc3339_from_millis(chunk.timestamp),
        }
    }
}

/// commands.get.v1 result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionView {
    pub execution_id: String,
    pub command: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub output: Vec<OutputView>,
    pub output_bytes: u64,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub cancel_requested: bool,
}

impl From<&ExecutionRecord> for ExecutionView {
    fn from(record: &ExecutionRecord) -> Self {
        Self {
            execution_id: record.id.clone(),
            command: record.command.clone(),
            status: record.status,
            exit_code: record.exit_code,
            reason: record.reason.clone(),
            output: record.output.iter().map(OutputView::from).collect(),
            output_bytes: record.output_bytes,
            created_at: rfc3339_from_millis(record.created_at),
            started_at: record.started_at.map(rfc3339_from_millis),
            completed_at: record.completed_at.map(rfc3339_from_millis),
            cancel_requested: record.cancel_requested,
        }
    }
}

/// commands.list.v1 - The caller's executions, newest first
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequest {
    pub caller_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryView {
    pub execution_id: String,
    pub command: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

impl From<ExecutionSummary> for SummaryView {
    fn from(summary: ExecutionSummary) -> Self {
        Self {
            execution_id: summary.id,
            command: summary.command,
            status: summary.status,
            exit_code: summary.exit_code,
            created_at: rfc3339_from_millis(summary.created_at),
            completed_at: summary.completed_at.map(rfc3339_from_millis),
        }
    }
}

/// system.health.v1 result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// "ok", or "shutting_down" once the engine stopped accepting work
    pub status: String,
    pub version: String,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub available_slots: usize,
}

impl HealthResponse {
    pub fn from_health(health: EngineHealth, version: &str) -> Self {
        Self {
            status: if health.accepting { "ok" } else { "shutting_down" }.to_string(),
            version: version.to_string(),
            in_flight: health.in_flight,
            max_concurrent: health.max_concurrent,
            available_slots: health.available_slots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_submit_request_accepts_camel_case_permissions() {
        let req: SubmitRequest = serde_json::from_value(json!({
            "callerId": "alice",
            "command": "ls /tmp",
            "permissions": { "allowedPrefixes": ["ls"], "forbiddenPaths": ["/var"] }
        }))
        .unwrap();

        let perms = req.permissions.unwrap();
        assert_eq!(perms.allowed_prefixes, vec!["ls"]);
        assert_eq!(perms.forbidden_paths, vec!["/var"]);
    }

    #[test]
    fn test_execution_view_omits_absent_fields() {
        let record = ExecutionRecord::new("exec-1", "echo hi", "alice", 0);
        let value = serde_json::to_value(ExecutionView::from(&record)).unwrap();

        assert_eq!(value["executionId"], "exec-1");
        assert_eq!(value["status"], "scheduled");
        assert_eq!(value["createdAt"], "1970-01-01T00:00:00.000Z");
        assert!(value.get("exitCode").is_none());
        assert!(value.get("startedAt").is_none());
        assert_eq!(value["output"], json!([]));
    }

    #[test]
    fn test_completed_view_carries_output_and_exit_code() {
        let mut record = ExecutionRecord::new("exec-1", "echo hello", "alice", 0);
        record.start(1_000, Some(7)).unwrap();
        record
            .append_output(OutputChunk::new(0, StreamKind::Stdout, "hello\n", 1_001))
            .unwrap();
        record.finish(0, 1_002).unwrap();

        let value = serde_json::to_value(ExecutionView::from(&record)).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["exitCode"], 0);
        assert_eq!(value["output"][0]["stream"], "stdout");
        assert_eq!(value["output"][0]["data"], "hello\n");
        assert_eq!(value["completedAt"], "1970-01-01T00:00:01.002Z");
    }
}
