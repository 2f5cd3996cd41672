// Lifecycle events pushed to the event sink
//
// Wire schema (one event per message):
//   { "executionId", "type": "status", "status", "timestamp", "exitCode"?, "reason"? }
//   { "executionId", "type": "output", "stream", "seq", "data", "timestamp" }
//   { "executionId", "type": "truncated", "droppedChunks", "timestamp" }

use crate::domain::execution::{
    ExecutionId, ExecutionRecord, ExecutionStatus, OutputChunk, StreamKind,
};
use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};

/// Render epoch milliseconds as RFC 3339 (UTC, millisecond precision)
pub fn rfc3339_from_millis(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ExecutionEvent {
    Status {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: String,
    },
    Output {
        execution_id: ExecutionId,
        stream: StreamKind,
        seq: u64,
        data: String,
        timestamp: String,
    },
    /// Synthetic notice: chunks were dropped before reaching the sink
    Truncated {
        execution_id: ExecutionId,
        dropped_chunks: u64,
        timestamp: String,
    },
}

impl ExecutionEvent {
    /// Status event reflecting the record's current state
    pub fn status_of(record: &ExecutionRecord, now_millis: i64) -> Self {
        ExecutionEvent::Status {
            execution_id: record.id.clone(),
            status: record.status,
            exit_code: record.exit_code,
            reason: record.reason.clone(),
            timestamp: rfc3339_from_millis(now_millis),
        }
    }

    pub fn output(execution_id: impl Into<String>, chunk: &OutputChunk) -> Self {
        ExecutionEvent::Output {
            execution_id: execution_id.into(),
            stream: chunk.stream,
            seq: chunk.seq,
            data: chunk.text(),
            timestamp: rfc3339_from_millis(chunk.timestamp),
        }
    }

    pub fn truncated(execution_id: impl Into<String>, dropped_chunks: u64, now_millis: i64) -> Self {
        ExecutionEvent::Truncated {
            execution_id: execution_id.into(),
            dropped_chunks,
            timestamp: rfc3339_from_millis(now_millis),
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionEvent::Status { execution_id, .. }
            | ExecutionEvent::Output { execution_id, .. }
            | ExecutionEvent::Truncated { execution_id, .. } => execution_id,
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self, ExecutionEvent::Output { .. })
    }

    /// True for a status event carrying a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionEvent::Status { status, .. } if status.is_terminal())
    }
}
