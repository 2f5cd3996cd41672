// Execution Domain Model

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Execution ID (UUID v4)
pub type ExecutionId = String;

/// Identity of the submitter, resolved by the front door
pub type CallerId = String;

/// Execution Status
///
/// `Scheduled -> Running -> {Completed | Failed | TimedOut | Cancelled}`,
/// plus `Scheduled -> Cancelled` and `Scheduled -> Failed` (spawn failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl ExecutionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Scheduled => "scheduled",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::TimedOut => "timed_out",
        }
    }

    /// Terminal states are never left
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::TimedOut
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(ExecutionStatus::Scheduled),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            "timed_out" => Ok(ExecutionStatus::TimedOut),
            other => Err(DomainError::ValidationError(format!(
                "unknown execution status '{}'",
                other
            ))),
        }
    }
}

/// Which pipe an output chunk was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stdout" => Ok(StreamKind::Stdout),
            "stderr" => Ok(StreamKind::Stderr),
            other => Err(DomainError::ValidationError(format!(
                "unknown stream '{}'",
                other
            ))),
        }
    }
}

/// One captured piece of process output
///
/// `seq` comes from a single counter shared by stdout and stderr, so it
/// orders chunks across both streams as the reader observed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub seq: u64,
    pub stream: StreamKind,
    pub data: Vec<u8>,
    pub timestamp: i64, // epoch ms
}

impl OutputChunk {
    pub fn new(seq: u64, stream: StreamKind, data: impl Into<Vec<u8>>, timestamp: i64) -> Self {
        Self {
            seq,
            stream,
            data: data.into(),
            timestamp,
        }
    }

    /// Payload decoded as UTF-8, invalid sequences replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Execution Entity - one run of one command
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub command: String,
    pub caller_id: CallerId,

    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,

    pub output: Vec<OutputChunk>,
    pub output_bytes: u64,

    pub created_at: i64, // epoch ms
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,

    pub cancel_requested: bool,
    pub pid: Option<u32>,
}

/// Listing view of an execution (no output)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub id: ExecutionId,
    pub command: String,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl ExecutionRecord {
    /// Create a new execution in `Scheduled`
    ///
    /// # Arguments
    ///
    /// * `id` - Unique execution ID (injected, not generated)
    /// * `command` - Command string exactly as submitted
    /// * `caller_id` - Owner used for status/cancel authorization
    /// * `created_at` - Creation timestamp in epoch ms (injected, not system time)
    pub fn new(
        id: impl Into<String>,
        command: impl Into<String>,
        caller_id: impl Into<String>,
        created_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            caller_id: caller_id.into(),
            status: ExecutionStatus::Scheduled,
            exit_code: None,
            reason: None,
            output: Vec::new(),
            output_bytes: 0,
            created_at,
            started_at: None,
            completed_at: None,
            cancel_requested: false,
            pid: None,
        }
    }

    fn transition(&mut self, allowed_from: &[ExecutionStatus], to: ExecutionStatus) -> Result<()> {
        if !allowed_from.contains(&self.status) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// Scheduled -> Running, once the process is spawned
    pub fn start(&mut self, now_millis: i64, pid: Option<u32>) -> Result<()> {
        self.transition(&[ExecutionStatus::Scheduled], ExecutionStatus::Running)?;
        self.started_at = Some(now_millis);
        self.pid = pid;
        Ok(())
    }

    /// Running -> Completed (code 0) or Failed (any other code)
    pub fn finish(&mut self, exit_code: i32, now_millis: i64) -> Result<()> {
        if exit_code == 0 {
            self.transition(&[ExecutionStatus::Running], ExecutionStatus::Completed)?;
        } else {
            self.transition(&[ExecutionStatus::Running], ExecutionStatus::Failed)?;
            self.reason = Some(format!("process exited with code {}", exit_code));
        }
        self.exit_code = Some(exit_code);
        self.completed_at = Some(now_millis);
        Ok(())
    }

    /// Scheduled|Running -> Failed with an explicit reason
    ///
    /// Covers spawn failures, the output cap and supervisor faults. An exit
    /// code is always recorded so `Failed` carries one like every other failure.
    pub fn fail(&mut self, exit_code: i32, reason: impl Into<String>, now_millis: i64) -> Result<()> {
        self.transition(
            &[ExecutionStatus::Scheduled, ExecutionStatus::Running],
            ExecutionStatus::Failed,
        )?;
        self.exit_code = Some(exit_code);
        self.reason = Some(reason.into());
        self.completed_at = Some(now_millis);
        Ok(())
    }

    /// Running -> TimedOut
    pub fn time_out(&mut self, timeout_ms: u64, now_millis: i64) -> Result<()> {
        self.transition(&[ExecutionStatus::Running], ExecutionStatus::TimedOut)?;
        self.reason = Some(format!("exceeded wall-clock timeout of {}ms", timeout_ms));
        self.completed_at = Some(now_millis);
        Ok(())
    }

    /// Scheduled|Running -> Cancelled
    pub fn cancel(&mut self, now_millis: i64) -> Result<()> {
        self.transition(
            &[ExecutionStatus::Scheduled, ExecutionStatus::Running],
            ExecutionStatus::Cancelled,
        )?;
        self.reason = Some("cancelled by caller".to_string());
        self.completed_at = Some(now_millis);
        Ok(())
    }

    /// Set the cancel flag. Returns false if it was already set.
    pub fn request_cancel(&mut self) -> bool {
        if self.cancel_requested {
            return false;
        }
        self.cancel_requested = true;
        true
    }

    /// Append a chunk; only while Running and only with a larger seq
    pub fn append_output(&mut self, chunk: OutputChunk) -> Result<()> {
        if self.status != ExecutionStatus::Running {
            return Err(DomainError::OutputNotAccepted(self.status.to_string()));
        }
        if let Some(last) = self.last_seq() {
            if chunk.seq <= last {
                return Err(DomainError::SequenceOutOfOrder {
                    last,
                    seq: chunk.seq,
                });
            }
        }
        self.output_bytes += chunk.data.len() as u64;
        self.output.push(chunk);
        Ok(())
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.output.last().map(|c| c.seq)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id.clone(),
            command: self.command.clone(),
            status: self.status,
            exit_code: self.exit_code,
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}
