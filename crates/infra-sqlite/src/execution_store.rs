// SQLite ExecutionStore Implementation

use async_trait::async_trait;
use cmdexec_core::domain::{
    DomainError, ExecutionRecord, ExecutionStatus, ExecutionSummary, OutputChunk, StreamKind,
};
use cmdexec_core::error::{AppError, Result};
use cmdexec_core::port::{ExecutionFilter, ExecutionStore};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::debug;

/// SQL list of terminal statuses (must match ExecutionStatus::is_terminal)
const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled', 'timed_out')";

// Helper to convert sqlx::Error to AppError with structured information
fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            // SQLite error codes: https://www.sqlite.org/rescode.html
            Some("2067") | Some("1555") => {
                AppError::Conflict(format!("Unique constraint violation: {}", db_err.message()))
            }
            Some("5") => AppError::Store(format!(
                "Database locked (SQLITE_BUSY): {}",
                db_err.message()
            )),
            Some("13") => AppError::Store(format!("Database full: {}", db_err.message())),
            Some(code) => AppError::Store(format!("Database error [{}]: {}", code, db_err.message())),
            None => AppError::Store(format!("Database error: {}", db_err.message())),
        },
        sqlx::Error::RowNotFound => AppError::Store("Row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => AppError::Store(format!("Column not found: {}", col)),
        _ => AppError::Store(err.to_string()),
    }
}

/// Durable execution store
///
/// Output chunks are rows of `execution_output` keyed by `(execution_id, seq)`.
/// Every write that could race a competing writer starts with the write
/// statement, so SQLite takes the write lock up front and `busy_timeout`
/// applies.
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn current_status(&self, id: &str) -> Result<Option<ExecutionStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        status.map(|s| parse_status(&s)).transpose()
    }

    async fn load_output(&self, id: &str) -> Result<Vec<OutputChunk>> {
        let rows = sqlx::query_as::<_, OutputRow>(
            "SELECT seq, stream, data, timestamp FROM execution_output WHERE execution_id = ? ORDER BY seq ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(OutputRow::into_chunk).collect()
    }

    /// Explain why a conditional output insert matched no row
    async fn output_rejection(&self, id: &str, seq: u64) -> AppError {
        let status = match self.current_status(id).await {
            Ok(Some(status)) => status,
            Ok(None) => return AppError::NotFound(format!("Execution {} not found", id)),
            Err(e) => return e,
        };
        if status != ExecutionStatus::Running {
            return DomainError::OutputNotAccepted(status.to_string()).into();
        }
        let last: Option<i64> =
            match sqlx::query_scalar("SELECT MAX(seq) FROM execution_output WHERE execution_id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await
            {
                Ok(last) => last,
                Err(e) => return map_sqlx_error(e),
            };
        DomainError::SequenceOutOfOrder {
            last: last.unwrap_or(0) as u64,
            seq,
        }
        .into()
    }
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn insert(&self, record: &ExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executions (
                id, command, caller_id, status, exit_code, reason, output_bytes,
                created_at, started_at, completed_at, cancel_requested, pid
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.command)
        .bind(&record.caller_id)
        .bind(record.status.as_str())
        .bind(record.exit_code)
        .bind(&record.reason)
        .bind(record.output_bytes as i64)
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.cancel_requested)
        .bind(record.pid.map(i64::from))
        .execute(&self.pool)
        .await
        .map_err(|e| match map_sqlx_error(e) {
            AppError::Conflict(_) => {
                AppError::Conflict(format!("execution {} already exists", record.id))
            }
            other => other,
        })?;

        debug!(execution_id = %record.id, "Execution inserted");
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query_as::<_, ExecutionRow>("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let output = self.load_output(id).await?;
        row.into_record(output).map(Some)
    }

    async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionSummary>> {
        let status = filter.status.map(|s| s.as_str());
        // SQLite treats a negative LIMIT as unbounded
        let limit = filter.limit.map_or(-1, |l| l as i64);

        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT * FROM executions
            WHERE (? IS NULL OR caller_id = ?)
              AND (? IS NULL OR status = ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(&filter.caller_id)
        .bind(&filter.caller_id)
        .bind(status)
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|row| row.into_record(Vec::new()).map(|r| r.summary()))
            .collect()
    }

    async fn save_state(&self, record: &ExecutionRecord) -> Result<()> {
        // Conditional update: a stored terminal status is never replaced
        let result = sqlx::query(&format!(
            r#"
            UPDATE executions
            SET status = ?, exit_code = ?, reason = ?, started_at = ?, completed_at = ?, pid = ?
            WHERE id = ?
              AND (status NOT IN {} OR status = ?)
            "#,
            TERMINAL_STATUSES
        ))
        .bind(record.status.as_str())
        .bind(record.exit_code)
        .bind(&record.reason)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.pid.map(i64::from))
        .bind(&record.id)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.current_status(&record.id).await? {
            None => Err(AppError::NotFound(format!("Execution {} not found", record.id))),
            Some(current) => Err(AppError::InvalidState(format!(
                "execution {} is already {}",
                record.id, current
            ))),
        }
    }

    async fn append_output(&self, id: &str, chunk: &OutputChunk) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO execution_output (execution_id, seq, stream, data, timestamp)
            SELECT ?, ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM executions WHERE id = ? AND status = 'running')
              AND ? > COALESCE((SELECT MAX(seq) FROM execution_output WHERE execution_id = ?), -1)
            "#,
        )
        .bind(id)
        .bind(chunk.seq as i64)
        .bind(chunk.stream.as_str())
        .bind(&chunk.data)
        .bind(chunk.timestamp)
        .bind(id)
        .bind(chunk.seq as i64)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Err(self.output_rejection(id, chunk.seq).await);
        }

        sqlx::query("UPDATE executions SET output_bytes = output_bytes + ? WHERE id = ?")
            .bind(chunk.len() as i64)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn request_cancel(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE executions SET cancel_requested = 1 WHERE id = ? AND cancel_requested = 0",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.current_status(id).await? {
            None => Err(AppError::NotFound(format!("Execution {} not found", id))),
            Some(_) => Ok(false),
        }
    }

    async fn find_unfinished(&self) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM executions WHERE status IN ('scheduled', 'running') ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let output = self.load_output(&row.id).await?;
            records.push(row.into_record(output)?);
        }
        Ok(records)
    }

    async fn evict(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let deleted = sqlx::query(&format!(
            "DELETE FROM executions WHERE id = ? AND status IN {}",
            TERMINAL_STATUSES
        ))
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        if deleted.rows_affected() == 0 {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return match self.current_status(id).await? {
                None => Ok(false),
                Some(status) => Err(AppError::InvalidState(format!(
                    "execution {} is still {}",
                    id, status
                ))),
            };
        }

        sqlx::query("DELETE FROM execution_output WHERE execution_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(true)
    }

    async fn evict_finished_before(&self, cutoff_millis: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        sqlx::query(&format!(
            r#"
            DELETE FROM execution_output WHERE execution_id IN (
                SELECT id FROM executions WHERE status IN {} AND completed_at < ?
            )
            "#,
            TERMINAL_STATUSES
        ))
        .bind(cutoff_millis)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let deleted = sqlx::query(&format!(
            "DELETE FROM executions WHERE status IN {} AND completed_at < ?",
            TERMINAL_STATUSES
        ))
        .bind(cutoff_millis)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(deleted.rows_affected())
    }
}

fn parse_status(s: &str) -> Result<ExecutionStatus> {
    ExecutionStatus::from_str(s).map_err(|e| AppError::Store(format!("corrupt status column: {}", e)))
}

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    command: String,
    caller_id: String,
    status: String,
    exit_code: Option<i32>,
    reason: Option<String>,
    output_bytes: i64,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    cancel_requested: bool,
    pid: Option<i64>,
}

impl ExecutionRow {
    fn into_record(self, output: Vec<OutputChunk>) -> Result<ExecutionRecord> {
        Ok(ExecutionRecord {
            status: parse_status(&self.status)?,
            id: self.id,
            command: self.command,
            caller_id: self.caller_id,
            exit_code: self.exit_code,
            reason: self.reason,
            output,
            output_bytes: self.output_bytes as u64,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            cancel_requested: self.cancel_requested,
            pid: self.pid.and_then(|p| u32::try_from(p).ok()),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OutputRow {
    seq: i64,
    stream: String,
    data: Vec<u8>,
    timestamp: i64,
}

impl OutputRow {
    fn into_chunk(self) -> Result<OutputChunk> {
        let stream = StreamKind::from_str(&self.stream)
            .map_err(|e| AppError::Store(format!("corrupt stream column: {}", e)))?;
        Ok(OutputChunk::new(self.seq as u64, stream, self.data, self.timestamp))
    }
}
