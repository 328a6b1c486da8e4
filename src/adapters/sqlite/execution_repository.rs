//! SQLite implementation of the ExecutionStore.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    ActivityAttempt, AttemptStatus, Execution, ExecutionEvent, ExecutionPatch, ExecutionStatus,
};
use crate::domain::ports::ExecutionStore;

use super::{parse_datetime, parse_optional_datetime, parse_uuid};

#[derive(Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_any(&self, execution_id: Uuid) -> DomainResult<Execution> {
        let row: Option<ExecutionRow> = sqlx::query_as(
            "SELECT id, tenant_id, workflow_id, workflow_version, workflow_hash, status,
                    current_step_id, started_at, completed_at, error_message, trigger_context_json
             FROM workflow_executions WHERE id = ?",
        )
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| DomainError::ExecutionNotFound(execution_id.to_string()))?
            .try_into_execution()
    }
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn create_execution(&self, execution: &Execution) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO workflow_executions
                 (id, tenant_id, workflow_id, workflow_version, workflow_hash, status,
                  current_step_id, started_at, completed_at, error_message, trigger_context_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(execution.id.to_string())
        .bind(&execution.tenant_id)
        .bind(execution.workflow_id.to_string())
        .bind(i64::from(execution.workflow_version))
        .bind(&execution.workflow_hash)
        .bind(execution.status.to_string())
        .bind(&execution.current_step_id)
        .bind(execution.started_at.to_rfc3339())
        .bind(execution.completed_at.map(|t| t.to_rfc3339()))
        .bind(&execution.error_message)
        .bind(serde_json::to_string(&execution.trigger_context)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid, tenant_id: &str) -> DomainResult<Execution> {
        let execution = self.load_any(execution_id).await?;
        if execution.tenant_id != tenant_id {
            return Err(DomainError::ExecutionNotFound(execution_id.to_string()));
        }
        Ok(execution)
    }

    /// Applies the patch after enforcing the state machine: transitions out
    /// of a terminal status are rejected, and a repeated terminal patch is
    /// a no-op.
    async fn update_execution(
        &self,
        execution_id: Uuid,
        patch: ExecutionPatch,
    ) -> DomainResult<()> {
        let current = self.load_any(execution_id).await?;

        if let Some(next) = patch.status {
            if next != current.status {
                if current.status.is_terminal() || !current.status.can_transition_to(next) {
                    return Err(DomainError::InvalidStateTransition {
                        from: current.status.to_string(),
                        to: next.to_string(),
                    });
                }
            } else if current.status.is_terminal() {
                // Idempotent repeat of the terminal patch.
                return Ok(());
            }
        } else if current.status.is_terminal() {
            return Err(DomainError::InvalidStateTransition {
                from: current.status.to_string(),
                to: current.status.to_string(),
            });
        }

        let status = patch.status.unwrap_or(current.status);
        let current_step_id = patch.current_step_id.unwrap_or(current.current_step_id);
        let completed_at = patch.completed_at.unwrap_or(current.completed_at);
        let error_message = patch.error_message.unwrap_or(current.error_message);

        sqlx::query(
            "UPDATE workflow_executions
             SET status = ?, current_step_id = ?, completed_at = ?, error_message = ?
             WHERE id = ?",
        )
        .bind(status.to_string())
        .bind(&current_step_id)
        .bind(completed_at.map(|t| t.to_rfc3339()))
        .bind(&error_message)
        .bind(execution_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_attempt(&self, attempt: &ActivityAttempt) -> DomainResult<()> {
        let output_json = attempt.output.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            "INSERT OR REPLACE INTO activity_executions
                 (execution_id, tenant_id, step_id, activity_type, attempt, status,
                  output_json, error_message, error_retryable, started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(attempt.execution_id.to_string())
        .bind(&attempt.tenant_id)
        .bind(&attempt.step_id)
        .bind(&attempt.activity_type)
        .bind(i64::from(attempt.attempt))
        .bind(attempt.status.to_string())
        .bind(output_json)
        .bind(&attempt.error_message)
        .bind(attempt.error_retryable.map(i32::from))
        .bind(attempt.started_at.to_rfc3339())
        .bind(attempt.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_attempts(&self, execution_id: Uuid) -> DomainResult<Vec<ActivityAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            "SELECT execution_id, tenant_id, step_id, activity_type, attempt, status,
                    output_json, error_message, error_retryable, started_at, completed_at
             FROM activity_executions
             WHERE execution_id = ?
             ORDER BY started_at, attempt",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AttemptRow::try_into_attempt).collect()
    }

    async fn append_event(&self, event: &ExecutionEvent) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO execution_events (execution_id, timestamp, event_type, payload_json)
             VALUES (?, ?, ?, ?)",
        )
        .bind(event.execution_id.to_string())
        .bind(event.timestamp.to_rfc3339())
        .bind(event.event_type.to_string())
        .bind(serde_json::to_string(&event.payload)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_events(&self, execution_id: Uuid) -> DomainResult<Vec<ExecutionEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT execution_id, timestamp, event_type, payload_json
             FROM execution_events
             WHERE execution_id = ?
             ORDER BY timestamp, id",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::try_into_event).collect()
    }

    async fn count_live_for_workflow(
        &self,
        workflow_id: Uuid,
        tenant_id: &str,
    ) -> DomainResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM workflow_executions
             WHERE workflow_id = ? AND tenant_id = ?
               AND status IN ('PENDING', 'RUNNING', 'PAUSED')",
        )
        .bind(workflow_id.to_string())
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}

// ============================================================================
// Row types
// ============================================================================

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    tenant_id: String,
    workflow_id: String,
    workflow_version: i64,
    workflow_hash: String,
    status: String,
    current_step_id: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    error_message: Option<String>,
    trigger_context_json: Option<String>,
}

impl ExecutionRow {
    fn try_into_execution(self) -> DomainResult<Execution> {
        let status = self
            .status
            .parse::<ExecutionStatus>()
            .map_err(DomainError::Serialization)?;
        let trigger_context = match self.trigger_context_json {
            Some(json) => serde_json::from_str(&json)?,
            None => serde_json::Value::Null,
        };

        Ok(Execution {
            id: parse_uuid(&self.id)?,
            tenant_id: self.tenant_id,
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_version: u32::try_from(self.workflow_version)
                .map_err(|e| DomainError::Serialization(e.to_string()))?,
            workflow_hash: self.workflow_hash,
            status,
            current_step_id: self.current_step_id,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: parse_optional_datetime(self.completed_at)?,
            error_message: self.error_message,
            trigger_context,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    execution_id: String,
    tenant_id: String,
    step_id: String,
    activity_type: String,
    attempt: i64,
    status: String,
    output_json: Option<String>,
    error_message: Option<String>,
    error_retryable: Option<i32>,
    started_at: String,
    completed_at: Option<String>,
}

impl AttemptRow {
    fn try_into_attempt(self) -> DomainResult<ActivityAttempt> {
        let status = self
            .status
            .parse::<AttemptStatus>()
            .map_err(DomainError::Serialization)?;
        let output = self.output_json.as_deref().map(serde_json::from_str).transpose()?;

        Ok(ActivityAttempt {
            execution_id: parse_uuid(&self.execution_id)?,
            tenant_id: self.tenant_id,
            step_id: self.step_id,
            activity_type: self.activity_type,
            attempt: u32::try_from(self.attempt)
                .map_err(|e| DomainError::Serialization(e.to_string()))?,
            status,
            output,
            error_message: self.error_message,
            error_retryable: self.error_retryable.map(|v| v != 0),
            started_at: parse_datetime(&self.started_at)?,
            completed_at: parse_optional_datetime(self.completed_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    execution_id: String,
    timestamp: String,
    event_type: String,
    payload_json: String,
}

impl EventRow {
    fn try_into_event(self) -> DomainResult<ExecutionEvent> {
        let event_type = self
            .event_type
            .parse()
            .map_err(DomainError::Serialization)?;

        Ok(ExecutionEvent {
            execution_id: parse_uuid(&self.execution_id)?,
            timestamp: parse_datetime(&self.timestamp)?,
            event_type,
            payload: serde_json::from_str(&self.payload_json)?,
        })
    }
}
