//! Execution persistence port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{ActivityAttempt, Execution, ExecutionEvent, ExecutionPatch};

/// Typed access to persisted execution, activity-attempt, and event rows.
///
/// Implementations must reject status transitions out of terminal states in
/// `update_execution`, and keep `append_event` strictly append-only.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, execution: &Execution) -> DomainResult<()>;

    /// Tenant-scoped load. `ExecutionNotFound` when absent or owned by a
    /// different tenant.
    async fn load_execution(&self, execution_id: Uuid, tenant_id: &str) -> DomainResult<Execution>;

    /// Apply a patch. `InvalidStateTransition` when the patch would move the
    /// row out of a terminal status; identical terminal patches are no-ops.
    async fn update_execution(&self, execution_id: Uuid, patch: ExecutionPatch)
        -> DomainResult<()>;

    /// Upsert on `(execution_id, step_id, attempt)`.
    async fn record_attempt(&self, attempt: &ActivityAttempt) -> DomainResult<()>;

    async fn list_attempts(&self, execution_id: Uuid) -> DomainResult<Vec<ActivityAttempt>>;

    async fn append_event(&self, event: &ExecutionEvent) -> DomainResult<()>;

    /// Events ordered by timestamp, ties broken by insertion order.
    async fn list_events(&self, execution_id: Uuid) -> DomainResult<Vec<ExecutionEvent>>;

    /// Executions in PENDING/RUNNING/PAUSED referencing a workflow; guards
    /// workflow deletion.
    async fn count_live_for_workflow(&self, workflow_id: Uuid, tenant_id: &str)
        -> DomainResult<u64>;
}
