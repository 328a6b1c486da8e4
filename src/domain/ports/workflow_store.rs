//! Workflow catalogue port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Workflow, WorkflowDefinition, WorkflowStatus};

/// Metadata fields that may mutate without a new version. A `None` leaves
/// the field untouched.
#[derive(Debug, Clone, Default)]
pub struct WorkflowMetaPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub status: Option<WorkflowStatus>,
}

/// Persistence for versioned workflow definitions.
///
/// Definitions are immutable once written: `new_version` appends a row with
/// `version = prev + 1`; `update_meta` touches name/description/status only.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// List the latest version of every workflow for a tenant.
    async fn find_all(
        &self,
        tenant_id: &str,
        status: Option<WorkflowStatus>,
    ) -> DomainResult<Vec<Workflow>>;

    /// Latest version of a workflow. `WorkflowNotFound` when absent.
    async fn find_one(&self, id: Uuid, tenant_id: &str) -> DomainResult<Workflow>;

    /// A specific version, as snapshotted by an execution.
    async fn find_version(&self, id: Uuid, tenant_id: &str, version: u32) -> DomainResult<Workflow>;

    /// Insert version 1. `Conflict` when the tenant already has a workflow
    /// with the same content hash.
    async fn create(&self, workflow: &Workflow) -> DomainResult<()>;

    async fn update_meta(
        &self,
        id: Uuid,
        tenant_id: &str,
        patch: WorkflowMetaPatch,
    ) -> DomainResult<Workflow>;

    /// Append a new immutable version.
    async fn new_version(
        &self,
        id: Uuid,
        tenant_id: &str,
        definition: &WorkflowDefinition,
        hash: &str,
        prev_version: u32,
    ) -> DomainResult<Workflow>;

    /// Delete all versions. `Conflict` while any PENDING/RUNNING/PAUSED
    /// execution references the workflow.
    async fn delete(&self, id: Uuid, tenant_id: &str) -> DomainResult<()>;
}
