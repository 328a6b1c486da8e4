//! Workflow catalogue operations: create, version, mutate metadata,
//! delete. Definitions are normalised, validated and content-hashed on
//! every write; published versions are immutable.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Workflow, WorkflowDefinition, WorkflowStatus};
use crate::domain::ports::{WorkflowMetaPatch, WorkflowStore};
use crate::services::validator::{self, DagValidator, ValidationReport};

pub struct WorkflowService {
    store: Arc<dyn WorkflowStore>,
    validator: DagValidator,
}

impl WorkflowService {
    pub fn new(store: Arc<dyn WorkflowStore>, validator: DagValidator) -> Self {
        Self { store, validator }
    }

    /// Dry-run validation, surfaced to authoring UIs.
    pub async fn validate(
        &self,
        tenant_id: &str,
        definition: &WorkflowDefinition,
    ) -> ValidationReport {
        self.validator.validate(tenant_id, definition).await
    }

    /// Normalise, validate, hash and persist version 1 of a new workflow.
    #[instrument(skip(self, definition))]
    pub async fn create(
        &self,
        tenant_id: &str,
        name: &str,
        description: Option<String>,
        mut definition: WorkflowDefinition,
    ) -> DomainResult<Workflow> {
        validator::normalize(&mut definition);

        let report = self.validator.validate(tenant_id, &definition).await;
        if !report.valid {
            return Err(DomainError::Validation(report.error_summary()));
        }

        let hash = validator::content_hash(&definition)?;
        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            description,
            status: WorkflowStatus::Draft,
            version: 1,
            hash,
            definition,
            created_at: now,
            updated_at: now,
        };

        self.store.create(&workflow).await?;
        info!(workflow_id = %workflow.id, hash = %workflow.hash, "workflow created");
        Ok(workflow)
    }

    /// Publish a new immutable version. An unchanged definition (same
    /// content hash) is a no-op returning the current head.
    #[instrument(skip(self, definition), fields(%id))]
    pub async fn new_version(
        &self,
        id: Uuid,
        tenant_id: &str,
        mut definition: WorkflowDefinition,
    ) -> DomainResult<Workflow> {
        validator::normalize(&mut definition);

        let report = self.validator.validate(tenant_id, &definition).await;
        if !report.valid {
            return Err(DomainError::Validation(report.error_summary()));
        }

        let head = self.store.find_one(id, tenant_id).await?;
        let hash = validator::content_hash(&definition)?;
        if hash == head.hash {
            return Ok(head);
        }

        let workflow =
            self.store.new_version(id, tenant_id, &definition, &hash, head.version).await?;
        info!(workflow_id = %id, version = workflow.version, "workflow version published");
        Ok(workflow)
    }

    pub async fn find_all(
        &self,
        tenant_id: &str,
        status: Option<WorkflowStatus>,
    ) -> DomainResult<Vec<Workflow>> {
        self.store.find_all(tenant_id, status).await
    }

    pub async fn find_one(&self, id: Uuid, tenant_id: &str) -> DomainResult<Workflow> {
        self.store.find_one(id, tenant_id).await
    }

    /// Mutate name/description/status in place; version and hash are
    /// untouched.
    pub async fn update_meta(
        &self,
        id: Uuid,
        tenant_id: &str,
        patch: WorkflowMetaPatch,
    ) -> DomainResult<Workflow> {
        self.store.update_meta(id, tenant_id, patch).await
    }

    /// Delete all versions; the store rejects while live executions
    /// reference the workflow.
    pub async fn delete(&self, id: Uuid, tenant_id: &str) -> DomainResult<()> {
        self.store.delete(id, tenant_id).await?;
        info!(workflow_id = %id, "workflow deleted");
        Ok(())
    }
}
