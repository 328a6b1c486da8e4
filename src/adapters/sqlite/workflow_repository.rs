//! SQLite implementation of the WorkflowStore.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Workflow, WorkflowDefinition, WorkflowStatus};
use crate::domain::ports::{WorkflowMetaPatch, WorkflowStore};

use super::{parse_datetime, parse_uuid};

#[derive(Clone)]
pub struct SqliteWorkflowStore {
    pool: SqlitePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const COLUMNS: &str = "id, tenant_id, version, name, description, status, hash, \
                       definition_json, created_at, updated_at";

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    async fn find_all(
        &self,
        tenant_id: &str,
        status: Option<WorkflowStatus>,
    ) -> DomainResult<Vec<Workflow>> {
        // Latest version per workflow id.
        let sql = format!(
            "SELECT {COLUMNS} FROM workflow_definitions w
             WHERE tenant_id = ?
               AND version = (SELECT MAX(version) FROM workflow_definitions
                              WHERE id = w.id AND tenant_id = w.tenant_id)
             ORDER BY name"
        );
        let rows: Vec<WorkflowRow> =
            sqlx::query_as(&sql).bind(tenant_id).fetch_all(&self.pool).await?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in rows {
            let workflow = row.try_into_workflow()?;
            if status.is_none_or(|s| workflow.status == s) {
                workflows.push(workflow);
            }
        }
        Ok(workflows)
    }

    async fn find_one(&self, id: Uuid, tenant_id: &str) -> DomainResult<Workflow> {
        let sql = format!(
            "SELECT {COLUMNS} FROM workflow_definitions
             WHERE id = ? AND tenant_id = ?
             ORDER BY version DESC LIMIT 1"
        );
        let row: Option<WorkflowRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| DomainError::WorkflowNotFound(id.to_string()))?.try_into_workflow()
    }

    async fn find_version(
        &self,
        id: Uuid,
        tenant_id: &str,
        version: u32,
    ) -> DomainResult<Workflow> {
        let sql = format!(
            "SELECT {COLUMNS} FROM workflow_definitions
             WHERE id = ? AND tenant_id = ? AND version = ?"
        );
        let row: Option<WorkflowRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .bind(tenant_id)
            .bind(i64::from(version))
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| DomainError::WorkflowNotFound(format!("{id} v{version}")))?
            .try_into_workflow()
    }

    async fn create(&self, workflow: &Workflow) -> DomainResult<()> {
        let definition_json = serde_json::to_string(&workflow.definition)?;

        let result = sqlx::query(
            "INSERT INTO workflow_definitions
                 (id, tenant_id, version, name, description, status, hash,
                  definition_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.tenant_id)
        .bind(i64::from(workflow.version))
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.status.to_string())
        .bind(&workflow.hash)
        .bind(&definition_json)
        .bind(workflow.created_at.to_rfc3339())
        .bind(workflow.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(DomainError::Conflict(format!(
                "a workflow with hash {} already exists for this tenant",
                workflow.hash
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_meta(
        &self,
        id: Uuid,
        tenant_id: &str,
        patch: WorkflowMetaPatch,
    ) -> DomainResult<Workflow> {
        let head = self.find_one(id, tenant_id).await?;

        let name = patch.name.unwrap_or(head.name);
        let description = patch.description.unwrap_or(head.description);
        let status = patch.status.unwrap_or(head.status);

        // Metadata applies to every version of the workflow.
        sqlx::query(
            "UPDATE workflow_definitions
             SET name = ?, description = ?, status = ?, updated_at = ?
             WHERE id = ? AND tenant_id = ?",
        )
        .bind(&name)
        .bind(&description)
        .bind(status.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        self.find_one(id, tenant_id).await
    }

    async fn new_version(
        &self,
        id: Uuid,
        tenant_id: &str,
        definition: &WorkflowDefinition,
        hash: &str,
        prev_version: u32,
    ) -> DomainResult<Workflow> {
        let head = self.find_one(id, tenant_id).await?;
        let definition_json = serde_json::to_string(definition)?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO workflow_definitions
                 (id, tenant_id, version, name, description, status, hash,
                  definition_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(tenant_id)
        .bind(i64::from(prev_version + 1))
        .bind(&head.name)
        .bind(&head.description)
        .bind(head.status.to_string())
        .bind(hash)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.find_version(id, tenant_id, prev_version + 1).await
    }

    async fn delete(&self, id: Uuid, tenant_id: &str) -> DomainResult<()> {
        let (live,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM workflow_executions
             WHERE workflow_id = ? AND tenant_id = ?
               AND status IN ('PENDING', 'RUNNING', 'PAUSED')",
        )
        .bind(id.to_string())
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;

        if live > 0 {
            return Err(DomainError::Conflict(format!(
                "{live} execution(s) still reference workflow {id}"
            )));
        }

        let result = sqlx::query("DELETE FROM workflow_definitions WHERE id = ? AND tenant_id = ?")
            .bind(id.to_string())
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::WorkflowNotFound(id.to_string()));
        }
        Ok(())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

// ============================================================================
// Row types
// ============================================================================

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: String,
    tenant_id: String,
    version: i64,
    name: String,
    description: Option<String>,
    status: String,
    hash: String,
    definition_json: String,
    created_at: String,
    updated_at: String,
}

impl WorkflowRow {
    fn try_into_workflow(self) -> DomainResult<Workflow> {
        let status = self
            .status
            .parse::<WorkflowStatus>()
            .map_err(DomainError::Serialization)?;

        Ok(Workflow {
            id: parse_uuid(&self.id)?,
            tenant_id: self.tenant_id,
            name: self.name,
            description: self.description,
            status,
            version: u32::try_from(self.version)
                .map_err(|e| DomainError::Serialization(e.to_string()))?,
            hash: self.hash,
            definition: serde_json::from_str(&self.definition_json)?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}
