//! Control-plane facade: the trigger/pause/resume/cancel surface consumed
//! by the HTTP layer, wired through admission, the tier queues, and the
//! orchestrator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    ActivityAttempt, Execution, ExecutionEvent, ExecutionStatus, WorkflowStatus,
};
use crate::domain::ports::{ExecutionStore, WorkflowStore};
use crate::services::admission::{AdmissionController, AdmissionStats, ExecutionJob, TierQueues};
use crate::services::orchestrator::Orchestrator;

/// Options accepted by `trigger_workflow`.
#[derive(Debug, Clone)]
pub struct TriggerOptions {
    pub trigger_context: Option<Value>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub immediate: bool,
}

impl Default for TriggerOptions {
    fn default() -> Self {
        Self { trigger_context: None, scheduled_for: None, immediate: true }
    }
}

#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
}

/// Execution row plus its attempts and ordered event log.
#[derive(Debug, Clone)]
pub struct ExecutionDetails {
    pub execution: Execution,
    pub attempts: Vec<ActivityAttempt>,
    pub events: Vec<ExecutionEvent>,
}

pub struct ControlPlane {
    workflows: Arc<dyn WorkflowStore>,
    executions: Arc<dyn ExecutionStore>,
    admission: Arc<AdmissionController>,
    orchestrator: Arc<Orchestrator>,
    queues: TierQueues,
}

impl ControlPlane {
    /// Wire the facade and spawn the tier worker pools. Workers load the
    /// execution's snapshotted definition version and drive it.
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        executions: Arc<dyn ExecutionStore>,
        admission: Arc<AdmissionController>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        let queues = {
            let workflows = Arc::clone(&workflows);
            let executions = Arc::clone(&executions);
            let orchestrator = Arc::clone(&orchestrator);
            TierQueues::spawn(Arc::clone(&admission), move |job: ExecutionJob| {
                let workflows = Arc::clone(&workflows);
                let executions = Arc::clone(&executions);
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    if let Err(e) = run_job(&workflows, &executions, &orchestrator, &job).await {
                        error!(execution_id = %job.execution_id, error = %e, "execution job failed");
                    }
                }
            })
        };

        Self { workflows, executions, admission, orchestrator, queues }
    }

    /// Admit and enqueue a new execution of the workflow's current version.
    #[instrument(skip(self, options), fields(%workflow_id, tenant_id))]
    pub async fn trigger_workflow(
        &self,
        workflow_id: Uuid,
        tenant_id: &str,
        options: TriggerOptions,
    ) -> DomainResult<TriggerOutcome> {
        let workflow = self.workflows.find_one(workflow_id, tenant_id).await?;
        if workflow.status != WorkflowStatus::Active {
            return Err(DomainError::Conflict(format!(
                "workflow is {}, not ACTIVE",
                workflow.status
            )));
        }
        if workflow.definition.root_steps().is_empty() {
            return Err(DomainError::Validation("no root steps".to_string()));
        }

        // Admission errors surface to the caller; no execution row exists
        // for a rejected trigger.
        let tier = self.admission.check(tenant_id)?;

        let mut trigger_context = options.trigger_context.unwrap_or(Value::Null);
        if let Some(scheduled_for) = options.scheduled_for {
            if let Value::Object(map) = &mut trigger_context {
                map.insert("scheduledFor".to_string(), Value::String(scheduled_for.to_rfc3339()));
            }
        }

        let execution = Execution {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            workflow_id,
            workflow_version: workflow.version,
            workflow_hash: workflow.hash.clone(),
            status: ExecutionStatus::Pending,
            current_step_id: None,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            trigger_context,
        };
        self.executions.create_execution(&execution).await?;

        let job = ExecutionJob {
            execution_id: execution.id,
            tenant_id: tenant_id.to_string(),
            workflow_id,
            workflow_version: workflow.version,
        };

        if options.immediate {
            self.queues.submit(&self.admission, tier, job);
        } else {
            info!(execution_id = %execution.id, "execution created for deferred start");
        }

        Ok(TriggerOutcome { execution_id: execution.id, status: ExecutionStatus::Pending })
    }

    /// Enqueue a previously created (deferred) execution.
    pub async fn enqueue_pending(&self, execution_id: Uuid, tenant_id: &str) -> DomainResult<()> {
        let execution = self.executions.load_execution(execution_id, tenant_id).await?;
        if execution.status != ExecutionStatus::Pending {
            return Err(DomainError::Conflict(format!(
                "execution is {}, not PENDING",
                execution.status
            )));
        }
        let tier = self.admission.tier_of(tenant_id);
        self.queues.submit(
            &self.admission,
            tier,
            ExecutionJob {
                execution_id,
                tenant_id: tenant_id.to_string(),
                workflow_id: execution.workflow_id,
                workflow_version: execution.workflow_version,
            },
        );
        Ok(())
    }

    pub async fn pause(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
        reason: Option<&str>,
    ) -> DomainResult<Execution> {
        self.orchestrator.pause(execution_id, tenant_id, reason).await
    }

    /// Resume a paused execution and hand it back to its tier queue; the
    /// worker re-enters the traversal loop.
    pub async fn resume(&self, execution_id: Uuid, tenant_id: &str) -> DomainResult<Execution> {
        let execution = self.orchestrator.resume(execution_id, tenant_id).await?;

        let tier = self.admission.tier_of(tenant_id);
        self.queues.submit(
            &self.admission,
            tier,
            ExecutionJob {
                execution_id,
                tenant_id: tenant_id.to_string(),
                workflow_id: execution.workflow_id,
                workflow_version: execution.workflow_version,
            },
        );
        Ok(execution)
    }

    pub async fn cancel(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
        reason: Option<&str>,
    ) -> DomainResult<Execution> {
        self.orchestrator.cancel(execution_id, tenant_id, reason).await
    }

    /// Execution row plus attempts and the ordered event log.
    pub async fn find_one(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
    ) -> DomainResult<ExecutionDetails> {
        let execution = self.executions.load_execution(execution_id, tenant_id).await?;
        let attempts = self.executions.list_attempts(execution_id).await?;
        let events = self.executions.list_events(execution_id).await?;
        Ok(ExecutionDetails { execution, attempts, events })
    }

    pub fn admission_stats(&self, tenant_id: &str) -> AdmissionStats {
        self.admission.stats(tenant_id)
    }

    /// Stop accepting work and return worker handles for draining.
    pub fn shutdown(self) -> Vec<tokio::task::JoinHandle<()>> {
        self.queues.shutdown()
    }
}

/// Drive one admitted execution. Pending executions start; running or
/// cancelling ones (resume, node restart) re-enter the traversal loop.
async fn run_job(
    workflows: &Arc<dyn WorkflowStore>,
    executions: &Arc<dyn ExecutionStore>,
    orchestrator: &Arc<Orchestrator>,
    job: &ExecutionJob,
) -> DomainResult<()> {
    let workflow =
        workflows.find_version(job.workflow_id, &job.tenant_id, job.workflow_version).await?;
    let execution = executions.load_execution(job.execution_id, &job.tenant_id).await?;

    match execution.status {
        ExecutionStatus::Pending => {
            orchestrator
                .start_execution(job.execution_id, &job.tenant_id, &workflow.definition)
                .await
        }
        ExecutionStatus::Running | ExecutionStatus::Cancelling => {
            orchestrator.drive(job.execution_id, &job.tenant_id, &workflow.definition).await
        }
        status => {
            info!(execution_id = %job.execution_id, %status, "job skipped; nothing to drive");
            Ok(())
        }
    }
}
