//! Execution orchestrator: DAG traversal, the execution state machine,
//! and outcome application.
//!
//! The reference traversal is sequential: one ready step at a time, chosen
//! in definition order. Readiness is a pure predicate over completed
//! steps, so a parallel scheduler can replace the loop without changing
//! any persisted contract.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult, HandlerError};
use crate::domain::models::{
    ActivityAttempt, AttemptStatus, EngineConfig, Execution, ExecutionPatch, ExecutionState,
    ExecutionStatus, Step, WorkflowDefinition,
};
use crate::domain::ports::ExecutionStore;
use crate::services::dispatcher::ActivityDispatcher;
use crate::services::event_log::EventLogger;

/// Retry policy for retryable handler errors.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Retries after the first attempt; an activity may declare its own cap.
    pub max_retries: u32,
    /// First retry delay; doubles per subsequent retry.
    pub retry_base_delay: Duration,
}

impl From<&EngineConfig> for OrchestratorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_activity_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

pub struct Orchestrator {
    store: Arc<dyn ExecutionStore>,
    events: EventLogger,
    dispatcher: Arc<ActivityDispatcher>,
    config: OrchestratorConfig,
}

enum StepOutcome {
    Completed,
    ExecutionFailed,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        events: EventLogger,
        dispatcher: Arc<ActivityDispatcher>,
        config: OrchestratorConfig,
    ) -> Self {
        Self { store, events, dispatcher, config }
    }

    /// Start a pending execution and drive it until it parks (paused) or
    /// reaches a terminal status.
    #[instrument(skip(self, definition), fields(execution_id = %execution_id))]
    pub async fn start_execution(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
        definition: &WorkflowDefinition,
    ) -> DomainResult<()> {
        let execution = self.store.load_execution(execution_id, tenant_id).await?;
        self.events.execution_started(execution_id, execution.workflow_version).await?;

        let roots = definition.root_steps();
        let Some(first_root) = roots.first() else {
            self.fail_execution(execution_id, tenant_id, "no root steps").await?;
            return Err(DomainError::Validation("no root steps".to_string()));
        };

        self.store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Running),
                    current_step_id: Some(Some(first_root.id.clone())),
                    ..ExecutionPatch::default()
                },
            )
            .await?;

        self.drive(execution_id, tenant_id, definition).await
    }

    /// Re-enter the traversal loop for a resumed execution.
    pub async fn drive(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
        definition: &WorkflowDefinition,
    ) -> DomainResult<()> {
        loop {
            // Re-read persisted status every iteration so pause and cancel
            // requested from outside take effect at the step boundary.
            let execution = self.store.load_execution(execution_id, tenant_id).await?;
            match execution.status {
                ExecutionStatus::Paused => return Ok(()),
                ExecutionStatus::Cancelling => {
                    self.finalize_cancel(execution_id).await?;
                    return Ok(());
                }
                status if status.is_terminal() => return Ok(()),
                _ => {}
            }

            let attempts = self.store.list_attempts(execution_id).await?;
            let state = ExecutionState::reconstruct(&execution, &attempts);

            // A step whose latest attempt failed retryably is deliberately
            // still a candidate here; only completion removes it.
            let next = definition
                .steps
                .iter()
                .find(|s| !state.completed_steps.contains(&s.id) && state.is_ready(&s.depends_on));

            let Some(step) = next else {
                if definition.steps.iter().all(|s| state.completed_steps.contains(&s.id)) {
                    self.complete_execution(execution_id, &state).await?;
                } else {
                    // Unsettled steps with no ready candidate: a failed
                    // dependency already drove the execution terminal, or
                    // the definition was tampered with after snapshot.
                    warn!(%execution_id, "no ready step and not all steps completed");
                    self.fail_execution(execution_id, tenant_id, "traversal stuck: no ready step")
                        .await?;
                }
                return Ok(());
            };

            let prior_attempts = attempts
                .iter()
                .filter(|a| a.step_id == step.id)
                .map(|a| a.attempt)
                .max()
                .unwrap_or(0);

            match self
                .run_step(&execution, definition, step, &state, prior_attempts + 1)
                .await?
            {
                StepOutcome::Completed => {}
                StepOutcome::ExecutionFailed => return Ok(()),
            }
        }
    }

    /// One attempt at a step, including the retry schedule for retryable
    /// failures. Event/attempt ordering per attempt is: `STEP_STARTED` ->
    /// attempt RUNNING -> handler -> attempt update -> step event.
    async fn run_step(
        &self,
        execution: &Execution,
        definition: &WorkflowDefinition,
        step: &Step,
        state: &ExecutionState,
        attempt_number: u32,
    ) -> DomainResult<StepOutcome> {
        let execution_id = execution.id;
        let Some(activity) = definition.activity(&step.activity_id) else {
            self.fail_execution(
                execution_id,
                &execution.tenant_id,
                &format!("step \"{}\" references unknown activity", step.id),
            )
            .await?;
            return Ok(StepOutcome::ExecutionFailed);
        };
        let max_retries = activity.retry_max.unwrap_or(self.config.max_retries);

        self.store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    current_step_id: Some(Some(step.id.clone())),
                    ..ExecutionPatch::default()
                },
            )
            .await?;

        self.events
            .step_started(execution_id, &step.id, activity.kind(), attempt_number)
            .await?;

        let mut attempt = ActivityAttempt {
            execution_id,
            tenant_id: execution.tenant_id.clone(),
            step_id: step.id.clone(),
            activity_type: activity.kind().to_string(),
            attempt: attempt_number,
            status: AttemptStatus::Running,
            output: None,
            error_message: None,
            error_retryable: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.store.record_attempt(&attempt).await?;

        let result = match ActivityDispatcher::gather_inputs(definition, step, state) {
            Ok(inputs) => {
                self.dispatcher.dispatch(definition, execution, step, activity, &inputs).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(output) => {
                attempt.status = AttemptStatus::Completed;
                attempt.output = Some(output);
                attempt.completed_at = Some(Utc::now());
                self.store.record_attempt(&attempt).await?;
                self.events.step_completed(execution_id, &step.id).await?;
                Ok(StepOutcome::Completed)
            }
            Err(error) => {
                self.on_activity_failed(execution, step, attempt, &error, max_retries).await
            }
        }
    }

    /// Record the failed attempt and either schedule a retry or drive the
    /// execution to FAILED.
    async fn on_activity_failed(
        &self,
        execution: &Execution,
        step: &Step,
        mut attempt: ActivityAttempt,
        error: &HandlerError,
        max_retries: u32,
    ) -> DomainResult<StepOutcome> {
        let execution_id = execution.id;

        attempt.status = AttemptStatus::Failed;
        attempt.error_message = Some(error.to_string());
        attempt.error_retryable = Some(error.retryable);
        attempt.completed_at = Some(Utc::now());
        self.store.record_attempt(&attempt).await?;

        self.events
            .step_failed(execution_id, &step.id, &error.to_string(), error.retryable)
            .await?;

        if !error.retryable {
            self.fail_execution(execution_id, &execution.tenant_id, &error.to_string()).await?;
            return Ok(StepOutcome::ExecutionFailed);
        }

        if attempt.attempt > max_retries {
            self.fail_execution(
                execution_id,
                &execution.tenant_id,
                &format!("retries exhausted: {error}"),
            )
            .await?;
            return Ok(StepOutcome::ExecutionFailed);
        }

        // Exponential backoff: base, 2x, 4x, ...
        let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt.attempt - 1);
        self.events
            .activity_retry(execution_id, &step.id, attempt.attempt + 1, delay.as_millis() as u64)
            .await?;
        info!(
            %execution_id,
            step_id = %step.id,
            next_attempt = attempt.attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "retrying step after transient failure"
        );
        tokio::time::sleep(delay).await;

        // The drive loop re-reads status before the next attempt, so a
        // pause or cancel issued during the backoff wins.
        Ok(StepOutcome::Completed)
    }

    // ========================================================================
    // Lifecycle transitions
    // ========================================================================

    /// Pause a pending or running execution. In-flight attempts run to
    /// completion; no new steps are started.
    pub async fn pause(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
        reason: Option<&str>,
    ) -> DomainResult<Execution> {
        let execution = self.store.load_execution(execution_id, tenant_id).await?;
        if !execution.status.can_transition_to(ExecutionStatus::Paused) {
            return Err(DomainError::Conflict(format!(
                "cannot pause execution in status {}",
                execution.status
            )));
        }

        self.events.execution_paused(execution_id, reason).await?;
        self.store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Paused),
                    ..ExecutionPatch::default()
                },
            )
            .await?;
        self.store.load_execution(execution_id, tenant_id).await
    }

    /// Resume a paused execution. The caller re-enters `drive` afterwards.
    pub async fn resume(&self, execution_id: Uuid, tenant_id: &str) -> DomainResult<Execution> {
        let execution = self.store.load_execution(execution_id, tenant_id).await?;
        if execution.status != ExecutionStatus::Paused {
            return Err(DomainError::Conflict(format!(
                "cannot resume execution in status {}",
                execution.status
            )));
        }

        self.events.execution_resumed(execution_id).await?;
        self.store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Running),
                    ..ExecutionPatch::default()
                },
            )
            .await?;
        self.store.load_execution(execution_id, tenant_id).await
    }

    /// Request cancellation. A running execution turns CANCELLING and the
    /// traversal loop finalises it at the next step boundary; an idle one
    /// (pending/paused) is finalised here.
    pub async fn cancel(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
        reason: Option<&str>,
    ) -> DomainResult<Execution> {
        let execution = self.store.load_execution(execution_id, tenant_id).await?;
        if !execution.status.can_transition_to(ExecutionStatus::Cancelling) {
            return Err(DomainError::Conflict(format!(
                "cannot cancel execution in status {}",
                execution.status
            )));
        }

        self.store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Cancelling),
                    ..ExecutionPatch::default()
                },
            )
            .await?;

        let idle = matches!(
            execution.status,
            ExecutionStatus::Pending | ExecutionStatus::Paused
        );
        if idle {
            self.finalize_cancel_with_reason(execution_id, reason).await?;
        }

        self.store.load_execution(execution_id, tenant_id).await
    }

    async fn finalize_cancel(&self, execution_id: Uuid) -> DomainResult<()> {
        self.finalize_cancel_with_reason(execution_id, None).await
    }

    async fn finalize_cancel_with_reason(
        &self,
        execution_id: Uuid,
        reason: Option<&str>,
    ) -> DomainResult<()> {
        self.events.execution_cancelled(execution_id, reason).await?;
        self.store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Cancelled),
                    current_step_id: Some(None),
                    completed_at: Some(Some(Utc::now())),
                    ..ExecutionPatch::default()
                },
            )
            .await?;
        info!(%execution_id, "execution cancelled");
        Ok(())
    }

    async fn complete_execution(
        &self,
        execution_id: Uuid,
        state: &ExecutionState,
    ) -> DomainResult<()> {
        let mut completed: Vec<String> = state.completed_steps.iter().cloned().collect();
        completed.sort();

        self.events.execution_completed(execution_id, &completed).await?;
        let update = self
            .store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Completed),
                    current_step_id: Some(None),
                    completed_at: Some(Some(Utc::now())),
                    ..ExecutionPatch::default()
                },
            )
            .await;

        match update {
            Ok(()) => {
                info!(%execution_id, "execution completed");
                Ok(())
            }
            // Lost the race against a cancel request; the cancel wins.
            Err(DomainError::InvalidStateTransition { .. }) => {
                self.finalize_cancel(execution_id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn fail_execution(
        &self,
        execution_id: Uuid,
        _tenant_id: &str,
        message: &str,
    ) -> DomainResult<()> {
        self.events.execution_failed(execution_id, message).await?;
        let update = self
            .store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Failed),
                    current_step_id: Some(None),
                    completed_at: Some(Some(Utc::now())),
                    error_message: Some(Some(message.to_string())),
                },
            )
            .await;

        match update {
            Ok(()) => {
                warn!(%execution_id, message, "execution failed");
                Ok(())
            }
            Err(DomainError::InvalidStateTransition { .. }) => {
                self.finalize_cancel(execution_id).await
            }
            Err(e) => Err(e),
        }
    }
}
