//! Durable append layer for execution events.
//!
//! Every state-affecting decision appends an event before the execution
//! row's new status becomes externally visible; the log is the canonical
//! history for replay and audit.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{EventType, ExecutionEvent};
use crate::domain::ports::ExecutionStore;

#[derive(Clone)]
pub struct EventLogger {
    store: Arc<dyn ExecutionStore>,
}

impl EventLogger {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    pub async fn append(
        &self,
        execution_id: Uuid,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> DomainResult<()> {
        debug!(%execution_id, event = %event_type, "appending execution event");
        self.store
            .append_event(&ExecutionEvent::new(execution_id, event_type, payload))
            .await
    }

    pub async fn execution_started(
        &self,
        execution_id: Uuid,
        workflow_version: u32,
    ) -> DomainResult<()> {
        self.append(
            execution_id,
            EventType::ExecutionStarted,
            json!({ "workflowVersion": workflow_version }),
        )
        .await
    }

    pub async fn step_started(
        &self,
        execution_id: Uuid,
        step_id: &str,
        activity_type: &str,
        attempt: u32,
    ) -> DomainResult<()> {
        self.append(
            execution_id,
            EventType::StepStarted,
            json!({ "stepId": step_id, "activityType": activity_type, "attempt": attempt }),
        )
        .await
    }

    pub async fn step_completed(&self, execution_id: Uuid, step_id: &str) -> DomainResult<()> {
        self.append(execution_id, EventType::StepCompleted, json!({ "stepId": step_id })).await
    }

    pub async fn step_failed(
        &self,
        execution_id: Uuid,
        step_id: &str,
        error: &str,
        retryable: bool,
    ) -> DomainResult<()> {
        self.append(
            execution_id,
            EventType::StepFailed,
            json!({ "stepId": step_id, "error": error, "retryable": retryable }),
        )
        .await
    }

    pub async fn activity_retry(
        &self,
        execution_id: Uuid,
        step_id: &str,
        next_attempt: u32,
        delay_ms: u64,
    ) -> DomainResult<()> {
        self.append(
            execution_id,
            EventType::ActivityRetry,
            json!({ "stepId": step_id, "nextAttempt": next_attempt, "delayMs": delay_ms }),
        )
        .await
    }

    pub async fn execution_paused(
        &self,
        execution_id: Uuid,
        reason: Option<&str>,
    ) -> DomainResult<()> {
        self.append(execution_id, EventType::ExecutionPaused, json!({ "reason": reason })).await
    }

    pub async fn execution_resumed(&self, execution_id: Uuid) -> DomainResult<()> {
        self.append(execution_id, EventType::ExecutionResumed, json!({})).await
    }

    pub async fn execution_cancelled(
        &self,
        execution_id: Uuid,
        reason: Option<&str>,
    ) -> DomainResult<()> {
        self.append(execution_id, EventType::ExecutionCancelled, json!({ "reason": reason })).await
    }

    pub async fn execution_completed(
        &self,
        execution_id: Uuid,
        completed_steps: &[String],
    ) -> DomainResult<()> {
        self.append(
            execution_id,
            EventType::ExecutionCompleted,
            json!({ "completedSteps": completed_steps }),
        )
        .await
    }

    pub async fn execution_failed(&self, execution_id: Uuid, error: &str) -> DomainResult<()> {
        self.append(execution_id, EventType::ExecutionFailed, json!({ "error": error })).await
    }
}
