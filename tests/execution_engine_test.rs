//! End-to-end engine scenarios: trigger through admission and the tier
//! queues, DAG traversal, retries, pause/resume, cancellation, and the
//! event log.

mod common;

use std::sync::Arc;

use common::{
    etl_definition, extract_activity, harness, harness_with_sandbox, load_activity, step,
    GatedSandbox,
};
use vectormesh::domain::errors::DomainError;
use vectormesh::domain::models::{
    AttemptStatus, EventType, ExecutionState, ExecutionStatus, WorkflowDefinition,
};
use vectormesh::domain::ports::{ExecutionStore, WorkflowStore};
use vectormesh::services::TriggerOptions;

#[tokio::test]
async fn etl_pipeline_runs_to_completion() {
    let h = harness().await;
    h.seed_instance("t1").await;
    let workflow = h.seed_workflow("t1", etl_definition()).await;

    let outcome = h
        .control
        .trigger_workflow(workflow.id, "t1", TriggerOptions::default())
        .await
        .expect("trigger");
    assert_eq!(outcome.status, ExecutionStatus::Pending);

    let execution =
        h.wait_for_status(outcome.execution_id, "t1", ExecutionStatus::Completed).await;
    assert!(execution.completed_at.is_some());
    assert_eq!(execution.current_step_id, None);
    assert_eq!(execution.workflow_hash, workflow.hash);

    // Every step completed, and the load saw the transformed rows.
    let attempts = h.executions.list_attempts(outcome.execution_id).await.unwrap();
    let mut steps: Vec<_> = attempts.iter().map(|a| a.step_id.as_str()).collect();
    steps.sort_unstable();
    assert_eq!(steps, vec!["s1", "s2", "s3"]);
    assert!(attempts.iter().all(|a| a.status == AttemptStatus::Completed));

    let load_output = attempts.iter().find(|a| a.step_id == "s3").unwrap().output.clone().unwrap();
    assert_eq!(load_output["rowsProcessed"], 2);
    assert_eq!(load_output["rowsLoaded"], 2);
    assert_eq!(load_output["rowsFailed"], 0);

    let loaded = h.driver.loaded_rows.lock().unwrap().clone();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0]["email"], "A@X");
    assert_eq!(loaded[1]["email"], "B@Y");

    // Exactly one STEP_COMPLETED per step, bracketed by the execution
    // lifecycle events.
    let events = h.executions.list_events(outcome.execution_id).await.unwrap();
    assert_eq!(events.first().unwrap().event_type, EventType::ExecutionStarted);
    assert_eq!(events.last().unwrap().event_type, EventType::ExecutionCompleted);
    let completed: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::StepCompleted)
        .map(|e| e.payload["stepId"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(completed, vec!["s1", "s2", "s3"]);
}

#[tokio::test]
async fn transient_extract_failures_are_retried_until_success() {
    let h = harness().await;
    h.seed_instance("t1").await;
    h.driver.push_query_error("NETWORK_ERROR", "connection reset");
    h.driver.push_query_error("NETWORK_ERROR", "connection reset");
    let workflow = h.seed_workflow("t1", etl_definition()).await;

    let outcome = h
        .control
        .trigger_workflow(workflow.id, "t1", TriggerOptions::default())
        .await
        .unwrap();
    h.wait_for_status(outcome.execution_id, "t1", ExecutionStatus::Completed).await;

    let attempts = h.executions.list_attempts(outcome.execution_id).await.unwrap();
    let mut s1: Vec<_> = attempts.iter().filter(|a| a.step_id == "s1").collect();
    s1.sort_by_key(|a| a.attempt);

    assert_eq!(s1.len(), 3);
    assert_eq!(s1[0].attempt, 1);
    assert_eq!(s1[0].status, AttemptStatus::Failed);
    assert_eq!(s1[0].error_retryable, Some(true));
    assert_eq!(s1[1].attempt, 2);
    assert_eq!(s1[1].status, AttemptStatus::Failed);
    assert_eq!(s1[2].attempt, 3);
    assert_eq!(s1[2].status, AttemptStatus::Completed);

    let events = h.executions.list_events(outcome.execution_id).await.unwrap();
    let retries = events.iter().filter(|e| e.event_type == EventType::ActivityRetry).count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn non_retryable_failure_fails_the_execution_with_handler_message() {
    let h = harness().await;
    h.seed_instance("t1").await;
    // One loaded, one failed: a partial failure is never retried.
    h.driver.load_replies.lock().unwrap().push_back(Ok(
        vectormesh::domain::ports::LoadOutcome {
            loaded: 1,
            failed: 1,
            warnings: vec!["row 1: constraint violation".to_string()],
        },
    ));
    let workflow = h.seed_workflow("t1", etl_definition()).await;

    let outcome = h
        .control
        .trigger_workflow(workflow.id, "t1", TriggerOptions::default())
        .await
        .unwrap();
    let execution = h.wait_for_status(outcome.execution_id, "t1", ExecutionStatus::Failed).await;

    let message = execution.error_message.unwrap();
    assert!(message.starts_with("LOAD_PARTIAL_FAILURE"), "unexpected message: {message}");

    let events = h.executions.list_events(outcome.execution_id).await.unwrap();
    assert_eq!(events.last().unwrap().event_type, EventType::ExecutionFailed);
    let step_failed =
        events.iter().find(|e| e.event_type == EventType::StepFailed).expect("step failed event");
    assert_eq!(step_failed.payload["retryable"], false);
}

#[tokio::test]
async fn diamond_dag_runs_join_point_exactly_once_after_both_branches() {
    let h = harness().await;
    h.seed_instance("t1").await;

    // A -> {B, C} -> D, all reading through the scripted driver.
    let definition = WorkflowDefinition {
        activities: vec![
            extract_activity("a"),
            extract_activity("b"),
            extract_activity("c"),
            load_activity("d", "sink"),
        ],
        steps: vec![
            step("s1", "a", &[]),
            step("s2", "b", &["s1"]),
            step("s3", "c", &["s1"]),
            step("s4", "d", &["s2", "s3"]),
        ],
        schedule: None,
    };
    let workflow = h.seed_workflow("t1", definition).await;

    let outcome = h
        .control
        .trigger_workflow(workflow.id, "t1", TriggerOptions::default())
        .await
        .unwrap();
    h.wait_for_status(outcome.execution_id, "t1", ExecutionStatus::Completed).await;

    let attempts = h.executions.list_attempts(outcome.execution_id).await.unwrap();
    let d_attempts = attempts.iter().filter(|a| a.step_id == "s4").count();
    assert_eq!(d_attempts, 1);

    // D starts only after both branches completed.
    let events = h.executions.list_events(outcome.execution_id).await.unwrap();
    let position = |pred: &dyn Fn(&vectormesh::domain::models::ExecutionEvent) -> bool| {
        events.iter().position(|e| pred(e)).unwrap()
    };
    let d_started = position(&|e| {
        e.event_type == EventType::StepStarted && e.payload["stepId"] == "s4"
    });
    let b_completed = position(&|e| {
        e.event_type == EventType::StepCompleted && e.payload["stepId"] == "s2"
    });
    let c_completed = position(&|e| {
        e.event_type == EventType::StepCompleted && e.payload["stepId"] == "s3"
    });
    assert!(d_started > b_completed);
    assert!(d_started > c_completed);
}

#[tokio::test]
async fn pause_parks_at_the_step_boundary_and_resume_continues() {
    let (started, release, sandbox) = GatedSandbox::new();
    let h = harness_with_sandbox(Arc::new(sandbox)).await;
    h.seed_instance("t1").await;
    let workflow = h.seed_workflow("t1", etl_definition()).await;

    let outcome = h
        .control
        .trigger_workflow(workflow.id, "t1", TriggerOptions::default())
        .await
        .unwrap();

    // The transform (s2) is now in flight; pause while it runs.
    started.notified().await;
    h.control.pause(outcome.execution_id, "t1", Some("operator request")).await.unwrap();
    release.add_permits(1);

    let execution = h.wait_for_status(outcome.execution_id, "t1", ExecutionStatus::Paused).await;
    assert!(execution.completed_at.is_none());

    // The in-flight attempt ran to completion; s3 never started.
    let attempts = h.executions.list_attempts(outcome.execution_id).await.unwrap();
    let s2 = attempts.iter().find(|a| a.step_id == "s2").unwrap();
    assert_eq!(s2.status, AttemptStatus::Completed);
    assert!(attempts.iter().all(|a| a.step_id != "s3"));

    let events = h.executions.list_events(outcome.execution_id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::ExecutionPaused));

    // Resume; the remaining load step finishes the run.
    h.control.resume(outcome.execution_id, "t1").await.unwrap();
    h.wait_for_status(outcome.execution_id, "t1", ExecutionStatus::Completed).await;

    let events = h.executions.list_events(outcome.execution_id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::ExecutionResumed));
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::StepStarted && e.payload["stepId"] == "s3"));
}

#[tokio::test]
async fn cancel_finalises_after_the_inflight_attempt_returns() {
    let (started, release, sandbox) = GatedSandbox::new();
    let h = harness_with_sandbox(Arc::new(sandbox)).await;
    h.seed_instance("t1").await;
    let workflow = h.seed_workflow("t1", etl_definition()).await;

    let outcome = h
        .control
        .trigger_workflow(workflow.id, "t1", TriggerOptions::default())
        .await
        .unwrap();

    started.notified().await;
    let execution =
        h.control.cancel(outcome.execution_id, "t1", Some("operator request")).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelling);

    release.add_permits(1);
    let execution = h.wait_for_status(outcome.execution_id, "t1", ExecutionStatus::Cancelled).await;
    assert!(execution.completed_at.is_some());

    let attempts = h.executions.list_attempts(outcome.execution_id).await.unwrap();
    assert!(attempts.iter().all(|a| a.step_id != "s3"));

    let events = h.executions.list_events(outcome.execution_id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::ExecutionCancelled));
}

#[tokio::test]
async fn terminal_executions_reject_pause_and_cancel() {
    let h = harness().await;
    h.seed_instance("t1").await;
    let workflow = h.seed_workflow("t1", etl_definition()).await;

    let outcome = h
        .control
        .trigger_workflow(workflow.id, "t1", TriggerOptions::default())
        .await
        .unwrap();
    h.wait_for_status(outcome.execution_id, "t1", ExecutionStatus::Completed).await;

    assert!(matches!(
        h.control.pause(outcome.execution_id, "t1", None).await,
        Err(DomainError::Conflict(_))
    ));
    assert!(matches!(
        h.control.cancel(outcome.execution_id, "t1", None).await,
        Err(DomainError::Conflict(_))
    ));
    assert!(matches!(
        h.control.resume(outcome.execution_id, "t1").await,
        Err(DomainError::Conflict(_))
    ));
}

#[tokio::test]
async fn definition_without_root_steps_fails_at_trigger() {
    let h = harness().await;
    let workflow = h
        .seed_workflow(
            "t1",
            WorkflowDefinition { activities: vec![], steps: vec![], schedule: None },
        )
        .await;

    let err = h
        .control
        .trigger_workflow(workflow.id, "t1", TriggerOptions::default())
        .await
        .unwrap_err();
    match err {
        DomainError::Validation(message) => assert!(message.contains("no root steps")),
        other => panic!("expected validation error, got {other}"),
    }
}

#[tokio::test]
async fn inactive_workflow_cannot_be_triggered() {
    let h = harness().await;
    h.seed_instance("t1").await;
    let mut definition = etl_definition();
    definition.schedule = Some("0 * * * *".to_string());
    let workflow = h.seed_workflow("t1", definition).await;
    h.workflows
        .update_meta(
            workflow.id,
            "t1",
            vectormesh::domain::ports::WorkflowMetaPatch {
                status: Some(vectormesh::domain::models::WorkflowStatus::Inactive),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(matches!(
        h.control.trigger_workflow(workflow.id, "t1", TriggerOptions::default()).await,
        Err(DomainError::Conflict(_))
    ));
}

#[tokio::test]
async fn replayed_state_matches_the_terminal_row() {
    let h = harness().await;
    h.seed_instance("t1").await;
    let workflow = h.seed_workflow("t1", etl_definition()).await;

    let outcome = h
        .control
        .trigger_workflow(workflow.id, "t1", TriggerOptions::default())
        .await
        .unwrap();
    let execution =
        h.wait_for_status(outcome.execution_id, "t1", ExecutionStatus::Completed).await;

    let attempts = h.executions.list_attempts(outcome.execution_id).await.unwrap();
    let state = ExecutionState::reconstruct(&execution, &attempts);

    let mut completed: Vec<_> = state.completed_steps.iter().cloned().collect();
    completed.sort();
    assert_eq!(completed, vec!["s1", "s2", "s3"]);
    assert!(state.failed_steps.is_empty());
    assert!(state.step_outputs.contains_key("s1"));
    assert!(state.step_outputs.contains_key("s2"));
    assert!(state.step_outputs.contains_key("s3"));

    // The event log agrees with the reconstruction.
    let events = h.executions.list_events(outcome.execution_id).await.unwrap();
    let completed_payload = &events.last().unwrap().payload["completedSteps"];
    assert_eq!(completed_payload.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn find_one_returns_attempts_and_ordered_events() {
    let h = harness().await;
    h.seed_instance("t1").await;
    let workflow = h.seed_workflow("t1", etl_definition()).await;

    let outcome = h
        .control
        .trigger_workflow(workflow.id, "t1", TriggerOptions::default())
        .await
        .unwrap();
    h.wait_for_status(outcome.execution_id, "t1", ExecutionStatus::Completed).await;

    let details = h.control.find_one(outcome.execution_id, "t1").await.unwrap();
    assert_eq!(details.attempts.len(), 3);
    assert!(!details.events.is_empty());
    for window in details.events.windows(2) {
        assert!(window[0].timestamp <= window[1].timestamp);
    }
}
