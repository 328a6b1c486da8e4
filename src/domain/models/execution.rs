//! Execution domain models: the run of a workflow, per-step attempts,
//! the append-only event log, and the live state reconstructed from them.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution lifecycle. `Paused` and `Cancelling` are transient;
/// `Completed`, `Failed` and `Cancelled` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal transitions of the execution state machine. Anything out of a
    /// terminal state is rejected.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ExecutionStatus::{Cancelled, Cancelling, Completed, Failed, Paused, Pending, Running};
        match self {
            Pending => matches!(next, Running | Paused | Cancelling | Failed),
            Running => matches!(next, Paused | Cancelling | Completed | Failed),
            Paused => matches!(next, Running | Cancelling),
            Cancelling => matches!(next, Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Cancelling => "CANCELLING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "CANCELLING" => Ok(Self::Cancelling),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("Unknown execution status: {other}")),
        }
    }
}

/// A single run of a workflow, bound to the exact definition bytes via
/// `workflow_hash`. Retained forever for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub tenant_id: String,
    pub workflow_id: Uuid,
    pub workflow_version: u32,
    pub workflow_hash: String,
    pub status: ExecutionStatus,
    pub current_step_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub trigger_context: serde_json::Value,
}

/// Mutable fields of an execution row. `None` leaves a field untouched;
/// `current_step_id`/`completed_at`/`error_message` use a double Option so
/// callers can set a column to NULL.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub current_step_id: Option<Option<String>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub error_message: Option<Option<String>>,
}

/// Status of one attempt at running a step's activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttemptStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            "TIMEOUT" => Ok(Self::Timeout),
            other => Err(format!("Unknown attempt status: {other}")),
        }
    }
}

/// One try at running a step's activity. Attempt numbers start at 1 and
/// increase monotonically per `(execution_id, step_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityAttempt {
    pub execution_id: Uuid,
    pub tenant_id: String,
    pub step_id: String,
    pub activity_type: String,
    pub attempt: u32,
    pub status: AttemptStatus,
    /// Handler output stored verbatim; inline JSON or a pointer envelope.
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_retryable: Option<bool>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Types of entries in the append-only execution event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ExecutionStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    ActivityRetry,
    ExecutionPaused,
    ExecutionResumed,
    ExecutionCancelled,
    ExecutionCompleted,
    ExecutionFailed,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ExecutionStarted => "EXECUTION_STARTED",
            Self::StepStarted => "STEP_STARTED",
            Self::StepCompleted => "STEP_COMPLETED",
            Self::StepFailed => "STEP_FAILED",
            Self::ActivityRetry => "ACTIVITY_RETRY",
            Self::ExecutionPaused => "EXECUTION_PAUSED",
            Self::ExecutionResumed => "EXECUTION_RESUMED",
            Self::ExecutionCancelled => "EXECUTION_CANCELLED",
            Self::ExecutionCompleted => "EXECUTION_COMPLETED",
            Self::ExecutionFailed => "EXECUTION_FAILED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXECUTION_STARTED" => Ok(Self::ExecutionStarted),
            "STEP_STARTED" => Ok(Self::StepStarted),
            "STEP_COMPLETED" => Ok(Self::StepCompleted),
            "STEP_FAILED" => Ok(Self::StepFailed),
            "ACTIVITY_RETRY" => Ok(Self::ActivityRetry),
            "EXECUTION_PAUSED" => Ok(Self::ExecutionPaused),
            "EXECUTION_RESUMED" => Ok(Self::ExecutionResumed),
            "EXECUTION_CANCELLED" => Ok(Self::ExecutionCancelled),
            "EXECUTION_COMPLETED" => Ok(Self::ExecutionCompleted),
            "EXECUTION_FAILED" => Ok(Self::ExecutionFailed),
            other => Err(format!("Unknown event type: {other}")),
        }
    }
}

/// One entry in the append-only log. The log is the canonical history;
/// observable status derives from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

impl ExecutionEvent {
    pub fn new(execution_id: Uuid, event_type: EventType, payload: serde_json::Value) -> Self {
        Self { execution_id, timestamp: Utc::now(), event_type, payload }
    }
}

/// Live traversal state, deterministically reconstructible from the
/// execution row and its attempt rows.
#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    pub completed_steps: HashSet<String>,
    pub failed_steps: HashSet<String>,
    pub step_outputs: HashMap<String, serde_json::Value>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    /// Rebuild state from durable rows.
    ///
    /// A step is completed when its latest attempt completed, failed when
    /// its latest attempt failed. The stored output is taken from the
    /// latest `COMPLETED` attempt even when later attempts exist.
    pub fn reconstruct(execution: &Execution, attempts: &[ActivityAttempt]) -> Self {
        let mut latest: HashMap<&str, &ActivityAttempt> = HashMap::new();
        let mut latest_completed: HashMap<&str, &ActivityAttempt> = HashMap::new();

        for attempt in attempts {
            let entry = latest.entry(attempt.step_id.as_str()).or_insert(attempt);
            if attempt.attempt >= entry.attempt {
                *entry = attempt;
            }
            if attempt.status == AttemptStatus::Completed {
                let entry = latest_completed.entry(attempt.step_id.as_str()).or_insert(attempt);
                if attempt.attempt >= entry.attempt {
                    *entry = attempt;
                }
            }
        }

        let mut state = Self::default();

        for (step_id, attempt) in &latest {
            match attempt.status {
                AttemptStatus::Completed => {
                    state.completed_steps.insert((*step_id).to_string());
                }
                AttemptStatus::Failed | AttemptStatus::Timeout => {
                    state.failed_steps.insert((*step_id).to_string());
                }
                _ => {}
            }
        }

        for (step_id, attempt) in &latest_completed {
            if let Some(output) = &attempt.output {
                state.step_outputs.insert((*step_id).to_string(), output.clone());
            }
        }

        state.last_activity_at = attempts
            .iter()
            .map(|a| a.completed_at.unwrap_or(a.started_at))
            .max()
            .or(Some(execution.started_at));

        state
    }

    /// A step is ready when every dependency has completed.
    pub fn is_ready(&self, depends_on: &[String]) -> bool {
        depends_on.iter().all(|d| self.completed_steps.contains(d))
    }

    pub fn is_settled(&self, step_id: &str) -> bool {
        self.completed_steps.contains(step_id) || self.failed_steps.contains(step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution() -> Execution {
        Execution {
            id: Uuid::new_v4(),
            tenant_id: "t1".to_string(),
            workflow_id: Uuid::new_v4(),
            workflow_version: 1,
            workflow_hash: "abc".to_string(),
            status: ExecutionStatus::Running,
            current_step_id: None,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            trigger_context: serde_json::Value::Null,
        }
    }

    fn attempt(exec: &Execution, step: &str, n: u32, status: AttemptStatus) -> ActivityAttempt {
        ActivityAttempt {
            execution_id: exec.id,
            tenant_id: exec.tenant_id.clone(),
            step_id: step.to_string(),
            activity_type: "extract".to_string(),
            attempt: n,
            status,
            output: (status == AttemptStatus::Completed)
                .then(|| serde_json::json!({"rowCount": n})),
            error_message: None,
            error_retryable: None,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
        }
    }

    #[test]
    fn terminal_statuses_are_absorbing() {
        for terminal in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            for next in [
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Paused,
                ExecutionStatus::Cancelling,
                ExecutionStatus::Completed,
                ExecutionStatus::Failed,
                ExecutionStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn pause_allowed_from_pending_and_running_only() {
        assert!(ExecutionStatus::Pending.can_transition_to(ExecutionStatus::Paused));
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Paused));
        assert!(!ExecutionStatus::Paused.can_transition_to(ExecutionStatus::Paused));
        assert!(!ExecutionStatus::Cancelling.can_transition_to(ExecutionStatus::Paused));
    }

    #[test]
    fn reconstruct_uses_latest_attempt_status() {
        let exec = execution();
        let attempts = vec![
            attempt(&exec, "s1", 1, AttemptStatus::Failed),
            attempt(&exec, "s1", 2, AttemptStatus::Failed),
            attempt(&exec, "s1", 3, AttemptStatus::Completed),
        ];

        let state = ExecutionState::reconstruct(&exec, &attempts);
        assert!(state.completed_steps.contains("s1"));
        assert!(!state.failed_steps.contains("s1"));
        assert_eq!(state.step_outputs["s1"]["rowCount"], 3);
    }

    #[test]
    fn reconstruct_keeps_latest_completed_output_when_newer_attempt_failed() {
        let exec = execution();
        let attempts = vec![
            attempt(&exec, "s1", 1, AttemptStatus::Completed),
            attempt(&exec, "s1", 2, AttemptStatus::Failed),
        ];

        let state = ExecutionState::reconstruct(&exec, &attempts);
        assert!(state.failed_steps.contains("s1"));
        assert!(!state.completed_steps.contains("s1"));
        // Output of the latest COMPLETED attempt is still addressable.
        assert_eq!(state.step_outputs["s1"]["rowCount"], 1);
    }

    #[test]
    fn readiness_requires_all_dependencies_completed() {
        let exec = execution();
        let attempts = vec![attempt(&exec, "s1", 1, AttemptStatus::Completed)];
        let state = ExecutionState::reconstruct(&exec, &attempts);

        assert!(state.is_ready(&["s1".to_string()]));
        assert!(!state.is_ready(&["s1".to_string(), "s2".to_string()]));
        assert!(state.is_ready(&[]));
    }

    #[test]
    fn event_type_round_trips_through_strings() {
        for ty in [
            EventType::ExecutionStarted,
            EventType::StepFailed,
            EventType::ActivityRetry,
            EventType::ExecutionCancelled,
        ] {
            let s = ty.to_string();
            assert_eq!(s.parse::<EventType>().unwrap(), ty);
        }
    }
}
