//! Domain errors for the Vectormesh control plane.

use thiserror::Error;

/// Error codes used by activity handlers and the drivers beneath them.
pub mod codes {
    pub const EXTRACT_ERROR: &str = "EXTRACT_ERROR";
    pub const TRANSFORM_ERROR: &str = "TRANSFORM_ERROR";
    pub const LOAD_ERROR: &str = "LOAD_ERROR";
    pub const LOAD_PARTIAL_FAILURE: &str = "LOAD_PARTIAL_FAILURE";
    pub const FILTER_ERROR: &str = "FILTER_ERROR";
    pub const JOIN_ERROR: &str = "JOIN_ERROR";
    pub const SDK_EXTRACT_ERROR: &str = "SDK_EXTRACT_ERROR";
    pub const SDK_LOAD_PARTIAL_FAILURE: &str = "SDK_LOAD_PARTIAL_FAILURE";

    // Transient classes surfaced by drivers and the network layer.
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CONNECTION_LOST: &str = "CONNECTION_LOST";
    pub const DEADLOCK: &str = "DEADLOCK";

    /// Unrecoverable engine failure (persistence unreachable, invariant broken).
    pub const FATAL: &str = "FATAL";

    /// Returns true for the underlying error classes that are safe to retry.
    pub fn is_transient(code: &str) -> bool {
        matches!(code, NETWORK_ERROR | TIMEOUT | CONNECTION_LOST | DEADLOCK)
    }
}

/// Error returned by every activity handler.
///
/// The `retryable` flag is the only thing the orchestrator inspects when
/// deciding between another attempt and a terminal `FAILED` transition.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl HandlerError {
    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), retryable: true, details: None }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), retryable: false, details: None }
    }

    /// Classify by the underlying error class: transient classes retry,
    /// everything else fails the execution.
    pub fn classified(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let retryable = codes::is_transient(&code);
        Self { code, message: message.into(), retryable, details: None }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Rejections produced by the admission controller before any execution
/// row exists.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("RATE_LIMITED: tenant has started {jobs_this_hour} of {max_jobs_per_hour} jobs this hour")]
    RateLimited { jobs_this_hour: u64, max_jobs_per_hour: u64 },

    #[error("AT_CAPACITY: {active} of {max} concurrent jobs in use")]
    AtCapacity { active: u64, max: u64 },

    #[error("BACKLOG: queue depth {depth} exceeds limit {max}")]
    Backlog { depth: u64, max: u64 },
}

/// Failures on the remote-agent command channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Malformed API key")]
    MalformedApiKey,

    #[error("Authentication failed for tenant {0}")]
    AuthenticationFailed(String),

    #[error("Connector {0} already has an active session")]
    DuplicateSession(String),

    #[error("No agent session available for tenant {0}")]
    NoSession(String),

    #[error("Command timed out")]
    CommandTimeout,

    #[error("Command {0} exceeded max delivery retries")]
    MaxRetriesExceeded(String),
}

/// Umbrella error for the control plane.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Aggregator instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Field mapping not found: {0}")]
    MappingNotFound(String),

    #[error("Workflow definition is invalid: {0}")]
    Validation(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Fatal engine error: {0}")]
    Fatal(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}
