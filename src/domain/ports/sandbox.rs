//! Expression-sandbox port.
//!
//! User code (transform expressions, filter conditions) is evaluated by an
//! external sandbox with a wall-clock timeout and no ambient I/O. The core
//! is agnostic to the implementation.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    #[error("Expression evaluation failed: {0}")]
    Evaluation(String),

    #[error("Expression evaluation exceeded {0:?}")]
    Timeout(Duration),

    #[error("No expression sandbox is configured")]
    Unavailable,
}

#[async_trait]
pub trait ExpressionSandbox: Send + Sync {
    /// Evaluate `code` with the given variable bindings. `bindings` is a
    /// JSON object mapping names (`data`, `row`, ...) to values.
    async fn evaluate(
        &self,
        code: &str,
        bindings: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, SandboxError>;
}

/// Sandbox stub for deployments without an evaluator wired in; every
/// evaluation fails as unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSandbox;

#[async_trait]
impl ExpressionSandbox for NullSandbox {
    async fn evaluate(
        &self,
        _code: &str,
        _bindings: serde_json::Value,
        _timeout: Duration,
    ) -> Result<serde_json::Value, SandboxError> {
        Err(SandboxError::Unavailable)
    }
}
