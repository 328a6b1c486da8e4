//! Opaque connector-driver port.
//!
//! Per-connector drivers (SQL dialects, SaaS APIs, generated SDKs) live
//! outside the core; the dispatcher only issues typed requests through this
//! trait and classifies the returned error class.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::{AggregatorInstance, ConflictResolution, LoadMode};

/// What a request is executed against.
#[derive(Debug, Clone)]
pub enum DriverTarget {
    /// A credentialed aggregator instance.
    Instance(AggregatorInstance),
    /// A generated cloud-connector SDK, referenced by id.
    Sdk { sdk_id: String },
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub target: DriverTarget,
    pub table: String,
    pub columns: Vec<String>,
    pub where_clause: Option<String>,
    pub limit: Option<u64>,
    pub order_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub rows: Vec<serde_json::Value>,
    pub columns: Vec<String>,
}

/// One batch of rows to write.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub target: DriverTarget,
    pub table: String,
    pub mode: LoadMode,
    pub conflict_key: Option<String>,
    pub conflict_resolution: Option<ConflictResolution>,
    pub rows: Vec<serde_json::Value>,
}

/// Per-batch outcome. `failed` rows plus warnings describe partial failure;
/// a hard `DriverError` means the whole batch was rejected.
#[derive(Debug, Clone, Default)]
pub struct LoadOutcome {
    pub loaded: u64,
    pub failed: u64,
    pub warnings: Vec<String>,
}

/// Driver failure with its error class (`NETWORK_ERROR`, `TIMEOUT`,
/// `CONNECTION_LOST`, `DEADLOCK`, or a driver-specific code). The class
/// decides retryability upstream.
#[derive(Debug, Clone, Error)]
#[error("{class}: {message}")]
pub struct DriverError {
    pub class: String,
    pub message: String,
}

impl DriverError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self { class: class.into(), message: message.into() }
    }
}

#[async_trait]
pub trait ConnectorDriver: Send + Sync {
    async fn query(&self, request: QueryRequest) -> Result<QueryResult, DriverError>;

    async fn load(&self, request: LoadRequest) -> Result<LoadOutcome, DriverError>;
}

/// Driver stub for deployments without connector drivers wired in; every
/// request fails with a non-transient class.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredDriver;

#[async_trait]
impl ConnectorDriver for UnconfiguredDriver {
    async fn query(&self, _request: QueryRequest) -> Result<QueryResult, DriverError> {
        Err(DriverError::new("DRIVER_UNAVAILABLE", "no connector driver configured"))
    }

    async fn load(&self, _request: LoadRequest) -> Result<LoadOutcome, DriverError> {
        Err(DriverError::new("DRIVER_UNAVAILABLE", "no connector driver configured"))
    }
}
