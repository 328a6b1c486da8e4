//! Ports (interfaces) between the core and its collaborators.

pub mod connector_driver;
pub mod connector_store;
pub mod execution_store;
pub mod sandbox;
pub mod workflow_store;

pub use connector_driver::{
    ConnectorDriver, DriverError, DriverTarget, LoadOutcome, LoadRequest, QueryRequest,
    QueryResult, UnconfiguredDriver,
};
pub use connector_store::ConnectorStore;
pub use execution_store::ExecutionStore;
pub use sandbox::{ExpressionSandbox, NullSandbox, SandboxError};
pub use workflow_store::{WorkflowMetaPatch, WorkflowStore};
