//! Domain models for the Vectormesh control plane.

pub mod agent;
pub mod config;
pub mod connector;
pub mod execution;
pub mod tenant;
pub mod workflow;

pub use agent::{
    parse_api_key_tenant, AgentMetrics, AgentSession, AgentToGateway, CommandEnvelope,
    CommandStatus, GatewayToAgent, HeartbeatPayload, PendingCommand, QueuedCommand,
};
pub use config::{
    AdmissionConfig, Config, DatabaseConfig, EngineConfig, GatewayConfig, LoggingConfig,
    ServerConfig,
};
pub use connector::{
    AggregatorInstance, Connector, ConnectorType, FieldMapping, FieldMappingRule, FieldTransform,
};
pub use execution::{
    ActivityAttempt, AttemptStatus, EventType, Execution, ExecutionEvent, ExecutionPatch,
    ExecutionState, ExecutionStatus,
};
pub use tenant::{TenantOverride, TenantTier, TierLimits};
pub use workflow::{
    Activity, ActivityConfig, CloudConnectorSinkConfig, CloudConnectorSourceConfig,
    ConflictResolution, ExtractConfig, FilterConfig, JoinConfig, JoinType, LoadConfig, LoadMode,
    MiniConnectorSourceConfig, SourceMetadata, Step, TransformConfig, Workflow,
    WorkflowDefinition, WorkflowStatus,
};
