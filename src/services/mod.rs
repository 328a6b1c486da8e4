//! Core services of the control plane.

pub mod admission;
pub mod dispatcher;
pub mod engine;
pub mod event_log;
pub mod gateway;
pub mod handlers;
pub mod orchestrator;
pub mod validator;
pub mod workflows;

pub use admission::{AdmissionController, AdmissionStats, ExecutionJob, TierQueues};
pub use dispatcher::{ActivityDispatcher, StepInput};
pub use engine::{ControlPlane, ExecutionDetails, TriggerOptions, TriggerOutcome};
pub use event_log::EventLogger;
pub use gateway::{AgentGateway, CommandContext, DispatchOutcome, GatewaySettings, GatewayStats};
pub use handlers::{ActivityHandlers, HandlerTimeouts};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use validator::{DagValidator, ValidationReport};
pub use workflows::WorkflowService;
