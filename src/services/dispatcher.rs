//! Typed dispatch of each activity kind.
//!
//! The dispatcher wires upstream outputs into the step being executed,
//! synthesises source metadata for loads, and branches on the activity
//! kind. Readiness is the orchestrator's contract: by the time dispatch is
//! called, every dependency output must be present.

use serde_json::Value;
use tracing::instrument;

use crate::domain::errors::{codes, HandlerError};
use crate::domain::models::{
    Activity, ActivityConfig, Execution, ExecutionState, SourceMetadata, Step, WorkflowDefinition,
};
use crate::services::handlers::{envelope_source_metadata, ActivityHandlers, HandlerResult};

/// One upstream output, in `depends_on` order.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub step_id: String,
    pub activity_id: String,
    pub value: Value,
}

pub struct ActivityDispatcher {
    handlers: ActivityHandlers,
}

impl ActivityDispatcher {
    pub fn new(handlers: ActivityHandlers) -> Self {
        Self { handlers }
    }

    /// Collect the latest completed output of every dependency, keyed by
    /// step id. A missing output means the readiness contract was broken.
    pub fn gather_inputs(
        definition: &WorkflowDefinition,
        step: &Step,
        state: &ExecutionState,
    ) -> Result<Vec<StepInput>, HandlerError> {
        step.depends_on
            .iter()
            .map(|dep_id| {
                let value = state.step_outputs.get(dep_id).cloned().ok_or_else(|| {
                    HandlerError::permanent(
                        codes::FATAL,
                        format!("dependency \"{dep_id}\" has no completed output"),
                    )
                })?;
                let activity_id = definition
                    .step(dep_id)
                    .map(|s| s.activity_id.clone())
                    .unwrap_or_default();
                Ok(StepInput { step_id: dep_id.clone(), activity_id, value })
            })
            .collect()
    }

    /// Execute the activity bound to `step` and return its output verbatim.
    #[instrument(skip_all, fields(execution_id = %execution.id, step_id = %step.id, kind = activity.kind()))]
    pub async fn dispatch(
        &self,
        definition: &WorkflowDefinition,
        execution: &Execution,
        step: &Step,
        activity: &Activity,
        inputs: &[StepInput],
    ) -> HandlerResult {
        let tenant_id = execution.tenant_id.as_str();

        match &activity.config {
            ActivityConfig::Extract(cfg) => self.handlers.extract(tenant_id, cfg).await,

            ActivityConfig::Transform(cfg) => {
                self.handlers.transform(cfg, inputs.first().map(|i| &i.value)).await
            }

            ActivityConfig::Filter(cfg) => {
                let input = match &cfg.input_activity_id {
                    Some(activity_id) => input_for_activity(inputs, activity_id)
                        .or_else(|| inputs.first().map(|i| &i.value)),
                    None => inputs.first().map(|i| &i.value),
                };
                let empty = Value::Array(vec![]);
                self.handlers.filter(cfg, input.unwrap_or(&empty)).await
            }

            ActivityConfig::Join(cfg) => {
                let left = input_for_activity(inputs, &cfg.left_activity_id).ok_or_else(|| {
                    HandlerError::permanent(
                        codes::JOIN_ERROR,
                        format!("no input from left activity \"{}\"", cfg.left_activity_id),
                    )
                })?;
                let right = input_for_activity(inputs, &cfg.right_activity_id).ok_or_else(|| {
                    HandlerError::permanent(
                        codes::JOIN_ERROR,
                        format!("no input from right activity \"{}\"", cfg.right_activity_id),
                    )
                })?;
                self.handlers.join(cfg, left, right)
            }

            ActivityConfig::Load(cfg) => {
                let metadata = cfg
                    .source_metadata
                    .clone()
                    .or_else(|| synthesize_source_metadata(definition, inputs));
                let table =
                    cfg.table.clone().or_else(|| metadata.map(|m| m.table_name));
                self.handlers
                    .load(
                        tenant_id,
                        cfg,
                        inputs.first().map(|i| &i.value),
                        table.as_deref(),
                        codes::LOAD_PARTIAL_FAILURE,
                    )
                    .await
            }

            ActivityConfig::MiniConnectorSource(cfg) => {
                self.handlers
                    .mini_connector_source(tenant_id, execution.id, &activity.id, cfg)
                    .await
            }

            ActivityConfig::CloudConnectorSource(cfg) => {
                self.handlers.cloud_connector_source(cfg).await
            }

            ActivityConfig::CloudConnectorSink(cfg) => {
                let table = cfg
                    .table
                    .clone()
                    .or_else(|| synthesize_source_metadata(definition, inputs).map(|m| m.table_name));
                self.handlers
                    .cloud_connector_sink(
                        tenant_id,
                        cfg,
                        inputs.first().map(|i| &i.value),
                        table.as_deref(),
                    )
                    .await
            }
        }
    }
}

fn input_for_activity<'a>(inputs: &'a [StepInput], activity_id: &str) -> Option<&'a Value> {
    inputs.iter().find(|i| i.activity_id == activity_id).map(|i| &i.value)
}

/// Metadata for a load with no explicit `sourceMetadata`: first dependency
/// output carrying `_sourceMetadata` wins; otherwise the upstream
/// activity's own config when that activity is a source kind.
fn synthesize_source_metadata(
    definition: &WorkflowDefinition,
    inputs: &[StepInput],
) -> Option<SourceMetadata> {
    for input in inputs {
        if let Some(metadata) = envelope_source_metadata(&input.value) {
            return Some(metadata);
        }
    }

    for input in inputs {
        match definition.activity(&input.activity_id).map(|a| &a.config) {
            Some(ActivityConfig::Extract(cfg)) => {
                return Some(SourceMetadata {
                    table_name: cfg.table.clone(),
                    columns: cfg.columns.clone(),
                });
            }
            Some(ActivityConfig::MiniConnectorSource(cfg)) => {
                return Some(SourceMetadata {
                    table_name: cfg.table.clone(),
                    columns: cfg.columns.clone(),
                });
            }
            _ => {}
        }
    }

    None
}
