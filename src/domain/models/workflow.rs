//! Workflow definition domain models.
//!
//! A workflow is a versioned, content-addressed definition: a set of
//! activities (typed units of work) and a DAG of steps binding activities
//! to positions with dependencies. Definitions are immutable once
//! published; metadata may mutate in place.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a workflow. Only `Active` workflows may be triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Inactive,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "DRAFT",
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "ACTIVE" => Ok(Self::Active),
            "INACTIVE" => Ok(Self::Inactive),
            other => Err(format!("Unknown workflow status: {other}")),
        }
    }
}

/// A persisted workflow row: one `(tenant_id, id, version)` triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: WorkflowStatus,
    pub version: u32,
    /// SHA-256 hex digest of the canonicalised definition.
    pub hash: String,
    pub definition: WorkflowDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The definition document: activities plus the step DAG over them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Optional cron schedule, 5 or 6 whitespace-separated fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

impl WorkflowDefinition {
    pub fn activity(&self, id: &str) -> Option<&Activity> {
        self.activities.iter().find(|a| a.id == id)
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps with no dependencies; traversal starts here.
    pub fn root_steps(&self) -> Vec<&Step> {
        self.steps.iter().filter(|s| s.depends_on.is_empty()).collect()
    }

    /// Steps that name `step_id` in their `depends_on`.
    pub fn dependents_of(&self, step_id: &str) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.depends_on.iter().any(|d| d == step_id))
            .collect()
    }
}

/// A node in the execution DAG, binding an activity to a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub activity_id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A unit of work. The `type`/`config` pair serialises as a discriminated
/// JSON document so arbitrary per-kind configuration survives persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Per-activity retry cap for retryable failures; engine default when
    /// unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max: Option<u32>,
    #[serde(flatten)]
    pub config: ActivityConfig,
}

impl Activity {
    pub fn kind(&self) -> &'static str {
        self.config.kind()
    }

    /// Source kinds carry table metadata a downstream load can inherit.
    pub fn is_source_kind(&self) -> bool {
        matches!(
            self.config,
            ActivityConfig::Extract(_)
                | ActivityConfig::MiniConnectorSource(_)
                | ActivityConfig::CloudConnectorSource(_)
        )
    }
}

/// The closed set of activity kinds, each with its typed config record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "kebab-case")]
pub enum ActivityConfig {
    Extract(ExtractConfig),
    Transform(TransformConfig),
    Load(LoadConfig),
    Filter(FilterConfig),
    Join(JoinConfig),
    MiniConnectorSource(MiniConnectorSourceConfig),
    CloudConnectorSource(CloudConnectorSourceConfig),
    CloudConnectorSink(CloudConnectorSinkConfig),
}

impl ActivityConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Extract(_) => "extract",
            Self::Transform(_) => "transform",
            Self::Load(_) => "load",
            Self::Filter(_) => "filter",
            Self::Join(_) => "join",
            Self::MiniConnectorSource(_) => "mini-connector-source",
            Self::CloudConnectorSource(_) => "cloud-connector-source",
            Self::CloudConnectorSink(_) => "cloud-connector-sink",
        }
    }
}

/// `{tableName, columns}` propagated from source activities so a load can
/// target the right destination without explicit configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetadata {
    pub table_name: String,
    #[serde(default)]
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractConfig {
    pub aggregator_instance_id: String,
    pub table: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformConfig {
    /// User expression evaluated in the sandbox against the upstream rows.
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    Insert,
    Upsert,
    Create,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    Replace,
    Merge,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub mode: LoadMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_resolution: Option<ConflictResolution>,
    /// Destination-column -> source-column renames applied after mapping rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_mappings: Option<HashMap<String, String>>,
    /// Reference to stored field-mapping rules applied before column mappings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// Explicit source metadata; synthesised from upstream when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_metadata: Option<SourceMetadata>,
}

impl LoadConfig {
    pub const DEFAULT_BATCH_SIZE: usize = 1000;

    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(Self::DEFAULT_BATCH_SIZE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_activity_id: Option<String>,
    /// Row predicate or whole-array expression evaluated in the sandbox.
    pub condition: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinConfig {
    pub left_activity_id: String,
    pub right_activity_id: String,
    #[serde(rename = "type")]
    pub join_type: JoinType,
    /// Join column, or comma-separated columns for composite keys.
    pub join_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiniConnectorSourceConfig {
    pub connector_id: String,
    pub database: String,
    pub table: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConnectorSourceConfig {
    pub sdk_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConnectorSinkConfig {
    pub sdk_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub mode: LoadMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}
