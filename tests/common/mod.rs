//! Shared harness for integration tests: in-memory SQLite stores, a
//! scripted connector driver, and pluggable sandboxes behind a fully
//! wired control plane.

// Each integration binary uses a different slice of this module.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use vectormesh::adapters::sqlite::{
    create_migrated_test_pool, SqliteConnectorStore, SqliteExecutionStore, SqliteWorkflowStore,
};
use vectormesh::domain::models::{
    Activity, ActivityConfig, AdmissionConfig, AggregatorInstance, EngineConfig, Execution,
    ExecutionStatus, ExtractConfig, LoadConfig, LoadMode, Step, TransformConfig, Workflow,
    WorkflowDefinition, WorkflowStatus,
};
use vectormesh::domain::ports::{
    ConnectorDriver, DriverError, ExecutionStore, ExpressionSandbox, LoadOutcome, LoadRequest,
    QueryRequest, QueryResult, SandboxError, WorkflowStore,
};
use vectormesh::services::{
    ActivityDispatcher, ActivityHandlers, AdmissionController, AgentGateway, ControlPlane,
    EventLogger, GatewaySettings, HandlerTimeouts, Orchestrator, OrchestratorConfig,
};

// ----------------------------------------------------------------------
// Scripted collaborators
// ----------------------------------------------------------------------

/// Driver with a programmable reply queue; defaults to two user rows for
/// queries and full success for loads.
#[derive(Default)]
pub struct ScriptedDriver {
    pub query_replies: Mutex<VecDeque<Result<QueryResult, DriverError>>>,
    pub load_replies: Mutex<VecDeque<Result<LoadOutcome, DriverError>>>,
    pub loaded_rows: Mutex<Vec<Value>>,
}

impl ScriptedDriver {
    pub fn push_query_error(&self, class: &str, message: &str) {
        self.query_replies.lock().unwrap().push_back(Err(DriverError::new(class, message)));
    }

    #[allow(dead_code)]
    pub fn push_query_rows(&self, rows: Vec<Value>, columns: &[&str]) {
        self.query_replies.lock().unwrap().push_back(Ok(QueryResult {
            rows,
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
        }));
    }
}

#[async_trait]
impl ConnectorDriver for ScriptedDriver {
    async fn query(&self, _request: QueryRequest) -> Result<QueryResult, DriverError> {
        self.query_replies.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(QueryResult {
                rows: vec![json!({"id": 1, "email": "a@x"}), json!({"id": 2, "email": "b@y"})],
                columns: vec!["id".to_string(), "email".to_string()],
            })
        })
    }

    async fn load(&self, request: LoadRequest) -> Result<LoadOutcome, DriverError> {
        self.loaded_rows.lock().unwrap().extend(request.rows.iter().cloned());
        self.load_replies.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(LoadOutcome { loaded: request.rows.len() as u64, failed: 0, warnings: vec![] })
        })
    }
}

/// Sandbox understanding the one expression family the scenarios use:
/// mapping rows and upper-casing their email column.
pub struct UppercaseEmailSandbox;

#[async_trait]
impl ExpressionSandbox for UppercaseEmailSandbox {
    async fn evaluate(
        &self,
        _code: &str,
        bindings: Value,
        _timeout: Duration,
    ) -> Result<Value, SandboxError> {
        let rows = bindings["data"].as_array().cloned().unwrap_or_default();
        let mapped: Vec<Value> = rows
            .into_iter()
            .map(|row| {
                let email = row["email"].as_str().unwrap_or_default().to_uppercase();
                json!({"id": row["id"], "email": email})
            })
            .collect();
        Ok(Value::Array(mapped))
    }
}

/// Sandbox that parks on a gate until the test releases it, so tests can
/// pause or cancel while a step is in flight.
pub struct GatedSandbox {
    started: Arc<tokio::sync::Notify>,
    release: Arc<tokio::sync::Semaphore>,
}

impl GatedSandbox {
    pub fn new() -> (Arc<tokio::sync::Notify>, Arc<tokio::sync::Semaphore>, Self) {
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Semaphore::new(0));
        let sandbox =
            Self { started: Arc::clone(&started), release: Arc::clone(&release) };
        (started, release, sandbox)
    }
}

#[async_trait]
impl ExpressionSandbox for GatedSandbox {
    async fn evaluate(
        &self,
        _code: &str,
        bindings: Value,
        _timeout: Duration,
    ) -> Result<Value, SandboxError> {
        self.started.notify_one();
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
        Ok(bindings["data"].clone())
    }
}

// ----------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------

pub struct Harness {
    pub workflows: Arc<SqliteWorkflowStore>,
    pub executions: Arc<SqliteExecutionStore>,
    pub connectors: Arc<SqliteConnectorStore>,
    pub driver: Arc<ScriptedDriver>,
    pub gateway: Arc<AgentGateway>,
    pub control: ControlPlane,
}

pub async fn harness_with_sandbox(sandbox: Arc<dyn ExpressionSandbox>) -> Harness {
    let pool = create_migrated_test_pool().await.expect("test pool");

    let workflows = Arc::new(SqliteWorkflowStore::new(pool.clone()));
    let executions = Arc::new(SqliteExecutionStore::new(pool.clone()));
    let connectors = Arc::new(SqliteConnectorStore::new(pool));
    let driver = Arc::new(ScriptedDriver::default());

    let gateway = Arc::new(AgentGateway::new(connectors.clone(), GatewaySettings::default()));

    let handlers = ActivityHandlers::new(
        connectors.clone(),
        driver.clone(),
        sandbox,
        Arc::clone(&gateway),
        HandlerTimeouts::from(&EngineConfig::default()),
    );
    let dispatcher = Arc::new(ActivityDispatcher::new(handlers));

    let orchestrator = Arc::new(Orchestrator::new(
        executions.clone(),
        EventLogger::new(executions.clone()),
        dispatcher,
        // Millisecond backoff keeps retry scenarios fast.
        OrchestratorConfig { max_retries: 3, retry_base_delay: Duration::from_millis(10) },
    ));
    let admission = Arc::new(AdmissionController::new(AdmissionConfig::default()));

    let control = ControlPlane::new(workflows.clone(), executions.clone(), admission, orchestrator);

    Harness { workflows, executions, connectors, driver, gateway, control }
}

pub async fn harness() -> Harness {
    harness_with_sandbox(Arc::new(UppercaseEmailSandbox)).await
}

impl Harness {
    pub async fn seed_instance(&self, tenant: &str) {
        self.connectors
            .insert_instance(&AggregatorInstance {
                id: "agg-1".to_string(),
                tenant_id: tenant.to_string(),
                name: "warehouse".to_string(),
                capabilities: vec!["read".to_string(), "write".to_string()],
                credential_ref: None,
                created_at: Utc::now(),
            })
            .await
            .expect("seed instance");
    }

    /// Persist an ACTIVE workflow with the given definition.
    pub async fn seed_workflow(&self, tenant: &str, definition: WorkflowDefinition) -> Workflow {
        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            name: "test workflow".to_string(),
            description: None,
            status: WorkflowStatus::Active,
            version: 1,
            hash: vectormesh::services::validator::content_hash(&definition).expect("hash"),
            definition,
            created_at: now,
            updated_at: now,
        };
        self.workflows.create(&workflow).await.expect("seed workflow");
        workflow
    }

    pub async fn wait_for_status(
        &self,
        execution_id: Uuid,
        tenant: &str,
        expected: ExecutionStatus,
    ) -> Execution {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let execution =
                self.executions.load_execution(execution_id, tenant).await.expect("load");
            if execution.status == expected {
                return execution;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {expected}, last status {}",
                execution.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

// ----------------------------------------------------------------------
// Definition builders
// ----------------------------------------------------------------------

pub fn extract_activity(id: &str) -> Activity {
    Activity {
        id: id.to_string(),
        name: format!("extract {id}"),
        retry_max: None,
        config: ActivityConfig::Extract(ExtractConfig {
            aggregator_instance_id: "agg-1".to_string(),
            table: "users".to_string(),
            columns: vec!["id".to_string(), "email".to_string()],
            where_clause: None,
            limit: None,
            order_by: None,
        }),
    }
}

pub fn transform_activity(id: &str) -> Activity {
    Activity {
        id: id.to_string(),
        name: format!("transform {id}"),
        retry_max: None,
        config: ActivityConfig::Transform(TransformConfig {
            code: "return data.map(r=>({id:r.id,email:r.email.toUpperCase()}))".to_string(),
            input_schema: None,
        }),
    }
}

pub fn load_activity(id: &str, table: &str) -> Activity {
    Activity {
        id: id.to_string(),
        name: format!("load {id}"),
        retry_max: None,
        config: ActivityConfig::Load(LoadConfig {
            aggregator_instance_id: Some("agg-1".to_string()),
            sdk_id: None,
            table: Some(table.to_string()),
            mode: LoadMode::Insert,
            conflict_key: None,
            conflict_resolution: None,
            column_mappings: None,
            mapping_id: None,
            batch_size: None,
            source_metadata: None,
        }),
    }
}

pub fn step(id: &str, activity: &str, deps: &[&str]) -> Step {
    Step {
        id: id.to_string(),
        activity_id: activity.to_string(),
        depends_on: deps.iter().map(|d| (*d).to_string()).collect(),
    }
}

/// Linear extract -> transform -> load pipeline.
pub fn etl_definition() -> WorkflowDefinition {
    WorkflowDefinition {
        activities: vec![
            extract_activity("e1"),
            transform_activity("t1"),
            load_activity("l1", "users_norm"),
        ],
        steps: vec![step("s1", "e1", &[]), step("s2", "t1", &["s1"]), step("s3", "l1", &["s2"])],
        schedule: None,
    }
}
