//! CLI command handlers.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use uuid::Uuid;

use crate::adapters::sqlite::{
    initialize_database, SqliteConnectorStore, SqliteExecutionStore, SqliteWorkflowStore,
};
use crate::adapters::ws;
use crate::cli::display;
use crate::domain::models::{Config, WorkflowDefinition};
use crate::domain::ports::{NullSandbox, UnconfiguredDriver};
use crate::services::{
    ActivityDispatcher, ActivityHandlers, AdmissionController, AgentGateway, ControlPlane,
    DagValidator, EventLogger, GatewaySettings, HandlerTimeouts, Orchestrator, OrchestratorConfig,
    WorkflowService,
};

async fn open_pool(config: &Config) -> Result<sqlx::SqlitePool> {
    let database_url = format!("sqlite:{}", config.database.path);
    initialize_database(&database_url).await.context("Failed to initialize database")
}

/// `vectormesh serve`: the agent channel, its sweepers, and the tier
/// worker pools, until ctrl-c.
pub async fn handle_serve(config: Config, port: Option<u16>) -> Result<()> {
    let pool = open_pool(&config).await?;

    let workflow_store = Arc::new(SqliteWorkflowStore::new(pool.clone()));
    let execution_store = Arc::new(SqliteExecutionStore::new(pool.clone()));
    let connector_store = Arc::new(SqliteConnectorStore::new(pool));

    let gateway = Arc::new(AgentGateway::new(
        connector_store.clone(),
        GatewaySettings::from(&config.gateway),
    ));
    let sweepers = gateway.spawn_sweepers();

    let handlers = ActivityHandlers::new(
        connector_store,
        Arc::new(UnconfiguredDriver),
        Arc::new(NullSandbox),
        Arc::clone(&gateway),
        HandlerTimeouts::from(&config.engine),
    );
    let dispatcher = Arc::new(ActivityDispatcher::new(handlers));

    let events = EventLogger::new(execution_store.clone());
    let orchestrator = Arc::new(Orchestrator::new(
        execution_store.clone(),
        events,
        dispatcher,
        OrchestratorConfig::from(&config.engine),
    ));
    let admission = Arc::new(AdmissionController::new(config.admission.clone()));
    let control =
        ControlPlane::new(workflow_store, execution_store, admission, orchestrator);

    let addr: SocketAddr = format!("{}:{}", config.server.host, port.unwrap_or(config.server.port))
        .parse()
        .context("Invalid listen address")?;

    ws::serve(addr, gateway, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;

    for sweeper in sweepers {
        sweeper.abort();
    }
    for worker in control.shutdown() {
        let _ = worker.await;
    }
    Ok(())
}

/// `vectormesh validate <file> --tenant <id>`: dry-run validation of a
/// definition document.
pub async fn handle_validate(
    config: Config,
    file: &Path,
    tenant: &str,
    json: bool,
) -> Result<bool> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let definition: WorkflowDefinition = if file.extension().is_some_and(|e| e == "json") {
        serde_json::from_str(&raw).context("Failed to parse definition JSON")?
    } else {
        serde_yaml::from_str(&raw).context("Failed to parse definition YAML")?
    };

    let pool = open_pool(&config).await?;
    let validator = DagValidator::new(Arc::new(SqliteConnectorStore::new(pool)));
    let report = validator.validate(tenant, &definition).await;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "valid": report.valid,
                "errors": report.errors,
                "warnings": report.warnings,
                "activitiesChecked": report.activities_checked,
                "aggregatorsVerified": report.aggregators_verified,
            })
        );
    } else {
        display::print_validation(&report);
    }
    Ok(report.valid)
}

/// `vectormesh workflows list --tenant <id>`.
pub async fn handle_workflows_list(config: Config, tenant: &str, json: bool) -> Result<()> {
    let pool = open_pool(&config).await?;
    let store = Arc::new(SqliteWorkflowStore::new(pool.clone()));
    let validator = DagValidator::new(Arc::new(SqliteConnectorStore::new(pool)));
    let service = WorkflowService::new(store, validator);

    let workflows = service.find_all(tenant, None).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&workflows)?);
    } else {
        display::print_workflows(&workflows);
    }
    Ok(())
}

/// `vectormesh executions show <id> --tenant <id>`.
pub async fn handle_execution_show(
    config: Config,
    id: Uuid,
    tenant: &str,
    json: bool,
) -> Result<()> {
    use crate::domain::ports::ExecutionStore;

    let pool = open_pool(&config).await?;
    let store = SqliteExecutionStore::new(pool);

    let execution = store.load_execution(id, tenant).await?;
    let attempts = store.list_attempts(id).await?;
    let events = store.list_events(id).await?;
    let details =
        crate::services::engine::ExecutionDetails { execution, attempts, events };

    if json {
        println!(
            "{}",
            serde_json::json!({
                "execution": details.execution,
                "attempts": details.attempts,
                "events": details.events,
            })
        );
    } else {
        display::print_execution(&details);
    }
    Ok(())
}
