//! Vectormesh CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;

use vectormesh::cli::{commands, Cli, Commands, ExecutionCommands, WorkflowCommands};
use vectormesh::infrastructure::config::ConfigLoader;
use vectormesh::infrastructure::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load().context("Failed to load configuration")?,
    };
    let _log_guard = logging::init(&config.logging)?;

    match cli.command {
        Commands::Serve { port } => commands::handle_serve(config, port).await,

        Commands::Validate { file, tenant } => {
            let valid = commands::handle_validate(config, &file, &tenant, cli.json).await?;
            if !valid {
                std::process::exit(1);
            }
            Ok(())
        }

        Commands::Workflows { command } => match command {
            WorkflowCommands::List { tenant } => {
                commands::handle_workflows_list(config, &tenant, cli.json).await
            }
        },

        Commands::Executions { command } => match command {
            ExecutionCommands::Show { id, tenant } => {
                commands::handle_execution_show(config, id, &tenant, cli.json).await
            }
        },
    }
}
