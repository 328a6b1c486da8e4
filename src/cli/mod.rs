//! Command-line interface.

pub mod commands;
pub mod display;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "vectormesh", about = "Multi-tenant data-integration control plane", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Load configuration from a specific file instead of the default
    /// `.vectormesh/` hierarchy.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit machine-readable JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control plane: agent channel, sweepers, tier workers.
    Serve {
        /// Override the configured listen port.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate a workflow definition file (JSON or YAML) without saving it.
    Validate {
        file: PathBuf,

        #[arg(long)]
        tenant: String,
    },

    /// Workflow catalogue operations.
    Workflows {
        #[command(subcommand)]
        command: WorkflowCommands,
    },

    /// Execution inspection.
    Executions {
        #[command(subcommand)]
        command: ExecutionCommands,
    },
}

#[derive(Subcommand)]
pub enum WorkflowCommands {
    /// List a tenant's workflows (latest version of each).
    List {
        #[arg(long)]
        tenant: String,
    },
}

#[derive(Subcommand)]
pub enum ExecutionCommands {
    /// Show an execution with its attempts and event log.
    Show {
        id: Uuid,

        #[arg(long)]
        tenant: String,
    },
}
