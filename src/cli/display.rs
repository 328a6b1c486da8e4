//! Table and status rendering for CLI output.

use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use console::style;

use crate::domain::models::Workflow;
use crate::services::engine::ExecutionDetails;
use crate::services::validator::ValidationReport;

pub fn print_validation(report: &ValidationReport) {
    if report.valid {
        println!(
            "{} {} activities checked, {} aggregator(s) verified",
            style("valid").green().bold(),
            report.activities_checked,
            report.aggregators_verified.len()
        );
    } else {
        println!("{}", style("invalid").red().bold());
        for error in &report.errors {
            println!("  {} {error}", style("error:").red());
        }
    }
    for warning in &report.warnings {
        println!("  {} {warning}", style("warning:").yellow());
    }
}

pub fn print_workflows(workflows: &[Workflow]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["ID", "Name", "Status", "Version", "Hash", "Activities"]);

    for workflow in workflows {
        table.add_row(vec![
            Cell::new(workflow.id),
            Cell::new(&workflow.name),
            Cell::new(workflow.status),
            Cell::new(workflow.version),
            Cell::new(&workflow.hash[..12.min(workflow.hash.len())]),
            Cell::new(workflow.definition.activities.len()),
        ]);
    }

    println!("{table}");
}

pub fn print_execution(details: &ExecutionDetails) {
    let execution = &details.execution;
    println!(
        "{} {} [{}] workflow {} v{}",
        style("execution").bold(),
        execution.id,
        style(execution.status).cyan(),
        execution.workflow_id,
        execution.workflow_version
    );
    if let Some(error) = &execution.error_message {
        println!("  {} {error}", style("error:").red());
    }

    let mut attempts = Table::new();
    attempts
        .load_preset(UTF8_FULL)
        .set_header(vec!["Step", "Type", "Attempt", "Status", "Error"]);
    for attempt in &details.attempts {
        attempts.add_row(vec![
            Cell::new(&attempt.step_id),
            Cell::new(&attempt.activity_type),
            Cell::new(attempt.attempt),
            Cell::new(attempt.status),
            Cell::new(attempt.error_message.as_deref().unwrap_or("-")),
        ]);
    }
    println!("{attempts}");

    let mut events = Table::new();
    events.load_preset(UTF8_FULL).set_header(vec!["Timestamp", "Event", "Payload"]);
    for event in &details.events {
        events.add_row(vec![
            Cell::new(event.timestamp.to_rfc3339()),
            Cell::new(event.event_type),
            Cell::new(event.payload.to_string()),
        ]);
    }
    println!("{events}");
}
