//! `haven stack` commands

use crate::app::App;
use anyhow::Result;
use colored::Colorize;
use haven_core::{cancellation, Cancellation, StackStatus, StackTarget, TeardownOutcome};
use std::time::{SystemTime, UNIX_EPOCH};
use tabled::{settings::Style, Table, Tabled};

/// Validate a stack and its prerequisites
pub async fn plan(app: &App, target: &StackTarget) -> Result<()> {
    let report = app.orchestrator.plan(&app.context, target).await?;

    println!("{} {} is {}", "→".cyan().bold(), report.stack_id.to_string().bold(), colorize_status(report.status));
    if report.changed {
        println!("  Document {} differs from the last apply", short_hash(&report.document_hash));
    }
    println!("  Address space {}", report.address_plan.parent_block);
    for allocation in &report.address_plan.subnets {
        println!("    {} {:<20} {}", "•".dimmed(), allocation.purpose, allocation.subnet);
    }
    if !report.new_secrets.is_empty() {
        println!("  Secrets to generate: {}", report.new_secrets.join(", ").dimmed());
    }
    Ok(())
}

/// Deploy a stack; Ctrl-C cancels the provisioner
pub async fn apply(app: &App, target: &StackTarget) -> Result<()> {
    println!("{} Applying {}...", "→".cyan().bold(), target);
    let report = app.orchestrator.apply(&app.context, target, &interrupt_on_ctrl_c()).await?;

    println!("{} Applied {}", "✓".green().bold(), report.stack_id.to_string().bold());
    if report.secrets_created > 0 {
        println!("  Generated {} new secret(s)", report.secrets_created);
    }
    for (key, value) in &report.outputs {
        println!("    {} {} = {}", "•".dimmed(), key, value);
    }
    Ok(())
}

/// Mark a deployed stack stale if its document changed
pub async fn refresh(app: &App, target: &StackTarget) -> Result<()> {
    let record = app.orchestrator.refresh(&app.context, target).await?;
    println!("{} is {}", record.id.to_string().bold(), colorize_status(record.status));
    Ok(())
}

/// Destroy a stack's resources; Ctrl-C cancels the provisioner
pub async fn teardown(app: &App, target: &StackTarget) -> Result<()> {
    println!("{} Tearing down {}...", "→".cyan().bold(), target);
    match app.orchestrator.teardown(&app.context, target, &interrupt_on_ctrl_c()).await? {
        TeardownOutcome::Destroyed => println!("{} Destroyed {}", "✓".green().bold(), target),
        TeardownOutcome::NothingToDo(status) => {
            println!("Nothing to tear down, {} is {}.", target, status)
        }
    }
    Ok(())
}

/// List every stack of the context
pub async fn status(app: &App) -> Result<()> {
    #[derive(Tabled)]
    struct StackRow {
        #[tabled(rename = "STACK")]
        id: String,
        #[tabled(rename = "KIND")]
        kind: String,
        #[tabled(rename = "STATUS")]
        status: String,
        #[tabled(rename = "APPLIED")]
        applied: String,
        #[tabled(rename = "UPDATED")]
        updated: String,
        #[tabled(rename = "LAST ERROR")]
        error: String,
    }

    let records = app.orchestrator.list(&app.context).await?;
    if records.is_empty() {
        println!("No stacks in context {}", app.context.name());
        return Ok(());
    }

    let rows: Vec<StackRow> = records
        .into_iter()
        .map(|r| StackRow {
            id: r.id.to_string(),
            kind: r.kind.label().to_string(),
            status: colorize_status(r.status),
            applied: r.applied_hash.as_deref().map(short_hash).unwrap_or_else(|| "-".to_string()),
            updated: format_age(r.updated_at),
            error: r.last_error.unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);
    Ok(())
}

/// A cancellation fired by the first Ctrl-C.
fn interrupt_on_ctrl_c() -> Cancellation {
    let (handle, cancel) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted, stopping provisioner...".yellow());
            handle.cancel();
        }
    });
    cancel
}

fn colorize_status(status: StackStatus) -> String {
    let text = status.to_string();
    match status {
        StackStatus::Applied => text.green().to_string(),
        StackStatus::Failed => text.red().to_string(),
        StackStatus::Stale | StackStatus::Applying | StackStatus::Destroying => text.yellow().to_string(),
        _ => text.dimmed().to_string(),
    }
}

fn short_hash(hash: &str) -> String {
    hash.chars().take(12).collect()
}

fn format_age(time: SystemTime) -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let then = time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let elapsed = now.saturating_sub(then);
    match elapsed {
        0..=59 => format!("{}s ago", elapsed),
        60..=3599 => format!("{}m ago", elapsed / 60),
        3600..=86399 => format!("{}h ago", elapsed / 3600),
        _ => format!("{}d ago", elapsed / 86400),
    }
}
