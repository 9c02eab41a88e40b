//! `haven secret` commands

use crate::app::App;
use anyhow::Result;
use colored::Colorize;
use haven_core::StackTarget;

/// List stored secret names; values are never printed
pub async fn list(app: &App, target: &StackTarget) -> Result<()> {
    let record = app.orchestrator.status(&app.context, target).await?;
    let names = app.orchestrator.secrets().list(&record.id).await?;

    if names.is_empty() {
        println!("No secrets stored for {}", record.id);
        return Ok(());
    }
    for name in names {
        println!("{}", name);
    }
    Ok(())
}

/// Replace one secret; takes effect on the next apply
pub async fn rotate(app: &App, target: &StackTarget, name: &str) -> Result<()> {
    let secret = app.orchestrator.rotate_secret(&app.context, target, name).await?;
    println!(
        "{} Rotated {} for {}; run `haven stack apply` to roll it out",
        "✓".green().bold(),
        name.bold(),
        secret.stack_id
    );
    Ok(())
}
