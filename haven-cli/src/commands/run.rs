//! `haven run` command

use crate::app::App;
use anyhow::Result;
use haven_core::StackTarget;

/// Run a raw provisioner command against a stack and print its output
pub async fn run(app: &App, target: &StackTarget, command: &str) -> Result<()> {
    let stdout = app.orchestrator.run_raw_command(&app.context, target, command).await?;
    print!("{}", stdout);
    Ok(())
}
