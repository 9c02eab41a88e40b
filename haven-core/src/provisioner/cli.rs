//! Provisioner backed by an external program (pulumi by default).
//!
//! Protocol, run in `<work_dir>/<stack_id>`:
//! - `<program> apply <stack_id>` reads the declaration JSON on stdin and
//!   prints a JSON object of outputs on stdout
//! - `<program> destroy <stack_id>`
//! - `<program> <args...>` for raw commands, with `HAVEN_STACK` set; the
//!   command line is split with shell quoting rules

use super::{Declaration, ResourceProvisioner};
use crate::error::{HavenError, Result};
use crate::types::StackId;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Destroy failures caused by resources that are still being released.
const TRANSIENT_DESTROY_ERRORS: &[&str] =
    &["NetworkProfileAlreadyInUseWithContainerNics", "InUseSubnetCannotBeDeleted"];

/// Captured result of one program run.
struct RunOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl RunOutput {
    fn failure_reason(&self) -> String {
        let detail = self.stderr.trim();
        if detail.is_empty() {
            "program exited with an error".to_string()
        } else {
            detail.lines().last().unwrap_or(detail).to_string()
        }
    }
}

/// Runs an external program per stack.
pub struct CliProvisioner {
    program: PathBuf,
    program_args: Vec<String>,
    work_dir: PathBuf,
    destroy_attempts: u32,
    retry_delay: Duration,
}

impl CliProvisioner {
    pub fn new(program: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            program_args: Vec::new(),
            work_dir: work_dir.into(),
            destroy_attempts: 5,
            retry_delay: Duration::from_secs(10),
        }
    }

    /// Arguments inserted before every subcommand.
    pub fn with_program_args(mut self, args: Vec<String>) -> Self {
        self.program_args = args;
        self
    }

    /// Bound the destroy retry loop.
    pub fn with_destroy_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.destroy_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    async fn run(&self, stack_id: &StackId, args: &[&str], input: Option<Vec<u8>>) -> Result<RunOutput> {
        let stack_dir = self.work_dir.join(stack_id.as_str());
        tokio::fs::create_dir_all(&stack_dir)
            .await
            .map_err(|e| HavenError::IoError { path: stack_dir.clone(), source: e })?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.program_args)
            .args(args)
            .current_dir(&stack_dir)
            .env("HAVEN_STACK", stack_id.as_str())
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.program.display(), ?args, "Spawning provisioner");
        let mut child = cmd.spawn().map_err(|e| HavenError::Command {
            stack_id: stack_id.to_string(),
            reason: format!("failed to spawn {}: {}", self.program.display(), e),
        })?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    warn!("Failed to write declaration to provisioner: {}", e);
                }
            });
        }

        let output = child.wait_with_output().await.map_err(|e| HavenError::Command {
            stack_id: stack_id.to_string(),
            reason: format!("failed to wait for {}: {}", self.program.display(), e),
        })?;

        Ok(RunOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[async_trait]
impl ResourceProvisioner for CliProvisioner {
    #[instrument(skip(self, declaration), fields(stack_id = %stack_id))]
    async fn apply(&self, stack_id: &StackId, declaration: &Declaration) -> Result<BTreeMap<String, String>> {
        let output = self.run(stack_id, &["apply", stack_id.as_str()], Some(declaration.to_json()?)).await?;
        if !output.success {
            return Err(HavenError::Provision { stack_id: stack_id.to_string(), reason: output.failure_reason() });
        }
        parse_outputs(stack_id, &output.stdout)
    }

    #[instrument(skip(self), fields(stack_id = %stack_id))]
    async fn destroy(&self, stack_id: &StackId) -> Result<()> {
        let mut attempt = 1;
        loop {
            let output = self.run(stack_id, &["destroy", stack_id.as_str()], None).await?;
            if output.success {
                info!(attempt, "Destroyed stack resources");
                return Ok(());
            }

            let transient = TRANSIENT_DESTROY_ERRORS
                .iter()
                .any(|marker| output.stderr.contains(marker) || output.stdout.contains(marker));
            if !transient || attempt >= self.destroy_attempts {
                return Err(HavenError::Provision {
                    stack_id: stack_id.to_string(),
                    reason: output.failure_reason(),
                });
            }

            warn!(attempt, "Resources still in use, retrying destroy in {:?}", self.retry_delay);
            tokio::time::sleep(self.retry_delay).await;
            attempt += 1;
        }
    }

    #[instrument(skip(self), fields(stack_id = %stack_id))]
    async fn raw_command(&self, stack_id: &StackId, command_line: &str) -> Result<String> {
        let args = shlex::split(command_line)
            .ok_or_else(|| HavenError::validation("command", "has an unterminated quote or escape"))?;
        if args.is_empty() {
            return Err(HavenError::validation("command", "must not be empty"));
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = self.run(stack_id, &args, None).await?;
        if !output.success {
            return Err(HavenError::Command { stack_id: stack_id.to_string(), reason: output.failure_reason() });
        }
        Ok(output.stdout)
    }
}

/// Parse `{"key": value, ...}` from provisioner stdout. Non-string values
/// are kept as their JSON text.
fn parse_outputs(stack_id: &StackId, stdout: &str) -> Result<BTreeMap<String, String>> {
    if stdout.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    let values: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(stdout.trim()).map_err(|e| HavenError::Provision {
            stack_id: stack_id.to_string(),
            reason: format!("provisioner printed invalid outputs: {}", e),
        })?;

    Ok(values
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, text)
        })
        .collect())
}
