//! Confirmation gate for remote writes.

use crate::error::{HavenError, Result};
use async_trait::async_trait;

/// What the operator is being asked to approve.
#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    /// Short description, e.g. "upload leaf document 'sandbox'"
    pub action: String,

    /// Unified diff, remote as "from" and local as "to"
    pub diff: String,
}

/// Decides whether a pending change may be written.
///
/// Implementations may block indefinitely waiting for a human.
#[async_trait]
pub trait Confirm: Send + Sync {
    /// `Ok(true)` to proceed, `Ok(false)` to abort without writing.
    async fn confirm(&self, request: &ConfirmRequest) -> Result<bool>;
}

/// A fixed answer supplied up front (`--yes` / `--no`).
#[derive(Debug, Clone, Copy)]
pub struct PresetAnswer(pub bool);

#[async_trait]
impl Confirm for PresetAnswer {
    async fn confirm(&self, _request: &ConfirmRequest) -> Result<bool> {
        Ok(self.0)
    }
}

/// No operator available and no answer supplied.
#[derive(Debug, Clone, Copy)]
pub struct NonInteractive;

#[async_trait]
impl Confirm for NonInteractive {
    async fn confirm(&self, request: &ConfirmRequest) -> Result<bool> {
        Err(HavenError::ConfirmationRequired { action: request.action.clone() })
    }
}
