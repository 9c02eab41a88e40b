//! Error types for Haven.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Every variant renders as a single human-readable line.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Haven operations.
pub type Result<T> = std::result::Result<T, HavenError>;

/// Main error type for Haven.
#[derive(Error, Debug)]
pub enum HavenError {
    // Document errors
    #[error("Failed to parse {source_name}: {reason}")]
    Parse { source_name: String, reason: String },

    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    // Remote store errors
    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Configuration store unavailable while accessing '{key}': {reason}")]
    StoreUnavailable { key: String, reason: String },

    // Confirmation errors
    #[error("Confirmation required to {action}; rerun interactively or pass an explicit answer")]
    ConfirmationRequired { action: String },

    // Stack lifecycle errors
    #[error("Stack {stack_id} cannot proceed: {reason}")]
    DependencyNotReady { stack_id: String, reason: String },

    #[error("Stack {stack_id} cannot move from {from} to {to}")]
    InvalidTransition { stack_id: String, from: String, to: String },

    #[error("Stack {stack_id} is busy: another operation holds its lease")]
    StackBusy { stack_id: String },

    #[error("Operation on stack {stack_id} was cancelled")]
    Cancelled { stack_id: String },

    // Provisioner errors
    #[error("Provisioning failed for stack {stack_id}: {reason}")]
    Provision { stack_id: String, reason: String },

    #[error("Command failed for stack {stack_id}: {reason}")]
    Command { stack_id: String, reason: String },

    // Planning errors
    #[error(
        "Insufficient address space in {block}: cannot fit '{purpose}' ({required} addresses)"
    )]
    InsufficientAddressSpace { block: String, purpose: String, required: u64 },

    // Secret errors
    #[error("Secret store error: {reason}")]
    Crypto { reason: String },

    // Database errors
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Database migration failed: {reason}")]
    MigrationFailed { reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HavenError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Shorthand for a validation failure on a named field.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation { field: field.into(), reason: reason.into() }
    }

    /// Whether the failure is transient and safe to retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_errors_are_retryable() {
        let transient =
            HavenError::StoreUnavailable { key: "acme/hub-acme.yaml".into(), reason: "eof".into() };
        assert!(transient.is_retryable());

        let fatal = HavenError::Provision { stack_id: "shm-acme".into(), reason: "quota".into() };
        assert!(!fatal.is_retryable());
        assert!(!HavenError::validation("name", "empty").is_retryable());
    }

    #[test]
    fn test_messages_are_single_line() {
        let err = HavenError::InsufficientAddressSpace {
            block: "10.0.0.0/28".into(),
            purpose: "workspaces".into(),
            required: 64,
        };
        let rendered = err.to_string();
        assert!(!rendered.contains('\n'));
        assert!(rendered.contains("workspaces"));
    }
}
