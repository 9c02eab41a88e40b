//! Haven Core Library
//!
//! Orchestrates one hub stack and its leaf stacks per deployment context,
//! with configuration documents kept in a remote store and per-stack
//! secrets encrypted at rest.

pub mod config;
pub mod error;
pub mod network;
pub mod observability;
pub mod orchestrator;
pub mod paths;
pub mod provisioner;
pub mod secrets;
pub mod state;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use config::{Config, ContextRegistry};
pub use error::{HavenError, Result};
pub use observability::init as init_observability;
pub use orchestrator::{
    cancellation, ApplyReport, CancelHandle, Cancellation, PlanReport, StackOrchestrator, TeardownOutcome,
};
pub use provisioner::{CliProvisioner, Declaration, MockProvisioner, ResourceProvisioner};
pub use secrets::{KeyFile, KeyProvider, SecretProvisioner, StaticKeyProvider};
pub use state::StateManager;
pub use store::{
    Confirm, ConfigStore, ConfirmRequest, FsRemoteStore, MemoryRemoteStore, NonInteractive, PresetAnswer,
    PublishOutcome, RemoteStore,
};
pub use types::{
    ConfigDocument, Context, ContextUpdate, DocumentKind, DocumentRef, StackId, StackKind, StackRecord,
    StackStatus, StackTarget,
};
