//! Core domain types for Haven.

pub mod context;
pub mod document;
pub mod naming;
pub mod stack;

// Re-exports
pub use context::{Context, ContextUpdate};
pub use document::{
    CloudSection, ConfigDocument, DatabaseSystem, DockerHubSection, DocumentKind, DocumentRef,
    FeatureFlags, IdentitySection, NetworkSection, SoftwarePackages,
};
pub use naming::{is_safe_identifier, sanitise};
pub use stack::{StackId, StackKind, StackRecord, StackStatus, StackTarget};
