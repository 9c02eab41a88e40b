//! Configuration store.
//!
//! Publishes hub and leaf documents to a [`RemoteStore`] and loads them back
//! at apply time. Uploads are diff-gated: an unchanged document is never
//! rewritten, and a changed one is only written after confirmation.
//!
//! There is no server-side lock. Two operators publishing the same document
//! concurrently can overwrite each other; the last write wins.

pub mod confirm;
pub mod diff;
pub mod remote;
pub mod template;

pub use confirm::{Confirm, ConfirmRequest, NonInteractive, PresetAnswer};
pub use diff::LineChange;
pub use remote::{FsRemoteStore, MemoryRemoteStore, RemoteStore};
pub use template::template;

use crate::error::{HavenError, Result};
use crate::types::{sanitise, ConfigDocument, DocumentRef};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument};

/// Context lines shown around each diff hunk.
const DIFF_CONTEXT: usize = 3;

/// Result of a publish call. Only `Created` and `Updated` wrote anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// No remote object existed; written unconditionally
    Created,

    /// Remote differed and the change was confirmed
    Updated { diff: String },

    /// Remote is semantically equal to local
    NoChanges,

    /// Remote differed and the change was declined
    Declined { diff: String },
}

impl PublishOutcome {
    pub fn wrote(&self) -> bool {
        matches!(self, Self::Created | Self::Updated { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated { .. } => "updated",
            Self::NoChanges => "no_changes",
            Self::Declined { .. } => "declined",
        }
    }
}

/// Loads, compares and publishes configuration documents.
#[derive(Clone)]
pub struct ConfigStore {
    remote: Arc<dyn RemoteStore>,
}

impl ConfigStore {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self { remote }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Parse and validate a local document.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn load_local(&self, path: impl AsRef<Path>) -> Result<ConfigDocument> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| HavenError::IoError { path: path.to_path_buf(), source: e })?;
        ConfigDocument::from_yaml(&content, &path.display().to_string())
    }

    /// Raw YAML of a remote document.
    #[instrument(skip(self), fields(key = %doc_ref.key()))]
    pub async fn show_remote(&self, doc_ref: &DocumentRef) -> Result<String> {
        let bytes = self.get(doc_ref).await?;
        String::from_utf8(bytes).map_err(|e| HavenError::Parse {
            source_name: doc_ref.key(),
            reason: format!("not UTF-8: {}", e),
        })
    }

    /// Load and validate a remote document.
    #[instrument(skip(self), fields(key = %doc_ref.key()))]
    pub async fn load_remote(&self, doc_ref: &DocumentRef) -> Result<ConfigDocument> {
        let text = self.show_remote(doc_ref).await?;
        ConfigDocument::from_yaml(&text, &doc_ref.key())
    }

    /// Whether a remote document exists.
    pub async fn exists_remote(&self, doc_ref: &DocumentRef) -> Result<bool> {
        self.remote.exists(&doc_ref.key()).await
    }

    /// Line-level changes from `remote` to `local`. Empty when semantically equal.
    pub fn diff(&self, local: &ConfigDocument, remote: &ConfigDocument) -> Result<Vec<LineChange>> {
        if local.semantically_eq(remote)? {
            return Ok(Vec::new());
        }
        Ok(diff::line_changes(&remote.canonical_yaml()?, &local.canonical_yaml()?))
    }

    /// Unified diff from `remote` to `local`. Empty when semantically equal.
    pub fn unified_diff(&self, local: &ConfigDocument, remote: &ConfigDocument) -> Result<String> {
        if local.semantically_eq(remote)? {
            return Ok(String::new());
        }
        Ok(diff::unified_diff(
            &remote.canonical_yaml()?,
            &local.canonical_yaml()?,
            "remote",
            "local",
            DIFF_CONTEXT,
        ))
    }

    /// Publish `local` under `doc_ref`.
    ///
    /// Writes unconditionally when nothing exists remotely. Otherwise writes
    /// only if the canonical serializations differ and `confirm` agrees.
    /// A remote object that no longer parses is treated as changed.
    #[instrument(skip(self, local, confirm), fields(key = %doc_ref.key()))]
    pub async fn publish(
        &self,
        local: &ConfigDocument,
        doc_ref: &DocumentRef,
        confirm: &dyn Confirm,
    ) -> Result<PublishOutcome> {
        local.validate()?;
        if local.kind != doc_ref.kind || sanitise(&local.name) != sanitise(&doc_ref.name) {
            return Err(HavenError::validation(
                "name",
                format!("document {} '{}' cannot be published as {}", local.kind, local.name, doc_ref),
            ));
        }

        let key = doc_ref.key();
        let canonical = local.canonical_yaml()?;

        let outcome = if !self.remote.exists(&key).await? {
            self.remote.put(&key, canonical.as_bytes()).await?;
            PublishOutcome::Created
        } else {
            let remote_text = self.show_remote(doc_ref).await?;
            let remote_canonical = match ConfigDocument::from_yaml(&remote_text, &key) {
                Ok(remote) => remote.canonical_yaml()?,
                Err(_) => remote_text,
            };

            if remote_canonical == canonical {
                PublishOutcome::NoChanges
            } else {
                let diff = diff::unified_diff(&remote_canonical, &canonical, "remote", "local", DIFF_CONTEXT);
                let request = ConfirmRequest { action: format!("upload {}", doc_ref), diff: diff.clone() };
                if confirm.confirm(&request).await? {
                    self.remote.put(&key, canonical.as_bytes()).await?;
                    PublishOutcome::Updated { diff }
                } else {
                    PublishOutcome::Declined { diff }
                }
            }
        };

        metrics::counter!("haven_publish_total", "outcome" => outcome.label()).increment(1);
        info!(outcome = outcome.label(), "Publish finished");
        Ok(outcome)
    }

    async fn get(&self, doc_ref: &DocumentRef) -> Result<Vec<u8>> {
        self.remote.get(&doc_ref.key()).await.map_err(|e| match e {
            HavenError::NotFound { .. } => HavenError::NotFound { what: doc_ref.to_string() },
            other => other,
        })
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
