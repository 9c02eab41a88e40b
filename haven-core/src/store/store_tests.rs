//! Tests for the configuration store.

use super::*;
use crate::types::{Context, DocumentKind};
use std::sync::atomic::{AtomicUsize, Ordering};

const LEAF_YAML: &str = r#"
kind: leaf
name: sandbox
description: Sandbox research environment
cloud:
  location: uksouth
  subscription_id: 3f6b2a4e-7a35-4a8c-9d1e-2b8f6c1d0a11
  tenant_id: 0c8b7d9e-1f2a-4b3c-8d4e-5f6a7b8c9d0e
network:
  address_space: 10.1.0.0/16
  admin_ip_addresses: [192.0.2.0/30]
identity:
  admin_email_address: admin@example.org
  timezone: Europe/London
"#;

fn context() -> Context {
    Context::new("acme", "Acme Subscription", "Acme Admins", "Acme deployment").unwrap()
}

fn leaf() -> ConfigDocument {
    ConfigDocument::from_yaml(LEAF_YAML, "sandbox.yaml").unwrap()
}

fn store() -> (ConfigStore, Arc<MemoryRemoteStore>) {
    let remote = Arc::new(MemoryRemoteStore::new());
    (ConfigStore::new(remote.clone()), remote)
}

/// Records how often it was asked and answers with a fixed value.
struct CountingConfirm {
    answer: bool,
    asked: AtomicUsize,
}

#[async_trait::async_trait]
impl Confirm for CountingConfirm {
    async fn confirm(&self, request: &ConfirmRequest) -> Result<bool> {
        assert!(request.diff.starts_with("--- remote\n+++ local\n"));
        self.asked.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer)
    }
}

#[tokio::test]
async fn test_first_publish_writes_without_asking() {
    let (store, remote) = store();
    let doc_ref = DocumentRef::leaf(&context(), "sandbox");

    let outcome = store.publish(&leaf(), &doc_ref, &NonInteractive).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Created);
    assert_eq!(remote.write_count(), 1);
    assert!(store.exists_remote(&doc_ref).await.unwrap());
}

#[tokio::test]
async fn test_publish_is_idempotent() {
    let (store, remote) = store();
    let doc_ref = DocumentRef::leaf(&context(), "sandbox");

    store.publish(&leaf(), &doc_ref, &PresetAnswer(true)).await.unwrap();
    let outcome = store.publish(&leaf(), &doc_ref, &PresetAnswer(true)).await.unwrap();

    assert_eq!(outcome, PublishOutcome::NoChanges);
    assert!(!outcome.wrote());
    assert_eq!(remote.write_count(), 1);
}

#[tokio::test]
async fn test_declined_change_is_not_written() {
    let (store, remote) = store();
    let doc_ref = DocumentRef::leaf(&context(), "sandbox");
    store.publish(&leaf(), &doc_ref, &NonInteractive).await.unwrap();

    let mut edited = leaf();
    edited.description = "Edited".to_string();
    let confirm = CountingConfirm { answer: false, asked: AtomicUsize::new(0) };

    let outcome = store.publish(&edited, &doc_ref, &confirm).await.unwrap();
    match outcome {
        PublishOutcome::Declined { diff } => {
            assert!(diff.contains("-description: Sandbox research environment"));
            assert!(diff.contains("+description: Edited"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(confirm.asked.load(Ordering::SeqCst), 1);
    assert_eq!(remote.write_count(), 1);
    assert_eq!(store.load_remote(&doc_ref).await.unwrap(), leaf());
}

#[tokio::test]
async fn test_confirmed_change_is_written() {
    let (store, remote) = store();
    let doc_ref = DocumentRef::leaf(&context(), "sandbox");
    store.publish(&leaf(), &doc_ref, &NonInteractive).await.unwrap();

    let mut edited = leaf();
    edited.features.allow_copy = true;
    let outcome = store.publish(&edited, &doc_ref, &PresetAnswer(true)).await.unwrap();

    assert!(matches!(outcome, PublishOutcome::Updated { .. }));
    assert_eq!(remote.write_count(), 2);
    assert_eq!(store.load_remote(&doc_ref).await.unwrap(), edited);
}

#[tokio::test]
async fn test_changed_document_needs_an_answer() {
    let (store, remote) = store();
    let doc_ref = DocumentRef::leaf(&context(), "sandbox");
    store.publish(&leaf(), &doc_ref, &NonInteractive).await.unwrap();

    let mut edited = leaf();
    edited.description = "Edited".to_string();
    let err = store.publish(&edited, &doc_ref, &NonInteractive).await.unwrap_err();

    assert!(matches!(err, HavenError::ConfirmationRequired { .. }));
    assert_eq!(remote.write_count(), 1);
}

#[tokio::test]
async fn test_single_field_diff_is_one_change() {
    let (store, _) = store();
    let remote_doc = leaf();
    let mut local = leaf();
    local.identity.timezone = "UTC".to_string();

    let changes = store.diff(&local, &remote_doc).unwrap();
    assert_eq!(changes.len(), 1);
    assert!(matches!(
        &changes[0],
        LineChange::Changed { from, to, .. } if from.contains("Europe/London") && to.contains("UTC")
    ));
    assert!(store.diff(&remote_doc, &leaf()).unwrap().is_empty());
    assert!(store.unified_diff(&remote_doc, &leaf()).unwrap().is_empty());
}

#[tokio::test]
async fn test_publish_rejects_mismatched_reference() {
    let (store, remote) = store();
    let doc_ref = DocumentRef::leaf(&context(), "other");
    let err = store.publish(&leaf(), &doc_ref, &PresetAnswer(true)).await.unwrap_err();
    assert!(matches!(err, HavenError::Validation { .. }));
    assert_eq!(remote.write_count(), 0);
}

#[tokio::test]
async fn test_leaf_names_are_sanitised() {
    let (store, _) = store();
    store.publish(&leaf(), &DocumentRef::leaf(&context(), "sandbox"), &NonInteractive).await.unwrap();

    let mixed_case = DocumentRef::leaf(&context(), "SandBox");
    assert_eq!(mixed_case.key(), "acme/leaf-sandbox.yaml");
    assert!(store.exists_remote(&mixed_case).await.unwrap());
}

#[tokio::test]
async fn test_load_remote_missing() {
    let (store, _) = store();
    let err = store.load_remote(&DocumentRef::hub(&context())).await.unwrap_err();
    assert!(matches!(err, HavenError::NotFound { .. }));
}

#[tokio::test]
async fn test_store_outage_is_surfaced() {
    let (store, remote) = store();
    remote.set_unavailable(true);
    let err = store
        .publish(&leaf(), &DocumentRef::leaf(&context(), "sandbox"), &PresetAnswer(true))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unparseable_remote_counts_as_changed() {
    let (store, remote) = store();
    let doc_ref = DocumentRef::leaf(&context(), "sandbox");
    remote.put(&doc_ref.key(), b"garbage: [").await.unwrap();

    let outcome = store.publish(&leaf(), &doc_ref, &PresetAnswer(true)).await.unwrap();
    assert!(matches!(outcome, PublishOutcome::Updated { .. }));
    assert_eq!(store.load_remote(&doc_ref).await.unwrap().kind, DocumentKind::Leaf);
}

#[tokio::test]
async fn test_load_local() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sandbox.yaml");
    std::fs::write(&path, LEAF_YAML).unwrap();

    let (store, _) = store();
    assert_eq!(store.load_local(&path).await.unwrap(), leaf());

    std::fs::write(&path, "kind: leaf\nname: [").unwrap();
    assert!(matches!(store.load_local(&path).await.unwrap_err(), HavenError::Parse { .. }));
}
