//! Integration tests for hub and leaf stack lifecycles.
//!
//! These tests drive the public API end to end:
//! - Publish documents to a filesystem store
//! - Apply the hub, then leaves
//! - Re-apply, edit and tear down
//!
//! State lives in a temporary directory; the provisioner is the in-process mock.

use haven_core::{
    network::nets_overlap, Cancellation, ConfigDocument, ConfigStore, Context, DocumentRef, FsRemoteStore,
    HavenError, KeyFile, MockProvisioner, PresetAnswer, PublishOutcome, SecretProvisioner, StackOrchestrator,
    StackStatus, StackTarget, StateManager, TeardownOutcome,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const HUB_YAML: &str = r#"
kind: hub
name: acme
description: Acme hub
cloud:
  location: uksouth
  subscription_id: 3f6b2a4e-7a35-4a8c-9d1e-2b8f6c1d0a11
  tenant_id: 0c8b7d9e-1f2a-4b3c-8d4e-5f6a7b8c9d0e
network:
  address_space: 10.0.0.0/24
  admin_ip_addresses: [192.0.2.0/30]
identity:
  admin_email_address: admin@example.org
  admin_group_id: 6a1f2e3d-4c5b-4a69-8877-665544332211
  timezone: UTC
"#;

fn leaf_yaml(name: &str, address_space: &str) -> String {
    format!(
        r#"
kind: leaf
name: {name}
description: Research environment {name}
cloud:
  location: uksouth
  subscription_id: 3f6b2a4e-7a35-4a8c-9d1e-2b8f6c1d0a11
  tenant_id: 0c8b7d9e-1f2a-4b3c-8d4e-5f6a7b8c9d0e
network:
  address_space: {address_space}
  admin_ip_addresses: [192.0.2.0/30]
  user_ip_addresses: [198.51.100.0/30]
identity:
  admin_email_address: admin@example.org
  timezone: Europe/London
"#
    )
}

struct Deployment {
    orchestrator: StackOrchestrator,
    store: ConfigStore,
    provisioner: Arc<MockProvisioner>,
    context: Context,
}

async fn open(dir: &Path, provisioner: Arc<MockProvisioner>) -> Deployment {
    let state = StateManager::new(dir.join("haven.db")).await.unwrap();
    let store = ConfigStore::new(Arc::new(FsRemoteStore::new(dir.join("remote"))));
    let secrets = SecretProvisioner::new(state.clone(), Arc::new(KeyFile::new(dir.join("data.key"))));
    let orchestrator = StackOrchestrator::new(state, store.clone(), provisioner.clone(), secrets);
    let context = Context::new("acme", "Acme Subscription", "Acme Admins", "Acme deployment").unwrap();
    Deployment { orchestrator, store, provisioner, context }
}

impl Deployment {
    async fn publish(&self, yaml: &str, confirm: bool) -> PublishOutcome {
        let document = ConfigDocument::from_yaml(yaml, "test.yaml").unwrap();
        let doc_ref = DocumentRef::for_document(&self.context, &document).unwrap();
        self.store.publish(&document, &doc_ref, &PresetAnswer(confirm)).await.unwrap()
    }
}

fn leaf(name: &str) -> StackTarget {
    StackTarget::Leaf(name.to_string())
}

#[tokio::test]
async fn test_end_to_end() {
    let dir = TempDir::new().unwrap();
    let d = open(dir.path(), Arc::new(MockProvisioner::new())).await;
    let never = Cancellation::never();

    // (1) hub
    assert_eq!(d.publish(HUB_YAML, false).await, PublishOutcome::Created);
    let hub = d.orchestrator.apply(&d.context, &StackTarget::Hub, &never).await.unwrap();
    assert_eq!(d.orchestrator.status(&d.context, &StackTarget::Hub).await.unwrap().status, StackStatus::Applied);

    // (2) leaf, disjoint from the hub
    let sandbox = leaf_yaml("sandbox", "10.1.0.0/24");
    assert_eq!(d.publish(&sandbox, false).await, PublishOutcome::Created);
    let first = d.orchestrator.apply(&d.context, &leaf("sandbox"), &never).await.unwrap();
    assert!(!nets_overlap(&first.address_plan.parent_block, &hub.address_plan.parent_block));
    for subnet in &first.address_plan.subnets {
        assert!(!hub.address_plan.overlaps(&subnet.subnet));
    }

    // (3) an edit that is declined leaves the remote untouched
    let edited = sandbox.replace("timezone: Europe/London", "timezone: UTC");
    let local = ConfigDocument::from_yaml(&edited, "edited.yaml").unwrap();
    let remote_ref = DocumentRef::leaf(&d.context, "sandbox");
    let remote = d.store.load_remote(&remote_ref).await.unwrap();
    assert_eq!(d.store.diff(&local, &remote).unwrap().len(), 1);

    match d.publish(&edited, false).await {
        PublishOutcome::Declined { diff } => assert!(diff.contains("+  timezone: UTC")),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(d.store.load_remote(&remote_ref).await.unwrap(), remote);

    // (4) re-applying the unchanged leaf is stable
    let second = d.orchestrator.apply(&d.context, &leaf("sandbox"), &never).await.unwrap();
    assert_eq!(second.secrets_created, 0);
    assert_eq!(second.address_plan, first.address_plan);

    let applied = d.provisioner.applied();
    assert_eq!(applied[1].secrets, applied[2].secrets);
    assert_eq!(applied[2].allow_lists["admin"], vec!["192.0.2.0", "192.0.2.1", "192.0.2.2", "192.0.2.3"]);
    assert_eq!(applied[2].user_ranges, vec!["198.51.100.0/30"]);
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let never = Cancellation::never();

    let first = open(dir.path(), Arc::new(MockProvisioner::new())).await;
    first.publish(HUB_YAML, false).await;
    first.orchestrator.apply(&first.context, &StackTarget::Hub, &never).await.unwrap();
    let before = first.provisioner.applied()[0].secrets.clone();
    drop(first);

    let second = open(dir.path(), Arc::new(MockProvisioner::new())).await;
    let record = second.orchestrator.status(&second.context, &StackTarget::Hub).await.unwrap();
    assert_eq!(record.status, StackStatus::Applied);
    assert!(record.address_plan.is_some());

    let report = second.orchestrator.apply(&second.context, &StackTarget::Hub, &never).await.unwrap();
    assert_eq!(report.secrets_created, 0);
    assert_eq!(second.provisioner.applied()[0].secrets, before);
}

#[tokio::test]
async fn test_leaves_apply_in_parallel() {
    let dir = TempDir::new().unwrap();
    let d = open(dir.path(), Arc::new(MockProvisioner::new())).await;
    let never = Cancellation::never();

    d.publish(HUB_YAML, false).await;
    d.publish(&leaf_yaml("sandbox", "10.1.0.0/24"), false).await;
    d.publish(&leaf_yaml("analysis", "10.2.0.0/24"), false).await;
    d.orchestrator.apply(&d.context, &StackTarget::Hub, &never).await.unwrap();

    let sandbox = leaf("sandbox");
    let analysis = leaf("analysis");
    let (a, b) = tokio::join!(
        d.orchestrator.apply(&d.context, &sandbox, &never),
        d.orchestrator.apply(&d.context, &analysis, &never),
    );
    a.unwrap();
    b.unwrap();

    let ids: Vec<String> =
        d.orchestrator.list(&d.context).await.unwrap().into_iter().map(|r| r.id.to_string()).collect();
    assert_eq!(ids, vec!["shm-acme", "shm-acme-sre-analysis", "shm-acme-sre-sandbox"]);
}

#[tokio::test]
async fn test_hub_teardown_waits_for_leaves() {
    let dir = TempDir::new().unwrap();
    let d = open(dir.path(), Arc::new(MockProvisioner::new())).await;
    let never = Cancellation::never();

    d.publish(HUB_YAML, false).await;
    d.publish(&leaf_yaml("sandbox", "10.1.0.0/24"), false).await;
    d.orchestrator.apply(&d.context, &StackTarget::Hub, &never).await.unwrap();
    d.orchestrator.apply(&d.context, &leaf("sandbox"), &never).await.unwrap();

    let err = d.orchestrator.teardown(&d.context, &StackTarget::Hub, &never).await.unwrap_err();
    assert!(matches!(err, HavenError::DependencyNotReady { .. }));
    assert!(d.provisioner.destroyed().is_empty());

    assert_eq!(
        d.orchestrator.teardown(&d.context, &leaf("sandbox"), &never).await.unwrap(),
        TeardownOutcome::Destroyed
    );
    assert_eq!(
        d.orchestrator.teardown(&d.context, &StackTarget::Hub, &never).await.unwrap(),
        TeardownOutcome::Destroyed
    );

    // A destroyed hub blocks leaves again
    let err = d.orchestrator.apply(&d.context, &leaf("sandbox"), &never).await.unwrap_err();
    assert!(matches!(err, HavenError::DependencyNotReady { .. }));
}
