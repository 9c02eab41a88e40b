//! Tests for stack orchestration.

#[cfg(test)]
mod tests {
    use crate::error::HavenError;
    use crate::orchestrator::{cancellation, Cancellation, StackOrchestrator, TeardownOutcome};
    use crate::provisioner::MockProvisioner;
    use crate::secrets::{SecretProvisioner, StaticKeyProvider};
    use crate::state::StateManager;
    use crate::store::{ConfigStore, MemoryRemoteStore, PresetAnswer, RemoteStore};
    use crate::types::{
        ConfigDocument, Context, DocumentRef, StackId, StackKind, StackRecord, StackStatus, StackTarget,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Notify;

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

    const LEAF_YAML: &str = r#"
kind: leaf
name: sandbox
description: Sandbox research environment
cloud:
  location: uksouth
  subscription_id: 3f6b2a4e-7a35-4a8c-9d1e-2b8f6c1d0a11
  tenant_id: 0c8b7d9e-1f2a-4b3c-8d4e-5f6a7b8c9d0e
network:
  address_space: 10.1.0.0/24
  admin_ip_addresses: [192.0.2.0/30]
identity:
  admin_email_address: admin@example.org
  timezone: Europe/London
features:
  databases: [postgresql]
"#;

    /// Parks the first read of one key until released.
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryRemoteStore,
        key: Mutex<String>,
        armed: AtomicBool,
        reached: Notify,
        release: Notify,
    }

    impl GatedStore {
        fn arm(&self, key: String) {
            *self.key.lock().unwrap() = key;
            self.armed.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RemoteStore for GatedStore {
        async fn get(&self, key: &str) -> crate::error::Result<Vec<u8>> {
            let gated = *self.key.lock().unwrap() == key;
            if gated && self.armed.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.notified().await;
            }
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, bytes: &[u8]) -> crate::error::Result<()> {
            self.inner.put(key, bytes).await
        }

        async fn exists(&self, key: &str) -> crate::error::Result<bool> {
            self.inner.exists(key).await
        }

        fn describe(&self) -> String {
            "gated".to_string()
        }
    }

    struct Harness {
        orchestrator: StackOrchestrator,
        provisioner: Arc<MockProvisioner>,
        state: StateManager,
        store: ConfigStore,
        context: Context,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_remote(Arc::new(MemoryRemoteStore::new())).await
        }

        async fn with_remote(remote: Arc<dyn RemoteStore>) -> Self {
            let state = StateManager::new_in_memory().await.unwrap();
            let store = ConfigStore::new(remote);
            let provisioner = Arc::new(MockProvisioner::new());
            let secrets = SecretProvisioner::new(state.clone(), Arc::new(StaticKeyProvider::random()));
            let orchestrator =
                StackOrchestrator::new(state.clone(), store.clone(), provisioner.clone(), secrets);
            let context = Context::new("acme", "Acme Subscription", "Acme Admins", "Acme deployment").unwrap();
            Self { orchestrator, provisioner, state, store, context }
        }

        async fn publish(&self, yaml: &str) {
            let document = ConfigDocument::from_yaml(yaml, "test.yaml").unwrap();
            let doc_ref = DocumentRef::for_document(&self.context, &document).unwrap();
            self.store.publish(&document, &doc_ref, &PresetAnswer(true)).await.unwrap();
        }

        async fn published() -> Self {
            let harness = Self::new().await;
            harness.publish(HUB_YAML).await;
            harness.publish(LEAF_YAML).await;
            harness
        }

        async fn apply(&self, target: &StackTarget) -> crate::error::Result<crate::orchestrator::ApplyReport> {
            self.orchestrator.apply(&self.context, target, &Cancellation::never()).await
        }

        async fn status(&self, target: &StackTarget) -> StackStatus {
            self.orchestrator.status(&self.context, target).await.unwrap().status
        }
    }

    fn sandbox() -> StackTarget {
        StackTarget::Leaf("sandbox".to_string())
    }

    #[tokio::test]
    async fn test_hub_then_leaf() {
        let h = Harness::published().await;

        let hub = h.apply(&StackTarget::Hub).await.unwrap();
        assert_eq!(hub.stack_id.as_str(), "shm-acme");
        assert_eq!(hub.secrets_created, 2);
        assert_eq!(h.status(&StackTarget::Hub).await, StackStatus::Applied);

        let leaf = h.apply(&sandbox()).await.unwrap();
        assert_eq!(leaf.stack_id.as_str(), "shm-acme-sre-sandbox");
        assert_eq!(h.status(&sandbox()).await, StackStatus::Applied);

        let applied = h.provisioner.applied();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[1].parent.as_ref().unwrap().as_str(), "shm-acme");
        assert_eq!(applied[1].parent_outputs["stack_id"], "shm-acme");
        assert!(applied[1].secrets.contains_key("postgresql-admin-password"));
        assert_eq!(applied[1].address_plan.subnet("workspaces").unwrap().to_string(), "10.1.0.128/25");
    }

    #[tokio::test]
    async fn test_leaf_requires_applied_hub() {
        let h = Harness::published().await;

        let err = h.apply(&sandbox()).await.unwrap_err();
        assert!(matches!(err, HavenError::DependencyNotReady { .. }));
        assert_eq!(h.provisioner.apply_count(), 0);
        assert_eq!(h.status(&sandbox()).await, StackStatus::Absent);

        let err = h.orchestrator.plan(&h.context, &sandbox()).await.unwrap_err();
        assert!(matches!(err, HavenError::DependencyNotReady { .. }));

        // Planned is not enough
        h.orchestrator.plan(&h.context, &StackTarget::Hub).await.unwrap();
        assert_eq!(h.status(&StackTarget::Hub).await, StackStatus::Planned);
        let err = h.apply(&sandbox()).await.unwrap_err();
        assert!(matches!(err, HavenError::DependencyNotReady { .. }));
        assert_eq!(h.provisioner.apply_count(), 0);

        // Neither is an applied hub whose document has since changed
        h.apply(&StackTarget::Hub).await.unwrap();
        h.publish(&HUB_YAML.replace("Acme hub", "Acme hub, edited")).await;
        let report = h.orchestrator.plan(&h.context, &StackTarget::Hub).await.unwrap();
        assert_eq!(report.status, StackStatus::Stale);
        let err = h.apply(&sandbox()).await.unwrap_err();
        assert!(matches!(err, HavenError::DependencyNotReady { .. }));
        assert_eq!(h.provisioner.apply_count(), 1);
        assert_eq!(h.status(&sandbox()).await, StackStatus::Absent);
    }

    #[tokio::test]
    async fn test_leaf_blocked_by_failed_hub() {
        let h = Harness::published().await;
        h.provisioner.fail_stack(&StackId::new("shm-acme"), "quota exceeded");
        h.apply(&StackTarget::Hub).await.unwrap_err();
        assert_eq!(h.status(&StackTarget::Hub).await, StackStatus::Failed);

        let err = h.apply(&sandbox()).await.unwrap_err();
        assert!(matches!(err, HavenError::DependencyNotReady { .. }));
        assert_eq!(h.provisioner.apply_count(), 1);
    }

    #[tokio::test]
    async fn test_hub_is_pinned_while_leaf_applies() {
        let gate = Arc::new(GatedStore::default());
        let h = Harness::with_remote(gate.clone()).await;
        h.publish(HUB_YAML).await;
        h.publish(LEAF_YAML).await;
        h.apply(&StackTarget::Hub).await.unwrap();

        gate.arm(DocumentRef::leaf(&h.context, "sandbox").key());
        let meanwhile = async {
            gate.reached.notified().await;

            // The leaf has read the hub outputs; the hub must not move now
            h.publish(&HUB_YAML.replace("10.0.0.0/24", "10.2.0.0/24")).await;
            let err = h.apply(&StackTarget::Hub).await.unwrap_err();
            assert!(matches!(err, HavenError::StackBusy { .. }));
            let err = h
                .orchestrator
                .teardown(&h.context, &StackTarget::Hub, &Cancellation::never())
                .await
                .unwrap_err();
            assert!(matches!(err, HavenError::StackBusy { .. }));

            gate.release.notify_one();
        };
        let sandbox_target = sandbox();
        let (leaf, ()) = tokio::join!(h.apply(&sandbox_target), meanwhile);
        leaf.unwrap();

        let hub_outputs = h.orchestrator.outputs(&h.context, &StackTarget::Hub).await.unwrap();
        let applied = h.provisioner.applied();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[1].parent_outputs, hub_outputs);
        assert_eq!(applied[1].parent_outputs["subnet_firewall"], "10.0.0.0/26");

        // Released once the leaf is done
        h.apply(&StackTarget::Hub).await.unwrap();
        let hub_outputs = h.orchestrator.outputs(&h.context, &StackTarget::Hub).await.unwrap();
        assert_eq!(hub_outputs["subnet_firewall"], "10.2.0.0/26");
    }

    #[tokio::test]
    async fn test_plan_reports_secrets_to_create() {
        let h = Harness::published().await;

        let report = h.orchestrator.plan(&h.context, &StackTarget::Hub).await.unwrap();
        assert_eq!(report.status, StackStatus::Planned);
        assert!(report.changed);
        assert_eq!(report.new_secrets, vec!["admin-password", "update-servers-password"]);
        assert_eq!(report.address_plan.subnet("firewall").unwrap().to_string(), "10.0.0.0/26");
        assert_eq!(h.provisioner.apply_count(), 0);

        h.apply(&StackTarget::Hub).await.unwrap();
        let report = h.orchestrator.plan(&h.context, &StackTarget::Hub).await.unwrap();
        assert_eq!(report.status, StackStatus::Applied);
        assert!(!report.changed);
        assert!(report.new_secrets.is_empty());
    }

    #[tokio::test]
    async fn test_secrets_are_stable_across_applies() {
        let h = Harness::published().await;
        h.apply(&StackTarget::Hub).await.unwrap();
        let second = h.apply(&StackTarget::Hub).await.unwrap();
        assert_eq!(second.secrets_created, 0);

        let applied = h.provisioner.applied();
        assert_eq!(applied[0].secrets, applied[1].secrets);
        assert_eq!(applied[0].secrets["admin-password"].len(), 20);
    }

    #[tokio::test]
    async fn test_failed_apply_stores_no_secrets() {
        let h = Harness::published().await;
        let hub_id = h.context.hub_stack_id();
        h.provisioner.fail_stack(&hub_id, "quota exceeded");

        let err = h.apply(&StackTarget::Hub).await.unwrap_err();
        assert!(matches!(err, HavenError::Provision { .. }));

        let record = h.orchestrator.status(&h.context, &StackTarget::Hub).await.unwrap();
        assert_eq!(record.status, StackStatus::Failed);
        assert!(record.last_error.unwrap().contains("quota exceeded"));
        assert!(h.orchestrator.secrets().list(&hub_id).await.unwrap().is_empty());

        h.provisioner.clear_failure(&hub_id);
        h.apply(&StackTarget::Hub).await.unwrap();
        let record = h.orchestrator.status(&h.context, &StackTarget::Hub).await.unwrap();
        assert_eq!(record.status, StackStatus::Applied);
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn test_refresh_marks_changed_document_stale() {
        let h = Harness::published().await;
        h.apply(&StackTarget::Hub).await.unwrap();

        let record = h.orchestrator.refresh(&h.context, &StackTarget::Hub).await.unwrap();
        assert_eq!(record.status, StackStatus::Applied);

        h.publish(&HUB_YAML.replace("Acme hub", "Acme hub, edited")).await;
        let record = h.orchestrator.refresh(&h.context, &StackTarget::Hub).await.unwrap();
        assert_eq!(record.status, StackStatus::Stale);

        // A stale hub blocks its leaves until reapplied
        let err = h.apply(&sandbox()).await.unwrap_err();
        assert!(matches!(err, HavenError::DependencyNotReady { .. }));

        h.apply(&StackTarget::Hub).await.unwrap();
        assert_eq!(h.status(&StackTarget::Hub).await, StackStatus::Applied);
    }

    #[tokio::test]
    async fn test_teardown_order() {
        let h = Harness::published().await;
        let never = Cancellation::never();
        h.apply(&StackTarget::Hub).await.unwrap();
        h.apply(&sandbox()).await.unwrap();

        let err = h.orchestrator.teardown(&h.context, &StackTarget::Hub, &never).await.unwrap_err();
        assert!(matches!(err, HavenError::DependencyNotReady { .. }));
        assert_eq!(h.status(&StackTarget::Hub).await, StackStatus::Applied);

        let outcome = h.orchestrator.teardown(&h.context, &sandbox(), &never).await.unwrap();
        assert_eq!(outcome, TeardownOutcome::Destroyed);
        let outcome = h.orchestrator.teardown(&h.context, &StackTarget::Hub, &never).await.unwrap();
        assert_eq!(outcome, TeardownOutcome::Destroyed);

        let destroyed: Vec<String> = h.provisioner.destroyed().iter().map(|id| id.to_string()).collect();
        assert_eq!(destroyed, vec!["shm-acme-sre-sandbox", "shm-acme"]);
        assert!(h.orchestrator.outputs(&h.context, &StackTarget::Hub).await.unwrap().is_empty());

        let again = h.orchestrator.teardown(&h.context, &StackTarget::Hub, &never).await.unwrap();
        assert_eq!(again, TeardownOutcome::NothingToDo(StackStatus::Destroyed));
    }

    #[tokio::test]
    async fn test_teardown_of_absent_stack_is_a_no_op() {
        let h = Harness::new().await;
        let outcome = h.orchestrator.teardown(&h.context, &sandbox(), &Cancellation::never()).await.unwrap();
        assert_eq!(outcome, TeardownOutcome::NothingToDo(StackStatus::Absent));
        assert!(h.provisioner.destroyed().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_apply() {
        let h = Harness::published().await;
        h.provisioner.set_apply_delay(Some(Duration::from_secs(30)));
        let (handle, cancel) = cancellation();

        let orchestrator = h.orchestrator.clone();
        let context = h.context.clone();
        let task =
            tokio::spawn(async move { orchestrator.apply(&context, &StackTarget::Hub, &cancel).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        let err = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap_err();

        assert!(matches!(err, HavenError::Cancelled { .. }));
        assert_eq!(h.status(&StackTarget::Hub).await, StackStatus::Failed);
        assert!(h.orchestrator.secrets().list(&h.context.hub_stack_id()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = Harness::published().await;
        let (handle, cancel) = cancellation();
        handle.cancel();

        let err = h.orchestrator.apply(&h.context, &StackTarget::Hub, &cancel).await.unwrap_err();
        assert!(matches!(err, HavenError::Cancelled { .. }));
        assert_eq!(h.provisioner.apply_count(), 0);
        assert_eq!(h.status(&StackTarget::Hub).await, StackStatus::Absent);
    }

    #[tokio::test]
    async fn test_busy_stack_is_rejected() {
        let h = Harness::published().await;
        let hub_id = h.context.hub_stack_id();
        assert!(h.state.try_acquire_lease(&hub_id, "other", Duration::from_secs(60)).await.unwrap());

        let err = h.apply(&StackTarget::Hub).await.unwrap_err();
        assert!(matches!(err, HavenError::StackBusy { .. }));
        assert_eq!(h.provisioner.apply_count(), 0);

        h.state.release_lease(&hub_id, "other").await.unwrap();
        h.apply(&StackTarget::Hub).await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupted_apply_is_recovered() {
        let h = Harness::published().await;
        let mut record =
            StackRecord::absent(h.context.hub_stack_id(), h.context.name(), "acme", StackKind::Hub);
        record.status = StackStatus::Applying;
        h.state.upsert_stack(&record).await.unwrap();

        h.apply(&StackTarget::Hub).await.unwrap();
        assert_eq!(h.status(&StackTarget::Hub).await, StackStatus::Applied);
    }

    #[tokio::test]
    async fn test_overlapping_leaf_is_rejected() {
        let h = Harness::published().await;
        h.apply(&StackTarget::Hub).await.unwrap();
        h.publish(&LEAF_YAML.replace("10.1.0.0/24", "10.0.0.0/16")).await;

        let err = h.apply(&sandbox()).await.unwrap_err();
        assert!(matches!(err, HavenError::Validation { .. }));
        assert_eq!(h.provisioner.apply_count(), 1);
    }

    #[tokio::test]
    async fn test_hub_cannot_move_onto_live_leaf() {
        let h = Harness::published().await;
        h.apply(&StackTarget::Hub).await.unwrap();
        h.apply(&sandbox()).await.unwrap();

        h.publish(&HUB_YAML.replace("10.0.0.0/24", "10.1.0.0/16")).await;
        for err in [
            h.apply(&StackTarget::Hub).await.unwrap_err(),
            h.orchestrator.plan(&h.context, &StackTarget::Hub).await.unwrap_err(),
        ] {
            match err {
                HavenError::Validation { field, reason } => {
                    assert_eq!(field, "network.address_space");
                    assert!(reason.contains("shm-acme-sre-sandbox"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(h.provisioner.apply_count(), 2);
        assert_eq!(h.status(&StackTarget::Hub).await, StackStatus::Applied);

        // A destroyed leaf no longer reserves its block
        h.orchestrator.teardown(&h.context, &sandbox(), &Cancellation::never()).await.unwrap();
        let report = h.apply(&StackTarget::Hub).await.unwrap();
        assert_eq!(report.address_plan.parent_block.to_string(), "10.1.0.0/16");
    }

    #[tokio::test]
    async fn test_raw_command() {
        let h = Harness::new().await;
        let err = h.orchestrator.run_raw_command(&h.context, &StackTarget::Hub, "stack output").await.unwrap_err();
        assert!(matches!(err, HavenError::NotFound { .. }));

        h.publish(HUB_YAML).await;
        h.publish(LEAF_YAML).await;
        let stdout = h.orchestrator.run_raw_command(&h.context, &StackTarget::Hub, "stack output").await.unwrap();
        assert_eq!(stdout, "shm-acme: stack output\n");
        assert_eq!(h.status(&StackTarget::Hub).await, StackStatus::Absent);

        let err = h.orchestrator.run_raw_command(&h.context, &sandbox(), "stack output").await.unwrap_err();
        assert!(matches!(err, HavenError::DependencyNotReady { .. }));
        assert_eq!(h.provisioner.commands(), vec![(StackId::new("shm-acme"), "stack output".to_string())]);
    }

    #[tokio::test]
    async fn test_rotated_secret_reaches_next_apply() {
        let h = Harness::published().await;
        h.apply(&StackTarget::Hub).await.unwrap();
        let rotated =
            h.orchestrator.rotate_secret(&h.context, &StackTarget::Hub, "admin-password").await.unwrap();

        h.apply(&StackTarget::Hub).await.unwrap();
        let err = h.orchestrator.rotate_secret(&h.context, &StackTarget::Hub, "unknown").await.unwrap_err();
        assert!(matches!(err, HavenError::Validation { .. }));

        let applied = h.provisioner.applied();
        assert_ne!(applied[0].secrets["admin-password"], rotated.value);
        assert_eq!(applied[1].secrets["admin-password"], rotated.value);
    }

    #[tokio::test]
    async fn test_leaf_names_resolve_case_insensitively() {
        let h = Harness::published().await;
        h.apply(&StackTarget::Hub).await.unwrap();
        h.apply(&StackTarget::Leaf("SandBox".to_string())).await.unwrap();
        assert_eq!(h.status(&sandbox()).await, StackStatus::Applied);

        let err = h.apply(&StackTarget::Leaf("--".to_string())).await.unwrap_err();
        assert!(matches!(err, HavenError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_list_puts_hub_first() {
        let h = Harness::published().await;
        h.apply(&StackTarget::Hub).await.unwrap();
        h.apply(&sandbox()).await.unwrap();

        let ids: Vec<String> =
            h.orchestrator.list(&h.context).await.unwrap().into_iter().map(|r| r.id.to_string()).collect();
        assert_eq!(ids, vec!["shm-acme", "shm-acme-sre-sandbox"]);
    }
}
