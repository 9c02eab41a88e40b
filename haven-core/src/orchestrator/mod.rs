//! Stack orchestration.
//!
//! Sequences plan, apply, refresh and teardown of one hub stack and its
//! leaf stacks. Every operation on a stack runs under that stack's lease,
//! and a leaf apply also holds its hub shared for its whole duration. The
//! address plan and secrets are computed before the provisioner is called
//! and passed to it as plain data.
//!
//! Lifecycle:
//!
//! ```text
//! Absent/Destroyed/Failed ──plan──► Planned ──apply──► Applying ──► Applied
//!                                                          │           │ remote changed
//!                                                          ▼           ▼
//!                                                       Failed ◄── Stale
//! Applied/Stale/Failed ──teardown──► Destroying ──► Destroyed
//! ```

mod cancel;
mod lease;

pub use cancel::{cancellation, CancelHandle, Cancellation};

use crate::error::{HavenError, Result};
use crate::network::{self, nets_overlap, AddressPlan, AddressPlanner};
use crate::provisioner::{Declaration, ResourceProvisioner};
use crate::secrets::{self, SecretProvisioner, SecretRecord};
use crate::state::StateManager;
use crate::store::ConfigStore;
use crate::types::{
    is_safe_identifier, sanitise, ConfigDocument, Context, DatabaseSystem, DocumentKind, DocumentRef,
    StackId, StackKind, StackRecord, StackStatus, StackTarget,
};
use lease::Lease;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, instrument, warn};

/// Default lease lifetime; longer than any single provisioner run.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// A target resolved against its context.
#[derive(Debug, Clone)]
struct Resolved {
    id: StackId,
    kind: StackKind,
    name: String,
    doc_ref: DocumentRef,
}

/// Result of [`StackOrchestrator::plan`].
#[derive(Debug, Clone)]
pub struct PlanReport {
    pub stack_id: StackId,
    pub status: StackStatus,
    pub document_hash: String,
    /// Whether the remote document differs from the last applied one
    pub changed: bool,
    pub address_plan: AddressPlan,
    /// Secrets that the next apply will generate
    pub new_secrets: Vec<String>,
}

/// Result of [`StackOrchestrator::apply`].
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub stack_id: StackId,
    pub document_hash: String,
    pub address_plan: AddressPlan,
    pub outputs: BTreeMap<String, String>,
    pub secrets_created: u64,
}

/// Result of [`StackOrchestrator::teardown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownOutcome {
    Destroyed,
    /// Nothing was deployed
    NothingToDo(StackStatus),
}

/// Sequences stack lifecycles.
#[derive(Clone)]
pub struct StackOrchestrator {
    state: StateManager,
    store: ConfigStore,
    provisioner: Arc<dyn ResourceProvisioner>,
    secrets: SecretProvisioner,
    lease_ttl: Duration,
}

impl StackOrchestrator {
    pub fn new(
        state: StateManager,
        store: ConfigStore,
        provisioner: Arc<dyn ResourceProvisioner>,
        secrets: SecretProvisioner,
    ) -> Self {
        Self { state, store, provisioner, secrets, lease_ttl: DEFAULT_LEASE_TTL }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn secrets(&self) -> &SecretProvisioner {
        &self.secrets
    }

    /// Validate the remote document and prerequisites and move to `Planned`,
    /// or to `Stale` if an applied stack's document changed.
    #[instrument(skip(self, context), fields(context = %context.name(), stack = %target))]
    pub async fn plan(&self, context: &Context, target: &StackTarget) -> Result<PlanReport> {
        let resolved = resolve(context, target)?;
        let lease = Lease::acquire(&self.state, &resolved.id, self.lease_ttl).await?;
        let result = self.plan_locked(context, &resolved).await;
        lease.release(&self.state).await;
        result
    }

    /// Compare the remote document with the last applied one and mark an
    /// applied stack `Stale` if they differ.
    #[instrument(skip(self, context), fields(context = %context.name(), stack = %target))]
    pub async fn refresh(&self, context: &Context, target: &StackTarget) -> Result<StackRecord> {
        let resolved = resolve(context, target)?;
        let lease = Lease::acquire(&self.state, &resolved.id, self.lease_ttl).await?;
        let result = self.refresh_locked(context, &resolved).await;
        lease.release(&self.state).await;
        result
    }

    /// Provision a stack from its remote document.
    ///
    /// A leaf requires its hub to be `Applied` and keeps it pinned until
    /// done, so the hub outputs it provisions against cannot change.
    /// Secrets generated by this call are stored only if the provisioner
    /// succeeds.
    #[instrument(skip(self, context, cancel), fields(context = %context.name(), stack = %target))]
    pub async fn apply(
        &self,
        context: &Context,
        target: &StackTarget,
        cancel: &Cancellation,
    ) -> Result<ApplyReport> {
        let resolved = resolve(context, target)?;
        let lease = Lease::acquire(&self.state, &resolved.id, self.lease_ttl).await?;
        let result = match self.hold_hub(&resolved).await {
            Ok(hub_hold) => {
                let result = self.apply_locked(context, &resolved, cancel).await;
                if let Some(hold) = hub_hold {
                    hold.release(&self.state).await;
                }
                result
            }
            Err(e) => Err(e),
        };
        lease.release(&self.state).await;

        let label = if result.is_ok() { "applied" } else { "failed" };
        metrics::counter!("haven_apply_total", "status" => label).increment(1);
        result
    }

    /// Destroy a stack's resources. A hub requires every leaf to be
    /// `Destroyed` or `Absent` first.
    #[instrument(skip(self, context, cancel), fields(context = %context.name(), stack = %target))]
    pub async fn teardown(
        &self,
        context: &Context,
        target: &StackTarget,
        cancel: &Cancellation,
    ) -> Result<TeardownOutcome> {
        let resolved = resolve(context, target)?;
        let lease = Lease::acquire(&self.state, &resolved.id, self.lease_ttl).await?;
        let result = self.teardown_locked(&resolved, cancel).await;
        lease.release(&self.state).await;
        result
    }

    /// Run a raw provisioner command against a resolved stack.
    ///
    /// Bypasses the state machine and the lease; no status changes.
    #[instrument(skip(self, context), fields(context = %context.name(), stack = %target))]
    pub async fn run_raw_command(
        &self,
        context: &Context,
        target: &StackTarget,
        command_line: &str,
    ) -> Result<String> {
        let resolved = resolve(context, target)?;

        if !self.store.exists_remote(&resolved.doc_ref).await? {
            return Err(HavenError::NotFound { what: resolved.doc_ref.to_string() });
        }
        if let StackKind::Leaf(hub_id) = &resolved.kind {
            self.hub_outputs(&resolved.id, hub_id).await?;
        }

        self.provisioner.raw_command(&resolved.id, command_line).await
    }

    /// Current record of one stack (`Absent` if never touched).
    pub async fn status(&self, context: &Context, target: &StackTarget) -> Result<StackRecord> {
        let resolved = resolve(context, target)?;
        self.load_record(context, &resolved).await
    }

    /// Every recorded stack of a context, hub first.
    pub async fn list(&self, context: &Context) -> Result<Vec<StackRecord>> {
        self.state.list_stacks(context.name()).await
    }

    /// Outputs cached from a stack's last successful apply.
    pub async fn outputs(&self, context: &Context, target: &StackTarget) -> Result<BTreeMap<String, String>> {
        let resolved = resolve(context, target)?;
        self.state.get_outputs(&resolved.id).await
    }

    /// Replace one secret of a stack. Takes effect on the next apply.
    #[instrument(skip(self, context), fields(context = %context.name(), stack = %target))]
    pub async fn rotate_secret(&self, context: &Context, target: &StackTarget, name: &str) -> Result<SecretRecord> {
        let resolved = resolve(context, target)?;
        let known = secret_names(&self.load_document(&resolved).await?);
        if !known.iter().any(|known| known == name) {
            return Err(HavenError::validation(
                "secret",
                format!("'{}' is not used by {}; expected one of: {}", name, resolved.id, known.join(", ")),
            ));
        }

        let lease = Lease::acquire(&self.state, &resolved.id, self.lease_ttl).await?;
        let result = self.secrets.rotate(&resolved.id, name, secrets::default_generator).await;
        lease.release(&self.state).await;
        result
    }

    // ========================
    // Locked operations
    // ========================

    async fn plan_locked(&self, context: &Context, resolved: &Resolved) -> Result<PlanReport> {
        let mut record = self.recover_interrupted(self.load_record(context, resolved).await?).await?;
        let document = self.load_document(resolved).await?;
        let hash = document.content_hash()?;

        if let StackKind::Leaf(hub_id) = &resolved.kind {
            self.require_hub_applied(&resolved.id, hub_id).await?;
        }
        let address_plan = self.address_plan(context, resolved, &document).await?;

        let changed = record.applied_hash.as_deref() != Some(hash.as_str());
        match record.status {
            StackStatus::Applied if changed => {
                self.transition(&mut record, StackStatus::Stale, None).await?;
            }
            StackStatus::Applied | StackStatus::Stale => {}
            _ => self.transition(&mut record, StackStatus::Planned, None).await?,
        }

        let existing = self.secrets.list(&resolved.id).await?;
        let new_secrets = secret_names(&document)
            .into_iter()
            .filter(|name| !existing.contains(name))
            .collect();

        info!(stack_id = %resolved.id, status = %record.status, changed, "Planned stack");
        Ok(PlanReport {
            stack_id: resolved.id.clone(),
            status: record.status,
            document_hash: hash,
            changed,
            address_plan,
            new_secrets,
        })
    }

    async fn refresh_locked(&self, context: &Context, resolved: &Resolved) -> Result<StackRecord> {
        let mut record = self.recover_interrupted(self.load_record(context, resolved).await?).await?;
        if record.status != StackStatus::Applied {
            return Ok(record);
        }

        let hash = self.load_document(resolved).await?.content_hash()?;
        if record.applied_hash.as_deref() != Some(hash.as_str()) {
            info!(stack_id = %resolved.id, "Remote document changed since last apply");
            self.transition(&mut record, StackStatus::Stale, None).await?;
        }
        Ok(record)
    }

    async fn apply_locked(
        &self,
        context: &Context,
        resolved: &Resolved,
        cancel: &Cancellation,
    ) -> Result<ApplyReport> {
        let mut record = self.recover_interrupted(self.load_record(context, resolved).await?).await?;

        let parent_outputs = match &resolved.kind {
            StackKind::Hub => BTreeMap::new(),
            StackKind::Leaf(hub_id) => self.hub_outputs(&resolved.id, hub_id).await?,
        };

        let document = self.load_document(resolved).await?;
        let hash = document.content_hash()?;
        let address_plan = self.address_plan(context, resolved, &document).await?;

        let names = secret_names(&document);
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let bundle = self.secrets.prepare(&resolved.id, &name_refs, secrets::default_generator).await?;
        debug!(stack_id = %resolved.id, pending = ?bundle.pending_names(), "Prepared secrets");

        let declaration = Declaration::new(
            resolved.id.clone(),
            &resolved.kind,
            context,
            document,
            address_plan.clone(),
            bundle.values().clone(),
            parent_outputs,
        )?;

        if cancel.is_cancelled() {
            return Err(HavenError::Cancelled { stack_id: resolved.id.to_string() });
        }

        if matches!(record.status, StackStatus::Absent | StackStatus::Destroyed) {
            self.transition(&mut record, StackStatus::Planned, None).await?;
        }
        if record.status == StackStatus::Applied && record.applied_hash.as_deref() != Some(hash.as_str()) {
            self.transition(&mut record, StackStatus::Stale, None).await?;
        }
        self.transition(&mut record, StackStatus::Applying, None).await?;

        let mut cancelled = cancel.clone();
        let outcome = tokio::select! {
            result = self.provisioner.apply(&resolved.id, &declaration) => result,
            _ = cancelled.cancelled() => Err(HavenError::Cancelled { stack_id: resolved.id.to_string() }),
        };

        let outputs = match outcome {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(stack_id = %resolved.id, "Apply failed: {}", e);
                self.transition(&mut record, StackStatus::Failed, Some(e.to_string())).await?;
                return Err(e);
            }
        };

        let secrets_created = match self.secrets.commit(&bundle).await {
            Ok(written) => written,
            Err(e) => {
                self.transition(&mut record, StackStatus::Failed, Some(e.to_string())).await?;
                return Err(e);
            }
        };
        self.state.record_apply_success(&resolved.id, &hash, &address_plan, &outputs).await?;

        info!(stack_id = %resolved.id, secrets_created, outputs = outputs.len(), "Applied stack");
        Ok(ApplyReport {
            stack_id: resolved.id.clone(),
            document_hash: hash,
            address_plan,
            outputs,
            secrets_created,
        })
    }

    async fn teardown_locked(&self, resolved: &Resolved, cancel: &Cancellation) -> Result<TeardownOutcome> {
        let mut record = match self.state.get_stack(&resolved.id).await? {
            Some(record) => self.recover_interrupted(record).await?,
            None => return Ok(TeardownOutcome::NothingToDo(StackStatus::Absent)),
        };

        if matches!(record.status, StackStatus::Absent | StackStatus::Destroyed | StackStatus::Planned) {
            return Ok(TeardownOutcome::NothingToDo(record.status));
        }

        if resolved.kind == StackKind::Hub {
            self.require_leaves_destroyed(&resolved.id).await?;
        }
        if cancel.is_cancelled() {
            return Err(HavenError::Cancelled { stack_id: resolved.id.to_string() });
        }

        self.transition(&mut record, StackStatus::Destroying, None).await?;

        let mut cancelled = cancel.clone();
        let outcome = tokio::select! {
            result = self.provisioner.destroy(&resolved.id) => result,
            _ = cancelled.cancelled() => Err(HavenError::Cancelled { stack_id: resolved.id.to_string() }),
        };

        if let Err(e) = outcome {
            warn!(stack_id = %resolved.id, "Teardown failed: {}", e);
            self.transition(&mut record, StackStatus::Failed, Some(e.to_string())).await?;
            return Err(e);
        }

        self.state.record_destroyed(&resolved.id).await?;
        info!(stack_id = %resolved.id, "Destroyed stack");
        Ok(TeardownOutcome::Destroyed)
    }

    // ========================
    // Helpers
    // ========================

    async fn load_record(&self, context: &Context, resolved: &Resolved) -> Result<StackRecord> {
        Ok(self.state.get_stack(&resolved.id).await?.unwrap_or_else(|| {
            StackRecord::absent(resolved.id.clone(), context.name(), &resolved.name, resolved.kind.clone())
        }))
    }

    async fn load_document(&self, resolved: &Resolved) -> Result<ConfigDocument> {
        let document = self.store.load_remote(&resolved.doc_ref).await?;
        let expected = match resolved.kind {
            StackKind::Hub => DocumentKind::Hub,
            StackKind::Leaf(_) => DocumentKind::Leaf,
        };
        if document.kind != expected {
            return Err(HavenError::validation(
                "kind",
                format!("{} holds a {} document", resolved.doc_ref, document.kind),
            ));
        }
        Ok(document)
    }

    /// A stack left `Applying` or `Destroying` by a process that died.
    async fn recover_interrupted(&self, mut record: StackRecord) -> Result<StackRecord> {
        if matches!(record.status, StackStatus::Applying | StackStatus::Destroying) {
            warn!(stack_id = %record.id, status = %record.status, "Recovering interrupted operation");
            let reason = format!("interrupted while {}", record.status);
            self.transition(&mut record, StackStatus::Failed, Some(reason)).await?;
        }
        Ok(record)
    }

    async fn transition(&self, record: &mut StackRecord, next: StackStatus, error: Option<String>) -> Result<()> {
        if !record.status.can_transition_to(next) {
            return Err(HavenError::InvalidTransition {
                stack_id: record.id.to_string(),
                from: record.status.to_string(),
                to: next.to_string(),
            });
        }

        debug!(stack_id = %record.id, from = %record.status, to = %next, "Stack transition");
        record.status = next;
        record.last_error = error;
        record.updated_at = SystemTime::now();
        self.state.upsert_stack(record).await
    }

    async fn require_hub_applied(&self, stack_id: &StackId, hub_id: &StackId) -> Result<StackRecord> {
        let hub = self.state.get_stack(hub_id).await?;
        match hub {
            Some(hub) if hub.status == StackStatus::Applied => Ok(hub),
            Some(hub) => Err(HavenError::DependencyNotReady {
                stack_id: stack_id.to_string(),
                reason: format!("hub {} is {}, it must be applied first", hub_id, hub.status),
            }),
            None => Err(HavenError::DependencyNotReady {
                stack_id: stack_id.to_string(),
                reason: format!("hub {} has not been deployed", hub_id),
            }),
        }
    }

    /// Shared hold on the hub of a leaf; none for the hub itself.
    async fn hold_hub(&self, resolved: &Resolved) -> Result<Option<Lease>> {
        match &resolved.kind {
            StackKind::Hub => Ok(None),
            StackKind::Leaf(hub_id) => Lease::acquire_shared(&self.state, hub_id, self.lease_ttl).await.map(Some),
        }
    }

    async fn hub_outputs(&self, stack_id: &StackId, hub_id: &StackId) -> Result<BTreeMap<String, String>> {
        self.require_hub_applied(stack_id, hub_id).await?;
        self.state.get_outputs(hub_id).await
    }

    async fn require_leaves_destroyed(&self, hub_id: &StackId) -> Result<()> {
        let blocking: Vec<String> = self
            .state
            .list_leaves(hub_id)
            .await?
            .into_iter()
            .filter(|leaf| !matches!(leaf.status, StackStatus::Absent | StackStatus::Destroyed))
            .map(|leaf| format!("{} ({})", leaf.id, leaf.status))
            .collect();

        if blocking.is_empty() {
            return Ok(());
        }
        Err(HavenError::DependencyNotReady {
            stack_id: hub_id.to_string(),
            reason: format!("leaf stacks must be torn down first: {}", blocking.join(", ")),
        })
    }

    /// Allocate subnets. The hub's block must not overlap any live leaf's;
    /// a leaf's block must not overlap the hub's or any other live leaf's.
    async fn address_plan(
        &self,
        context: &Context,
        resolved: &Resolved,
        document: &ConfigDocument,
    ) -> Result<AddressPlan> {
        let block = document.network.address_space;
        let purposes = match resolved.kind {
            StackKind::Hub => network::hub_purposes(),
            StackKind::Leaf(_) => network::leaf_purposes(),
        };

        let mut reserved: Vec<(StackId, AddressPlan)> = Vec::new();
        match &resolved.kind {
            StackKind::Hub => {
                for leaf in self.state.list_leaves(&resolved.id).await? {
                    if let (true, Some(plan)) = (leaf.status.is_live(), leaf.address_plan) {
                        reserved.push((leaf.id, plan));
                    }
                }
            }
            StackKind::Leaf(hub_id) => {
                if let Some(hub) = self.state.get_stack(hub_id).await? {
                    if let Some(plan) = hub.address_plan {
                        reserved.push((hub.id, plan));
                    }
                }
                for leaf in self.state.list_stacks(context.name()).await? {
                    if leaf.id != resolved.id && leaf.kind != StackKind::Hub && leaf.status.is_live() {
                        if let Some(plan) = leaf.address_plan {
                            reserved.push((leaf.id, plan));
                        }
                    }
                }
            }
        }

        for (owner, plan) in reserved {
            if nets_overlap(&block, &plan.parent_block) {
                return Err(HavenError::validation(
                    "network.address_space",
                    format!("{} overlaps {} reserved by {}", block, plan.parent_block, owner),
                ));
            }
        }

        AddressPlanner::allocate(block, &purposes)
    }
}

/// Resolve a target to its stack id, kind and document reference.
fn resolve(context: &Context, target: &StackTarget) -> Result<Resolved> {
    match target {
        StackTarget::Hub => Ok(Resolved {
            id: context.hub_stack_id(),
            kind: StackKind::Hub,
            name: context.name().to_string(),
            doc_ref: DocumentRef::hub(context),
        }),
        StackTarget::Leaf(name) => {
            let name = sanitise(name);
            if !is_safe_identifier(&name) || !name.chars().any(|c| c.is_ascii_alphanumeric()) {
                return Err(HavenError::validation("leaf name", "must contain letters or numbers"));
            }
            Ok(Resolved {
                id: context.leaf_stack_id(&name),
                kind: StackKind::Leaf(context.hub_stack_id()),
                doc_ref: DocumentRef::leaf(context, &name),
                name,
            })
        }
    }
}

/// Secrets a stack needs, in a stable order.
fn secret_names(document: &ConfigDocument) -> Vec<String> {
    let mut names: Vec<String> = match document.kind {
        DocumentKind::Hub => vec!["admin-password".into(), "update-servers-password".into()],
        DocumentKind::Leaf => vec![
            "admin-password".into(),
            "identity-bind-password".into(),
            "gitea-database-password".into(),
            "hedgedoc-database-password".into(),
        ],
    };
    for database in &document.features.databases {
        names.push(match database {
            DatabaseSystem::Postgresql => "postgresql-admin-password".into(),
            DatabaseSystem::MicrosoftSqlServer => "mssql-admin-password".into(),
        });
    }
    names
}

#[cfg(test)]
mod tests;
