//! Resource provisioner boundary.
//!
//! The orchestrator computes everything a stack needs (document, address
//! plan, secrets, parent outputs, allow-lists) and hands it over as one
//! [`Declaration`]. The provisioner turns that into cloud resources and
//! returns a flat map of outputs.

pub mod cli;
pub mod mock;

pub use cli::CliProvisioner;
pub use mock::MockProvisioner;

use crate::error::Result;
use crate::network::{aggregate, AddressPlan, AllowList};
use crate::types::{ConfigDocument, Context, StackId, StackKind};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

/// Executes declared infrastructure changes.
///
/// Futures returned by these methods may be dropped to cancel the call;
/// implementations must stop work when that happens.
#[async_trait]
pub trait ResourceProvisioner: Send + Sync {
    /// Create or update every resource of a stack. Returns its outputs.
    async fn apply(&self, stack_id: &StackId, declaration: &Declaration) -> Result<BTreeMap<String, String>>;

    /// Remove every resource of a stack.
    async fn destroy(&self, stack_id: &StackId) -> Result<()>;

    /// Run an arbitrary provisioner command against a stack and return stdout.
    async fn raw_command(&self, stack_id: &StackId, command_line: &str) -> Result<String>;
}

/// Names derived from the context, passed through so resource names stay stable.
#[derive(Debug, Clone, Serialize)]
pub struct ContextNames {
    pub name: String,
    pub subscription_name: String,
    pub admin_group_name: String,
    pub resource_group_name: String,
    pub storage_account_name: String,
    pub key_vault_name: String,
    pub managed_identity_name: String,
    pub tags: BTreeMap<String, String>,
}

impl From<&Context> for ContextNames {
    fn from(context: &Context) -> Self {
        Self {
            name: context.name().to_string(),
            subscription_name: context.subscription_name().to_string(),
            admin_group_name: context.admin_group_name().to_string(),
            resource_group_name: context.resource_group_name(),
            storage_account_name: context.storage_account_name(),
            key_vault_name: context.key_vault_name(),
            managed_identity_name: context.managed_identity_name(),
            tags: context.tags(),
        }
    }
}

/// Everything the provisioner needs for one apply.
#[derive(Clone, Serialize)]
pub struct Declaration {
    pub stack_id: StackId,
    pub kind: &'static str,
    pub parent: Option<StackId>,
    pub context: ContextNames,
    pub document: ConfigDocument,
    pub address_plan: AddressPlan,
    pub secrets: BTreeMap<String, String>,
    pub parent_outputs: BTreeMap<String, String>,
    /// Flattened, de-duplicated, ascending addresses for the `admin` and
    /// `data_provider` sections
    pub allow_lists: BTreeMap<String, Vec<String>>,
    /// User ranges as merged CIDRs; these may be arbitrarily wide
    pub user_ranges: Vec<String>,
    /// Every trusted range of the document as merged CIDRs
    pub trusted_ranges: Vec<String>,
}

impl Declaration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stack_id: StackId,
        kind: &StackKind,
        context: &Context,
        document: ConfigDocument,
        address_plan: AddressPlan,
        secrets: BTreeMap<String, String>,
        parent_outputs: BTreeMap<String, String>,
    ) -> Result<Self> {
        let network = &document.network;
        let allow_lists = BTreeMap::from([
            ("admin".to_string(), flatten(&network.admin_ip_addresses, "network.admin_ip_addresses")?),
            (
                "data_provider".to_string(),
                flatten(&network.data_provider_ip_addresses, "network.data_provider_ip_addresses")?,
            ),
        ]);
        let user_ranges = to_strings(aggregate(&network.user_ip_addresses));
        let trusted_ranges = to_strings(aggregate(document.trusted_ranges()));

        Ok(Self {
            stack_id,
            kind: kind.label(),
            parent: kind.parent().cloned(),
            context: ContextNames::from(context),
            document,
            address_plan,
            secrets,
            parent_outputs,
            allow_lists,
            user_ranges,
            trusted_ranges,
        })
    }

    /// JSON sent to external provisioners.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(crate::error::HavenError::internal)
    }
}

impl std::fmt::Debug for Declaration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Declaration")
            .field("stack_id", &self.stack_id)
            .field("kind", &self.kind)
            .field("parent", &self.parent)
            .field("address_plan", &self.address_plan)
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .field("parent_outputs", &self.parent_outputs)
            .finish_non_exhaustive()
    }
}

fn flatten(ranges: &[ipnet::Ipv4Net], field: &str) -> Result<Vec<String>> {
    Ok(AllowList::bounded(ranges.iter().copied(), field)?.map(|ip| ip.to_string()).collect())
}

fn to_strings(ranges: Vec<ipnet::Ipv4Net>) -> Vec<String> {
    ranges.iter().map(ToString::to_string).collect()
}
