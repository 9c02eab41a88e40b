//! Configuration document domain types.
//!
//! A [`ConfigDocument`] is the declaration of desired state for one stack.
//! Documents are compared and hashed through their canonical serialization
//! ([`ConfigDocument::canonical_yaml`]) so that key order and whitespace in
//! the source file never affect equality.

use super::context::Context;
use super::naming::{is_safe_identifier, sanitise};
use crate::error::{HavenError, Result};
use crate::network::AllowList;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Document kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Hub,
    Leaf,
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hub => write!(f, "hub"),
            Self::Leaf => write!(f, "leaf"),
        }
    }
}

impl std::str::FromStr for DocumentKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hub" | "shm" => Ok(Self::Hub),
            "leaf" | "sre" => Ok(Self::Leaf),
            _ => Err(format!("Unknown document kind: {}", s)),
        }
    }
}

/// Identity of a document in the remote store: `(context, kind, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentRef {
    pub context: String,
    pub kind: DocumentKind,
    pub name: String,
}

impl DocumentRef {
    /// Reference to the hub document of a context.
    pub fn hub(context: &Context) -> Self {
        Self { context: context.name().to_string(), kind: DocumentKind::Hub, name: context.name().to_string() }
    }

    /// Reference to a leaf document of a context.
    pub fn leaf(context: &Context, name: &str) -> Self {
        Self { context: context.name().to_string(), kind: DocumentKind::Leaf, name: name.to_string() }
    }

    /// Reference under which `document` is published for `context`.
    ///
    /// A hub document must be named after its context.
    pub fn for_document(context: &Context, document: &ConfigDocument) -> Result<Self> {
        match document.kind {
            DocumentKind::Hub if document.name != context.name() => Err(HavenError::validation(
                "name",
                format!(
                    "hub document '{}' must be named after its context '{}'",
                    document.name,
                    context.name()
                ),
            )),
            DocumentKind::Hub => Ok(Self::hub(context)),
            DocumentKind::Leaf => Ok(Self::leaf(context, &document.name)),
        }
    }

    /// Canonical remote key: `{context-name}/{kind}-{safe-identifier}.yaml`.
    pub fn key(&self) -> String {
        format!("{}/{}-{}.yaml", sanitise(&self.context), self.kind, sanitise(&self.name))
    }
}

impl std::fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} document '{}' of context '{}'", self.kind, self.name, self.context)
    }
}

/// Versioned, named configuration for a hub or leaf stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDocument {
    /// Hub or leaf
    pub kind: DocumentKind,

    /// Letters, digits and underscores only
    pub name: String,

    /// Human-friendly description
    pub description: String,

    /// Cloud placement
    pub cloud: CloudSection,

    /// Address space and trusted IP ranges
    pub network: NetworkSection,

    /// Administrative identity
    pub identity: IdentitySection,

    /// External-service credentials (leaf only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerhub: Option<DockerHubSection>,

    /// Feature flags
    #[serde(default)]
    pub features: FeatureFlags,
}

/// Cloud placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudSection {
    pub location: String,
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
}

/// Network section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSection {
    /// Parent block the stack's subnets are carved from
    pub address_space: Ipv4Net,

    #[serde(default)]
    pub admin_ip_addresses: Vec<Ipv4Net>,

    #[serde(default)]
    pub user_ip_addresses: Vec<Ipv4Net>,

    #[serde(default)]
    pub data_provider_ip_addresses: Vec<Ipv4Net>,
}

/// Identity section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentitySection {
    pub admin_email_address: String,

    /// Directory group granted administrative rights (hub)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_group_id: Option<Uuid>,

    /// Timezone in tz database format (e.g. Europe/London)
    pub timezone: String,
}

/// DockerHub credentials used to pull images without rate limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DockerHubSection {
    pub username: String,
    pub access_token: String,
}

/// Which packages from external repositories are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SoftwarePackages {
    Any,
    PreApproved,
    #[default]
    None,
}

/// Database systems that can be deployed into a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseSystem {
    Postgresql,
    MicrosoftSqlServer,
}

/// Feature flags.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureFlags {
    pub allow_copy: bool,
    pub allow_paste: bool,
    pub software_packages: SoftwarePackages,
    pub databases: Vec<DatabaseSystem>,
    pub workspace_skus: Vec<String>,
}

impl ConfigDocument {
    /// Parse and validate a document from YAML text.
    ///
    /// `source_name` is only used in error messages.
    #[instrument(skip(content))]
    pub fn from_yaml(content: &str, source_name: &str) -> Result<Self> {
        let document: Self = serde_yaml::from_str(content).map_err(|e| HavenError::Parse {
            source_name: source_name.to_string(),
            reason: e.to_string(),
        })?;
        document.validate()?;
        debug!(kind = %document.kind, name = %document.name, "Parsed configuration document");
        Ok(document)
    }

    /// Read, parse and validate a document from a local file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| HavenError::IoError { path: path.to_path_buf(), source: e })?;
        Self::from_yaml(&content, &path.display().to_string())
    }

    /// Check every invariant that the type system does not.
    pub fn validate(&self) -> Result<()> {
        if !is_safe_identifier(&self.name) {
            return Err(HavenError::validation(
                "name",
                format!("'{}' may only contain letters, numbers and underscores", self.name),
            ));
        }
        if self.description.trim().is_empty() {
            return Err(HavenError::validation("description", "must not be empty"));
        }
        if self.cloud.location.trim().is_empty() {
            return Err(HavenError::validation("cloud.location", "must not be empty"));
        }

        let space = self.network.address_space;
        if space.network() != space.addr() {
            return Err(HavenError::validation(
                "network.address_space",
                format!("{} is not a network address (did you mean {}?)", space, space.trunc()),
            ));
        }

        // Admin and data provider ranges become one firewall rule per address
        AllowList::bounded(self.network.admin_ip_addresses.iter().copied(), "network.admin_ip_addresses")?;
        AllowList::bounded(
            self.network.data_provider_ip_addresses.iter().copied(),
            "network.data_provider_ip_addresses",
        )?;

        let email = &self.identity.admin_email_address;
        let valid_email = email
            .split_once('@')
            .map(|(user, domain)| !user.is_empty() && domain.contains('.') && !domain.ends_with('.'))
            .unwrap_or(false);
        if !valid_email {
            return Err(HavenError::validation(
                "identity.admin_email_address",
                format!("'{}' is not an email address", email),
            ));
        }

        let tz = self.identity.timezone.trim();
        if tz.is_empty() || !(tz == "UTC" || tz.contains('/')) || tz.contains(char::is_whitespace) {
            return Err(HavenError::validation(
                "identity.timezone",
                format!("'{}' is not a tz database name", self.identity.timezone),
            ));
        }

        let mut seen = HashSet::new();
        for db in &self.features.databases {
            if !seen.insert(db) {
                return Err(HavenError::validation(
                    "features.databases",
                    format!("{:?} is listed more than once", db),
                ));
            }
        }
        if self.features.workspace_skus.iter().any(|sku| sku.trim().is_empty()) {
            return Err(HavenError::validation("features.workspace_skus", "SKUs must not be empty"));
        }

        match self.kind {
            DocumentKind::Hub => {
                if self.identity.admin_group_id.is_none() {
                    return Err(HavenError::validation(
                        "identity.admin_group_id",
                        "required for hub documents",
                    ));
                }
                if self.dockerhub.is_some() {
                    return Err(HavenError::validation("dockerhub", "only allowed in leaf documents"));
                }
            }
            DocumentKind::Leaf => {
                if let Some(dockerhub) = &self.dockerhub {
                    if dockerhub.username.trim().is_empty() || dockerhub.access_token.trim().is_empty() {
                        return Err(HavenError::validation(
                            "dockerhub",
                            "username and access_token must both be set",
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Canonical normalized serialization.
    ///
    /// Fields are emitted in sorted key order so two semantically equal
    /// documents always produce identical text.
    pub fn canonical_yaml(&self) -> Result<String> {
        let value = serde_json::to_value(self).map_err(HavenError::internal)?;
        serde_yaml::to_string(&value).map_err(HavenError::internal)
    }

    /// SHA-256 of the canonical serialization, hex encoded.
    pub fn content_hash(&self) -> Result<String> {
        let canonical = self.canonical_yaml()?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// Semantic equality: equal canonical serializations.
    pub fn semantically_eq(&self, other: &Self) -> Result<bool> {
        Ok(self.canonical_yaml()? == other.canonical_yaml()?)
    }

    /// All trusted IP ranges declared in the network section.
    pub fn trusted_ranges(&self) -> impl Iterator<Item = &Ipv4Net> {
        self.network
            .admin_ip_addresses
            .iter()
            .chain(&self.network.user_ip_addresses)
            .chain(&self.network.data_provider_ip_addresses)
    }
}

#[cfg(test)]
#[path = "document_tests.rs"]
mod tests;
