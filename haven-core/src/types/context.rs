//! Deployment context domain types.

use super::naming::{alphanumeric, is_safe_identifier, sanitise, truncate};
use super::stack::StackId;
use crate::error::{HavenError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One deployment of the hub environment.
///
/// Fields are private: a context is immutable once created and only
/// changes through [`Context::migrate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    name: String,
    subscription_name: String,
    admin_group_name: String,
    description: String,
}

/// Changes permitted by an explicit context migration.
#[derive(Debug, Clone, Default)]
pub struct ContextUpdate {
    pub admin_group_name: Option<String>,
    pub description: Option<String>,
}

impl Context {
    /// Create and validate a new context.
    pub fn new(
        name: impl Into<String>,
        subscription_name: impl Into<String>,
        admin_group_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self> {
        let context = Self {
            name: name.into(),
            subscription_name: subscription_name.into(),
            admin_group_name: admin_group_name.into(),
            description: description.into(),
        };
        context.validate()?;
        Ok(context)
    }

    /// Check naming rules. Called on creation and after loading from disk.
    pub fn validate(&self) -> Result<()> {
        if !is_safe_identifier(&self.name) {
            return Err(HavenError::validation(
                "context.name",
                format!("'{}' may only contain letters, numbers and underscores", self.name),
            ));
        }
        if self.subscription_name.trim().is_empty() {
            return Err(HavenError::validation("context.subscription_name", "must not be empty"));
        }
        if self.admin_group_name.trim().is_empty() {
            return Err(HavenError::validation("context.admin_group_name", "must not be empty"));
        }
        Ok(())
    }

    /// Apply an explicit migration, returning the updated context.
    pub fn migrate(&self, update: ContextUpdate) -> Result<Self> {
        let migrated = Self {
            name: self.name.clone(),
            subscription_name: self.subscription_name.clone(),
            admin_group_name: update.admin_group_name.unwrap_or_else(|| self.admin_group_name.clone()),
            description: update.description.unwrap_or_else(|| self.description.clone()),
        };
        migrated.validate()?;
        Ok(migrated)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscription_name(&self) -> &str {
        &self.subscription_name
    }

    pub fn admin_group_name(&self) -> &str {
        &self.admin_group_name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Resource tags applied to everything deployed for this context.
    pub fn tags(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("description".to_string(), self.description.clone()),
            ("project".to_string(), "Data Safe Haven".to_string()),
            ("shm_name".to_string(), self.name.clone()),
            ("version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
        ])
    }

    pub fn resource_group_name(&self) -> String {
        format!("shm-{}-rg", self.name)
    }

    /// Storage account names are 3-24 lowercase letters and digits.
    pub fn storage_account_name(&self) -> String {
        format!("shm{}", truncate(&alphanumeric(&self.name), 21))
    }

    /// Key vault names are limited to 24 characters.
    pub fn key_vault_name(&self) -> String {
        format!("shm-{}-kv", truncate(&self.name, 17))
    }

    pub fn managed_identity_name(&self) -> String {
        format!("shm-{}-identity-reader", self.name)
    }

    /// Stack id of this context's hub.
    pub fn hub_stack_id(&self) -> StackId {
        StackId::new(format!("shm-{}", sanitise(&self.name)))
    }

    /// Stack id of a leaf belonging to this context.
    pub fn leaf_stack_id(&self, leaf_name: &str) -> StackId {
        StackId::new(format!("shm-{}-sre-{}", sanitise(&self.name), sanitise(leaf_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme() -> Context {
        Context::new("acme", "Data Safe Haven Acme", "Acme Admins", "Acme deployment").unwrap()
    }

    #[test]
    fn test_derived_names() {
        let context = acme();
        assert_eq!(context.resource_group_name(), "shm-acme-rg");
        assert_eq!(context.storage_account_name(), "shmacme");
        assert_eq!(context.key_vault_name(), "shm-acme-kv");
        assert_eq!(context.managed_identity_name(), "shm-acme-identity-reader");
        assert_eq!(context.hub_stack_id().as_str(), "shm-acme");
        assert_eq!(context.leaf_stack_id("SandBox").as_str(), "shm-acme-sre-sandbox");
    }

    #[test]
    fn test_names_respect_length_limits() {
        let context = Context::new(
            "a_very_long_context_name_indeed",
            "subscription",
            "admins",
            "long",
        )
        .unwrap();
        assert!(context.storage_account_name().len() <= 24);
        assert!(context.storage_account_name().chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(context.key_vault_name().len() <= 24);
    }

    #[test]
    fn test_invalid_name_rejected() {
        let err = Context::new("acme-corp", "sub", "admins", "").unwrap_err();
        assert!(matches!(err, HavenError::Validation { .. }));
    }

    #[test]
    fn test_migrate_keeps_identity() {
        let context = acme();
        let migrated = context
            .migrate(ContextUpdate {
                description: Some("Renamed".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(migrated.name(), "acme");
        assert_eq!(migrated.subscription_name(), context.subscription_name());
        assert_eq!(migrated.description(), "Renamed");
        assert_eq!(migrated.admin_group_name(), "Acme Admins");
    }

    #[test]
    fn test_tags() {
        let tags = acme().tags();
        assert_eq!(tags["shm_name"], "acme");
        assert_eq!(tags["project"], "Data Safe Haven");
    }
}
