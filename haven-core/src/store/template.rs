//! Starter documents for operators.
//!
//! Values are instructions rather than data, so a template never parses as
//! a valid document until the operator fills it in.

use crate::types::DocumentKind;

const HUB_TEMPLATE: &str = r#"kind: hub
name: Name of this context (letters, numbers and underscores only)
description: Human-friendly name for this deployment
cloud:
  location: Cloud region to deploy into, e.g. uksouth
  subscription_id: ID of the subscription to deploy into
  tenant_id: ID of the tenant that owns the subscription
network:
  address_space: CIDR block for the hub network, e.g. 10.0.0.0/24
  admin_ip_addresses:
    - IP ranges (CIDR) that administrators connect from
  user_ip_addresses: []
  data_provider_ip_addresses: []
identity:
  admin_email_address: Email address shared by all administrators
  admin_group_id: ID of the group whose members are administrators
  timezone: Timezone in tz database format, e.g. Europe/London
features:
  allow_copy: false
  allow_paste: false
  software_packages: Which packages users may install (any, pre-approved or none)
  databases: []
  workspace_skus: []
"#;

const LEAF_TEMPLATE: &str = r#"kind: leaf
name: Name of this environment (letters, numbers and underscores only)
description: Human-friendly name for this environment
cloud:
  location: Cloud region to deploy into, e.g. uksouth
  subscription_id: ID of the subscription to deploy into
  tenant_id: ID of the tenant that owns the subscription
network:
  address_space: CIDR block for this environment, must not overlap the hub
  admin_ip_addresses:
    - IP ranges (CIDR) that administrators connect from
  user_ip_addresses:
    - IP ranges (CIDR) that users connect from
  data_provider_ip_addresses:
    - IP ranges (CIDR) that data providers upload from
identity:
  admin_email_address: Email address shared by all administrators
  timezone: Timezone in tz database format, e.g. Europe/London
dockerhub:
  username: Docker Hub account used to pull images
  access_token: Read-only access token for that account
features:
  allow_copy: Whether users may copy text out of the environment (true/false)
  allow_paste: Whether users may paste text into the environment (true/false)
  software_packages: Which packages users may install (any, pre-approved or none)
  databases:
    - Database systems to deploy (postgresql, microsoft-sql-server)
  workspace_skus:
    - Virtual machine sizes for user workspaces, e.g. Standard_D2s_v3
"#;

/// Starter YAML for a document kind.
pub fn template(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Hub => HUB_TEMPLATE,
        DocumentKind::Leaf => LEAF_TEMPLATE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConfigDocument;

    #[test]
    fn test_templates_name_their_kind() {
        assert!(template(DocumentKind::Hub).starts_with("kind: hub\n"));
        assert!(template(DocumentKind::Leaf).starts_with("kind: leaf\n"));
    }

    #[test]
    fn test_templates_are_yaml_but_not_documents() {
        for kind in [DocumentKind::Hub, DocumentKind::Leaf] {
            let text = template(kind);
            assert!(serde_yaml::from_str::<serde_yaml::Value>(text).is_ok());
            assert!(ConfigDocument::from_yaml(text, "template").is_err());
        }
    }
}
