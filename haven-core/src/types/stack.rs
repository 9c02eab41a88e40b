//! Stack domain types.

use crate::network::AddressPlan;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Stable stack identifier (e.g. `shm-acme`, `shm-acme-sre-sandbox`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackId(String);

impl StackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hub or leaf. A leaf carries a reference to its parent hub stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackKind {
    Hub,
    Leaf(StackId),
}

impl StackKind {
    /// Parent hub of a leaf stack.
    pub fn parent(&self) -> Option<&StackId> {
        match self {
            Self::Hub => None,
            Self::Leaf(parent) => Some(parent),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Hub => "hub",
            Self::Leaf(_) => "leaf",
        }
    }
}

/// Stack lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackStatus {
    /// Nothing recorded for this stack
    Absent,

    /// Document validated, prerequisites met
    Planned,

    /// Provisioner call in flight
    Applying,

    /// Last apply succeeded with the current remote document
    Applied,

    /// Remote document changed since the last successful apply
    Stale,

    /// Provisioner destroy in flight
    Destroying,

    /// Resources removed
    Destroyed,

    /// Last provisioner call failed or was cancelled
    Failed,
}

impl StackStatus {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: StackStatus) -> bool {
        use StackStatus::*;
        match (self, next) {
            (Absent | Destroyed | Failed | Planned, Planned) => true,
            (Applied, Stale) => true,
            (Planned | Applied | Stale | Failed, Applying) => true,
            (Applying, Applied | Failed) => true,
            (Applied | Stale | Failed, Destroying) => true,
            (Destroying, Destroyed | Failed) => true,
            _ => false,
        }
    }

    /// Whether resources may currently exist for this stack.
    pub fn is_live(self) -> bool {
        !matches!(self, StackStatus::Absent | StackStatus::Destroyed | StackStatus::Planned)
    }
}

impl std::fmt::Display for StackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Planned => write!(f, "planned"),
            Self::Applying => write!(f, "applying"),
            Self::Applied => write!(f, "applied"),
            Self::Stale => write!(f, "stale"),
            Self::Destroying => write!(f, "destroying"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for StackStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "absent" => Ok(Self::Absent),
            "planned" => Ok(Self::Planned),
            "applying" => Ok(Self::Applying),
            "applied" => Ok(Self::Applied),
            "stale" => Ok(Self::Stale),
            "destroying" => Ok(Self::Destroying),
            "destroyed" => Ok(Self::Destroyed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown stack status: {}", s)),
        }
    }
}

/// Which stack of a context an operator is addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackTarget {
    Hub,
    Leaf(String),
}

impl std::fmt::Display for StackTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hub => write!(f, "hub"),
            Self::Leaf(name) => write!(f, "leaf '{}'", name),
        }
    }
}

/// Persisted record of one stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackRecord {
    /// Stack ID
    pub id: StackId,

    /// Owning context name
    pub context: String,

    /// Document name (context name for hubs, leaf name otherwise)
    pub name: String,

    /// Hub or leaf with parent reference
    pub kind: StackKind,

    /// Lifecycle status
    pub status: StackStatus,

    /// Content hash of the document used by the last successful apply
    pub applied_hash: Option<String>,

    /// Address plan computed by the last apply
    pub address_plan: Option<AddressPlan>,

    /// Human-readable cause of the last failure
    pub last_error: Option<String>,

    /// Creation timestamp
    pub created_at: SystemTime,

    /// Last status change
    pub updated_at: SystemTime,
}

impl StackRecord {
    /// A fresh record in the `Absent` state.
    pub fn absent(id: StackId, context: &str, name: &str, kind: StackKind) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            context: context.to_string(),
            name: name.to_string(),
            kind,
            status: StackStatus::Absent,
            applied_hash: None,
            address_plan: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_display() {
        for status in [
            StackStatus::Absent,
            StackStatus::Planned,
            StackStatus::Applying,
            StackStatus::Applied,
            StackStatus::Stale,
            StackStatus::Destroying,
            StackStatus::Destroyed,
            StackStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<StackStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_transitions() {
        use StackStatus::*;
        assert!(Absent.can_transition_to(Planned));
        assert!(Planned.can_transition_to(Applying));
        assert!(Applying.can_transition_to(Applied));
        assert!(Applied.can_transition_to(Stale));
        assert!(Stale.can_transition_to(Applying));
        assert!(Failed.can_transition_to(Applying));
        assert!(Applied.can_transition_to(Destroying));
        assert!(Destroying.can_transition_to(Destroyed));

        assert!(!Absent.can_transition_to(Applied));
        assert!(!Absent.can_transition_to(Destroying));
        assert!(!Destroyed.can_transition_to(Applying));
        assert!(!Applying.can_transition_to(Destroying));
    }

    #[test]
    fn test_leaf_parent() {
        let kind = StackKind::Leaf(StackId::new("shm-acme"));
        assert_eq!(kind.parent().unwrap().as_str(), "shm-acme");
        assert!(StackKind::Hub.parent().is_none());
        assert_eq!(kind.label(), "leaf");
    }
}
