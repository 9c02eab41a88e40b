//! Network planning for stacks.
//!
//! - [`planner`]: deterministic subnet allocation per stack
//! - [`hosts`]: lazy host enumeration for firewall allow-lists
//!
//! Purpose lists are fixed per stack kind. Changing their order changes
//! every subnet after the first moved purpose, so new purposes are only
//! ever appended.

pub mod hosts;
pub mod planner;

pub use hosts::{aggregate, enumerate_hosts, AllowList, MAX_EXPANDED_ADDRESSES};
pub use planner::{nets_overlap, AddressPlan, AddressPlanner, Purpose, SubnetAllocation};

/// Subnets carved from the hub's address space.
pub fn hub_purposes() -> Vec<Purpose> {
    vec![
        Purpose::new("firewall", 62),
        Purpose::new("identity", 14),
        Purpose::new("monitoring", 30),
        Purpose::new("update-servers", 14),
    ]
}

/// Subnets carved from a leaf's address space.
pub fn leaf_purposes() -> Vec<Purpose> {
    vec![
        Purpose::new("identity", 14),
        Purpose::new("data-configuration", 14),
        Purpose::new("data-private", 14),
        Purpose::new("user-services", 30),
        Purpose::new("workspaces", 126),
    ]
}
