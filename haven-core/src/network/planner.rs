//! Address planning: deterministic subnet allocation for a stack.
//!
//! Purposes are carved from a parent block in the order given, using
//! first-fit bump allocation. Each purpose gets the smallest power-of-two
//! subnet that holds its hosts plus the network and broadcast addresses,
//! aligned to its own size. The same block and purpose order always yield
//! the same plan, so re-applying a stack never moves unrelated subnets.

use crate::error::{HavenError, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::{debug, instrument};

/// Addresses reserved in every subnet (network and broadcast).
const RESERVED_PER_SUBNET: u64 = 2;

/// A named purpose and the number of hosts it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Purpose {
    pub name: String,
    pub required_hosts: u32,
}

impl Purpose {
    pub fn new(name: impl Into<String>, required_hosts: u32) -> Self {
        Self { name: name.into(), required_hosts }
    }
}

/// One allocated subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetAllocation {
    pub purpose: String,
    pub subnet: Ipv4Net,
}

/// Purpose → subnet mapping for one stack, in allocation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPlan {
    pub parent_block: Ipv4Net,
    pub subnets: Vec<SubnetAllocation>,
}

impl AddressPlan {
    /// Subnet allocated to `purpose`, if any.
    pub fn subnet(&self, purpose: &str) -> Option<Ipv4Net> {
        self.subnets.iter().find(|s| s.purpose == purpose).map(|s| s.subnet)
    }

    /// Whether any allocated subnet intersects `range`.
    pub fn overlaps(&self, range: &Ipv4Net) -> bool {
        self.subnets.iter().any(|s| nets_overlap(&s.subnet, range))
    }
}

/// Whether two networks share at least one address.
pub fn nets_overlap(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Address planner.
pub struct AddressPlanner;

impl AddressPlanner {
    /// Carve `purposes` out of `parent_block`, in order.
    ///
    /// # Errors
    ///
    /// Returns `HavenError::InsufficientAddressSpace` if the next candidate
    /// subnet would extend past the end of `parent_block`, and
    /// `HavenError::Validation` if a purpose name is repeated.
    #[instrument(skip(purposes), fields(block = %parent_block, purposes = purposes.len()))]
    pub fn allocate(parent_block: Ipv4Net, purposes: &[Purpose]) -> Result<AddressPlan> {
        let block = parent_block.trunc();
        let block_start = u64::from(u32::from(block.network()));
        let block_end = block_start + (1u64 << (32 - block.prefix_len()));

        let mut cursor = block_start;
        let mut subnets: Vec<SubnetAllocation> = Vec::with_capacity(purposes.len());

        for purpose in purposes {
            if subnets.iter().any(|s| s.purpose == purpose.name) {
                return Err(HavenError::validation(
                    "purposes",
                    format!("'{}' is listed more than once", purpose.name),
                ));
            }

            let required = u64::from(purpose.required_hosts) + RESERVED_PER_SUBNET;
            let size = required.next_power_of_two();
            let insufficient = || HavenError::InsufficientAddressSpace {
                block: block.to_string(),
                purpose: purpose.name.clone(),
                required,
            };
            if size > 1u64 << 32 {
                return Err(insufficient());
            }

            let start = align_up(cursor, size);
            if start + size > block_end {
                return Err(insufficient());
            }

            let prefix = 32 - size.trailing_zeros() as u8;
            let subnet = Ipv4Net::new(Ipv4Addr::from(start as u32), prefix)
                .map_err(|e| HavenError::Internal(format!("invalid prefix {}: {}", prefix, e)))?;

            debug!(purpose = %purpose.name, subnet = %subnet, "Allocated subnet");
            metrics::counter!("haven_subnets_allocated_total").increment(1);

            subnets.push(SubnetAllocation { purpose: purpose.name.clone(), subnet });
            cursor = start + size;
        }

        Ok(AddressPlan { parent_block: block, subnets })
    }
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}
