//! Host enumeration for firewall allow-lists.
//!
//! Storage and firewall rules take individual addresses, so CIDR ranges
//! from a document are expanded lazily. Overlapping ranges are merged
//! first, which makes the flattened sequence free of duplicates and
//! ascending without buffering it.
//!
//! Expansion is bounded by [`MAX_EXPANDED_ADDRESSES`]; wider ranges are
//! handed to the provisioner as CIDRs via [`aggregate`].

use crate::error::{HavenError, Result};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Most addresses one allow-list may expand to (a /16).
pub const MAX_EXPANDED_ADDRESSES: u64 = 1 << 16;

/// Every address in `subnet`, ascending.
///
/// The returned value is an iterator that can be cloned to restart it.
pub fn enumerate_hosts(subnet: Ipv4Net) -> AllowList {
    AllowList::new([subnet])
}

/// Lazy, restartable, de-duplicated sequence of addresses drawn from one
/// or more CIDR ranges.
#[derive(Debug, Clone)]
pub struct AllowList {
    /// Disjoint, sorted, non-adjacent inclusive intervals
    intervals: Vec<(u32, u32)>,
    index: usize,
    next: Option<u64>,
}

impl AllowList {
    /// Build from any collection of ranges, in any order, possibly overlapping.
    pub fn new(ranges: impl IntoIterator<Item = Ipv4Net>) -> Self {
        let mut spans: Vec<(u32, u32)> = ranges
            .into_iter()
            .map(|net| (u32::from(net.network()), u32::from(net.broadcast())))
            .collect();
        spans.sort_unstable();

        let mut intervals: Vec<(u32, u32)> = Vec::with_capacity(spans.len());
        for (start, end) in spans {
            match intervals.last_mut() {
                Some((_, last_end)) if u64::from(start) <= u64::from(*last_end) + 1 => {
                    *last_end = (*last_end).max(end);
                }
                _ => intervals.push((start, end)),
            }
        }

        let next = intervals.first().map(|(start, _)| u64::from(*start));
        Self { intervals, index: 0, next }
    }

    /// Like [`AllowList::new`], but fails when the merged ranges hold more
    /// than [`MAX_EXPANDED_ADDRESSES`] addresses. `field` names the document
    /// path reported in the error.
    pub fn bounded(ranges: impl IntoIterator<Item = Ipv4Net>, field: &str) -> Result<Self> {
        let list = Self::new(ranges);
        let total = list.total();
        if total > MAX_EXPANDED_ADDRESSES {
            return Err(HavenError::validation(
                field,
                format!("covers {} addresses, at most {} can be listed individually", total, MAX_EXPANDED_ADDRESSES),
            ));
        }
        Ok(list)
    }

    /// Total number of addresses the sequence yields from the start.
    pub fn total(&self) -> u64 {
        self.intervals.iter().map(|(s, e)| u64::from(*e) - u64::from(*s) + 1).sum()
    }

    /// The merged ranges backing this list.
    pub fn intervals(&self) -> impl Iterator<Item = (Ipv4Addr, Ipv4Addr)> + '_ {
        self.intervals.iter().map(|(s, e)| (Ipv4Addr::from(*s), Ipv4Addr::from(*e)))
    }

    /// A fresh iterator positioned at the first address.
    pub fn restart(&self) -> Self {
        let next = self.intervals.first().map(|(start, _)| u64::from(*start));
        Self { intervals: self.intervals.clone(), index: 0, next }
    }
}

/// Smallest set of CIDRs covering `ranges`, ascending.
pub fn aggregate<'a>(ranges: impl IntoIterator<Item = &'a Ipv4Net>) -> Vec<Ipv4Net> {
    let networks: Vec<Ipv4Net> = ranges.into_iter().map(Ipv4Net::trunc).collect();
    Ipv4Net::aggregate(&networks)
}

impl Iterator for AllowList {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        let (_, end) = self.intervals[self.index];

        if current < u64::from(end) {
            self.next = Some(current + 1);
        } else {
            self.index += 1;
            self.next = self.intervals.get(self.index).map(|(start, _)| u64::from(*start));
        }

        Some(Ipv4Addr::from(current as u32))
    }
}
