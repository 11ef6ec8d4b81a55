//! Desired route set computation

use crate::locality::LocalityFacts;
use crate::selector::RouteCandidate;
use std::collections::BTreeSet;
use std::net::IpAddr;

/// VIPs this node should be announcing
pub type DesiredRouteSet = BTreeSet<IpAddr>;

pub struct DesiredStateComputer;

impl DesiredStateComputer {
    /// VIPs of every candidate whose service has a local ready endpoint.
    ///
    /// Pure: the same inputs always yield the same set.
    pub fn compute(candidates: &[RouteCandidate], facts: &LocalityFacts) -> DesiredRouteSet {
        candidates
            .iter()
            .filter(|c| {
                facts
                    .get(&c.service)
                    .is_some_and(|fact| fact.has_local_endpoint)
            })
            .map(|c| c.vip)
            .collect()
    }
}
