//! VIP allocation from administrator-configured address pools

use crate::error::AllocError;
use crate::service::ServiceId;
use ipnetwork::IpNetwork;
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Pools are keyed by the `namespace/name` of the BGPRoute defining them
pub type PoolId = String;

/// Inclusive range of addresses of a single family
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressRange {
    start: IpAddr,
    end: IpAddr,
}

impl AddressRange {
    pub fn new(start: IpAddr, end: IpAddr) -> Result<Self, AllocError> {
        let invalid = |reason: &str| AllocError::InvalidRange {
            range: format!("{}-{}", start, end),
            reason: reason.to_string(),
        };
        if start.is_ipv4() != end.is_ipv4() {
            return Err(invalid("mixed address families"));
        }
        if to_u128(start) > to_u128(end) {
            return Err(invalid("start is after end"));
        }
        Ok(Self { start, end })
    }

    /// Parse `start-end` or CIDR notation
    pub fn parse(s: &str) -> Result<Self, AllocError> {
        let s = s.trim();
        let invalid = |reason: String| AllocError::InvalidRange {
            range: s.to_string(),
            reason,
        };

        if let Some((start, end)) = s.split_once('-') {
            let start: IpAddr = start.trim().parse().map_err(|e| invalid(format!("{}", e)))?;
            let end: IpAddr = end.trim().parse().map_err(|e| invalid(format!("{}", e)))?;
            return Self::new(start, end);
        }

        let network: IpNetwork = s.parse().map_err(|e| invalid(format!("{}", e)))?;
        let (start, end) = match network {
            IpNetwork::V4(net) => (IpAddr::V4(net.network()), IpAddr::V4(net.broadcast())),
            IpNetwork::V6(net) => {
                let host_bits = 128 - u32::from(net.prefix());
                let first = u128::from(net.network());
                let last = first | (u128::MAX.checked_shr(128 - host_bits).unwrap_or(0));
                (IpAddr::V6(net.network()), IpAddr::V6(Ipv6Addr::from(last)))
            }
        };
        Self::new(start, end)
    }

    pub fn start(&self) -> IpAddr {
        self.start
    }

    pub fn end(&self) -> IpAddr {
        self.end
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        addr.is_ipv4() == self.start.is_ipv4()
            && (to_u128(self.start)..=to_u128(self.end)).contains(&to_u128(addr))
    }

    fn overlaps(&self, other: &AddressRange) -> bool {
        self.start.is_ipv4() == other.start.is_ipv4()
            && to_u128(self.start) <= to_u128(other.end)
            && to_u128(other.start) <= to_u128(self.end)
    }

    /// Number of addresses in the range, saturating for a full IPv6 space
    pub fn size(&self) -> u128 {
        (to_u128(self.end) - to_u128(self.start)).saturating_add(1)
    }

    fn addresses(&self) -> impl Iterator<Item = IpAddr> {
        let v4 = self.start.is_ipv4();
        (to_u128(self.start)..=to_u128(self.end)).map(move |n| from_u128(n, v4))
    }
}

fn to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn from_u128(n: u128, v4: bool) -> IpAddr {
    if v4 {
        // Ranges are validated per family, so v4 values always fit.
        IpAddr::V4(Ipv4Addr::from(n as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(n))
    }
}

/// Ordered, disjoint address ranges plus the allocation map over them
#[derive(Debug)]
struct AddressPool {
    ranges: Vec<AddressRange>,
    allocated: BTreeMap<IpAddr, ServiceId>,
}

impl AddressPool {
    fn contains(&self, addr: IpAddr) -> bool {
        self.ranges.iter().any(|r| r.contains(addr))
    }

    /// First-fit scan in range order
    fn first_free(&self) -> Option<IpAddr> {
        self.ranges
            .iter()
            .flat_map(|r| r.addresses())
            .find(|addr| !self.allocated.contains_key(addr))
    }

    fn address_of(&self, service: &ServiceId) -> Option<IpAddr> {
        self.allocated
            .iter()
            .find(|(_, owner)| *owner == service)
            .map(|(addr, _)| *addr)
    }

    fn total(&self) -> u128 {
        self.ranges
            .iter()
            .fold(0u128, |acc, r| acc.saturating_add(r.size()))
    }
}

/// Allocation figures for one pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub total: u128,
    pub allocated: usize,
}

impl PoolStats {
    pub fn free(&self) -> u128 {
        self.total.saturating_sub(self.allocated as u128)
    }
}

/// IpAllocator owns every address pool and is the only writer of their
/// allocation maps. All operations take the same lock, so two concurrent
/// `allocate` calls can never hand out the same address.
#[derive(Debug, Default)]
pub struct IpAllocator {
    pools: Mutex<BTreeMap<PoolId, AddressPool>>,
}

impl IpAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<PoolId, AddressPool>>, AllocError> {
        self.pools.lock().map_err(|_| AllocError::Poisoned)
    }

    /// Register a pool from its range definitions.
    ///
    /// Registering the same pool again with identical ranges is a no-op.
    /// New ranges replace the old ones; allocations still inside them are
    /// kept, the rest are dropped. Ranges overlapping another pool are
    /// rejected and leave the pool as it was.
    pub fn ensure_pool(&self, pool: &str, ranges: &[String]) -> Result<(), AllocError> {
        let parsed = ranges
            .iter()
            .map(|r| AddressRange::parse(r))
            .collect::<Result<Vec<_>, _>>()?;

        for (i, a) in parsed.iter().enumerate() {
            if parsed[i + 1..].iter().any(|b| a.overlaps(b)) {
                return Err(AllocError::InvalidRange {
                    range: ranges[i].clone(),
                    reason: "overlaps another range of the same pool".to_string(),
                });
            }
        }

        let mut pools = self.lock()?;
        if pools.get(pool).is_some_and(|existing| existing.ranges == parsed) {
            return Ok(());
        }

        for (other_id, other) in pools.iter().filter(|(id, _)| id.as_str() != pool) {
            if parsed
                .iter()
                .any(|a| other.ranges.iter().any(|b| a.overlaps(b)))
            {
                return Err(AllocError::PoolOverlap {
                    pool: pool.to_string(),
                    other: other_id.clone(),
                });
            }
        }

        match pools.get_mut(pool) {
            Some(existing) => {
                existing.ranges = parsed;
                let AddressPool { ranges, allocated } = existing;
                allocated.retain(|addr, owner| {
                    let kept = ranges.iter().any(|r| r.contains(*addr));
                    if !kept {
                        warn!(pool = %pool, service = %owner, address = %addr, "Dropping allocation outside the new pool ranges");
                    }
                    kept
                });
                info!(pool = %pool, addresses = existing.total(), "Updated address pool ranges");
            }
            None => {
                let pool_state = AddressPool {
                    ranges: parsed,
                    allocated: BTreeMap::new(),
                };
                info!(pool = %pool, addresses = pool_state.total(), "Registered address pool");
                pools.insert(pool.to_string(), pool_state);
            }
        }
        Ok(())
    }

    /// Allocate an address for a service.
    ///
    /// A service already holding an address in the pool gets the same address
    /// back. Exhaustion leaves the pool untouched.
    pub fn allocate(&self, pool: &str, service: &ServiceId) -> Result<IpAddr, AllocError> {
        let mut pools = self.lock()?;
        let state = pools
            .get_mut(pool)
            .ok_or_else(|| AllocError::UnknownPool(pool.to_string()))?;

        if let Some(addr) = state.address_of(service) {
            return Ok(addr);
        }

        let addr = state
            .first_free()
            .ok_or_else(|| AllocError::PoolExhausted(pool.to_string()))?;
        state.allocated.insert(addr, service.clone());
        debug!(pool = %pool, service = %service, address = %addr, "Allocated address");
        Ok(addr)
    }

    /// Return an address to its pool, yielding the service it was bound to
    pub fn release(&self, addr: IpAddr) -> Result<Option<ServiceId>, AllocError> {
        let mut pools = self.lock()?;
        let released = pools
            .values_mut()
            .find_map(|state| state.allocated.remove(&addr));
        if let Some(owner) = &released {
            debug!(service = %owner, address = %addr, "Released address");
        }
        Ok(released)
    }

    /// Record an allocation observed in the cluster.
    ///
    /// Used to rebuild allocator state from service statuses before any new
    /// address is handed out. Returns `false` when the address lies outside
    /// every pool. The observed binding supersedes any other address the
    /// service held.
    pub fn mark_used(&self, addr: IpAddr, service: &ServiceId) -> Result<bool, AllocError> {
        let mut pools = self.lock()?;

        let Some(pool_id) = pools
            .iter()
            .find(|(_, state)| state.contains(addr))
            .map(|(id, _)| id.clone())
        else {
            return Ok(false);
        };

        if let Some(owner) = pools.get(&pool_id).and_then(|s| s.allocated.get(&addr)) {
            if owner == service {
                return Ok(true);
            }
            return Err(AllocError::AddressConflict {
                address: addr,
                owner: owner.clone(),
            });
        }

        for state in pools.values_mut() {
            state.allocated.retain(|other, owner| {
                if owner == service {
                    warn!(service = %service, stale = %other, observed = %addr, "Replacing stale allocation");
                    false
                } else {
                    true
                }
            });
        }
        if let Some(state) = pools.get_mut(&pool_id) {
            state.allocated.insert(addr, service.clone());
        }
        Ok(true)
    }

    /// Release allocations of services outside the live set
    pub fn retain_services(
        &self,
        live: &HashSet<ServiceId>,
    ) -> Result<Vec<(IpAddr, ServiceId)>, AllocError> {
        let mut pools = self.lock()?;
        let mut released = Vec::new();
        for state in pools.values_mut() {
            state.allocated.retain(|addr, owner| {
                if live.contains(owner) {
                    true
                } else {
                    released.push((*addr, owner.clone()));
                    false
                }
            });
        }
        Ok(released)
    }

    /// Pool whose ranges contain the address
    pub fn pool_of(&self, addr: IpAddr) -> Option<PoolId> {
        let pools = self.lock().ok()?;
        pools
            .iter()
            .find(|(_, state)| state.contains(addr))
            .map(|(id, _)| id.clone())
    }

    pub fn allocation_of(&self, service: &ServiceId) -> Option<IpAddr> {
        let pools = self.lock().ok()?;
        pools.values().find_map(|state| state.address_of(service))
    }

    pub fn stats(&self, pool: &str) -> Option<PoolStats> {
        let pools = self.lock().ok()?;
        pools.get(pool).map(|state| PoolStats {
            total: state.total(),
            allocated: state.allocated.len(),
        })
    }
}
