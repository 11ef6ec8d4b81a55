//! Selection of routable services

use crate::allocator::{IpAllocator, PoolId};
use crate::error::{AllocError, CoreError, Result};
use crate::labels::selector_matches;
use crate::service::{self, ServiceId};
use crate::status::StatusWriter;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A routable service paired with its VIP
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteCandidate {
    pub service: ServiceId,
    pub vip: IpAddr,
    pub selector: BTreeMap<String, String>,
}

/// Why a service is not a route candidate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NotLoadBalancer,
    NodeLocalTrafficPolicy,
    EmptySelector,
    SelectorMismatch,
    NoVip,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::NotLoadBalancer => "service type is not LoadBalancer",
            SkipReason::NodeLocalTrafficPolicy => "external traffic policy is Local",
            SkipReason::EmptySelector => "service has no endpoint selector",
            SkipReason::SelectorMismatch => "service labels do not match the route selector",
            SkipReason::NoVip => "no VIP assigned yet",
        };
        f.write_str(s)
    }
}

/// Outcome of one selection pass
#[derive(Clone, Debug, Default)]
pub struct Selection {
    pub candidates: Vec<RouteCandidate>,
    /// Routable services still waiting for a VIP
    pub unassigned: Vec<ServiceId>,
    pub skipped: Vec<(ServiceId, SkipReason)>,
}

/// Result of assigning a VIP to one service
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Assignment {
    /// Allocated and written to the service status
    Recorded { service: ServiceId, vip: IpAddr },
    /// No free address left in the pool
    Exhausted { service: ServiceId },
    /// Allocation rolled back because the status write failed
    WriteFailed { service: ServiceId, vip: IpAddr, error: String },
}

struct PoolBinding {
    allocator: Arc<IpAllocator>,
    pool: PoolId,
    status: Arc<dyn StatusWriter>,
}

/// RouteSelector filters services down to route candidates.
///
/// When bound to a pool it can also assign VIPs to routable services that
/// lack one.
pub struct RouteSelector {
    service_selector: LabelSelector,
    binding: Option<PoolBinding>,
}

impl RouteSelector {
    pub fn new(service_selector: LabelSelector) -> Self {
        Self {
            service_selector,
            binding: None,
        }
    }

    /// Bind the selector to the pool VIPs are drawn from
    pub fn with_pool(
        mut self,
        allocator: Arc<IpAllocator>,
        pool: impl Into<PoolId>,
        status: Arc<dyn StatusWriter>,
    ) -> Self {
        self.binding = Some(PoolBinding {
            allocator,
            pool: pool.into(),
            status,
        });
        self
    }

    /// Apply the routability predicates in order, stopping at the first failure
    pub fn check(&self, svc: &Service) -> std::result::Result<(), SkipReason> {
        if !service::is_load_balancer(svc) {
            return Err(SkipReason::NotLoadBalancer);
        }
        if service::has_local_traffic_policy(svc) {
            return Err(SkipReason::NodeLocalTrafficPolicy);
        }
        if service::endpoint_selector(svc).is_none() {
            return Err(SkipReason::EmptySelector);
        }
        if !selector_matches(&self.service_selector, svc.labels()) {
            return Err(SkipReason::SelectorMismatch);
        }
        Ok(())
    }

    pub fn select<'a>(&self, services: impl IntoIterator<Item = &'a Service>) -> Selection {
        let mut selection = Selection::default();

        for svc in services {
            let id = ServiceId::of(svc);
            if let Err(reason) = self.check(svc) {
                debug!(service = %id, %reason, "Skipping service");
                selection.skipped.push((id, reason));
                continue;
            }

            match service::assigned_vip(svc) {
                Some(vip) => selection.candidates.push(RouteCandidate {
                    service: id,
                    vip,
                    selector: service::endpoint_selector(svc).cloned().unwrap_or_default(),
                }),
                None => {
                    debug!(service = %id, reason = %SkipReason::NoVip, "Skipping service");
                    selection.unassigned.push(id);
                }
            }
        }

        selection.candidates.sort_by(|a, b| a.service.cmp(&b.service));
        selection.unassigned.sort();
        selection
    }

    /// Allocate and record VIPs for routable services lacking one.
    ///
    /// An address only becomes a candidate once it is read back from the
    /// service status on a later pass; a failed status write releases it.
    pub async fn assign_missing(&self, selection: &Selection) -> Result<Vec<Assignment>> {
        let binding = self.binding.as_ref().ok_or_else(|| {
            CoreError::InvalidConfiguration("route selector is not bound to an address pool".to_string())
        })?;

        let mut assignments = Vec::with_capacity(selection.unassigned.len());
        for service in &selection.unassigned {
            let vip = match binding.allocator.allocate(&binding.pool, service) {
                Ok(vip) => vip,
                Err(AllocError::PoolExhausted(pool)) => {
                    warn!(service = %service, pool = %pool, "Address pool exhausted");
                    if let Err(e) = binding.status.record_exhausted(service, &pool).await {
                        warn!(service = %service, error = %e, "Failed to record exhaustion condition");
                    }
                    assignments.push(Assignment::Exhausted {
                        service: service.clone(),
                    });
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match binding.status.record_vip(service, vip).await {
                Ok(()) => {
                    info!(service = %service, vip = %vip, pool = %binding.pool, "Assigned VIP");
                    assignments.push(Assignment::Recorded {
                        service: service.clone(),
                        vip,
                    });
                }
                Err(e) => {
                    warn!(service = %service, vip = %vip, error = %e, "Status write failed, releasing VIP");
                    binding.allocator.release(vip)?;
                    assignments.push(Assignment::WriteFailed {
                        service: service.clone(),
                        vip,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(assignments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{lb_service, RecordingStatus};

    fn selector(pairs: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            match_expressions: None,
        }
    }

    #[test]
    fn test_predicates_in_order() {
        let rs = RouteSelector::new(selector(&[("bgp", "on")]));

        let mut svc = lb_service("web", "api", Some("10.0.0.5"));
        assert_eq!(rs.check(&svc), Ok(()));

        svc.metadata.labels = None;
        assert_eq!(rs.check(&svc), Err(SkipReason::SelectorMismatch));

        svc.spec.as_mut().unwrap().selector = None;
        assert_eq!(rs.check(&svc), Err(SkipReason::EmptySelector));

        svc.spec.as_mut().unwrap().external_traffic_policy = Some("Local".to_string());
        assert_eq!(rs.check(&svc), Err(SkipReason::NodeLocalTrafficPolicy));

        svc.spec.as_mut().unwrap().type_ = Some("ClusterIP".to_string());
        assert_eq!(rs.check(&svc), Err(SkipReason::NotLoadBalancer));
    }

    #[test]
    fn test_node_local_policy_never_selected() {
        let rs = RouteSelector::new(selector(&[("bgp", "on")]));
        let mut svc = lb_service("web", "api", Some("10.0.0.5"));
        svc.spec.as_mut().unwrap().external_traffic_policy = Some("Local".to_string());

        let selection = rs.select([&svc]);
        assert!(selection.candidates.is_empty());
        assert!(selection.unassigned.is_empty());
        assert_eq!(
            selection.skipped,
            vec![(ServiceId::new("web", "api"), SkipReason::NodeLocalTrafficPolicy)]
        );
    }

    #[test]
    fn test_select_pairs_vips() {
        let rs = RouteSelector::new(selector(&[("bgp", "on")]));
        let services = vec![
            lb_service("web", "b", Some("10.0.0.2")),
            lb_service("web", "a", Some("10.0.0.1")),
            lb_service("web", "pending", None),
        ];

        let selection = rs.select(&services);
        let vips: Vec<_> = selection.candidates.iter().map(|c| c.vip.to_string()).collect();
        assert_eq!(vips, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(selection.unassigned, vec![ServiceId::new("web", "pending")]);
        assert_eq!(
            selection.candidates[0].selector.get("app").map(String::as_str),
            Some("a")
        );
    }

    #[tokio::test]
    async fn test_assign_missing_records_status() {
        let allocator = Arc::new(IpAllocator::new());
        allocator
            .ensure_pool("web/edge", &["10.0.0.1-10.0.0.1".to_string()])
            .unwrap();
        let status = Arc::new(RecordingStatus::default());
        let rs = RouteSelector::new(selector(&[("bgp", "on")])).with_pool(
            allocator.clone(),
            "web/edge",
            status.clone(),
        );

        let services = vec![lb_service("web", "a", None), lb_service("web", "b", None)];
        let selection = rs.select(&services);
        let assignments = rs.assign_missing(&selection).await.unwrap();

        let vip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(
            assignments,
            vec![
                Assignment::Recorded {
                    service: ServiceId::new("web", "a"),
                    vip
                },
                Assignment::Exhausted {
                    service: ServiceId::new("web", "b")
                },
            ]
        );
        assert_eq!(status.vips(), vec![(ServiceId::new("web", "a"), vip)]);
        assert_eq!(status.exhausted(), vec![ServiceId::new("web", "b")]);
        // Not trusted until it is read back from the status
        assert!(selection.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_failed_status_write_releases_vip() {
        let allocator = Arc::new(IpAllocator::new());
        allocator
            .ensure_pool("web/edge", &["10.0.0.1-10.0.0.2".to_string()])
            .unwrap();
        let status = Arc::new(RecordingStatus::failing());
        let rs = RouteSelector::new(selector(&[("bgp", "on")])).with_pool(
            allocator.clone(),
            "web/edge",
            status,
        );

        let services = vec![lb_service("web", "a", None)];
        let assignments = rs.assign_missing(&rs.select(&services)).await.unwrap();
        assert!(matches!(assignments[0], Assignment::WriteFailed { .. }));
        assert_eq!(allocator.stats("web/edge").unwrap().allocated, 0);
    }

    #[tokio::test]
    async fn test_unbound_selector_cannot_assign() {
        let rs = RouteSelector::new(selector(&[("bgp", "on")]));
        let services = vec![lb_service("web", "a", None)];
        assert!(rs.assign_missing(&rs.select(&services)).await.is_err());
    }
}
