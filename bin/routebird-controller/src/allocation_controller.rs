//! VIP allocation for load-balancer services selected by a BGPRoute

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client, ResourceExt};
use kube_runtime::{controller::Action, reflector::ObjectRef, watcher, Controller};
use routebird_api::BGPRoute;
use routebird_core::{
    service, AllocError, Assignment, CoreError, IpAllocator, RouteSelector, ServiceId,
    StatusWriter,
};
use routebird_k8s::{ClusterDiscovery, K8sError, KubeStatusWriter};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error(transparent)]
    K8s(#[from] K8sError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result of one allocation pass
#[derive(Debug, Default)]
pub struct PassOutcome {
    pub assignments: Vec<Assignment>,
    pub released: usize,
    pub conflicts: usize,
}

impl PassOutcome {
    pub fn exhausted(&self) -> bool {
        self.assignments
            .iter()
            .any(|a| matches!(a, Assignment::Exhausted { .. }))
    }
}

struct Context {
    discovery: ClusterDiscovery,
    allocator: Arc<IpAllocator>,
    status: Arc<dyn StatusWriter>,
    // Passes rebuild allocator state from a full listing and must not interleave
    pass: Mutex<()>,
}

pub struct AllocationController {
    client: Client,
}

impl AllocationController {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!("Starting VIP allocation reconciliation");

        let services: Api<Service> = Api::all(self.client.clone());
        let ctx = Arc::new(Context {
            discovery: ClusterDiscovery::new(self.client.clone()),
            allocator: Arc::new(IpAllocator::new()),
            status: Arc::new(KubeStatusWriter::new(self.client.clone())),
            pass: Mutex::new(()),
        });

        let controller = Controller::new(services, watcher::Config::default());
        let store = controller.store();
        controller
            // Route edits change pools and selections; any load-balancer
            // service is enough to start a full pass
            .watches(
                Api::<BGPRoute>::all(self.client.clone()),
                watcher::Config::default(),
                move |_route| {
                    store
                        .state()
                        .into_iter()
                        .find(|svc| service::is_load_balancer(svc))
                        .map(|svc| ObjectRef::from_obj(&*svc))
                },
            )
            .run(reconcile, error_policy, ctx)
            .for_each(|item| async move {
                match item {
                    Ok((svc, _)) => debug!("Reconciled Service {}", svc),
                    Err(e) => error!("Error in reconciliation stream: {}", e),
                }
            })
            .await;

        Ok(())
    }
}

async fn reconcile(svc: Arc<Service>, ctx: Arc<Context>) -> Result<Action, AllocationError> {
    if !service::is_load_balancer(&svc) {
        return Ok(Action::await_change());
    }
    debug!("Allocation pass triggered by Service {}", ServiceId::of(&svc));

    let _pass = ctx.pass.lock().await;
    let routes = ctx.discovery.list_routes().await?;
    let services = ctx.discovery.list_services().await?;

    let outcome = allocation_pass(&routes, &services, &ctx.allocator, &ctx.status).await?;
    if outcome.exhausted() {
        // A later service change may free an address
        return Ok(Action::await_change());
    }
    Ok(Action::requeue(Duration::from_secs(300)))
}

fn error_policy(svc: Arc<Service>, e: &AllocationError, _ctx: Arc<Context>) -> Action {
    error!("Error allocating VIP for Service {}: {}", ServiceId::of(&svc), e);
    Action::requeue(Duration::from_secs(60))
}

/// Pool of a BGPRoute, named after the route
pub fn pool_id(route: &BGPRoute) -> String {
    format!(
        "{}/{}",
        route.namespace().unwrap_or_else(|| "default".to_string()),
        route.name_any()
    )
}

/// Reconcile allocator state against the cluster and assign missing VIPs.
///
/// Observed VIPs are recorded before any new address is handed out. A
/// service selected by several routes belongs to the first route in
/// `namespace/name` order. An address held by a service that is no longer
/// routed returns to its pool only once the service status no longer
/// shows it.
pub async fn allocation_pass(
    routes: &[BGPRoute],
    services: &[Service],
    allocator: &Arc<IpAllocator>,
    status: &Arc<dyn StatusWriter>,
) -> Result<PassOutcome, CoreError> {
    let mut routes: Vec<&BGPRoute> = routes.iter().collect();
    routes.sort_by_key(|route| pool_id(route));

    let mut outcome = PassOutcome::default();
    let mut claimed: HashSet<ServiceId> = HashSet::new();
    let mut pending = Vec::with_capacity(routes.len());

    for route in routes {
        let pool = pool_id(route);
        let usable = match allocator.ensure_pool(&pool, &route.spec.allocatable_ip_ranges) {
            Ok(()) => true,
            Err(e) => {
                warn!(pool = %pool, error = %e, "BGPRoute has an unusable address pool, not assigning VIPs");
                false
            }
        };

        let selector = RouteSelector::new(route.spec.service_selector.clone()).with_pool(
            allocator.clone(),
            pool.clone(),
            status.clone(),
        );
        // Services of an unusable route stay claimed so their VIPs survive
        let mut selection = selector.select(services);
        selection.candidates.retain(|c| claimed.insert(c.service.clone()));
        selection.unassigned.retain(|s| claimed.insert(s.clone()));
        if usable {
            pending.push((pool, selector, selection));
        }
    }

    let mut observed: Vec<(ServiceId, IpAddr)> = services
        .iter()
        .filter(|svc| service::is_load_balancer(svc))
        .filter_map(|svc| Some((ServiceId::of(svc), service::assigned_vip(svc)?)))
        .collect();
    observed.sort();

    let mut holders: HashSet<ServiceId> = HashSet::new();
    for (id, vip) in observed {
        if !claimed.contains(&id) {
            if allocator.pool_of(vip).is_none() {
                continue;
            }
            match status.clear_vip(&id).await {
                Ok(()) => {
                    allocator.release(vip)?;
                    info!(service = %id, vip = %vip, "Released VIP of service no longer routed");
                    outcome.released += 1;
                    continue;
                }
                Err(e) => {
                    warn!(service = %id, vip = %vip, error = %e, "Failed to clear VIP of service no longer routed, keeping it reserved");
                }
            }
        }

        match allocator.mark_used(vip, &id) {
            Ok(_) => {
                holders.insert(id);
            }
            Err(e @ AllocError::AddressConflict { .. }) => {
                warn!(service = %id, vip = %vip, error = %e, "Observed VIP conflicts with allocator state");
                outcome.conflicts += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    holders.extend(claimed);
    for (address, owner) in allocator.retain_services(&holders)? {
        info!(service = %owner, vip = %address, "Released VIP of deleted service");
        outcome.released += 1;
    }

    for (pool, selector, selection) in pending {
        outcome
            .assignments
            .extend(selector.assign_missing(&selection).await?);
        if let Some(stats) = allocator.stats(&pool) {
            debug!(pool = %pool, total = stats.total, allocated = stats.allocated, free = stats.free(), "Address pool usage");
        }
    }

    Ok(outcome)
}
