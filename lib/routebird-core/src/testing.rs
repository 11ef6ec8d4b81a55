//! Fixtures and test doubles shared by unit tests

use crate::convergence::Operation;
use crate::error::{self, CoreError};
use crate::event::ClusterSnapshot;
use crate::peering::{Peering, PeeringError};
use crate::runtime::ClusterSource;
use crate::service::ServiceId;
use crate::status::StatusWriter;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Service, ServiceSpec, ServiceStatus,
};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointSlice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use routebird_api::SERVICE_NAME_LABEL;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// LoadBalancer service labelled `bgp=on`, selecting `app=<name>`
pub fn lb_service(namespace: &str, name: &str, vip: Option<&str>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([("bgp".to_string(), "on".to_string())])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            external_traffic_policy: Some("Cluster".to_string()),
            selector: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
            ..Default::default()
        }),
        status: vip.map(|ip| ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some(ip.to_string()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        }),
    }
}

/// EndpointSlice owned by `service` with one endpoint per `(node, ready)`
pub fn slice(
    namespace: &str,
    name: &str,
    service: &str,
    endpoints: &[(&str, Option<bool>)],
) -> EndpointSlice {
    EndpointSlice {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                SERVICE_NAME_LABEL.to_string(),
                service.to_string(),
            )])),
            ..Default::default()
        },
        address_type: "IPv4".to_string(),
        endpoints: endpoints
            .iter()
            .enumerate()
            .map(|(i, (node, ready))| Endpoint {
                addresses: vec![format!("10.244.0.{}", i + 1)],
                node_name: Some(node.to_string()),
                conditions: Some(EndpointConditions {
                    ready: *ready,
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect(),
        ports: None,
    }
}

/// Peering double recording every call
#[derive(Default)]
pub struct RecordingPeering {
    calls: Mutex<Vec<(Operation, IpAddr)>>,
    session_down: AtomicBool,
    rejected: Mutex<HashSet<IpAddr>>,
    delay: Option<Duration>,
}

impl RecordingPeering {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn set_session(&self, up: bool) {
        self.session_down.store(!up, Ordering::SeqCst);
    }

    pub fn reject(&self, vip: IpAddr) {
        self.rejected.lock().unwrap().insert(vip);
    }

    pub fn accept_all(&self) {
        self.rejected.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<(Operation, IpAddr)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    async fn call(&self, op: Operation, vip: IpAddr) -> Result<(), PeeringError> {
        self.calls.lock().unwrap().push((op, vip));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.rejected.lock().unwrap().contains(&vip) {
            return Err(PeeringError::Rejected(vip, "policy".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Peering for RecordingPeering {
    async fn announce(&self, vip: IpAddr) -> Result<(), PeeringError> {
        self.call(Operation::Announce, vip).await
    }

    async fn withdraw(&self, vip: IpAddr) -> Result<(), PeeringError> {
        self.call(Operation::Withdraw, vip).await
    }

    fn has_established_session(&self) -> bool {
        !self.session_down.load(Ordering::SeqCst)
    }
}

/// StatusWriter double
#[derive(Default)]
pub struct RecordingStatus {
    vips: Mutex<Vec<(ServiceId, IpAddr)>>,
    exhausted: Mutex<Vec<ServiceId>>,
    fail: bool,
}

impl RecordingStatus {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn vips(&self) -> Vec<(ServiceId, IpAddr)> {
        self.vips.lock().unwrap().clone()
    }

    pub fn exhausted(&self) -> Vec<ServiceId> {
        self.exhausted.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusWriter for RecordingStatus {
    async fn record_vip(&self, service: &ServiceId, vip: IpAddr) -> error::Result<()> {
        if self.fail {
            return Err(CoreError::StatusWrite {
                service: service.clone(),
                message: "conflict".to_string(),
            });
        }
        self.vips.lock().unwrap().push((service.clone(), vip));
        Ok(())
    }

    async fn record_exhausted(&self, service: &ServiceId, _pool: &str) -> error::Result<()> {
        self.exhausted.lock().unwrap().push(service.clone());
        Ok(())
    }

    async fn clear_vip(&self, _service: &ServiceId) -> error::Result<()> {
        Ok(())
    }
}

/// ClusterSource double serving a fixed snapshot
#[derive(Default)]
pub struct StaticSource {
    snapshot: Mutex<ClusterSnapshot>,
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl StaticSource {
    pub fn new(snapshot: ClusterSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            ..Default::default()
        }
    }

    pub fn set(&self, snapshot: ClusterSnapshot) {
        *self.snapshot.lock().unwrap() = snapshot;
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterSource for StaticSource {
    async fn snapshot(&self) -> error::Result<ClusterSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoreError::Observation("apiserver unavailable".to_string()));
        }
        Ok(self.snapshot.lock().unwrap().clone())
    }
}
