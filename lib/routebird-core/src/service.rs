//! Service identity and accessors over the Kubernetes Service object

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

pub const LOAD_BALANCER: &str = "LoadBalancer";
pub const TRAFFIC_POLICY_LOCAL: &str = "Local";

/// Namespace and name of a Service
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId {
    pub namespace: String,
    pub name: String,
}

impl ServiceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of(svc: &Service) -> Self {
        Self {
            namespace: svc.namespace().unwrap_or_else(|| "default".to_string()),
            name: svc.name_any(),
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// `namespace/name` key of any namespaced object
pub fn object_key<K: ResourceExt>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.namespace().unwrap_or_else(|| "default".to_string()),
        obj.name_any()
    )
}

pub fn is_load_balancer(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        .is_some_and(|t| t == LOAD_BALANCER)
}

/// Whether external traffic is restricted to node-local endpoints
pub fn has_local_traffic_policy(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.external_traffic_policy.as_deref())
        .is_some_and(|p| p == TRAFFIC_POLICY_LOCAL)
}

/// Endpoint selector of the service, if any
pub fn endpoint_selector(svc: &Service) -> Option<&BTreeMap<String, String>> {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.selector.as_ref())
        .filter(|selector| !selector.is_empty())
}

/// First parseable ingress IP recorded in the service status
pub fn assigned_vip(svc: &Service) -> Option<IpAddr> {
    svc.status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .filter_map(|ingress| ingress.ip.as_deref())
        .find_map(|ip| ip.parse().ok())
}
