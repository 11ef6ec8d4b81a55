//! Endpoint locality derived from EndpointSlices

use crate::service::ServiceId;
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointSlice};
use kube::ResourceExt;
use routebird_api::SERVICE_NAME_LABEL;
use std::collections::BTreeMap;

/// Whether a service has at least one ready endpoint on the local node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalityFact {
    pub service: ServiceId,
    pub has_local_endpoint: bool,
}

pub type LocalityFacts = BTreeMap<ServiceId, LocalityFact>;

/// Group slices by the service owning them.
///
/// Slices without the service-name label are not attributable and are ignored.
pub fn group_by_service<'a>(
    slices: impl IntoIterator<Item = &'a EndpointSlice>,
) -> BTreeMap<ServiceId, Vec<&'a EndpointSlice>> {
    let mut grouped: BTreeMap<ServiceId, Vec<&'a EndpointSlice>> = BTreeMap::new();
    for slice in slices {
        let Some(service) = slice.labels().get(SERVICE_NAME_LABEL) else {
            continue;
        };
        let namespace = slice.namespace().unwrap_or_else(|| "default".to_string());
        grouped
            .entry(ServiceId::new(namespace, service.clone()))
            .or_default()
            .push(slice);
    }
    grouped
}

/// LocalityIndex answers endpoint locality questions for one node
#[derive(Clone, Debug)]
pub struct LocalityIndex {
    node: String,
}

impl LocalityIndex {
    pub fn new(node: impl Into<String>) -> Self {
        Self { node: node.into() }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Hosted on this node and explicitly marked ready
    pub fn is_local_ready(&self, endpoint: &Endpoint) -> bool {
        endpoint.node_name.as_deref() == Some(self.node.as_str())
            && endpoint
                .conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(false)
    }

    /// One fact per service that owns at least one slice.
    ///
    /// Services without slices get no fact, which reads as no local endpoint.
    pub fn facts(&self, slices: &BTreeMap<ServiceId, Vec<&EndpointSlice>>) -> LocalityFacts {
        slices
            .iter()
            .map(|(service, slices)| {
                let has_local_endpoint = slices
                    .iter()
                    .flat_map(|slice| slice.endpoints.iter())
                    .any(|ep| self.is_local_ready(ep));
                (
                    service.clone(),
                    LocalityFact {
                        service: service.clone(),
                        has_local_endpoint,
                    },
                )
            })
            .collect()
    }
}
