//! Local cache of observed cluster objects

use crate::event::{ClusterEvent, ClusterSnapshot, EventKind, ObservedObject};
use crate::locality::group_by_service;
use crate::service::{object_key, ServiceId};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// ClusterState holds the latest observed Services and EndpointSlices.
///
/// It is owned by the single reconciliation task; change notifications patch
/// it incrementally and resyncs replace it wholesale.
#[derive(Debug, Default)]
pub struct ClusterState {
    // Keyed by namespace/name
    services: HashMap<String, Service>,
    slices: HashMap<String, EndpointSlice>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a single change notification
    pub fn apply(&mut self, event: ClusterEvent) {
        debug!(kind = event.object.kind(), key = %event.key, event = %event.kind, "Applying change");
        match (event.kind, event.object) {
            (EventKind::Delete, ObservedObject::Service(_)) => {
                self.services.remove(&event.key);
            }
            (EventKind::Delete, ObservedObject::EndpointSlice(_)) => {
                self.slices.remove(&event.key);
            }
            (_, ObservedObject::Service(svc)) => {
                self.services.insert(event.key, svc);
            }
            (_, ObservedObject::EndpointSlice(slice)) => {
                self.slices.insert(event.key, slice);
            }
        }
    }

    /// Replace everything with a fresh listing
    pub fn replace(&mut self, snapshot: ClusterSnapshot) {
        self.services = snapshot
            .services
            .into_iter()
            .map(|svc| (object_key(&svc), svc))
            .collect();
        self.slices = snapshot
            .endpoint_slices
            .into_iter()
            .map(|slice| (object_key(&slice), slice))
            .collect();
        debug!(
            services = self.service_count(),
            endpoint_slices = self.slice_count(),
            "Replaced cluster state"
        );
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    /// Slices grouped by the service owning them
    pub fn slices_by_service(&self) -> BTreeMap<ServiceId, Vec<&EndpointSlice>> {
        group_by_service(self.slices.values())
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }
}
