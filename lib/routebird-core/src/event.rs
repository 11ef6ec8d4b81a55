//! Cluster observations

use crate::service::object_key;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Add => "add",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Object carried by a change notification
#[derive(Clone, Debug)]
pub enum ObservedObject {
    Service(Service),
    EndpointSlice(EndpointSlice),
}

impl ObservedObject {
    pub fn kind(&self) -> &'static str {
        match self {
            ObservedObject::Service(_) => "Service",
            ObservedObject::EndpointSlice(_) => "EndpointSlice",
        }
    }
}

/// A change notification keyed by `namespace/name`
#[derive(Clone, Debug)]
pub struct ClusterEvent {
    pub kind: EventKind,
    pub key: String,
    pub object: ObservedObject,
}

impl ClusterEvent {
    pub fn service(kind: EventKind, svc: Service) -> Self {
        Self {
            kind,
            key: object_key(&svc),
            object: ObservedObject::Service(svc),
        }
    }

    pub fn endpoint_slice(kind: EventKind, slice: EndpointSlice) -> Self {
        Self {
            kind,
            key: object_key(&slice),
            object: ObservedObject::EndpointSlice(slice),
        }
    }
}

/// Full listing of the observed resources
#[derive(Clone, Debug, Default)]
pub struct ClusterSnapshot {
    pub services: Vec<Service>,
    pub endpoint_slices: Vec<EndpointSlice>,
}
