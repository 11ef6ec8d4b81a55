//! Routebird API types and CRDs for Kubernetes integration
//!
//! This library defines:
//! - BGPRoute: which services get their VIPs advertised, to which peers,
//!   and how the per-node agent is deployed
//! - AgentConfig: the document handed to every agent through a ConfigMap

pub mod config;
pub mod v1alpha1;

pub use config::AgentConfig;
pub use v1alpha1::{BGPPeer, BGPRoute, BGPRouteSpec, BGPRouteStatus};

/// Label set by the EndpointSlice controller naming the owning Service
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Annotation carrying the hash of the agent ConfigMap data
pub const CONFIG_HASH_ANNOTATION: &str = "configMapHash";

/// Value of the `app` label on every generated agent resource
pub const AGENT_APP_LABEL: &str = "routebird-agent";

/// Directory the agent ConfigMap is mounted into
pub const CONFIG_MOUNT_PATH: &str = "/etc/routebird";

/// Key of the agent config document inside the ConfigMap
pub const CONFIG_FILENAME: &str = "config.json";
