//! Kubernetes adapters for the route convergence core
pub mod discovery;
pub mod error;
pub mod status;
pub mod watch;

pub use discovery::ClusterDiscovery;
pub use error::K8sError;
pub use status::{condition, KubeStatusWriter};

/// Field manager used for status patches and server-side apply
pub const FIELD_MANAGER: &str = "routebird";
