/// API version v1alpha1 for Routebird CRDs

pub mod bgp_route;

pub use bgp_route::{AgentSpec, BGPPeer, BGPRoute, BGPRouteSpec, BGPRouteStatus};

/// API group for Routebird resources
pub const API_GROUP: &str = "bgp.routebird.dev";
/// API version for Routebird resources
pub const API_VERSION: &str = "v1alpha1";
