//! Agent configuration document

use crate::v1alpha1::{BGPPeer, BGPRoute};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration consumed by the per-node agent.
///
/// The controller renders one of these per BGPRoute into the agent ConfigMap;
/// the agent reads it back from the mounted volume at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub service_selector: LabelSelector,
    #[serde(rename = "localASN")]
    pub local_asn: u32,
    pub bgp_local_port: i32,
    #[serde(default)]
    pub peers: Vec<BGPPeer>,
}

impl AgentConfig {
    /// Derive the agent config from a BGPRoute
    pub fn from_route(route: &BGPRoute) -> Self {
        Self {
            service_selector: route.spec.service_selector.clone(),
            local_asn: route.spec.local_asn,
            bgp_local_port: route.spec.bgp_local_port,
            peers: route.spec.peers.clone(),
        }
    }

    /// Render the document as it is stored in the ConfigMap
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }

    /// Load the document from a file on disk
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data).map_err(std::io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v1alpha1::BGPRouteSpec;
    use std::collections::BTreeMap;

    fn route() -> BGPRoute {
        let mut route = BGPRoute::new(
            "edge",
            BGPRouteSpec {
                local_asn: 65010,
                peers: vec![BGPPeer {
                    address: "10.1.0.1".to_string(),
                    asn: 65000,
                }],
                ..Default::default()
            },
        );
        route.spec.service_selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("bgp".to_string(), "on".to_string())])),
            match_expressions: None,
        };
        route
    }

    #[test]
    fn test_from_route() {
        let config = AgentConfig::from_route(&route());
        assert_eq!(config.local_asn, 65010);
        assert_eq!(config.bgp_local_port, 179);
        assert_eq!(config.peers.len(), 1);
    }

    #[test]
    fn test_json_is_stable() {
        let config = AgentConfig::from_route(&route());
        let first = config.to_json().unwrap();
        let second = AgentConfig::from_route(&route()).to_json().unwrap();
        assert_eq!(first, second);
        assert!(first.contains("\"localASN\": 65010"));
        assert_eq!(AgentConfig::from_json(&first).unwrap(), config);
    }
}
