use k8s_openapi::api::core::v1::Toleration;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// BGPRoute selects load-balancer services whose VIPs are advertised over BGP
/// and describes the agent that runs on every eligible node
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "bgp.routebird.dev",
    version = "v1alpha1",
    kind = "BGPRoute",
    plural = "bgproutes",
    namespaced,
    status = "BGPRouteStatus",
    printcolumn = r#"{"name":"ASN","type":"integer","jsonPath":".spec.localASN"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
)]
#[serde(rename_all = "camelCase")]
pub struct BGPRouteSpec {
    /// Services matched by label
    #[serde(default = "default_service_selector")]
    pub service_selector: LabelSelector,

    /// ASN of the node where the route is advertised
    #[serde(rename = "localASN")]
    #[schemars(range(min = 1))]
    pub local_asn: u32,

    /// Port the agent listens on for incoming BGP connections
    #[serde(default = "default_bgp_port")]
    #[schemars(range(min = 1))]
    pub bgp_local_port: i32,

    /// Peers receiving the advertisements
    #[serde(rename = "bgpPeers", default)]
    pub peers: Vec<BGPPeer>,

    /// Address ranges VIPs are allocated from, as `start-end` or CIDR
    #[serde(rename = "allocatableIPRanges", default)]
    pub allocatable_ip_ranges: Vec<String>,

    /// Agent DaemonSet settings
    #[serde(default)]
    pub agent: AgentSpec,

    /// Restricts the nodes the agent runs on
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

impl Default for BGPRouteSpec {
    fn default() -> Self {
        Self {
            service_selector: default_service_selector(),
            local_asn: 0,
            bgp_local_port: default_bgp_port(),
            peers: Vec::new(),
            allocatable_ip_ranges: Vec::new(),
            agent: AgentSpec::default(),
            node_selector: BTreeMap::new(),
            tolerations: Vec::new(),
        }
    }
}

/// Remote peer receiving BGP updates
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BGPPeer {
    /// Address of the remote peer
    #[schemars(regex(pattern = r"^([0-9a-fA-F:.]+)$"))]
    pub address: String,

    /// ASN of the remote peer
    pub asn: u32,
}

/// How the agent DaemonSet is deployed
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    /// Container image of the agent, without tag
    #[serde(default = "default_image")]
    pub image: String,

    /// Image tag
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default = "default_pull_policy")]
    pub image_pull_policy: String,

    /// Existing service account the agent runs as. When omitted, the
    /// controller creates one per route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

impl Default for AgentSpec {
    fn default() -> Self {
        Self {
            image: default_image(),
            version: default_version(),
            image_pull_policy: default_pull_policy(),
            service_account_name: None,
        }
    }
}

/// Status of a BGPRoute
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BGPRouteStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Hash of the config most recently rolled out to the agents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_config_hash: Option<String>,
}

/// Label key that no service carries, so an omitted selector matches nothing
pub const NEVER_MATCH_LABEL: &str = "__never_match__";

fn default_service_selector() -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(
            NEVER_MATCH_LABEL.to_string(),
            "true".to_string(),
        )])),
        match_expressions: None,
    }
}

fn default_bgp_port() -> i32 {
    179
}

fn default_image() -> String {
    "ghcr.io/yago-123/routebird-agent".to_string()
}

fn default_version() -> String {
    "latest".to_string()
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}
