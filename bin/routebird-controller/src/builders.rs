//! Desired state of the per-route agent resources

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource,
    ObjectFieldSelector, PodSpec, PodTemplateSpec, ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use routebird_api::{
    AgentConfig, BGPRoute, AGENT_APP_LABEL, CONFIG_FILENAME, CONFIG_HASH_ANNOTATION,
    CONFIG_MOUNT_PATH,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

pub const AGENT_CLUSTER_ROLE: &str = "routebird-agent";
pub const AGENT_CLUSTER_ROLE_BINDING: &str = "routebird-agent-binding";
const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
const CONFIG_VOLUME: &str = "config";

pub fn config_map_name(route: &BGPRoute) -> String {
    format!("{}-config", route.name_any())
}

pub fn daemon_set_name(route: &BGPRoute) -> String {
    format!("{}-{}", AGENT_APP_LABEL, route.name_any())
}

/// Account the agent pods run as, either user-provided or owned by the route
pub fn service_account_name(route: &BGPRoute) -> String {
    route
        .spec
        .agent
        .service_account_name
        .clone()
        .unwrap_or_else(|| daemon_set_name(route))
}

fn agent_labels(route: &BGPRoute) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), AGENT_APP_LABEL.to_string()),
        ("route".to_string(), route.name_any()),
    ])
}

fn owned_meta(route: &BGPRoute, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: route.namespace(),
        labels: Some(agent_labels(route)),
        owner_references: owner_reference(route).map(|r| vec![r]),
        ..Default::default()
    }
}

fn owner_reference(route: &BGPRoute) -> Option<OwnerReference> {
    route.controller_owner_ref(&())
}

/// SHA-256 over the data in key order, each key followed by its value
pub fn config_map_hash(data: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(key.as_bytes());
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub fn build_config_map(route: &BGPRoute) -> serde_json::Result<ConfigMap> {
    let config = AgentConfig::from_route(route).to_json()?;
    Ok(ConfigMap {
        metadata: owned_meta(route, config_map_name(route)),
        data: Some(BTreeMap::from([(CONFIG_FILENAME.to_string(), config)])),
        ..Default::default()
    })
}

/// The route's own service account, `None` when the route names an existing one
pub fn build_service_account(route: &BGPRoute) -> Option<ServiceAccount> {
    if route.spec.agent.service_account_name.is_some() {
        return None;
    }
    Some(ServiceAccount {
        metadata: owned_meta(route, service_account_name(route)),
        ..Default::default()
    })
}

pub fn build_cluster_role() -> ClusterRole {
    let read = vec!["get".to_string(), "list".to_string(), "watch".to_string()];
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(AGENT_CLUSTER_ROLE.to_string()),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["endpoints".to_string(), "services".to_string()]),
                verbs: read.clone(),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["discovery.k8s.io".to_string()]),
                resources: Some(vec!["endpointslices".to_string()]),
                verbs: read,
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

/// One binding shared by the agent service accounts of every route
pub fn build_cluster_role_binding(routes: &[BGPRoute]) -> ClusterRoleBinding {
    let accounts: BTreeSet<(String, String)> = routes
        .iter()
        .filter_map(|route| {
            let namespace = route.namespace()?;
            Some((namespace, service_account_name(route)))
        })
        .collect();

    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(AGENT_CLUSTER_ROLE_BINDING.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: AGENT_CLUSTER_ROLE.to_string(),
        },
        subjects: Some(
            accounts
                .into_iter()
                .map(|(namespace, name)| Subject {
                    kind: "ServiceAccount".to_string(),
                    name,
                    namespace: Some(namespace),
                    ..Default::default()
                })
                .collect(),
        ),
    }
}

pub fn build_daemon_set(route: &BGPRoute, default_image: &str, config_hash: &str) -> DaemonSet {
    let agent = &route.spec.agent;
    let labels = agent_labels(route);
    let repository = if agent.image.is_empty() {
        default_image
    } else {
        agent.image.as_str()
    };

    let mut metadata = owned_meta(route, daemon_set_name(route));
    metadata.annotations = Some(BTreeMap::from([(
        CONFIG_HASH_ANNOTATION.to_string(),
        config_hash.to_string(),
    )]));

    let config_volume = Volume {
        name: CONFIG_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map_name(route),
            ..Default::default()
        }),
        ..Default::default()
    };

    let container = Container {
        name: AGENT_APP_LABEL.to_string(),
        image: Some(format!("{}:{}", repository, agent.version)),
        image_pull_policy: Some(agent.image_pull_policy.clone()),
        args: Some(vec![
            "--config".to_string(),
            format!("{CONFIG_MOUNT_PATH}/{CONFIG_FILENAME}"),
        ]),
        env: Some(vec![EnvVar {
            name: "NODE_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "spec.nodeName".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ports: Some(vec![ContainerPort {
            name: Some("bgp".to_string()),
            container_port: route.spec.bgp_local_port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        host_network: Some(true),
        dns_policy: Some("ClusterFirstWithHostNet".to_string()),
        service_account_name: Some(service_account_name(route)),
        containers: vec![container],
        volumes: Some(vec![config_volume]),
        node_selector: (!route.spec.node_selector.is_empty())
            .then(|| route.spec.node_selector.clone()),
        tolerations: (!route.spec.tolerations.is_empty()).then(|| route.spec.tolerations.clone()),
        ..Default::default()
    };

    DaemonSet {
        metadata,
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routebird_api::{BGPPeer, BGPRouteSpec};

    fn route(namespace: &str, name: &str) -> BGPRoute {
        let mut route = BGPRoute::new(
            name,
            BGPRouteSpec {
                local_asn: 65010,
                peers: vec![BGPPeer {
                    address: "10.1.0.1".to_string(),
                    asn: 65000,
                }],
                node_selector: BTreeMap::from([("edge".to_string(), "true".to_string())]),
                ..Default::default()
            },
        );
        route.metadata.namespace = Some(namespace.to_string());
        route.metadata.uid = Some("0b6f3a52-1b7e-4c1c-9f0e-4b5c2b1a9d11".to_string());
        route
    }

    #[test]
    fn test_hash_is_order_independent_and_content_sensitive() {
        let a = BTreeMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);
        let mut b = BTreeMap::new();
        b.insert("a".to_string(), "1".to_string());
        b.insert("b".to_string(), "2".to_string());
        assert_eq!(config_map_hash(&a), config_map_hash(&b));
        assert_eq!(config_map_hash(&a).len(), 64);

        b.insert("b".to_string(), "3".to_string());
        assert_ne!(config_map_hash(&a), config_map_hash(&b));
    }

    #[test]
    fn test_hash_of_empty_data() {
        assert_eq!(
            config_map_hash(&BTreeMap::new()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_config_map() {
        let route = route("net", "edge");
        let cm = build_config_map(&route).unwrap();

        assert_eq!(cm.metadata.name.as_deref(), Some("edge-config"));
        assert_eq!(cm.metadata.namespace.as_deref(), Some("net"));
        let owner = &cm.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "BGPRoute");
        assert_eq!(owner.controller, Some(true));

        let data = cm.data.unwrap();
        let config = AgentConfig::from_json(&data[CONFIG_FILENAME]).unwrap();
        assert_eq!(config, AgentConfig::from_route(&route));
    }

    #[test]
    fn test_daemon_set() {
        let route = route("net", "edge");
        let ds = build_daemon_set(&route, "registry.local/agent", "abc123");

        assert_eq!(ds.metadata.name.as_deref(), Some("routebird-agent-edge"));
        assert_eq!(
            ds.metadata.annotations.as_ref().unwrap()[CONFIG_HASH_ANNOTATION],
            "abc123"
        );

        let pod = ds.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.host_network, Some(true));
        assert_eq!(pod.node_selector.unwrap()["edge"], "true");
        assert!(pod.tolerations.is_none());

        let container = &pod.containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("ghcr.io/yago-123/routebird-agent:latest")
        );
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec!["--config".to_string(), "/etc/routebird/config.json".to_string()]
        );
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 179);
        let env = &container.env.as_ref().unwrap()[0];
        assert_eq!(env.name, "NODE_NAME");

        assert_eq!(pod.service_account_name.as_deref(), Some("routebird-agent-edge"));
        let volume = &pod.volumes.unwrap()[0];
        assert_eq!(volume.config_map.as_ref().unwrap().name, "edge-config");
    }

    #[test]
    fn test_empty_image_falls_back_to_default() {
        let mut route = route("net", "edge");
        route.spec.agent.image = String::new();
        let ds = build_daemon_set(&route, "registry.local/agent", "abc123");
        let pod = ds.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("registry.local/agent:latest"));
    }

    #[test]
    fn test_binding_covers_every_route() {
        let mut other = route("edge-b", "b");
        other.spec.agent.service_account_name = Some("custom".to_string());
        let routes = vec![route("net", "edge"), route("net", "edge-2"), other];

        let binding = build_cluster_role_binding(&routes);
        let subjects: Vec<_> = binding
            .subjects
            .unwrap()
            .into_iter()
            .map(|s| (s.namespace.unwrap(), s.name))
            .collect();
        assert_eq!(
            subjects,
            vec![
                ("edge-b".to_string(), "custom".to_string()),
                ("net".to_string(), "routebird-agent-edge".to_string()),
                ("net".to_string(), "routebird-agent-edge-2".to_string()),
            ]
        );
        assert_eq!(binding.role_ref.name, AGENT_CLUSTER_ROLE);
    }

    #[test]
    fn test_routes_in_one_namespace_own_separate_accounts() {
        let mut first = route("net", "edge");
        first.metadata.uid = Some("uid-edge".to_string());
        let mut second = route("net", "edge-2");
        second.metadata.uid = Some("uid-edge-2".to_string());

        let a = build_service_account(&first).unwrap();
        let b = build_service_account(&second).unwrap();
        assert_ne!(a.metadata.name, b.metadata.name);
        assert_eq!(a.metadata.owner_references.unwrap()[0].uid, "uid-edge");
        assert_eq!(b.metadata.owner_references.unwrap()[0].uid, "uid-edge-2");

        let pod = build_daemon_set(&second, "registry.local/agent", "abc123")
            .spec
            .unwrap()
            .template
            .spec
            .unwrap();
        assert_eq!(pod.service_account_name, b.metadata.name);
    }

    #[test]
    fn test_named_account_is_not_owned() {
        let mut route = route("net", "edge");
        route.spec.agent.service_account_name = Some("shared".to_string());

        assert!(build_service_account(&route).is_none());
        let pod = build_daemon_set(&route, "registry.local/agent", "abc123")
            .spec
            .unwrap()
            .template
            .spec
            .unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("shared"));
    }
}
