//! BGPRoute controller deploying the agent for every route

use crate::builders;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::{controller::Action, watcher, Controller};
use routebird_api::{BGPRoute, BGPRouteStatus};
use routebird_k8s::{condition, FIELD_MANAGER};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Failed to render agent resources: {0}")]
    Render(#[from] serde_json::Error),

    #[error("BGPRoute {0} has no namespace")]
    MissingNamespace(String),
}

struct Context {
    client: Client,
    agent_image: String,
}

pub struct BGPRouteController {
    client: Client,
    agent_image: String,
}

impl BGPRouteController {
    pub fn new(client: Client, agent_image: String) -> Self {
        Self {
            client,
            agent_image,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!("Starting BGPRoute reconciliation");

        let routes: Api<BGPRoute> = Api::all(self.client.clone());
        let ctx = Arc::new(Context {
            client: self.client.clone(),
            agent_image: self.agent_image.clone(),
        });

        Controller::new(routes, watcher::Config::default())
            .owns(Api::<DaemonSet>::all(self.client.clone()), watcher::Config::default())
            .owns(Api::<ConfigMap>::all(self.client.clone()), watcher::Config::default())
            .run(reconcile, error_policy, ctx)
            .for_each(|item| async move {
                match item {
                    Ok((route, _)) => debug!("Reconciled BGPRoute {}", route),
                    Err(e) => error!("Error in reconciliation stream: {}", e),
                }
            })
            .await;

        Ok(())
    }
}

async fn reconcile(route: Arc<BGPRoute>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let name = route.name_any();
    let namespace = route
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(name.clone()))?;
    info!("Reconciling BGPRoute: {}/{}", namespace, name);

    let config_map = builders::build_config_map(&route)?;
    let config_hash = builders::config_map_hash(&config_map.data.clone().unwrap_or_default());
    apply(&Api::namespaced(ctx.client.clone(), &namespace), &config_map).await?;

    if let Some(account) = builders::build_service_account(&route) {
        apply(
            &Api::<ServiceAccount>::namespaced(ctx.client.clone(), &namespace),
            &account,
        )
        .await?;
    }

    // The binding lists the service account of every route
    let all_routes = Api::<BGPRoute>::all(ctx.client.clone())
        .list(&ListParams::default())
        .await?;
    apply(
        &Api::<ClusterRole>::all(ctx.client.clone()),
        &builders::build_cluster_role(),
    )
    .await?;
    apply(
        &Api::<ClusterRoleBinding>::all(ctx.client.clone()),
        &builders::build_cluster_role_binding(&all_routes.items),
    )
    .await?;

    let daemon_set = builders::build_daemon_set(&route, &ctx.agent_image, &config_hash);
    apply(&Api::namespaced(ctx.client.clone(), &namespace), &daemon_set).await?;

    // Status writes trigger another reconcile, only write on change
    if !status_current(&route, &config_hash) {
        let status = BGPRouteStatus {
            conditions: vec![condition("Ready", true, "Reconciled", "Agent resources applied")],
            observed_config_hash: Some(config_hash),
        };
        Api::<BGPRoute>::namespaced(ctx.client.clone(), &namespace)
            .patch_status(
                &name,
                &PatchParams::default(),
                &Patch::Merge(&serde_json::json!({ "status": status })),
            )
            .await?;
    }

    info!("BGPRoute {}/{} reconciled", namespace, name);
    Ok(Action::requeue(Duration::from_secs(300)))
}

fn status_current(route: &BGPRoute, config_hash: &str) -> bool {
    let Some(status) = &route.status else {
        return false;
    };
    status.observed_config_hash.as_deref() == Some(config_hash)
        && status
            .conditions
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True")
}

fn error_policy(route: Arc<BGPRoute>, e: &ReconcileError, _ctx: Arc<Context>) -> Action {
    error!("Error reconciling BGPRoute {}: {}", route.name_any(), e);
    Action::requeue(Duration::from_secs(60))
}

/// Server-side apply, creating or updating the object in one step
async fn apply<K>(api: &Api<K>, obj: &K) -> Result<K, kube::Error>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
    K::DynamicType: Default,
{
    let name = obj.name_any();
    let applied = api
        .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(obj))
        .await?;
    debug!("Applied {} {}", K::kind(&Default::default()), name);
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use routebird_api::BGPRouteSpec;

    #[test]
    fn test_status_current() {
        let mut route = BGPRoute::new("edge", BGPRouteSpec::default());
        assert!(!status_current(&route, "abc"));

        route.status = Some(BGPRouteStatus {
            conditions: vec![condition("Ready", true, "Reconciled", "")],
            observed_config_hash: Some("abc".to_string()),
        });
        assert!(status_current(&route, "abc"));
        assert!(!status_current(&route, "def"));

        route.status.as_mut().unwrap().conditions = vec![condition("Ready", false, "Failed", "")];
        assert!(!status_current(&route, "abc"));
    }
}
