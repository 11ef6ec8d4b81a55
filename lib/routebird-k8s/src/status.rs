//! Service status writes

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use routebird_core::{CoreError, ServiceId, StatusWriter};
use serde_json::json;
use std::net::IpAddr;
use tracing::debug;

pub const VIP_ALLOCATED: &str = "VIPAllocated";

/// Build a status condition stamped with the current time
pub fn condition(type_: &str, status: bool, reason: &str, message: impl Into<String>) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.into(),
        last_transition_time: Time(Utc::now()),
        observed_generation: None,
    }
}

/// Writes assigned VIPs back to the Service status subresource
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch(&self, service: &ServiceId, status: serde_json::Value) -> routebird_core::Result<()> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &service.namespace);
        services
            .patch_status(&service.name, &PatchParams::default(), &status_patch(status))
            .await
            .map_err(|e| CoreError::StatusWrite {
                service: service.clone(),
                message: e.to_string(),
            })?;
        debug!(service = %service, "Patched service status");
        Ok(())
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn record_vip(&self, service: &ServiceId, vip: IpAddr) -> routebird_core::Result<()> {
        let allocated = condition(VIP_ALLOCATED, true, "Allocated", format!("Assigned {vip}"));
        self.patch(service, vip_status(vip, allocated)).await
    }

    async fn record_exhausted(&self, service: &ServiceId, pool: &str) -> routebird_core::Result<()> {
        let exhausted = condition(
            VIP_ALLOCATED,
            false,
            "PoolExhausted",
            format!("Address pool {pool} has no free addresses"),
        );
        self.patch(service, json!({ "conditions": [exhausted] })).await
    }

    async fn clear_vip(&self, service: &ServiceId) -> routebird_core::Result<()> {
        let released = condition(
            VIP_ALLOCATED,
            false,
            "NotRouted",
            "Service is no longer selected for BGP routing",
        );
        self.patch(service, cleared_status(released)).await
    }
}

/// Service conditions are keyed by type, so a strategic merge only touches
/// the conditions carried in the patch
fn status_patch(status: serde_json::Value) -> Patch<serde_json::Value> {
    Patch::Strategic(json!({ "status": status }))
}

fn vip_status(vip: IpAddr, allocated: Condition) -> serde_json::Value {
    json!({
        "loadBalancer": { "ingress": [{ "ip": vip.to_string() }] },
        "conditions": [allocated],
    })
}

fn cleared_status(released: Condition) -> serde_json::Value {
    json!({
        "loadBalancer": { "ingress": [] },
        "conditions": [released],
    })
}
