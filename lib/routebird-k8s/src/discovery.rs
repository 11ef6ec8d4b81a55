//! Listing of the resources route convergence observes

use crate::error::K8sError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::ListParams;
use kube::{Api, Client};
use routebird_api::BGPRoute;
use routebird_core::{ClusterSnapshot, ClusterSource};
use tracing::debug;

/// ClusterDiscovery lists Services, EndpointSlices and BGPRoutes
#[derive(Clone)]
pub struct ClusterDiscovery {
    client: Client,
}

impl ClusterDiscovery {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Discover all Services in the cluster
    pub async fn list_services(&self) -> Result<Vec<Service>, K8sError> {
        let services: Api<Service> = Api::all(self.client.clone());
        let list = services.list(&ListParams::default()).await?;

        debug!("Discovered {} services", list.items.len());
        Ok(list.items)
    }

    /// Discover all EndpointSlices in the cluster
    pub async fn list_endpoint_slices(&self) -> Result<Vec<EndpointSlice>, K8sError> {
        let slices: Api<EndpointSlice> = Api::all(self.client.clone());
        let list = slices.list(&ListParams::default()).await?;

        debug!("Discovered {} endpoint slices", list.items.len());
        Ok(list.items)
    }

    /// Discover all BGPRoutes in the cluster
    pub async fn list_routes(&self) -> Result<Vec<BGPRoute>, K8sError> {
        let routes: Api<BGPRoute> = Api::all(self.client.clone());
        let list = routes.list(&ListParams::default()).await?;

        debug!("Discovered {} BGP routes", list.items.len());
        Ok(list.items)
    }
}

#[async_trait]
impl ClusterSource for ClusterDiscovery {
    async fn snapshot(&self) -> routebird_core::Result<ClusterSnapshot> {
        let (services, endpoint_slices) =
            futures::try_join!(self.list_services(), self.list_endpoint_slices())?;
        Ok(ClusterSnapshot {
            services,
            endpoint_slices,
        })
    }
}
