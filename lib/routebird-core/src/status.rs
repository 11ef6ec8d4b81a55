//! Service status persistence

use crate::error::Result;
use crate::service::ServiceId;
use async_trait::async_trait;
use std::net::IpAddr;

/// Writes allocation outcomes into the externally visible service status
#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Persist the VIP as the service's load-balancer ingress IP
    async fn record_vip(&self, service: &ServiceId, vip: IpAddr) -> Result<()>;

    /// Surface pool exhaustion as a condition on the service
    async fn record_exhausted(&self, service: &ServiceId, pool: &str) -> Result<()>;

    /// Remove the ingress IP of a service that is no longer routed
    async fn clear_vip(&self, service: &ServiceId) -> Result<()>;
}
