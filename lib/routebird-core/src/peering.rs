//! Peering capability consumed by the convergence loop

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeeringError {
    #[error("no established peering session")]
    NoEstablishedSession,

    #[error("route {0} rejected: {1}")]
    Rejected(IpAddr, String),

    #[error("peering operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("peering I/O error: {0}")]
    Io(String),
}

/// Announce and withdraw routes towards the upstream routers.
///
/// Implementations must make both operations idempotent: announcing an
/// announced route or withdrawing an absent one succeeds without effect.
#[async_trait]
pub trait Peering: Send + Sync {
    async fn announce(&self, vip: IpAddr) -> Result<(), PeeringError>;

    async fn withdraw(&self, vip: IpAddr) -> Result<(), PeeringError>;

    fn has_established_session(&self) -> bool;
}
