//! Peering manager backing route announcements

use crate::error::BgpError;
use crate::session::{PeerSession, SessionConfig, SessionState};
use crate::BGP_PORT;
use async_trait::async_trait;
use routebird_api::AgentConfig;
use routebird_core::{Peering, PeeringError};
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct PeerHandle {
    peer: SocketAddr,
    asn: u32,
    state: watch::Receiver<SessionState>,
}

/// BgpPeeringManager owns one session per configured peer and the set of
/// routes advertised over them
pub struct BgpPeeringManager {
    local_asn: u32,
    peers: Vec<PeerHandle>,
    rib: RwLock<BTreeSet<IpAddr>>,
}

impl BgpPeeringManager {
    /// Spawn a session task per peer in the agent config
    pub fn start(
        config: &AgentConfig,
        session: SessionConfig,
        cancel: CancellationToken,
    ) -> Result<Self, BgpError> {
        let mut peers = Vec::with_capacity(config.peers.len());
        for peer in &config.peers {
            let ip: IpAddr = peer
                .address
                .parse()
                .map_err(|_| BgpError::InvalidPeer(peer.address.clone()))?;
            let addr = SocketAddr::new(ip, BGP_PORT);

            let (task, state) = PeerSession::new(addr, session.clone());
            tokio::spawn(task.run(cancel.child_token()));
            peers.push(PeerHandle {
                peer: addr,
                asn: peer.asn,
                state,
            });
        }

        info!(
            local_asn = config.local_asn,
            peers = peers.len(),
            "Started BGP peering manager"
        );
        Ok(Self::with_peers(config.local_asn, peers))
    }

    fn with_peers(local_asn: u32, peers: Vec<PeerHandle>) -> Self {
        Self {
            local_asn,
            peers,
            rib: RwLock::new(BTreeSet::new()),
        }
    }

    /// Current state of every session
    #[cfg(test)]
    pub fn sessions(&self) -> Vec<(SocketAddr, u32, SessionState)> {
        self.peers
            .iter()
            .map(|p| (p.peer, p.asn, *p.state.borrow()))
            .collect()
    }

    /// Routes currently advertised
    #[cfg(test)]
    pub fn rib(&self) -> BTreeSet<IpAddr> {
        match self.rib.read() {
            Ok(rib) => rib.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update_rib(&self, f: impl FnOnce(&mut BTreeSet<IpAddr>) -> bool) -> Result<bool, PeeringError> {
        if !self.has_established_session() {
            return Err(PeeringError::NoEstablishedSession);
        }
        let mut rib = self
            .rib
            .write()
            .map_err(|_| PeeringError::Io("routing table lock poisoned".to_string()))?;
        Ok(f(&mut rib))
    }
}

#[async_trait]
impl Peering for BgpPeeringManager {
    async fn announce(&self, vip: IpAddr) -> Result<(), PeeringError> {
        if self.update_rib(|rib| rib.insert(vip))? {
            info!(vip = %vip, local_asn = self.local_asn, "Advertising route");
        } else {
            debug!(vip = %vip, "Route already advertised");
        }
        Ok(())
    }

    async fn withdraw(&self, vip: IpAddr) -> Result<(), PeeringError> {
        if self.update_rib(|rib| rib.remove(&vip))? {
            info!(vip = %vip, "Withdrawing route");
        } else {
            debug!(vip = %vip, "Route not advertised");
        }
        Ok(())
    }

    fn has_established_session(&self) -> bool {
        self.peers
            .iter()
            .any(|p| *p.state.borrow() == SessionState::Established)
    }
}
