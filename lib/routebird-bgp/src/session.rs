//! Transport session towards one BGP peer

use crate::backoff::ExponentialBackoff;
use crate::error::BgpError;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Established,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Established => "established",
            SessionState::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    /// Interval between liveness checks, also used as the TCP keepalive time
    pub keepalive: Duration,
    pub backoff: ExponentialBackoff,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keepalive: Duration::from_secs(30),
            backoff: ExponentialBackoff::default(),
        }
    }
}

/// PeerSession keeps one connection to a peer alive.
///
/// The current state is published on a watch channel so readers never wait
/// on the session task.
pub struct PeerSession {
    peer: SocketAddr,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
}

impl PeerSession {
    pub fn new(peer: SocketAddr, config: SessionConfig) -> (Self, watch::Receiver<SessionState>) {
        let (state, rx) = watch::channel(SessionState::Disconnected);
        (Self { peer, config, state }, rx)
    }

    /// Connect, hold and reconnect until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut attempt = 0u32;

        loop {
            self.set(SessionState::Connecting);
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                connected = self.connect() => connected,
            };

            match connected {
                Ok(stream) => {
                    attempt = 0;
                    self.set(SessionState::Established);
                    info!(peer = %self.peer, "BGP session established");

                    let reason = tokio::select! {
                        _ = cancel.cancelled() => break,
                        reason = self.hold(stream) => reason,
                    };
                    warn!(peer = %self.peer, %reason, "BGP session lost");
                }
                Err(e) => warn!(peer = %self.peer, error = %e, "BGP connect failed"),
            }
            self.set(SessionState::Failed);

            let delay = self.config.backoff.duration(attempt);
            attempt = attempt.saturating_add(1);
            debug!(peer = %self.peer, ?delay, "Reconnecting after backoff");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = time::sleep(delay) => {}
            }
        }

        self.set(SessionState::Disconnected);
        debug!(peer = %self.peer, "BGP session stopped");
    }

    fn set(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    async fn connect(&self) -> Result<TcpStream, BgpError> {
        let socket = Socket::new(Domain::for_address(self.peer), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_keepalive(true)?;
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(self.config.keepalive))?;
        socket.set_nodelay(true)?;
        socket.set_nonblocking(true)?;

        let socket = TcpSocket::from_std_stream(socket.into());
        match time::timeout(self.config.connect_timeout, socket.connect(self.peer)).await {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(BgpError::ConnectTimeout { peer: self.peer }),
        }
    }

    /// Hold an established connection, returning why it ended
    async fn hold(&self, mut stream: TcpStream) -> String {
        let mut heartbeat = time::interval(self.config.keepalive);
        heartbeat.tick().await;
        let mut buf = [0u8; 4096];

        loop {
            tokio::select! {
                read = stream.read(&mut buf) => match read {
                    Ok(0) => return "peer closed the connection".to_string(),
                    // Message framing is not interpreted
                    Ok(n) => debug!(peer = %self.peer, bytes = n, "Discarding peer data"),
                    Err(e) => return e.to_string(),
                },
                _ = heartbeat.tick() => match stream.take_error() {
                    Ok(None) => debug!(peer = %self.peer, "Keepalive ok"),
                    Ok(Some(e)) | Err(e) => return e.to_string(),
                },
            }
        }
    }
}
