use thiserror::Error;

#[derive(Error, Debug)]
pub enum BgpError {
    #[error("Invalid peer address {0:?}")]
    InvalidPeer(String),

    #[error("Connect to {peer} timed out")]
    ConnectTimeout { peer: std::net::SocketAddr },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
