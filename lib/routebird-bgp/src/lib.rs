//! BGP peering sessions and the local routing table
//!
//! Sessions hold a TCP connection to every configured peer and reconnect with
//! exponential backoff. Route announcements are kept in a RIB that is only
//! writable while at least one session is established.

pub mod backoff;
pub mod error;
pub mod manager;
pub mod session;

pub use backoff::ExponentialBackoff;
pub use error::BgpError;
pub use manager::BgpPeeringManager;
pub use session::{PeerSession, SessionConfig, SessionState};

/// Well-known BGP port peers listen on
pub const BGP_PORT: u16 = 179;
