use crate::service::ServiceId;
use std::net::IpAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Address allocation error: {0}")]
    Alloc(#[from] AllocError),

    #[error("Failed to write status of service {service}: {message}")]
    StatusWrite { service: ServiceId, message: String },

    #[error("Cluster observation failed: {0}")]
    Observation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("address pool {0} is exhausted")]
    PoolExhausted(String),

    #[error("unknown address pool {0}")]
    UnknownPool(String),

    #[error("invalid address range {range:?}: {reason}")]
    InvalidRange { range: String, reason: String },

    #[error("address pool {pool} overlaps pool {other}")]
    PoolOverlap { pool: String, other: String },

    #[error("address {address} is already bound to {owner}")]
    AddressConflict { address: IpAddr, owner: ServiceId },

    #[error("allocator lock poisoned")]
    Poisoned,
}
