//! Route convergence control plane
//!
//! This library provides:
//! - VIP allocation from administrator-configured address pools
//! - Route selection and endpoint locality derived from cluster observations
//! - The convergence loop reconciling desired routes against what has been
//!   announced through the peering capability
//! - The agent runtime serializing change notifications and periodic resyncs

pub mod allocator;
pub mod convergence;
pub mod desired;
pub mod error;
pub mod event;
pub mod labels;
pub mod locality;
pub mod metrics;
pub mod peering;
pub mod runtime;
pub mod selector;
pub mod service;
pub mod state;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use allocator::{AddressRange, IpAllocator, PoolId, PoolStats};
pub use convergence::{ConvergenceLoop, CycleReport, Operation, RouteState};
pub use desired::{DesiredRouteSet, DesiredStateComputer};
pub use error::{AllocError, CoreError, Result};
pub use event::{ClusterEvent, ClusterSnapshot, EventKind, ObservedObject};
pub use locality::{LocalityFact, LocalityFacts, LocalityIndex};
pub use metrics::Metrics;
pub use peering::{Peering, PeeringError};
pub use runtime::{AgentRuntime, ClusterSource, RuntimeConfig, Trigger, TriggerSender};
pub use selector::{Assignment, RouteCandidate, RouteSelector, Selection, SkipReason};
pub use service::ServiceId;
pub use state::ClusterState;
pub use status::StatusWriter;
