//! Convergence of announced routes towards the desired route set

use crate::desired::DesiredRouteSet;
use crate::metrics::Metrics;
use crate::peering::{Peering, PeeringError};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time;
use tracing::{debug, info, warn};

/// Default bound on a single announce or withdraw call
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Announce,
    Withdraw,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Announce => "announce",
            Operation::Withdraw => "withdraw",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one VIP as seen by this node
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteState {
    Unannounced,
    Announcing,
    Announced,
    Withdrawing,
    Failed { op: Operation, reason: String },
}

impl RouteState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, RouteState::Announcing | RouteState::Withdrawing)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RouteState::Unannounced => "unannounced",
            RouteState::Announcing => "announcing",
            RouteState::Announced => "announced",
            RouteState::Withdrawing => "withdrawing",
            RouteState::Failed { .. } => "failed",
        }
    }
}

/// Outcome of one reconciliation cycle
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub announced: usize,
    pub withdrawn: usize,
    pub failed: usize,
    /// Routes left alone because an earlier operation is still running
    pub skipped: usize,
}

impl CycleReport {
    /// True when the cycle changed nothing
    pub fn is_quiet(&self) -> bool {
        self.announced == 0 && self.withdrawn == 0 && self.failed == 0
    }
}

type OpOutcome = (IpAddr, Operation, Result<(), PeeringError>);

/// ConvergenceLoop owns the announced route state table.
///
/// Each cycle diffs the desired set against the table, issues the missing
/// announce and withdraw calls concurrently, and waits for them. A VIP absent
/// from the table is `Unannounced`.
pub struct ConvergenceLoop {
    peering: Arc<dyn Peering>,
    routes: BTreeMap<IpAddr, RouteState>,
    in_flight: JoinSet<OpOutcome>,
    op_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl ConvergenceLoop {
    pub fn new(peering: Arc<dyn Peering>, op_timeout: Duration) -> Self {
        Self {
            peering,
            routes: BTreeMap::new(),
            in_flight: JoinSet::new(),
            op_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self, vip: &IpAddr) -> RouteState {
        self.routes
            .get(vip)
            .cloned()
            .unwrap_or(RouteState::Unannounced)
    }

    /// Snapshot of the state table
    #[cfg(test)]
    pub fn routes(&self) -> BTreeMap<IpAddr, RouteState> {
        self.routes.clone()
    }

    /// Run one cycle against the given desired set
    pub async fn reconcile(&mut self, desired: &DesiredRouteSet) -> CycleReport {
        let mut report = CycleReport::default();

        // Leftovers from a cycle that was cancelled mid-flight
        while let Some(joined) = self.in_flight.try_join_next() {
            self.complete(joined, &mut report);
        }

        let plan = self.plan(desired, &mut report);
        if !plan.is_empty() {
            if self.peering.has_established_session() {
                for (vip, op) in plan {
                    self.spawn(vip, op);
                }
                while let Some(joined) = self.in_flight.join_next().await {
                    self.complete(joined, &mut report);
                }
            } else {
                warn!(routes = plan.len(), "No established peering session, deferring route changes");
                let reason = PeeringError::NoEstablishedSession.to_string();
                for (vip, op) in plan {
                    self.fail(vip, op, reason.clone(), &mut report);
                }
            }
        }

        self.sweep_orphans(&mut report);
        if let Some(metrics) = &self.metrics {
            metrics.observe_routes(&self.routes, desired.len());
        }

        debug!(
            announced = report.announced,
            withdrawn = report.withdrawn,
            failed = report.failed,
            skipped = report.skipped,
            "Convergence cycle finished"
        );
        report
    }

    /// Let in-flight operations finish within `grace`, then abort them
    pub async fn shutdown(&mut self, grace: Duration) {
        if self.in_flight.is_empty() {
            return;
        }

        info!(in_flight = self.in_flight.len(), "Waiting for in-flight peering operations");
        let mut report = CycleReport::default();
        let settled = time::timeout(grace, async {
            while let Some(joined) = self.in_flight.join_next().await {
                self.complete(joined, &mut report);
            }
        })
        .await;

        if settled.is_err() {
            warn!(
                in_flight = self.in_flight.len(),
                "Grace period elapsed, aborting peering operations"
            );
            self.in_flight.shutdown().await;
        }
        self.sweep_orphans(&mut report);
    }

    fn plan(&self, desired: &DesiredRouteSet, report: &mut CycleReport) -> Vec<(IpAddr, Operation)> {
        let mut plan = Vec::new();

        for vip in desired {
            match self.routes.get(vip) {
                Some(state) if state.is_in_flight() => report.skipped += 1,
                Some(RouteState::Announced) => {}
                _ => plan.push((*vip, Operation::Announce)),
            }
        }

        for (vip, state) in &self.routes {
            if desired.contains(vip) {
                continue;
            }
            match state {
                state if state.is_in_flight() => report.skipped += 1,
                // A failed announce may still have reached the peer
                RouteState::Announced | RouteState::Failed { .. } => {
                    plan.push((*vip, Operation::Withdraw))
                }
                _ => {}
            }
        }

        plan
    }

    fn spawn(&mut self, vip: IpAddr, op: Operation) {
        let state = match op {
            Operation::Announce => RouteState::Announcing,
            Operation::Withdraw => RouteState::Withdrawing,
        };
        self.routes.insert(vip, state);

        let peering = self.peering.clone();
        let timeout = self.op_timeout;
        self.in_flight.spawn(async move {
            let call = async {
                match op {
                    Operation::Announce => peering.announce(vip).await,
                    Operation::Withdraw => peering.withdraw(vip).await,
                }
            };
            let result = match time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(PeeringError::Timeout(timeout)),
            };
            (vip, op, result)
        });
    }

    fn complete(&mut self, joined: Result<OpOutcome, JoinError>, report: &mut CycleReport) {
        let (vip, op, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                // The VIP is unknown here; the orphan sweep picks it up
                warn!(error = %e, "Peering task did not complete");
                return;
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_op(op, result.is_ok());
        }

        match (op, result) {
            (Operation::Announce, Ok(())) => {
                info!(vip = %vip, "Route announced");
                self.routes.insert(vip, RouteState::Announced);
                report.announced += 1;
            }
            (Operation::Withdraw, Ok(())) => {
                info!(vip = %vip, "Route withdrawn");
                self.routes.remove(&vip);
                report.withdrawn += 1;
            }
            (op, Err(e)) => self.fail(vip, op, e.to_string(), report),
        }
    }

    fn fail(&mut self, vip: IpAddr, op: Operation, reason: String, report: &mut CycleReport) {
        warn!(vip = %vip, op = %op, reason = %reason, "Peering operation failed");
        self.routes.insert(vip, RouteState::Failed { op, reason });
        report.failed += 1;
    }

    fn sweep_orphans(&mut self, report: &mut CycleReport) {
        if !self.in_flight.is_empty() {
            return;
        }
        let orphaned: Vec<(IpAddr, Operation)> = self
            .routes
            .iter()
            .filter_map(|(vip, state)| match state {
                RouteState::Announcing => Some((*vip, Operation::Announce)),
                RouteState::Withdrawing => Some((*vip, Operation::Withdraw)),
                _ => None,
            })
            .collect();
        for (vip, op) in orphaned {
            self.fail(vip, op, "operation aborted".to_string(), report);
        }
    }
}
