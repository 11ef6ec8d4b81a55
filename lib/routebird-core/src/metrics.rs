//! Prometheus metrics for the convergence loop

use crate::convergence::{Operation, RouteState};
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;
use std::net::IpAddr;

const ROUTE_STATES: [&str; 5] = ["unannounced", "announcing", "announced", "withdrawing", "failed"];

/// Metrics collector for route convergence
#[derive(Clone)]
pub struct Metrics {
    /// Reconciliation cycles by trigger
    pub cycles_total: IntCounterVec,
    /// Peering calls by operation and result
    pub peering_ops_total: IntCounterVec,
    /// Tracked routes by state
    pub routes: IntGaugeVec,
    /// Size of the last desired route set
    pub desired_routes: IntGauge,
    registry: Registry,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let cycles_total = IntCounterVec::new(
            Opts::new("routebird_cycles_total", "Reconciliation cycles by trigger"),
            &["trigger"],
        )?;
        let peering_ops_total = IntCounterVec::new(
            Opts::new("routebird_peering_ops_total", "Announce and withdraw calls by result"),
            &["op", "result"],
        )?;
        let routes = IntGaugeVec::new(
            Opts::new("routebird_routes", "Tracked routes by state"),
            &["state"],
        )?;
        let desired_routes = IntGauge::new(
            "routebird_desired_routes",
            "Routes this node should be announcing",
        )?;

        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(peering_ops_total.clone()))?;
        registry.register(Box::new(routes.clone()))?;
        registry.register(Box::new(desired_routes.clone()))?;

        Ok(Self {
            cycles_total,
            peering_ops_total,
            routes,
            desired_routes,
            registry,
        })
    }

    pub fn record_cycle(&self, trigger: &str) {
        self.cycles_total.with_label_values(&[trigger]).inc();
    }

    pub fn record_op(&self, op: Operation, ok: bool) {
        let result = if ok { "success" } else { "failure" };
        self.peering_ops_total
            .with_label_values(&[op.as_str(), result])
            .inc();
    }

    pub fn observe_routes(&self, routes: &BTreeMap<IpAddr, RouteState>, desired: usize) {
        for state in ROUTE_STATES {
            let count = routes.values().filter(|s| s.label() == state).count();
            self.routes.with_label_values(&[state]).set(count as i64);
        }
        self.desired_routes.set(desired as i64);
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
