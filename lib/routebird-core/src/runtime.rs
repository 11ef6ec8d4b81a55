//! Agent runtime serializing change notifications and periodic resyncs

use crate::convergence::{ConvergenceLoop, CycleReport};
use crate::desired::DesiredStateComputer;
use crate::error::Result;
use crate::event::{ClusterEvent, ClusterSnapshot};
use crate::locality::LocalityIndex;
use crate::metrics::Metrics;
use crate::selector::RouteSelector;
use crate::state::ClusterState;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Full listing of the observed resources
#[async_trait]
pub trait ClusterSource: Send + Sync {
    async fn snapshot(&self) -> Result<ClusterSnapshot>;
}

#[derive(Debug)]
pub enum Trigger {
    Changed(ClusterEvent),
    Resync,
    /// A watch stream re-listed; its incremental history is no longer trusted
    WatchRestarted,
}

/// Producer handle feeding the runtime queue.
///
/// Sending never blocks. When the queue is full the trigger is dropped and
/// the next cycle performs a full resync instead.
#[derive(Clone)]
pub struct TriggerSender {
    tx: mpsc::Sender<Trigger>,
    resync_pending: Arc<AtomicBool>,
}

impl TriggerSender {
    fn request_resync(&self) {
        self.send(Trigger::Resync);
    }

    pub fn send(&self, trigger: Trigger) {
        match self.tx.try_send(trigger) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Trigger queue full, falling back to resync");
                self.resync_pending.store(true, Ordering::SeqCst);
            }
            Err(TrySendError::Closed(_)) => debug!("Runtime stopped, dropping trigger"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub resync_interval: Duration,
    pub queue_depth: usize,
    pub shutdown_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(10),
            queue_depth: 128,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// AgentRuntime runs every reconciliation cycle on a single task
pub struct AgentRuntime {
    source: Arc<dyn ClusterSource>,
    selector: RouteSelector,
    locality: LocalityIndex,
    convergence: ConvergenceLoop,
    state: ClusterState,
    rx: mpsc::Receiver<Trigger>,
    sender: TriggerSender,
    resync_pending: Arc<AtomicBool>,
    config: RuntimeConfig,
    metrics: Option<Arc<Metrics>>,
}

impl AgentRuntime {
    pub fn new(
        source: Arc<dyn ClusterSource>,
        selector: RouteSelector,
        locality: LocalityIndex,
        convergence: ConvergenceLoop,
        config: RuntimeConfig,
    ) -> (Self, TriggerSender) {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let resync_pending = Arc::new(AtomicBool::new(false));
        let sender = TriggerSender {
            tx,
            resync_pending: resync_pending.clone(),
        };

        let runtime = Self {
            source,
            selector,
            locality,
            convergence,
            state: ClusterState::new(),
            rx,
            sender: sender.clone(),
            resync_pending,
            config,
            metrics: None,
        };
        (runtime, sender)
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Consume triggers until cancelled, then wind down in-flight operations
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(node = %self.locality.node(), "Starting agent runtime");
        let ticker = self.spawn_resync_ticker(cancel.clone());

        // Nothing from a previous run is trusted
        self.process(vec![Trigger::Resync]).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                trigger = self.rx.recv() => {
                    let Some(trigger) = trigger else { break };
                    let mut batch = vec![trigger];
                    while let Ok(next) = self.rx.try_recv() {
                        batch.push(next);
                    }
                    self.process(batch).await;
                }
            }
        }

        info!("Stopping agent runtime");
        ticker.abort();
        self.convergence.shutdown(self.config.shutdown_grace).await;
    }

    fn spawn_resync_ticker(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let sender = self.sender.clone();
        let period = self.config.resync_interval;
        tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately and startup already resyncs
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => sender.request_resync(),
                }
            }
        })
    }

    /// Fold a batch of triggers into the cluster state and run one cycle
    async fn process(&mut self, batch: Vec<Trigger>) -> CycleReport {
        let mut resync = self.resync_pending.swap(false, Ordering::SeqCst);
        let mut changes = 0usize;
        for trigger in batch {
            match trigger {
                Trigger::Changed(event) => {
                    self.state.apply(event);
                    changes += 1;
                }
                Trigger::Resync | Trigger::WatchRestarted => resync = true,
            }
        }

        if resync {
            match self.source.snapshot().await {
                Ok(snapshot) => self.state.replace(snapshot),
                Err(e) => {
                    warn!(error = %e, "Resync failed, reconciling against cached state");
                    self.resync_pending.store(true, Ordering::SeqCst);
                }
            }
        }

        let trigger = if resync { "resync" } else { "change" };
        if let Some(metrics) = &self.metrics {
            metrics.record_cycle(trigger);
        }
        debug!(trigger, changes, "Running reconciliation cycle");

        self.reconcile_once().await
    }

    async fn reconcile_once(&mut self) -> CycleReport {
        let selection = self.selector.select(self.state.services());
        let facts = self.locality.facts(&self.state.slices_by_service());
        let desired = DesiredStateComputer::compute(&selection.candidates, &facts);

        let report = self.convergence.reconcile(&desired).await;
        if !report.is_quiet() {
            info!(
                desired = desired.len(),
                announced = report.announced,
                withdrawn = report.withdrawn,
                failed = report.failed,
                "Routes reconciled"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::{Operation, DEFAULT_OP_TIMEOUT};
    use crate::event::EventKind;
    use crate::testing::{lb_service, slice, RecordingPeering, StaticSource};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use std::collections::BTreeMap;
    use std::net::IpAddr;

    fn bgp_selector() -> RouteSelector {
        RouteSelector::new(LabelSelector {
            match_labels: Some(BTreeMap::from([("bgp".to_string(), "on".to_string())])),
            match_expressions: None,
        })
    }

    fn snapshot(local: bool) -> ClusterSnapshot {
        let node = if local { "node-a" } else { "node-b" };
        ClusterSnapshot {
            services: vec![lb_service("web", "api", Some("10.0.0.5"))],
            endpoint_slices: vec![slice("web", "api-1", "api", &[(node, Some(true))])],
        }
    }

    fn runtime(
        source: Arc<StaticSource>,
        peering: Arc<RecordingPeering>,
        config: RuntimeConfig,
    ) -> (AgentRuntime, TriggerSender) {
        AgentRuntime::new(
            source,
            bgp_selector(),
            LocalityIndex::new("node-a"),
            ConvergenceLoop::new(peering, DEFAULT_OP_TIMEOUT),
            config,
        )
    }

    async fn wait_for_calls(peering: &RecordingPeering, n: usize) {
        time::timeout(Duration::from_secs(2), async {
            while peering.calls().len() < n {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peering calls");
    }

    #[tokio::test]
    async fn test_startup_resync_then_change_event() {
        let source = Arc::new(StaticSource::new(snapshot(true)));
        let peering = Arc::new(RecordingPeering::default());
        let (runtime, sender) = runtime(source.clone(), peering.clone(), RuntimeConfig::default());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(runtime.run(cancel.clone()));

        wait_for_calls(&peering, 1).await;
        let vip: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(peering.calls(), vec![(Operation::Announce, vip)]);
        assert_eq!(source.calls(), 1);

        // Endpoint moves off this node
        sender.send(Trigger::Changed(ClusterEvent::endpoint_slice(
            EventKind::Update,
            slice("web", "api-1", "api", &[("node-b", Some(true))]),
        )));
        wait_for_calls(&peering, 2).await;
        assert_eq!(peering.calls()[1], (Operation::Withdraw, vip));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_resync_heals_drift() {
        let source = Arc::new(StaticSource::new(snapshot(false)));
        let peering = Arc::new(RecordingPeering::default());
        let config = RuntimeConfig {
            resync_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let (runtime, _sender) = runtime(source.clone(), peering.clone(), config);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(runtime.run(cancel.clone()));

        // No event is delivered; only the resync picks up the new endpoint
        source.set(snapshot(true));
        wait_for_calls(&peering, 1).await;
        assert!(source.calls() >= 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_falls_back_to_resync() {
        let source = Arc::new(StaticSource::new(snapshot(true)));
        let peering = Arc::new(RecordingPeering::default());
        let config = RuntimeConfig {
            queue_depth: 1,
            ..Default::default()
        };
        let (mut runtime, sender) = runtime(source.clone(), peering.clone(), config);

        let event = ClusterEvent::service(EventKind::Update, lb_service("web", "api", None));
        sender.send(Trigger::Changed(event.clone()));
        sender.send(Trigger::Changed(event));
        assert!(runtime.resync_pending.load(Ordering::SeqCst));

        let queued = runtime.rx.try_recv().unwrap();
        runtime.process(vec![queued]).await;
        assert_eq!(source.calls(), 1);
        assert!(!runtime.resync_pending.load(Ordering::SeqCst));
        assert_eq!(peering.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_resync_keeps_cached_state() {
        let source = Arc::new(StaticSource::new(snapshot(true)));
        let peering = Arc::new(RecordingPeering::default());
        let (mut runtime, _sender) = runtime(source.clone(), peering.clone(), RuntimeConfig::default());

        let report = runtime.process(vec![Trigger::Resync]).await;
        assert_eq!(report.announced, 1);

        source.set_failing(true);
        let report = runtime.process(vec![Trigger::WatchRestarted]).await;
        assert!(report.is_quiet());
        assert!(runtime.resync_pending.load(Ordering::SeqCst));
        assert_eq!(peering.calls().len(), 1);
    }
}
