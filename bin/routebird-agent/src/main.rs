use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use routebird_api::AgentConfig;
use routebird_bgp::{BgpPeeringManager, SessionConfig};
use routebird_core::{
    AgentRuntime, ConvergenceLoop, LocalityIndex, Metrics, RouteSelector, RuntimeConfig,
};
use routebird_k8s::{watch, ClusterDiscovery};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod http;

/// Advertises load-balancer VIPs over BGP from nodes hosting their endpoints
#[derive(Parser, Debug)]
#[command(name = "routebird-agent", version)]
struct Args {
    /// Agent config rendered by the controller
    #[arg(long, env = "ROUTEBIRD_CONFIG", default_value = "/etc/routebird/config.json")]
    config: PathBuf,

    /// Node this agent runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    #[arg(long, default_value_t = 10)]
    resync_interval_secs: u64,

    /// Capacity of the change notification queue
    #[arg(long, default_value_t = 128)]
    queue_depth: usize,

    /// Bound on a single announce or withdraw
    #[arg(long, default_value_t = 5)]
    op_timeout_secs: u64,

    #[arg(long, default_value_t = 10)]
    shutdown_grace_secs: u64,

    #[arg(long, default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,

    #[arg(long, default_value_t = 30)]
    keepalive_secs: u64,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!(node = %args.node_name, "Starting routebird-agent...");

    let config = AgentConfig::load(&args.config)
        .with_context(|| format!("failed to load agent config from {}", args.config.display()))?;
    info!(
        local_asn = config.local_asn,
        peers = config.peers.len(),
        "Agent config loaded"
    );

    let cancel = CancellationToken::new();
    let metrics = Arc::new(Metrics::new()?);

    let session = SessionConfig {
        keepalive: Duration::from_secs(args.keepalive_secs),
        ..Default::default()
    };
    let peering = Arc::new(BgpPeeringManager::start(&config, session, cancel.clone())?);

    let client = Client::try_default().await?;
    let discovery = Arc::new(ClusterDiscovery::new(client.clone()));

    let convergence = ConvergenceLoop::new(peering, Duration::from_secs(args.op_timeout_secs))
        .with_metrics(metrics.clone());
    let (runtime, sender) = AgentRuntime::new(
        discovery,
        RouteSelector::new(config.service_selector.clone()),
        LocalityIndex::new(args.node_name.clone()),
        convergence,
        RuntimeConfig {
            resync_interval: Duration::from_secs(args.resync_interval_secs),
            queue_depth: args.queue_depth,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        },
    );
    let runtime = runtime.with_metrics(metrics.clone());

    tokio::spawn(watch::watch_services(client.clone(), sender.clone()));
    tokio::spawn(watch::watch_endpoint_slices(client, sender));

    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = http::serve(args.metrics_addr, metrics, server_cancel).await {
            error!("Metrics server error: {}", e);
        }
    });

    let runtime_task = tokio::spawn(runtime.run(cancel.clone()));

    shutdown_signal().await?;
    info!("Shutdown signal received, exiting...");
    cancel.cancel();
    runtime_task.await?;

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
