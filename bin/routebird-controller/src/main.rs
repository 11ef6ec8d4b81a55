use anyhow::Result;
use clap::Parser;
use kube::{Client, CustomResourceExt};
use routebird_api::BGPRoute;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod allocation_controller;
mod bgproute_controller;
mod builders;

use allocation_controller::AllocationController;
use bgproute_controller::BGPRouteController;

/// Deploys routebird agents for BGPRoutes and allocates service VIPs
#[derive(Parser, Debug)]
#[command(name = "routebird-controller", version)]
struct Args {
    /// Agent image repository used when a BGPRoute leaves it empty
    #[arg(long, env = "ROUTEBIRD_AGENT_IMAGE", default_value = "ghcr.io/yago-123/routebird-agent")]
    agent_image: String,

    /// Print the BGPRoute CustomResourceDefinition as JSON and exit
    #[arg(long)]
    print_crd: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.print_crd {
        println!("{}", serde_json::to_string_pretty(&BGPRoute::crd())?);
        return Ok(());
    }
    init_tracing(args.log_json);

    info!("Starting routebird-controller...");

    let client = Client::try_default().await?;
    let routes = BGPRouteController::new(client.clone(), args.agent_image);
    let allocation = AllocationController::new(client);

    // Start BGPRoute reconciliation
    tokio::spawn(async move {
        if let Err(e) = routes.run().await {
            error!("BGPRoute controller error: {}", e);
        }
    });

    // Start VIP allocation
    tokio::spawn(async move {
        if let Err(e) = allocation.run().await {
            error!("Allocation controller error: {}", e);
        }
    });

    shutdown_signal().await?;
    info!("Shutdown signal received, exiting...");

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
