//! Vultr CSI Driver binary: parses CLI flags, wires up the Identity,
//! Controller, and Node services against the Vultr API, and serves them
//! over the CSI gRPC endpoint until terminated.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vultr_csi_driver::config::Args;
use vultr_csi_driver::controller::ControllerService;
use vultr_csi_driver::identity::{IdentityService, ReadinessState};
use vultr_csi_driver::metadata;
use vultr_csi_driver::metrics;
use vultr_csi_driver::node::NodeService;
use vultr_csi_driver::provider::ProviderClient;
use vultr_csi_driver::server::NonBlockingGrpcServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let version = env!("CARGO_PKG_VERSION").to_string();
    if version.is_empty() {
        error!("version must be defined at compilation");
        std::process::exit(1);
    }

    if args.token.is_empty() {
        error!("a Vultr API token is required (--token or CSI_API_TOKEN)");
        std::process::exit(1);
    }

    let provider = match &args.api_url {
        Some(url) => ProviderClient::with_base_url(args.token.clone(), url.clone(), args.user_agent.clone()),
        None => ProviderClient::new(args.token.clone()),
    };

    let node_identity = metadata::fetch_node_identity().await?;

    info!(
        driver_name = %args.driver_name,
        endpoint = %args.endpoint,
        node_id = %node_identity.instance_id,
        region = %node_identity.region,
        "starting vultr-csi-driver"
    );

    if let Some(addr) = args.metrics_address {
        if let Err(e) = metrics::init_metrics(addr) {
            error!(error = %e, "failed to start metrics exporter");
        }
    }

    let readiness = Arc::new(ReadinessState::new());
    let identity = IdentityService::with_readiness(args.driver_name.clone(), version, readiness.clone());

    let controller = ControllerService::new(provider, node_identity.region.clone());
    let node = NodeService::new(node_identity.instance_id, node_identity.region);

    let mut server = NonBlockingGrpcServer::start(&args.endpoint, identity, controller, node).await?;
    readiness.set_ready(true);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    tokio::select! {
        _ = shutdown => {
            info!("shutdown signal received, stopping gracefully");
            server.stop();
        }
    }

    server.wait().await;
    Ok(())
}
