//! Azure node autopilot entry point: starts the node inventory watch, the repair and
//! update cron drivers, and the optional health/metrics HTTP server.

use std::sync::Arc;

use azure_node_autopilot::cloud::azure::AzureComputeClient;
use azure_node_autopilot::cloud::CloudComputeClient;
use azure_node_autopilot::config::Config;
use azure_node_autopilot::controller::scheduler::Scheduler;
use azure_node_autopilot::inventory::{self, NodeInventory};
use azure_node_autopilot::Error;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cfg = Config::parse();

    let env_filter = EnvFilter::builder().with_default_directive(Level::INFO.into()).from_env_lossy();
    match cfg.log_format {
        azure_node_autopilot::config::LogFormat::Json => {
            tracing_subscriber::registry().with(fmt::layer().json()).with(env_filter).init();
        }
        azure_node_autopilot::config::LogFormat::Text => {
            tracing_subscriber::registry().with(fmt::layer().with_target(true)).with(env_filter).init();
        }
    }

    cfg.validate()?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting node autopilot");

    let client = if let Some(path) = &cfg.kubeconfig {
        let kubeconfig = kube::config::Kubeconfig::read_from(path)
            .map_err(|e| Error::ConfigFatal(format!("failed to read kubeconfig {path}: {e}")))?;
        let options = kube::config::KubeConfigOptions::default();
        let client_config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| Error::ConfigFatal(format!("failed to build client config: {e}")))?;
        kube::Client::try_from(client_config)?
    } else {
        kube::Client::try_default().await?
    };
    info!("connected to Kubernetes cluster");

    let inventory = Arc::new(NodeInventory::new());
    let watch_client = client.clone();
    let watch_inventory = inventory.clone();
    let label_selector = cfg.node_label_selector.clone();
    tokio::spawn(async move {
        inventory::run_watch(watch_client, watch_inventory, label_selector).await;
    });

    let cloud: Arc<dyn CloudComputeClient> = Arc::new(AzureComputeClient::new(cfg.azure_subscription_override.clone())?);

    let notify_http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|e| Error::ConfigFatal(format!("failed to build notification HTTP client: {e}")))?;

    let cfg = Arc::new(cfg);
    let scheduler = Scheduler::start(client.clone(), inventory.clone(), cloud, cfg.clone(), notify_http);

    #[cfg(feature = "rest-api")]
    {
        let http_inventory = inventory.clone();
        let listen_addr = cfg.http.listen_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = azure_node_autopilot::rest_api::run_server(&listen_addr, http_inventory).await {
                tracing::error!(error = %e, "REST API server error");
            }
        });
    }

    tokio::signal::ctrl_c().await.map_err(|e| Error::ConfigFatal(format!("failed to listen for shutdown signal: {e}")))?;
    info!("shutdown signal received, stopping");
    scheduler.stop().await;

    Ok(())
}
