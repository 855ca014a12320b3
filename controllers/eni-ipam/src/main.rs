//! ENI IPAM Controller
//!
//! Watches `ENINode` resources and keeps each node's address pool filled
//! from the cloud inventory service.

use eni_client::HttpProviderClient;
use eni_ipam::metrics::PrometheusMetrics;
use eni_ipam::store::KubeResourceStore;
use eni_ipam::{Config, ControllerError, NodeManager, server, watcher};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting ENI IPAM Controller");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  Provider URL: {}", config.provider_url);
    info!("  Resync interval: {:?}", config.manager.resync_interval);
    info!("  Default pre-allocate: {}", config.manager.default_pre_allocate);
    info!("  Metrics address: {}", config.metrics_addr);

    let provider = HttpProviderClient::new(config.provider_url.clone(), config.provider_token.clone())?;
    let kube_client = Client::try_default().await?;
    let metrics = Arc::new(PrometheusMetrics::new()?);

    let manager = Arc::new(NodeManager::new(
        Arc::new(provider),
        Arc::new(KubeResourceStore::new(kube_client.clone())),
        metrics.clone(),
        config.manager.clone(),
    ));

    if let Err(e) = manager.resync().await {
        warn!("Initial subnet listing failed (will retry): {}", e);
    }

    let mut server_task = tokio::spawn(server::serve(config.metrics_addr, metrics));
    let mut watcher_task = tokio::spawn(watcher::watch_nodes(Api::all(kube_client), manager.clone()));

    let mut resync_task = tokio::spawn(resync_loop(manager.clone(), config.manager.resync_interval));

    info!("ENI IPAM Controller running");

    // Wait for any task to exit (they should run forever)
    tokio::select! {
        result = &mut watcher_task => {
            result.map_err(|e| ControllerError::Watch(format!("ENINode watcher panicked: {}", e)))??;
        }
        result = &mut server_task => {
            result.map_err(|e| ControllerError::Watch(format!("Metrics server panicked: {}", e)))?
                .map_err(|e| ControllerError::Watch(format!("Metrics server error: {}", e)))?;
        }
        result = &mut resync_task => {
            result.map_err(|e| ControllerError::Watch(format!("Resync loop panicked: {}", e)))?;
        }
    }

    Ok(())
}

/// Periodic full resync: refresh subnets and re-trigger every node
async fn resync_loop(manager: Arc<NodeManager>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = manager.resync().await {
            warn!("Resync failed: {}", e);
        }
    }
}
