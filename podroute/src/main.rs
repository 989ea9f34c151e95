use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use podroute_cluster::{
    CoordinationStore, Coordinator, CoordinatorSettings, MemoryRoutingTable, MemoryStore, RedisStore,
};
use podroute_core::{bootstrap::load_config, logging, Config, CoordinationMode};
use podroute_kube::KubeCluster;

const STANDALONE_GROUP: &str = "standalone";

/// Pick the coordination store; without a usable Redis this instance runs alone
async fn open_store(config: &Config) -> (Arc<dyn CoordinationStore>, bool) {
    match config.coordination_mode() {
        CoordinationMode::Standalone { reason } => {
            warn!(%reason, "Running standalone, registry is local to this instance");
            (Arc::new(MemoryStore::new()), false)
        }
        CoordinationMode::Replicated => {
            let timeout = Duration::from_secs(config.redis.operation_timeout_seconds);
            match RedisStore::connect(&config.redis.url, timeout).await {
                Ok(store) => {
                    info!(group = %config.coordination.group, "Connected to coordination store");
                    (Arc::new(store), true)
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to Redis");
                    error!("Continuing in standalone mode");
                    (Arc::new(MemoryStore::new()), false)
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration and logging
    let config = load_config()?;
    logging::init_logging(&config.logging)?;

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    info!(%hostname, "podroute starting...");

    // 2. Coordination store
    let (store, replicated) = open_store(&config).await;
    let mut settings = CoordinatorSettings::from_config(&config);
    if !replicated && settings.group.trim().is_empty() {
        settings.group = STANDALONE_GROUP.to_string();
    }

    // 3. Cluster API
    let cluster = Arc::new(KubeCluster::connect(&config.discovery).await?);
    info!(
        namespace = config.discovery.namespace.as_deref().unwrap_or("<all>"),
        selector = ?settings.discovery.selector,
        "Kubernetes client initialized"
    );

    // 4. Join the group
    let routing = Arc::new(MemoryRoutingTable::new());
    let coordinator = Coordinator::start(settings, store, cluster, routing)
        .await
        .context("Failed to start coordinator")?;
    info!(
        proxy_id = %coordinator.proxy_id(),
        leader = coordinator.is_leader(),
        "podroute is running"
    );

    shutdown_signal().await;

    info!("Shutting down...");
    coordinator.shutdown().await;
    info!("podroute stopped");
    Ok(())
}
