//! sfw daemon
//!
//! Wires the orchestration engine from `SFW_*` environment variables, loads
//! definitions, starts the autostart services and runs until Ctrl-C.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sfw_orchestrator::{Config, ServiceDefinition, ServiceManager, StartOptions};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // RUST_LOG wins over SFW_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting sfw daemon");
    info!(
        log_dir = %config.log_dir.display(),
        heartbeat_interval_secs = config.heartbeat_interval_secs,
        strategy = %config.placement_strategy,
        "Configuration loaded"
    );

    let manager = ServiceManager::from_config(&config);

    if let Some(path) = &config.definitions_path {
        for definition in load_definitions(path)? {
            let name = definition.name.clone();
            if let Err(e) = manager.register(definition).await {
                error!(service = %name, error = %e, "Rejected service definition");
            }
        }
    }

    manager.start();

    for name in &config.autostart {
        match manager.start_service(name, StartOptions::default()).await {
            Ok(instance) => info!(service = %name, instance_id = %instance.id, "Autostarted service"),
            Err(e) => warn!(service = %name, error = %e, code = e.error_code(), "Autostart failed"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Received shutdown signal");

    let stopped = manager.shutdown().await;
    info!(stopped, "sfw daemon shutdown complete");
    Ok(())
}

fn load_definitions(path: &Path) -> Result<Vec<ServiceDefinition>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading definitions from {}", path.display()))?;
    let definitions: Vec<ServiceDefinition> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing definitions in {}", path.display()))?;
    info!(count = definitions.len(), path = %path.display(), "Loaded service definitions");
    Ok(definitions)
}
