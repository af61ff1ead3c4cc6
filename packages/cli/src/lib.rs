// ABOUTME: Library half of the corral binary: configuration, logging and runtime wiring
// ABOUTME: Opens the state database and cluster gateway and builds the sandbox manager

pub mod config;
pub mod logging;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use corral_sandbox::{
    ClusterGateway, DockerGateway, InMemoryGateway, OrchestratorSettings, SandboxManager,
    SqliteStateStore, StateStore,
};

use config::{Config, GatewayKind};

/// Connect the gateway named by the configuration
pub fn connect_gateway(kind: GatewayKind) -> Result<Arc<dyn ClusterGateway>> {
    let gateway: Arc<dyn ClusterGateway> = match kind {
        GatewayKind::Docker => {
            Arc::new(DockerGateway::connect().context("Failed to connect to Docker")?)
        }
        GatewayKind::Memory => Arc::new(InMemoryGateway::new()),
    };
    Ok(gateway)
}

/// Open the database, read settings and wire a manager over the configured gateway
pub async fn build_manager(
    config: &Config,
    settings: OrchestratorSettings,
) -> Result<Arc<SandboxManager>> {
    settings.validate().context("Invalid orchestrator settings")?;

    let pool = corral_storage::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    let store: Arc<dyn StateStore> =
        Arc::new(SqliteStateStore::new(pool).with_deadline(settings.cluster_call_timeout));
    let gateway = connect_gateway(config.gateway)?;

    info!(
        database = %config.database_url,
        gateway = config.gateway.as_str(),
        "Sandbox manager ready"
    );
    Ok(Arc::new(SandboxManager::new(store, gateway, settings)))
}
