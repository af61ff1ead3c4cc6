// ABOUTME: Supervisor starting the reconciler, standby pool and execution workers under one shutdown signal
// ABOUTME: Restart recovery on start; cancel, await and drain on shutdown

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::manager::SandboxManager;

pub struct Orchestrator;

impl Orchestrator {
    /// Recover state left by a previous process, then spawn every background task
    pub async fn start(manager: Arc<SandboxManager>) -> Result<OrchestratorHandle> {
        let recovered = manager.executions().recover_orphans().await?;
        if recovered > 0 {
            info!("Recovered {} executions interrupted by a restart", recovered);
        }

        let shutdown = manager.shutdown_token().clone();
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            manager.reconciler().clone().run(shutdown.clone()),
        ));
        tasks.push(tokio::spawn(manager.pool().clone().run(shutdown.clone())));
        tasks.extend(manager.executions().spawn_workers());

        info!(
            workers = manager.settings().execution_workers,
            "Orchestrator started"
        );
        Ok(OrchestratorHandle { manager, tasks })
    }
}

pub struct OrchestratorHandle {
    manager: Arc<SandboxManager>,
    tasks: Vec<JoinHandle<()>>,
}

impl OrchestratorHandle {
    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    /// Signal every loop, wait for them to exit, then remove the standby pods
    pub async fn shutdown(self) {
        info!("Orchestrator shutting down");
        self.manager.shutdown_token().cancel();

        for task in self.tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Background task panicked: {}", e);
                } else {
                    warn!("Background task did not finish cleanly: {}", e);
                }
            }
        }

        self.manager.pool().drain().await;
        info!("Orchestrator stopped");
    }
}
