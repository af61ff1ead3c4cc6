// ABOUTME: Integration tests for the supervisor that runs every background loop under one shutdown signal
// ABOUTME: Covers start-up recovery, warm pools under the running loops and a clean, draining shutdown

use corral_sandbox::gateway::memory::ExecScript;
use corral_sandbox::{
    CreateEnvironmentRequest, Environment, Execution, ExecutionStatus, InMemoryGateway,
    Orchestrator, OrchestratorSettings, SandboxManager, SqliteStateStore, StandbyPoolPolicy,
    StateStore, SubmitExecution,
};
use chrono::Utc;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        reconcile_interval: Duration::from_millis(100),
        pool_interval: Duration::from_millis(100),
        startup_timeout: Duration::from_secs(2),
        cluster_call_timeout: Duration::from_secs(2),
        execution_workers: 2,
        ..Default::default()
    }
}

async fn setup() -> (Arc<SandboxManager>, InMemoryGateway, Arc<dyn StateStore>) {
    let pool = corral_storage::connect_in_memory()
        .await
        .expect("Failed to create in-memory database");
    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::new(pool));
    let gateway = InMemoryGateway::new();
    let manager = Arc::new(SandboxManager::new(
        store.clone(),
        Arc::new(gateway.clone()),
        settings(),
    ));
    (manager, gateway, store)
}

fn check_deadline(started: tokio::time::Instant, what: &str) {
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "timed out waiting for {}",
        what
    );
}

async fn wait_for_running(manager: &SandboxManager, id: &str) {
    let started = tokio::time::Instant::now();
    while !manager.get_environment(id).await.unwrap().is_running() {
        check_deadline(started, "environment running");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_ready_standby(manager: &SandboxManager, ready: u32) {
    let started = tokio::time::Instant::now();
    while !manager.pool_status().await.iter().any(|s| s.ready == ready) {
        check_deadline(started, "standby pool filled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_execution<F>(manager: &SandboxManager, id: &str, done: F) -> Execution
where
    F: Fn(&Execution) -> bool,
{
    let started = tokio::time::Instant::now();
    loop {
        let execution = manager.get_execution(id).await.unwrap();
        if done(&execution) {
            return execution;
        }
        check_deadline(started, "execution state");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn declare_pooled(manager: &SandboxManager) -> Environment {
    manager
        .create_environment(CreateEnvironmentRequest {
            name: "sb-1".to_string(),
            image: "python:3.11-slim".to_string(),
            standby_pool: Some(StandbyPoolPolicy {
                enabled: true,
                size: 2,
                min_ready: 0,
            }),
            owner_id: "user-1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_supervised_loops_provision_serve_and_shut_down_cleanly() {
    let (manager, gateway, _store) = setup().await;
    gateway
        .script_command(
            "sleep",
            ExecScript {
                delay: Some(Duration::from_secs(30)),
                ..Default::default()
            },
        )
        .await;
    let env = declare_pooled(&manager).await;

    let handle = Orchestrator::start(manager.clone()).await.unwrap();

    // The reconciler loop provisions the environment without any manual tick
    wait_for_running(&manager, &env.id).await;

    // The pool loop fills the standby pool
    wait_for_ready_standby(&manager, 2).await;
    let standby_namespace = manager.pool().namespace().to_string();
    assert_eq!(gateway.pod_names(&standby_namespace).await.len(), 2);

    // A long execution is still running when shutdown starts
    let submitted = manager
        .submit_execution(SubmitExecution {
            environment_id: env.id.clone(),
            command: vec!["sleep".to_string(), "30".to_string()],
            env_vars: BTreeMap::new(),
            timeout_secs: None,
            owner_id: "user-1".to_string(),
        })
        .await
        .unwrap();
    wait_for_execution(&manager, &submitted.id, |e| {
        e.status == ExecutionStatus::Running
    })
    .await;

    tokio::time::timeout(Duration::from_secs(10), handle.shutdown())
        .await
        .expect("every background task must exit after the shutdown signal");

    let interrupted = manager.get_execution(&submitted.id).await.unwrap();
    assert_eq!(interrupted.status, ExecutionStatus::Failed);
    assert_eq!(interrupted.error.as_deref(), Some("orchestrator shutting down"));
    assert!(gateway.pod_names(&standby_namespace).await.is_empty());
    assert!(manager.pool_status().await.iter().all(|status| status.ready == 0));
    assert_eq!(manager.executions().tracked_count().await, 0);

    // Nothing keeps touching the cluster once stopped
    let calls = gateway.calls().await.len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(gateway.calls().await.len(), calls);
}

#[tokio::test]
async fn test_start_fails_executions_left_by_a_previous_process() {
    let (manager, _gateway, store) = setup().await;
    let env = declare_pooled(&manager).await;
    manager.reconciler().tick().await.unwrap();

    // A row still marked running that no worker in this process owns
    store
        .upsert_execution(&Execution {
            id: "exec-left-behind".to_string(),
            environment_id: env.id.clone(),
            command: vec!["sleep".to_string(), "100".to_string()],
            env_vars: BTreeMap::new(),
            timeout_secs: 300,
            status: ExecutionStatus::Running,
            owner_id: "user-1".to_string(),
            namespace: None,
            pod_name: None,
            from_standby: false,
            created_at: Utc::now(),
            queued_at: Some(Utc::now()),
            started_at: Some(Utc::now()),
            completed_at: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            error: None,
            duration_ms: None,
        })
        .await
        .unwrap();

    // Queued by this process before the workers exist
    let submitted = manager
        .submit_execution(SubmitExecution {
            environment_id: env.id.clone(),
            command: vec!["true".to_string()],
            env_vars: BTreeMap::new(),
            timeout_secs: None,
            owner_id: "user-1".to_string(),
        })
        .await
        .unwrap();

    let handle = Orchestrator::start(manager.clone()).await.unwrap();

    let left_behind = manager.get_execution("exec-left-behind").await.unwrap();
    assert_eq!(left_behind.status, ExecutionStatus::Failed);
    assert_eq!(
        left_behind.error.as_deref(),
        Some("interrupted by orchestrator restart")
    );

    let finished = wait_for_execution(&manager, &submitted.id, |e| e.status.is_terminal()).await;
    assert_eq!(finished.status, ExecutionStatus::Completed);

    tokio::time::timeout(Duration::from_secs(10), handle.shutdown())
        .await
        .expect("every background task must exit after the shutdown signal");
}
