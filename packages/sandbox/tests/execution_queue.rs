// ABOUTME: Integration tests for asynchronous executions, cancellation, timeouts and standby pods
// ABOUTME: Runs the execution workers against scripted commands in the in-memory cluster

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corral_sandbox::gateway::memory::ExecScript;
use corral_sandbox::{
    CreateEnvironmentRequest, DeletionOutcome, Environment, EnvironmentEvent, EnvironmentFilter,
    EnvironmentStatus, Execution, ExecutionFilter, ExecutionStatus, InMemoryGateway,
    OrchestratorSettings, SandboxError, SandboxManager, SqliteStateStore, StandbyPoolPolicy,
    StateStore, SubmitExecution,
};
use corral_storage::Result as StoreResult;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        startup_timeout: Duration::from_secs(2),
        cluster_call_timeout: Duration::from_secs(2),
        execution_workers: 2,
        ..Default::default()
    }
}

struct Harness {
    manager: Arc<SandboxManager>,
    gateway: InMemoryGateway,
    store: Arc<dyn StateStore>,
}

async fn setup(settings: OrchestratorSettings) -> Harness {
    let pool = corral_storage::connect_in_memory()
        .await
        .expect("Failed to create in-memory database");
    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::new(pool));
    let gateway = InMemoryGateway::new();
    let manager = Arc::new(SandboxManager::new(
        store.clone(),
        Arc::new(gateway.clone()),
        settings,
    ));
    Harness {
        manager,
        gateway,
        store,
    }
}

async fn running_environment(manager: &SandboxManager, pool: Option<StandbyPoolPolicy>) -> Environment {
    let env = manager
        .create_environment(CreateEnvironmentRequest {
            name: "sb-1".to_string(),
            image: "python:3.11-slim".to_string(),
            standby_pool: pool,
            owner_id: "user-1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    manager.reconciler().tick().await.unwrap();
    manager.get_environment(&env.id).await.unwrap()
}

fn run(env: &Environment, command: &[&str], timeout_secs: Option<u64>) -> SubmitExecution {
    SubmitExecution {
        environment_id: env.id.clone(),
        command: command.iter().map(|s| s.to_string()).collect(),
        env_vars: BTreeMap::new(),
        timeout_secs,
        owner_id: "user-1".to_string(),
    }
}

async fn wait_until<F>(manager: &SandboxManager, id: &str, done: F) -> Execution
where
    F: Fn(&Execution) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let execution = manager.get_execution(id).await.unwrap();
        if done(&execution) {
            return execution;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "execution {} stuck in {}",
            id,
            execution.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_terminal(manager: &SandboxManager, id: &str) -> Execution {
    wait_until(manager, id, |e| e.status.is_terminal()).await
}

#[tokio::test]
async fn test_execution_completes_with_captured_output() {
    let h = setup(test_settings()).await;
    h.gateway
        .script_command("python", ExecScript::output(0, "2\n"))
        .await;
    let env = running_environment(&h.manager, None).await;
    let _workers = h.manager.executions().spawn_workers();

    let submitted = h
        .manager
        .submit_execution(run(&env, &["python", "-c", "print(1+1)"], None))
        .await
        .unwrap();
    assert_eq!(submitted.status, ExecutionStatus::Pending);

    let done = wait_terminal(&h.manager, &submitted.id).await;
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.exit_code, Some(0));
    assert!(done.stdout.unwrap().contains('2'));
    assert!(done.queued_at.is_some());
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    assert!(done.duration_ms.is_some());
    assert!(!done.from_standby);

    // The ephemeral pod is gone; only the primary remains
    assert_eq!(
        h.gateway.pod_names(&env.namespace).await,
        vec!["primary".to_string()]
    );
}

#[tokio::test]
async fn test_nonzero_exit_is_failed_with_diagnostics() {
    let h = setup(test_settings()).await;
    h.gateway
        .script_command(
            "false",
            ExecScript {
                exit_code: 3,
                stderr: "boom".to_string(),
                ..Default::default()
            },
        )
        .await;
    let env = running_environment(&h.manager, None).await;
    let _workers = h.manager.executions().spawn_workers();

    let submitted = h.manager.submit_execution(run(&env, &["false"], None)).await.unwrap();
    let done = wait_terminal(&h.manager, &submitted.id).await;
    assert_eq!(done.status, ExecutionStatus::Failed);
    assert_eq!(done.exit_code, Some(3));
    assert_eq!(done.stderr.as_deref(), Some("boom"));
    assert!(done.error.unwrap().contains("code 3"));
}

#[tokio::test]
async fn test_timeout_fails_and_destroys_pod() {
    let h = setup(test_settings()).await;
    h.gateway
        .script_command(
            "sleep",
            ExecScript {
                delay: Some(Duration::from_secs(30)),
                ..Default::default()
            },
        )
        .await;
    let env = running_environment(&h.manager, None).await;
    let _workers = h.manager.executions().spawn_workers();

    let submitted = h
        .manager
        .submit_execution(run(&env, &["sleep", "30"], Some(1)))
        .await
        .unwrap();
    let done = wait_terminal(&h.manager, &submitted.id).await;
    assert_eq!(done.status, ExecutionStatus::Failed);
    assert!(done.error.unwrap().contains("timed out"));
    assert_eq!(h.gateway.pod_names(&env.namespace).await.len(), 1);
}

#[tokio::test]
async fn test_cancel_running_execution_tears_down_pod() {
    let h = setup(test_settings()).await;
    h.gateway
        .script_command(
            "sleep",
            ExecScript {
                delay: Some(Duration::from_secs(30)),
                ..Default::default()
            },
        )
        .await;
    let env = running_environment(&h.manager, None).await;
    let _workers = h.manager.executions().spawn_workers();

    let submitted = h
        .manager
        .submit_execution(run(&env, &["sleep", "30"], None))
        .await
        .unwrap();
    let running = wait_until(&h.manager, &submitted.id, |e| {
        e.status == ExecutionStatus::Running
    })
    .await;
    let pod = running.pod_name.unwrap();

    let canceled = h.manager.cancel_execution(&submitted.id).await.unwrap();
    assert_eq!(canceled.status, ExecutionStatus::Canceled);
    assert!(!h.gateway.pod_names(&env.namespace).await.contains(&pod));
    assert!(h
        .gateway
        .calls()
        .await
        .contains(&format!("delete_pod {}/{} force=true", env.namespace, pod)));

    // Terminal executions are immutable and cannot be canceled again
    assert!(matches!(
        h.manager.cancel_execution(&submitted.id).await,
        Err(SandboxError::InvalidStateTransition(_))
    ));
}

#[tokio::test]
async fn test_cancel_before_any_worker_picks_it_up() {
    let settings = OrchestratorSettings {
        cluster_call_timeout: Duration::from_secs(3),
        ..test_settings()
    };
    let h = setup(settings).await;
    let env = running_environment(&h.manager, None).await;

    let submitted = h.manager.submit_execution(run(&env, &["true"], None)).await.unwrap();
    assert_eq!(h.manager.executions().tracked_count().await, 1);

    // No workers: the cancellation is recorded without waiting for a run
    let canceled = tokio::time::timeout(
        Duration::from_millis(500),
        h.manager.cancel_execution(&submitted.id),
    )
    .await
    .expect("cancel of a queued execution must not wait for a worker")
    .unwrap();
    assert_eq!(canceled.status, ExecutionStatus::Canceled);
    assert_eq!(h.manager.executions().tracked_count().await, 0);

    let _workers = h.manager.executions().spawn_workers();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.gateway.exec_count().await, 0);
    assert_eq!(
        h.manager.get_execution(&submitted.id).await.unwrap().status,
        ExecutionStatus::Canceled
    );
}

#[tokio::test]
async fn test_shutdown_fails_and_releases_queued_executions() {
    let settings = OrchestratorSettings {
        execution_workers: 1,
        ..test_settings()
    };
    let h = setup(settings).await;
    h.gateway
        .script_command(
            "sleep",
            ExecScript {
                delay: Some(Duration::from_secs(30)),
                ..Default::default()
            },
        )
        .await;
    let env = running_environment(&h.manager, None).await;
    let workers = h.manager.executions().spawn_workers();

    let busy = h
        .manager
        .submit_execution(run(&env, &["sleep", "30"], None))
        .await
        .unwrap();
    wait_until(&h.manager, &busy.id, |e| e.status == ExecutionStatus::Running).await;
    let waiting = h
        .manager
        .submit_execution(run(&env, &["true"], None))
        .await
        .unwrap();

    h.manager.shutdown_token().cancel();
    for worker in workers {
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
    }

    for id in [&busy.id, &waiting.id] {
        let execution = h.manager.get_execution(id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error.as_deref(), Some("orchestrator shutting down"));
    }
    assert_eq!(h.manager.executions().tracked_count().await, 0);
}

#[tokio::test]
async fn test_full_queue_rejects_with_capacity_error() {
    let settings = OrchestratorSettings {
        execution_queue_capacity: 1,
        ..test_settings()
    };
    let h = setup(settings).await;
    let env = running_environment(&h.manager, None).await;

    h.manager.submit_execution(run(&env, &["true"], None)).await.unwrap();
    let err = h
        .manager
        .submit_execution(run(&env, &["true"], None))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Capacity(_)));

    // The rejected request left no record behind
    let all = h
        .manager
        .list_executions(&ExecutionFilter {
            environment_id: Some(env.id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_submit_requires_running_environment() {
    let h = setup(test_settings()).await;
    let env = h
        .manager
        .create_environment(CreateEnvironmentRequest {
            name: "sb-1".to_string(),
            image: "python:3.11-slim".to_string(),
            owner_id: "user-1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let err = h
        .manager
        .submit_execution(run(&env, &["true"], None))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Precondition(_)));

    let err = h
        .manager
        .submit_execution(run(&env, &[], None))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Validation(_)));
}

#[tokio::test]
async fn test_slow_execution_does_not_block_the_next() {
    let h = setup(test_settings()).await;
    h.gateway
        .script_command(
            "slow",
            ExecScript {
                delay: Some(Duration::from_secs(2)),
                ..Default::default()
            },
        )
        .await;
    h.gateway
        .script_command("fast", ExecScript::output(0, "done"))
        .await;
    let env = running_environment(&h.manager, None).await;
    let _workers = h.manager.executions().spawn_workers();

    let slow = h.manager.submit_execution(run(&env, &["slow"], None)).await.unwrap();
    let fast = h.manager.submit_execution(run(&env, &["fast"], None)).await.unwrap();

    let fast_done = wait_terminal(&h.manager, &fast.id).await;
    assert_eq!(fast_done.status, ExecutionStatus::Completed);
    assert!(!h.manager.get_execution(&slow.id).await.unwrap().status.is_terminal());

    let slow_done = wait_terminal(&h.manager, &slow.id).await;
    assert_eq!(slow_done.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_standby_pod_serves_execution_and_is_replenished() {
    let h = setup(test_settings()).await;
    let env = running_environment(
        &h.manager,
        Some(StandbyPoolPolicy {
            enabled: true,
            size: 2,
            min_ready: 1,
        }),
    )
    .await;
    h.manager.pool().tick().await.unwrap();
    assert_eq!(h.manager.pool_status().await[0].ready, 2);
    let _workers = h.manager.executions().spawn_workers();

    let submitted = h.manager.submit_execution(run(&env, &["true"], None)).await.unwrap();
    let done = wait_terminal(&h.manager, &submitted.id).await;
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert!(done.from_standby);
    assert_eq!(done.namespace.as_deref(), Some("corral-standby"));

    let status = h.manager.pool_status().await;
    assert_eq!(status[0].ready, 1);
    assert_eq!(h.gateway.pod_names("corral-standby").await.len(), 1);

    h.manager.pool().tick().await.unwrap();
    assert_eq!(h.manager.pool_status().await[0].ready, 2);
}

#[tokio::test]
async fn test_restart_marks_unfinished_executions_failed() {
    let h = setup(test_settings()).await;
    let env = running_environment(&h.manager, None).await;

    let stale = Execution {
        id: "exec-stale".to_string(),
        environment_id: env.id.clone(),
        command: vec!["sleep".to_string(), "100".to_string()],
        env_vars: BTreeMap::new(),
        timeout_secs: 300,
        status: ExecutionStatus::Running,
        owner_id: "user-1".to_string(),
        namespace: Some(env.namespace.clone()),
        pod_name: Some("exec-stale".to_string()),
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
    };
    h.store.upsert_execution(&stale).await.unwrap();

    let recovered = h.manager.executions().recover_orphans().await.unwrap();
    assert_eq!(recovered, 1);

    let after = h.manager.get_execution("exec-stale").await.unwrap();
    assert_eq!(after.status, ExecutionStatus::Failed);
    assert!(after.error.unwrap().contains("restart"));
    assert!(h
        .gateway
        .calls()
        .await
        .contains(&format!("delete_pod {}/exec-stale force=true", env.namespace)));
}

#[tokio::test]
async fn test_sync_exec_uses_primary_pod() {
    let h = setup(test_settings()).await;
    h.gateway
        .script_command("echo", ExecScript::output(0, "hi\n"))
        .await;
    let env = running_environment(&h.manager, None).await;
    let pods_before = h.gateway.total_pods().await;

    let result = h
        .manager
        .exec_sync(&env.id, vec!["echo".to_string(), "hi".to_string()], Some(5))
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "hi\n");
    assert_eq!(h.gateway.total_pods().await, pods_before);
    assert!(h
        .gateway
        .calls()
        .await
        .contains(&format!("exec_in_pod {}/primary echo hi", env.namespace)));

    let touched = h.manager.get_environment(&env.id).await.unwrap();
    assert!(touched.last_activity_at >= env.last_activity_at);
}

/// Store whose execution writes are slow, widening the window between an
/// environment read and the rest of a submission
struct SlowExecutionWrites {
    inner: Arc<dyn StateStore>,
    delay: Duration,
}

#[async_trait]
impl StateStore for SlowExecutionWrites {
    async fn upsert_environment(&self, env: &Environment) -> StoreResult<()> {
        self.inner.upsert_environment(env).await
    }
    async fn get_environment(&self, id: &str) -> StoreResult<Environment> {
        self.inner.get_environment(id).await
    }
    async fn list_environments(&self, filter: &EnvironmentFilter) -> StoreResult<Vec<Environment>> {
        self.inner.list_environments(filter).await
    }
    async fn delete_environment(&self, id: &str) -> StoreResult<()> {
        self.inner.delete_environment(id).await
    }
    async fn touch_activity(&self, id: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        self.inner.touch_activity(id, at).await
    }
    async fn upsert_execution(&self, exec: &Execution) -> StoreResult<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.upsert_execution(exec).await
    }
    async fn get_execution(&self, id: &str) -> StoreResult<Execution> {
        self.inner.get_execution(id).await
    }
    async fn list_executions(&self, filter: &ExecutionFilter) -> StoreResult<Vec<Execution>> {
        self.inner.list_executions(filter).await
    }
    async fn delete_execution(&self, id: &str) -> StoreResult<()> {
        self.inner.delete_execution(id).await
    }
    async fn append_event(&self, event: &EnvironmentEvent) -> StoreResult<()> {
        self.inner.append_event(event).await
    }
    async fn list_events(&self, environment_id: &str, limit: u32) -> StoreResult<Vec<EnvironmentEvent>> {
        self.inner.list_events(environment_id, limit).await
    }
}

#[tokio::test]
async fn test_submission_racing_delete_keeps_environment_terminating() {
    let pool = corral_storage::connect_in_memory()
        .await
        .expect("Failed to create in-memory database");
    let inner: Arc<dyn StateStore> = Arc::new(SqliteStateStore::new(pool));
    let store: Arc<dyn StateStore> = Arc::new(SlowExecutionWrites {
        inner,
        delay: Duration::from_millis(300),
    });
    let gateway = InMemoryGateway::new();
    let manager = Arc::new(SandboxManager::new(
        store,
        Arc::new(gateway.clone()),
        test_settings(),
    ));
    let env = running_environment(&manager, None).await;

    let submitter = {
        let manager = manager.clone();
        let request = run(&env, &["true"], None);
        tokio::spawn(async move { manager.submit_execution(request).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = manager.delete_environment(&env.id, false).await.unwrap();
    assert!(matches!(outcome, DeletionOutcome::Terminating(_)));
    let _ = submitter.await.unwrap();

    let after = manager.get_environment(&env.id).await.unwrap();
    assert_eq!(after.status, EnvironmentStatus::Terminating);
    assert!(after.last_activity_at.is_some());

    // A late submission is refused instead of reviving the environment
    assert!(matches!(
        manager.submit_execution(run(&env, &["true"], None)).await,
        Err(SandboxError::Precondition(_))
    ));
}
