// ABOUTME: Integration tests for environment declaration, reconciliation, retry and deletion
// ABOUTME: Drives the manager and reconciler against the in-memory cluster and an in-memory database

use corral_sandbox::{
    CreateEnvironmentRequest, DeletionOutcome, EnvironmentFilter, EnvironmentStatus, EventType,
    GatewayError, InMemoryGateway, OrchestratorSettings, ResourceSpec, SandboxError,
    SandboxManager, SqliteStateStore, StateStore, UpdateEnvironmentRequest,
};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        startup_timeout: Duration::from_secs(2),
        cluster_call_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn setup(settings: OrchestratorSettings) -> (Arc<SandboxManager>, InMemoryGateway) {
    let pool = corral_storage::connect_in_memory()
        .await
        .expect("Failed to create in-memory database");
    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::new(pool));
    let gateway = InMemoryGateway::new();
    let manager = Arc::new(SandboxManager::new(
        store,
        Arc::new(gateway.clone()),
        settings,
    ));
    (manager, gateway)
}

fn sb1() -> CreateEnvironmentRequest {
    CreateEnvironmentRequest {
        name: "sb-1".to_string(),
        image: "python:3.11-slim".to_string(),
        resources: Some(ResourceSpec {
            cpu: "500m".to_string(),
            memory: "512Mi".to_string(),
            storage: "1Gi".to_string(),
        }),
        owner_id: "user-1".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_declared_environment_reaches_running() {
    let (manager, gateway) = setup(test_settings()).await;

    let env = manager.create_environment(sb1()).await.unwrap();
    assert_eq!(env.status, EnvironmentStatus::Pending);
    assert!(env.started_at.is_none());
    assert!(env.namespace.starts_with("corral-env-"));

    let summary = manager.reconciler().tick().await.unwrap();
    assert_eq!(summary.provisioned, 1);

    let env = manager.get_environment(&env.id).await.unwrap();
    assert_eq!(env.status, EnvironmentStatus::Running);
    assert!(env.started_at.is_some());
    assert_eq!(env.retry_count, 0);
    assert_eq!(env.pod_name.as_deref(), Some("primary"));
    assert_eq!(gateway.pod_names(&env.namespace).await, vec!["primary".to_string()]);

    let events = manager.list_events(&env.id, 10).await.unwrap();
    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(types, vec![EventType::Provisioned, EventType::Created]);
}

#[tokio::test]
async fn test_retry_budget_exhausts_then_operator_retry_recovers() {
    let settings = OrchestratorSettings {
        max_retries: 5,
        ..test_settings()
    };
    let (manager, gateway) = setup(settings).await;
    gateway
        .fail_all_pod_creations(Some(GatewayError::Connection("scheduler busy".into())))
        .await;

    let env = manager.create_environment(sb1()).await.unwrap();
    for attempt in 1..=5u32 {
        manager.reconciler().tick().await.unwrap();
        let current = manager.get_environment(&env.id).await.unwrap();
        assert_eq!(current.retry_count, attempt);
        assert!(current.retry_count <= 5);
        assert!(current.last_error.is_some());
        assert!(current.last_attempt_at.is_some());
        let expected = if attempt < 5 {
            EnvironmentStatus::Pending
        } else {
            EnvironmentStatus::Failed
        };
        assert_eq!(current.status, expected);
    }

    // Exhausted: further ticks make no cluster calls for it
    let creates = gateway.call_count("create_pod").await;
    manager.reconciler().tick().await.unwrap();
    assert_eq!(gateway.call_count("create_pod").await, creates);

    let events = manager.list_events(&env.id, 1).await.unwrap();
    assert_eq!(events[0].event_type, EventType::RetriesExhausted);

    let retried = manager.retry_reconciliation(&env.id).await.unwrap();
    assert_eq!(retried.status, EnvironmentStatus::Pending);
    assert_eq!(retried.retry_count, 0);

    gateway.fail_all_pod_creations(None).await;
    manager.reconciler().tick().await.unwrap();
    let env = manager.get_environment(&env.id).await.unwrap();
    assert_eq!(env.status, EnvironmentStatus::Running);
    assert!(env.last_error.is_none());
}

#[tokio::test]
async fn test_permanent_error_fails_fast() {
    let (manager, gateway) = setup(test_settings()).await;
    gateway
        .fail_all_pod_creations(Some(GatewayError::QuotaExceeded("cpu".into())))
        .await;

    let env = manager.create_environment(sb1()).await.unwrap();
    manager.reconciler().tick().await.unwrap();

    let env = manager.get_environment(&env.id).await.unwrap();
    assert_eq!(env.status, EnvironmentStatus::Failed);
    assert_eq!(env.retry_count, manager.settings().max_retries);
    assert!(env.last_error.unwrap().contains("Quota exceeded"));
}

#[tokio::test]
async fn test_interrupted_provisioning_resumes_without_duplicates() {
    let (manager, gateway) = setup(test_settings()).await;
    gateway
        .fail_next_pod_creations(1, GatewayError::Connection("connection reset".into()))
        .await;

    let env = manager.create_environment(sb1()).await.unwrap();
    manager.reconciler().tick().await.unwrap();
    assert!(gateway.has_namespace(&env.namespace).await);
    assert_eq!(
        manager.get_environment(&env.id).await.unwrap().status,
        EnvironmentStatus::Pending
    );

    manager.reconciler().tick().await.unwrap();
    manager.reconciler().reconcile_one(&env.id).await.unwrap();

    assert_eq!(
        manager.get_environment(&env.id).await.unwrap().status,
        EnvironmentStatus::Running
    );
    assert_eq!(gateway.pod_names(&env.namespace).await.len(), 1);
    assert_eq!(gateway.total_pods().await, 1);
}

#[tokio::test]
async fn test_soft_delete_is_torn_down_by_reconciler() {
    let (manager, gateway) = setup(test_settings()).await;
    let env = manager.create_environment(sb1()).await.unwrap();
    manager.reconciler().tick().await.unwrap();

    let outcome = manager.delete_environment(&env.id, false).await.unwrap();
    match outcome {
        DeletionOutcome::Terminating(e) => assert_eq!(e.status, EnvironmentStatus::Terminating),
        DeletionOutcome::Removed => panic!("soft delete must not remove the record"),
    }
    // The cluster is untouched until the reconciler runs
    assert!(gateway.has_namespace(&env.namespace).await);

    let summary = manager.reconciler().tick().await.unwrap();
    assert_eq!(summary.terminated, 1);
    assert!(!gateway.has_namespace(&env.namespace).await);

    let env = manager.get_environment(&env.id).await.unwrap();
    assert_eq!(env.status, EnvironmentStatus::Terminated);
    assert!(env.terminated_at.is_some());

    // Deleting again is a no-op
    manager.delete_environment(&env.id, false).await.unwrap();
    manager.reconciler().tick().await.unwrap();
}

#[tokio::test]
async fn test_force_delete_removes_everything() {
    let (manager, gateway) = setup(test_settings()).await;
    let env = manager.create_environment(sb1()).await.unwrap();
    manager.reconciler().tick().await.unwrap();

    let outcome = manager.delete_environment(&env.id, true).await.unwrap();
    assert!(matches!(outcome, DeletionOutcome::Removed));
    assert!(!gateway.has_namespace(&env.namespace).await);
    assert_eq!(gateway.total_pods().await, 0);
    assert!(matches!(
        manager.get_environment(&env.id).await,
        Err(SandboxError::EnvironmentNotFound(_))
    ));
}

#[tokio::test]
async fn test_invalid_declaration_never_reaches_cluster() {
    let (manager, gateway) = setup(test_settings()).await;

    let mut request = sb1();
    request.resources = Some(ResourceSpec {
        cpu: "lots".to_string(),
        ..Default::default()
    });
    let err = manager.create_environment(request).await.unwrap_err();
    assert!(matches!(err, SandboxError::Validation(_)));

    let mut request = sb1();
    request.image = String::new();
    assert!(matches!(
        manager.create_environment(request).await,
        Err(SandboxError::Validation(_))
    ));

    assert!(manager
        .list_environments(&EnvironmentFilter::default())
        .await
        .unwrap()
        .is_empty());
    manager.reconciler().tick().await.unwrap();
    assert!(gateway.calls().await.is_empty());
}

#[tokio::test]
async fn test_update_limits_image_changes_to_unprovisioned_environments() {
    let (manager, _gateway) = setup(test_settings()).await;
    let env = manager.create_environment(sb1()).await.unwrap();

    let updated = manager
        .update_environment(
            &env.id,
            UpdateEnvironmentRequest {
                image: Some("python:3.12-slim".to_string()),
                labels: Some(BTreeMap::from([("team".to_string(), "ml".to_string())])),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.image, "python:3.12-slim");

    manager.reconciler().tick().await.unwrap();
    let err = manager
        .update_environment(
            &env.id,
            UpdateEnvironmentRequest {
                image: Some("python:3.13-slim".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::InvalidStateTransition(_)));

    let renamed = manager
        .update_environment(
            &env.id,
            UpdateEnvironmentRequest {
                name: Some("sb-renamed".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.name, "sb-renamed");

    let labelled = manager
        .list_environments(&EnvironmentFilter {
            labels: BTreeMap::from([("team".to_string(), "ml".to_string())]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(labelled.len(), 1);
}

#[tokio::test]
async fn test_retry_rejected_for_running_environment() {
    let (manager, _gateway) = setup(test_settings()).await;
    let env = manager.create_environment(sb1()).await.unwrap();
    manager.reconciler().tick().await.unwrap();

    assert!(matches!(
        manager.retry_reconciliation(&env.id).await,
        Err(SandboxError::InvalidStateTransition(_))
    ));
}

#[tokio::test]
async fn test_idle_environment_is_terminated() {
    let settings = OrchestratorSettings {
        idle_timeout: Duration::from_millis(10),
        ..test_settings()
    };
    let (manager, gateway) = setup(settings).await;
    let env = manager.create_environment(sb1()).await.unwrap();
    manager.reconciler().tick().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let summary = manager.reconciler().tick().await.unwrap();
    assert_eq!(summary.idle_expired, 1);
    assert_eq!(
        manager.get_environment(&env.id).await.unwrap().status,
        EnvironmentStatus::Terminating
    );

    manager.reconciler().tick().await.unwrap();
    assert!(!gateway.has_namespace(&env.namespace).await);
}

#[tokio::test]
async fn test_logs_batch_and_follow_until_deletion() {
    let (manager, gateway) = setup(test_settings()).await;
    let env = manager.create_environment(sb1()).await.unwrap();
    manager.reconciler().tick().await.unwrap();
    gateway
        .append_pod_logs(&env.namespace, "primary", &["booting", "ready", "serving"])
        .await;

    let batch = manager.get_logs(&env.id, Some(2), false).await.unwrap();
    assert_eq!(batch, "ready\nserving\n");

    let mut lines = manager.follow_logs(&env.id, None, false).await.unwrap();
    assert_eq!(lines.next().await.unwrap().unwrap(), "booting");
    assert_eq!(lines.next().await.unwrap().unwrap(), "ready");
    assert_eq!(lines.next().await.unwrap().unwrap(), "serving");

    gateway
        .append_pod_logs(&env.namespace, "primary", &["late line"])
        .await;
    assert_eq!(lines.next().await.unwrap().unwrap(), "late line");

    manager.delete_environment(&env.id, true).await.unwrap();
    let rest = tokio::time::timeout(Duration::from_secs(5), lines.collect::<Vec<_>>())
        .await
        .expect("follow stream must end once the environment is gone");
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_health_reports_unreachable_cluster() {
    let (manager, gateway) = setup(test_settings()).await;

    let health = manager.health_info().await;
    assert!(health.cluster_connected);
    assert!(health.cluster_version.is_some());
    assert!(health.capacity.is_some());

    gateway.set_healthy(false).await;
    let health = manager.health_info().await;
    assert!(!health.cluster_connected);
    assert!(health.error.is_some());
    assert_eq!(health.gateway, "memory");
}
