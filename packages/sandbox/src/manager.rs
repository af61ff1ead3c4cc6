// ABOUTME: Sandbox manager facade exposing environment, execution, log, session and pool operations
// ABOUTME: Validates declarations, records lifecycle events and delegates to the background components

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Result, SandboxError};
use crate::executor::{capture_pipe, render_output, ExecutionEngine, SubmitExecution};
use crate::gateway::{ClusterCapacity, ClusterGateway, ExecIo, ExecRequest, LogOptions};
use crate::naming;
use crate::pool::{PoolStatus, StandbyPool};
use crate::provisioner::Provisioner;
use crate::reconciler::{transition, Reconciler};
use crate::session::{SessionHandle, SessionInfo, SessionProxy, SessionRegistry};
use crate::settings::OrchestratorSettings;
use crate::storage::StateStore;
use crate::types::{
    Environment, EnvironmentEvent, EnvironmentFilter, EnvironmentStatus, EventType, Execution,
    ExecutionFilter, ExecutionStatus, IsolationPolicy, NodeAffinity, ResourceSpec,
    StandbyPoolPolicy,
};
use crate::validation;

/// Default number of lines returned by a non-follow log request
pub const DEFAULT_LOG_TAIL: u32 = 1000;
/// How often a log follower checks that its environment still exists
const LOG_FOLLOW_CHECK: Duration = Duration::from_secs(2);

/// Declaration of a new environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateEnvironmentRequest {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub resources: Option<ResourceSpec>,
    #[serde(default)]
    pub isolation: Option<IsolationPolicy>,
    #[serde(default)]
    pub node_affinity: Option<NodeAffinity>,
    #[serde(default)]
    pub standby_pool: Option<StandbyPoolPolicy>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    pub owner_id: String,
}

/// Partial update. Image and resources may only change before the environment runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateEnvironmentRequest {
    pub name: Option<String>,
    pub image: Option<String>,
    pub resources: Option<ResourceSpec>,
    pub labels: Option<BTreeMap<String, String>>,
    pub standby_pool: Option<StandbyPoolPolicy>,
}

/// What a delete request left behind
#[derive(Debug, Clone)]
pub enum DeletionOutcome {
    /// Marked for teardown by the reconciler (or left there after a failed inline teardown)
    Terminating(Environment),
    /// Cluster resources and the record are gone
    Removed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthInfo {
    pub gateway: String,
    pub cluster_connected: bool,
    pub cluster_version: Option<String>,
    pub capacity: Option<ClusterCapacity>,
    pub active_sessions: usize,
    pub error: Option<String>,
}

pub struct SandboxManager {
    store: Arc<dyn StateStore>,
    provisioner: Arc<Provisioner>,
    settings: Arc<OrchestratorSettings>,
    reconciler: Arc<Reconciler>,
    pool: Arc<StandbyPool>,
    executions: Arc<ExecutionEngine>,
    sessions: Arc<SessionProxy>,
    shutdown: CancellationToken,
}

impl SandboxManager {
    /// Wire every component over one store, one gateway and one shutdown signal
    pub fn new(
        store: Arc<dyn StateStore>,
        gateway: Arc<dyn ClusterGateway>,
        settings: OrchestratorSettings,
    ) -> Self {
        let settings = Arc::new(settings);
        let shutdown = CancellationToken::new();
        let provisioner = Arc::new(Provisioner::new(
            gateway,
            settings.cluster_call_timeout,
            settings.startup_timeout,
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            provisioner.clone(),
            settings.clone(),
        ));
        let pool = Arc::new(StandbyPool::new(
            store.clone(),
            provisioner.clone(),
            settings.standby_namespace.clone(),
            settings.pool_interval,
        ));
        let executions = Arc::new(ExecutionEngine::new(
            store.clone(),
            provisioner.clone(),
            pool.clone(),
            settings.clone(),
            shutdown.clone(),
        ));
        let sessions = Arc::new(SessionProxy::new(
            store.clone(),
            provisioner.clone(),
            Arc::new(SessionRegistry::new(settings.max_sessions)),
            &settings,
            shutdown.clone(),
        ));

        Self {
            store,
            provisioner,
            settings,
            reconciler,
            pool,
            executions,
            sessions,
            shutdown,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn pool(&self) -> &Arc<StandbyPool> {
        &self.pool
    }

    pub fn executions(&self) -> &Arc<ExecutionEngine> {
        &self.executions
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    // ========================================================================
    // ENVIRONMENTS
    // ========================================================================

    /// Validate and persist a declaration as `pending`; provisioning happens in the background
    pub async fn create_environment(&self, request: CreateEnvironmentRequest) -> Result<Environment> {
        let resources = request.resources.unwrap_or_default();
        validation::validate_name(&request.name)?;
        validation::validate_image(&request.image)?;
        validation::validate_resources(&resources, &self.settings)?;
        if let Some(isolation) = &request.isolation {
            validation::validate_isolation(isolation, &self.settings)?;
        }
        if let Some(affinity) = &request.node_affinity {
            validation::validate_node_affinity(affinity)?;
        }
        if let Some(policy) = &request.standby_pool {
            validation::validate_pool_policy(policy)?;
        }
        if request.owner_id.trim().is_empty() {
            return Err(SandboxError::Validation("owner_id is required".to_string()));
        }

        let id = naming::new_environment_id();
        let env = Environment {
            namespace: naming::namespace_for(&id),
            id,
            name: request.name,
            image: request.image,
            resources,
            status: EnvironmentStatus::Pending,
            pod_name: None,
            isolation: request.isolation,
            node_affinity: request.node_affinity,
            standby_pool: request.standby_pool,
            labels: request.labels,
            env_vars: request.env_vars,
            owner_id: request.owner_id,
            created_at: Utc::now(),
            started_at: None,
            terminated_at: None,
            last_activity_at: None,
            retry_count: 0,
            last_error: None,
            last_attempt_at: None,
        };

        self.store.upsert_environment(&env).await?;
        self.store
            .append_event(
                &EnvironmentEvent::new(&env.id, EventType::Created, "Environment declared")
                    .with_detail(serde_json::json!({ "image": env.image, "resources": env.resources })),
            )
            .await?;

        info!(environment_id = %env.id, name = %env.name, "Environment created");
        Ok(env)
    }

    pub async fn get_environment(&self, id: &str) -> Result<Environment> {
        self.store
            .get_environment(id)
            .await
            .map_err(|e| SandboxError::environment_lookup(id, e))
    }

    pub async fn list_environments(&self, filter: &EnvironmentFilter) -> Result<Vec<Environment>> {
        Ok(self.store.list_environments(filter).await?)
    }

    pub async fn update_environment(
        &self,
        id: &str,
        patch: UpdateEnvironmentRequest,
    ) -> Result<Environment> {
        let mut env = self.get_environment(id).await?;
        if matches!(
            env.status,
            EnvironmentStatus::Terminating | EnvironmentStatus::Terminated
        ) {
            return Err(SandboxError::InvalidStateTransition(format!(
                "environment {} is {} and can no longer be updated",
                id, env.status
            )));
        }

        let mut changed = Vec::new();
        if let Some(name) = patch.name {
            validation::validate_name(&name)?;
            env.name = name;
            changed.push("name");
        }
        if patch.image.is_some() || patch.resources.is_some() {
            if !matches!(env.status, EnvironmentStatus::Pending | EnvironmentStatus::Failed) {
                return Err(SandboxError::InvalidStateTransition(format!(
                    "image and resources of environment {} cannot change while it is {}",
                    id, env.status
                )));
            }
            if let Some(image) = patch.image {
                validation::validate_image(&image)?;
                env.image = image;
                changed.push("image");
            }
            if let Some(resources) = patch.resources {
                validation::validate_resources(&resources, &self.settings)?;
                env.resources = resources;
                changed.push("resources");
            }
        }
        if let Some(labels) = patch.labels {
            env.labels = labels;
            changed.push("labels");
        }
        if let Some(policy) = patch.standby_pool {
            validation::validate_pool_policy(&policy)?;
            env.standby_pool = Some(policy);
            changed.push("standby_pool");
        }

        if changed.is_empty() {
            return Ok(env);
        }
        self.store.upsert_environment(&env).await?;
        self.store
            .append_event(
                &EnvironmentEvent::new(&env.id, EventType::Updated, "Environment updated")
                    .with_detail(serde_json::json!({ "fields": changed })),
            )
            .await?;
        info!(environment_id = %env.id, fields = ?changed, "Environment updated");
        Ok(env)
    }

    /// Soft delete hands teardown to the reconciler; `force` tears down inline and
    /// removes the record with its executions and events.
    pub async fn delete_environment(&self, id: &str, force: bool) -> Result<DeletionOutcome> {
        let mut env = self.get_environment(id).await?;

        if env.status == EnvironmentStatus::Terminated {
            if force {
                self.store.delete_environment(id).await?;
                info!(environment_id = %id, "Terminated environment record removed");
                return Ok(DeletionOutcome::Removed);
            }
            return Ok(DeletionOutcome::Terminating(env));
        }

        if env.status != EnvironmentStatus::Terminating {
            transition(&mut env, EnvironmentStatus::Terminating)?;
            self.store.upsert_environment(&env).await?;
            self.store
                .append_event(
                    &EnvironmentEvent::new(&env.id, EventType::DeletionRequested, "Deletion requested")
                        .with_detail(serde_json::json!({ "force": force })),
                )
                .await?;
        }
        self.release_environment_work(&env).await;

        if !force {
            info!(environment_id = %id, "Environment marked for teardown");
            return Ok(DeletionOutcome::Terminating(env));
        }

        match self.provisioner.teardown_environment(&env, true).await {
            Ok(()) => {
                self.store.delete_environment(id).await?;
                info!(environment_id = %id, "Environment force-deleted");
                Ok(DeletionOutcome::Removed)
            }
            Err(e) => {
                warn!(
                    environment_id = %id,
                    "Inline teardown failed, leaving it to the reconciler: {}", e
                );
                env.last_error = Some(e.to_string());
                self.store.upsert_environment(&env).await?;
                self.store
                    .append_event(&EnvironmentEvent::new(
                        &env.id,
                        EventType::TeardownFailed,
                        e.to_string(),
                    ))
                    .await?;
                Ok(DeletionOutcome::Terminating(env))
            }
        }
    }

    /// Cancel active executions and close sessions of an environment on its way out
    async fn release_environment_work(&self, env: &Environment) {
        let active = match self
            .executions
            .list(&ExecutionFilter {
                environment_id: Some(env.id.clone()),
                statuses: vec![
                    ExecutionStatus::Pending,
                    ExecutionStatus::Queued,
                    ExecutionStatus::Running,
                ],
                ..Default::default()
            })
            .await
        {
            Ok(active) => active,
            Err(e) => {
                warn!(environment_id = %env.id, "Could not list executions to cancel: {}", e);
                Vec::new()
            }
        };
        for execution in active {
            if let Err(e) = self.executions.cancel(&execution.id).await {
                warn!(execution_id = %execution.id, "Could not cancel execution: {}", e);
            }
        }

        for session in self.sessions.list_sessions().await {
            if session.environment_id == env.id {
                if let Err(e) = self.sessions.close_session(&session.id).await {
                    warn!(session_id = %session.id, "Could not close session: {}", e);
                }
            }
        }
    }

    /// Operator retry: back to `pending` with a fresh retry budget
    pub async fn retry_reconciliation(&self, id: &str) -> Result<Environment> {
        let mut env = self.get_environment(id).await?;
        if !matches!(env.status, EnvironmentStatus::Failed | EnvironmentStatus::Pending) {
            return Err(SandboxError::InvalidStateTransition(format!(
                "environment {} is {}; only failed or pending environments can be retried",
                id, env.status
            )));
        }

        let previous_error = env.last_error.take();
        transition(&mut env, EnvironmentStatus::Pending)?;
        env.retry_count = 0;
        self.store.upsert_environment(&env).await?;
        self.store
            .append_event(
                &EnvironmentEvent::new(&env.id, EventType::RetryRequested, "Reconciliation retry requested")
                    .with_detail(serde_json::json!({ "previous_error": previous_error })),
            )
            .await?;

        info!(environment_id = %id, "Reconciliation retry requested");
        Ok(env)
    }

    pub async fn list_events(&self, id: &str, limit: u32) -> Result<Vec<EnvironmentEvent>> {
        self.get_environment(id).await?;
        Ok(self.store.list_events(id, limit).await?)
    }

    // ========================================================================
    // EXECUTIONS
    // ========================================================================

    pub async fn submit_execution(&self, request: SubmitExecution) -> Result<Execution> {
        self.executions.submit(request).await
    }

    pub async fn get_execution(&self, id: &str) -> Result<Execution> {
        self.executions.get(id).await
    }

    pub async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        self.executions.list(filter).await
    }

    pub async fn cancel_execution(&self, id: &str) -> Result<Execution> {
        self.executions.cancel(id).await
    }

    /// Run a command in the environment's primary pod and wait for it
    pub async fn exec_sync(
        &self,
        environment_id: &str,
        command: Vec<String>,
        timeout_secs: Option<u64>,
    ) -> Result<SyncExecResult> {
        validation::validate_command(&command)?;
        let timeout = validation::resolve_timeout(timeout_secs, &self.settings)?;
        let env = self.running_environment(environment_id).await?;
        let pod = env.pod_name.clone().unwrap_or_else(|| naming::PRIMARY_POD.to_string());

        if !self.store.touch_activity(&env.id, Utc::now()).await? {
            return Err(SandboxError::Precondition(format!(
                "environment {} is no longer running",
                env.id
            )));
        }

        let (stdout, stdout_task) = capture_pipe(self.settings.max_output_bytes);
        let (stderr, stderr_task) = capture_pipe(self.settings.max_output_bytes);
        let cancel = self.shutdown.child_token();
        let started = Instant::now();

        let result = tokio::time::timeout(
            timeout,
            self.provisioner.gateway().exec_in_pod(
                &env.namespace,
                &pod,
                ExecRequest {
                    command,
                    env: env.env_vars.clone(),
                },
                ExecIo {
                    stdin: None,
                    stdout,
                    stderr,
                },
                cancel.clone(),
            ),
        )
        .await;

        let exit_code = match result {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                cancel.cancel();
                return Err(SandboxError::Timeout(format!(
                    "command did not finish within {}s",
                    timeout.as_secs()
                )));
            }
        };

        let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
        let (stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();
        Ok(SyncExecResult {
            stdout: render_output(&stdout, stdout_truncated),
            stderr: render_output(&stderr, stderr_truncated),
            exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    // ========================================================================
    // LOGS
    // ========================================================================

    /// Bounded batch of the primary pod's most recent log lines
    pub async fn get_logs(
        &self,
        environment_id: &str,
        tail_lines: Option<u32>,
        timestamps: bool,
    ) -> Result<String> {
        let env = self.running_environment(environment_id).await?;
        let pod = env.pod_name.as_deref().unwrap_or(naming::PRIMARY_POD);
        let options = LogOptions {
            tail_lines: Some(tail_lines.unwrap_or(DEFAULT_LOG_TAIL)),
            timestamps,
        };
        Ok(self
            .provisioner
            .call(self.provisioner.gateway().get_pod_logs(&env.namespace, pod, options))
            .await?)
    }

    /// Ordered, unbounded log lines. The stream ends when the environment stops
    /// running or is deleted, on shutdown, or when the caller drops it.
    pub async fn follow_logs(
        &self,
        environment_id: &str,
        tail_lines: Option<u32>,
        timestamps: bool,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let env = self.running_environment(environment_id).await?;
        let pod = env
            .pod_name
            .clone()
            .unwrap_or_else(|| naming::PRIMARY_POD.to_string());
        let options = LogOptions {
            tail_lines,
            timestamps,
        };
        let mut chunks = self
            .provisioner
            .call(
                self.provisioner
                    .gateway()
                    .stream_pod_logs(&env.namespace, &pod, options, true),
            )
            .await?;

        let store = self.store.clone();
        let shutdown = self.shutdown.clone();
        let id = env.id.clone();

        let lines = async_stream::stream! {
            let mut pending: Vec<u8> = Vec::new();
            let mut check = tokio::time::interval(LOG_FOLLOW_CHECK);
            check.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = check.tick() => {
                        match store.get_environment(&id).await {
                            Ok(env) if env.is_running() => {}
                            _ => break,
                        }
                    }
                    chunk = chunks.next() => match chunk {
                        None => break,
                        Some(Err(e)) => {
                            yield Err(SandboxError::Cluster(e));
                            break;
                        }
                        Some(Ok(bytes)) => {
                            pending.extend_from_slice(&bytes);
                            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                                let line: Vec<u8> = pending.drain(..=pos).collect();
                                yield Ok(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
                            }
                        }
                    },
                }
            }

            if !pending.is_empty() {
                yield Ok(String::from_utf8_lossy(&pending).into_owned());
            }
        };
        Ok(Box::pin(lines))
    }

    // ========================================================================
    // SESSIONS, POOL, HEALTH
    // ========================================================================

    pub async fn attach_session<S>(
        &self,
        environment_id: &str,
        owner_id: &str,
        connection: S,
    ) -> Result<SessionHandle>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.sessions.attach(environment_id, owner_id, connection).await
    }

    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        self.sessions.close_session(session_id).await
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list_sessions().await
    }

    pub async fn pool_status(&self) -> Vec<PoolStatus> {
        self.pool.status().await
    }

    /// Cluster reachability, version and capacity. An unreachable cluster is
    /// reported in the result rather than as an error.
    pub async fn health_info(&self) -> HealthInfo {
        let gateway = self.provisioner.gateway();
        let mut info = HealthInfo {
            gateway: gateway.name().to_string(),
            cluster_connected: false,
            cluster_version: None,
            capacity: None,
            active_sessions: self.sessions.registry().len().await,
            error: None,
        };

        if let Err(e) = self.provisioner.call(gateway.health_check()).await {
            info.error = Some(e.to_string());
            return info;
        }
        info.cluster_connected = true;

        match self.provisioner.call(gateway.get_server_version()).await {
            Ok(version) => info.cluster_version = Some(format!("{} {}", version.platform, version.version)),
            Err(e) => warn!("Could not read cluster version: {}", e),
        }
        match self.provisioner.call(gateway.get_cluster_capacity()).await {
            Ok(capacity) => info.capacity = Some(capacity),
            Err(e) => warn!("Could not read cluster capacity: {}", e),
        }
        info
    }

    async fn running_environment(&self, id: &str) -> Result<Environment> {
        let env = self.get_environment(id).await?;
        if env.status != EnvironmentStatus::Running {
            return Err(SandboxError::Precondition(format!(
                "environment {} is {}, not running",
                env.id, env.status
            )));
        }
        Ok(env)
    }
}
