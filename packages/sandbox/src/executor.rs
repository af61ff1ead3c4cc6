// ABOUTME: Execution Engine running asynchronous commands in standby or ephemeral pods
// ABOUTME: Bounded FIFO queue, fixed worker pool, per-execution cancellation, timeouts and output capture

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SandboxError};
use crate::gateway::{ExecIo, ExecRequest, GatewayError};
use crate::naming::{self, PoolKey};
use crate::pool::StandbyPool;
use crate::provisioner::Provisioner;
use crate::settings::OrchestratorSettings;
use crate::storage::StateStore;
use crate::types::{
    Environment, EnvironmentStatus, Execution, ExecutionFilter, ExecutionStatus,
};
use crate::validation;

const CAPTURE_PIPE_SIZE: usize = 64 * 1024;
const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Request to run a command asynchronously
#[derive(Debug, Clone)]
pub struct SubmitExecution {
    pub environment_id: String,
    pub command: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub timeout_secs: Option<u64>,
    pub owner_id: String,
}

struct InFlight {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

enum RunOutcome {
    Exited(i64),
    TimedOut(Duration),
    Canceled,
    Errored(GatewayError),
}

pub struct ExecutionEngine {
    store: Arc<dyn StateStore>,
    provisioner: Arc<Provisioner>,
    pool: Arc<StandbyPool>,
    settings: Arc<OrchestratorSettings>,
    sender: mpsc::Sender<String>,
    receiver: Arc<Mutex<mpsc::Receiver<String>>>,
    in_flight: RwLock<HashMap<String, InFlight>>,
    done_senders: Mutex<HashMap<String, watch::Sender<bool>>>,
    shutdown: CancellationToken,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        provisioner: Arc<Provisioner>,
        pool: Arc<StandbyPool>,
        settings: Arc<OrchestratorSettings>,
        shutdown: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(settings.execution_queue_capacity);
        Self {
            store,
            provisioner,
            pool,
            settings,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            in_flight: RwLock::new(HashMap::new()),
            done_senders: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    // ========================================================================
    // SUBMISSION AND CANCELLATION
    // ========================================================================

    /// Validate, persist as `pending` and enqueue. Never waits for a pod.
    pub async fn submit(&self, request: SubmitExecution) -> Result<Execution> {
        validation::validate_command(&request.command)?;
        let timeout = validation::resolve_timeout(request.timeout_secs, &self.settings)?;

        let env = self
            .store
            .get_environment(&request.environment_id)
            .await
            .map_err(|e| SandboxError::environment_lookup(&request.environment_id, e))?;
        if env.status != EnvironmentStatus::Running {
            return Err(SandboxError::Precondition(format!(
                "environment {} is {}, not running",
                env.id, env.status
            )));
        }

        // Reserve the queue slot first so a full queue rejects before anything is written
        let permit = self.sender.try_reserve().map_err(|_| {
            SandboxError::Capacity(format!(
                "execution queue is full ({} pending)",
                self.settings.execution_queue_capacity
            ))
        })?;

        if !self.store.touch_activity(&env.id, Utc::now()).await? {
            return Err(SandboxError::Precondition(format!(
                "environment {} is no longer running",
                env.id
            )));
        }

        let execution = Execution {
            id: naming::new_execution_id(),
            environment_id: env.id.clone(),
            command: request.command,
            env_vars: request.env_vars,
            timeout_secs: timeout.as_secs(),
            status: ExecutionStatus::Pending,
            owner_id: request.owner_id,
            namespace: None,
            pod_name: None,
            from_standby: false,
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            completed_at: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            error: None,
            duration_ms: None,
        };
        self.store.upsert_execution(&execution).await?;

        let (done_tx, done_rx) = watch::channel(false);
        self.in_flight.write().await.insert(
            execution.id.clone(),
            InFlight {
                cancel: self.shutdown.child_token(),
                done: done_rx,
            },
        );
        self.done_senders
            .lock()
            .await
            .insert(execution.id.clone(), done_tx);

        permit.send(execution.id.clone());
        info!(
            execution_id = %execution.id,
            environment_id = %execution.environment_id,
            "Execution submitted"
        );
        Ok(execution)
    }

    /// Cancel a pending, queued or running execution. A running execution's pod is
    /// destroyed before this returns, bounded by the cluster call deadline.
    pub async fn cancel(&self, id: &str) -> Result<Execution> {
        let mut execution = self
            .store
            .get_execution(id)
            .await
            .map_err(|e| SandboxError::execution_lookup(id, e))?;
        if !execution.status.is_cancelable() {
            return Err(SandboxError::InvalidStateTransition(format!(
                "execution {} is already {}",
                id, execution.status
            )));
        }

        let in_flight = self
            .in_flight
            .read()
            .await
            .get(id)
            .map(|f| (f.cancel.clone(), f.done.clone()));

        match in_flight {
            Some((token, mut done)) => {
                token.cancel();
                if execution.status == ExecutionStatus::Running {
                    let deadline = self.settings.cluster_call_timeout * 2;
                    if tokio::time::timeout(deadline, done.wait_for(|d| *d))
                        .await
                        .is_err()
                    {
                        warn!(execution_id = %id, "Cancellation still in progress after {:?}", deadline);
                    }
                } else {
                    // Not yet running: record the cancellation now, the worker will skip it
                    mark_terminal(&mut execution, ExecutionStatus::Canceled, Some("canceled".into()));
                    self.store.upsert_execution(&execution).await?;
                    self.finish(id).await;
                }
            }
            None => {
                // Owned by no worker in this process (e.g. left over from a restart)
                mark_terminal(&mut execution, ExecutionStatus::Canceled, Some("canceled".into()));
                self.store.upsert_execution(&execution).await?;
            }
        }

        info!(execution_id = %id, "Execution canceled");
        self.store
            .get_execution(id)
            .await
            .map_err(|e| SandboxError::execution_lookup(id, e))
    }

    pub async fn get(&self, id: &str) -> Result<Execution> {
        self.store
            .get_execution(id)
            .await
            .map_err(|e| SandboxError::execution_lookup(id, e))
    }

    pub async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        Ok(self.store.list_executions(filter).await?)
    }

    // ========================================================================
    // WORKERS
    // ========================================================================

    /// Mark executions a previous process left unfinished as failed and remove their pods
    pub async fn recover_orphans(&self) -> Result<usize> {
        let stale = self
            .store
            .list_executions(&ExecutionFilter {
                statuses: vec![
                    ExecutionStatus::Pending,
                    ExecutionStatus::Queued,
                    ExecutionStatus::Running,
                ],
                ..Default::default()
            })
            .await?;

        let owned = self.in_flight.read().await;
        let mut recovered = 0;
        for mut execution in stale.into_iter().filter(|e| !owned.contains_key(&e.id)) {
            if let (Some(ns), Some(pod)) = (&execution.namespace, &execution.pod_name) {
                self.provisioner.destroy_pod(ns, pod, true).await;
            }
            mark_terminal(
                &mut execution,
                ExecutionStatus::Failed,
                Some("interrupted by orchestrator restart".into()),
            );
            self.store.upsert_execution(&execution).await?;
            recovered += 1;
        }
        if recovered > 0 {
            warn!("Marked {} interrupted executions as failed", recovered);
        }
        Ok(recovered)
    }

    /// Start the fixed-size worker pool draining the shared queue
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.settings.execution_workers)
            .map(|worker| {
                let engine = self.clone();
                tokio::spawn(async move { engine.worker_loop(worker).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize) {
        debug!(worker, "Execution worker started");
        loop {
            let next = {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => None,
                    id = receiver.recv() => id,
                }
            };
            let Some(id) = next else { break };
            if let Err(e) = self.process(&id).await {
                error!(execution_id = %id, worker, "Execution processing failed: {}", e);
                self.fail_quietly(&id, &e.to_string()).await;
            }
            self.finish(&id).await;
        }
        if self.shutdown.is_cancelled() {
            self.drain_queue().await;
        }
        debug!(worker, "Execution worker stopped");
    }

    /// Fail and release every execution still waiting in the queue at shutdown
    async fn drain_queue(&self) {
        let mut receiver = self.receiver.lock().await;
        while let Ok(id) = receiver.try_recv() {
            self.fail_quietly(&id, "orchestrator shutting down").await;
            self.finish(&id).await;
        }
    }

    /// Executions submitted but not yet finished by a worker
    pub async fn tracked_count(&self) -> usize {
        self.in_flight.read().await.len()
    }

    async fn finish(&self, id: &str) {
        self.in_flight.write().await.remove(id);
        if let Some(done) = self.done_senders.lock().await.remove(id) {
            let _ = done.send(true);
        }
    }

    async fn fail_quietly(&self, id: &str, message: &str) {
        if let Ok(mut execution) = self.store.get_execution(id).await {
            if !execution.status.is_terminal() {
                mark_terminal(&mut execution, ExecutionStatus::Failed, Some(message.to_string()));
                if let Err(e) = self.store.upsert_execution(&execution).await {
                    error!(execution_id = %id, "Could not record failure: {}", e);
                }
            }
        }
    }

    async fn process(&self, id: &str) -> Result<()> {
        let token = match self.in_flight.read().await.get(id) {
            Some(f) => f.cancel.clone(),
            None => self.shutdown.child_token(),
        };

        let mut execution = self.get(id).await?;
        if execution.status.is_terminal() {
            debug!(execution_id = %id, "Skipping execution that is already {}", execution.status);
            return Ok(());
        }

        execution.status = ExecutionStatus::Queued;
        execution.queued_at = Some(Utc::now());
        if !self.store.upsert_execution(&execution).await? {
            return Ok(());
        }

        let env = self
            .store
            .get_environment(&execution.environment_id)
            .await
            .map_err(|e| SandboxError::environment_lookup(&execution.environment_id, e))?;
        if env.status != EnvironmentStatus::Running {
            mark_terminal(
                &mut execution,
                ExecutionStatus::Failed,
                Some(format!("environment is {}", env.status)),
            );
            self.store.upsert_execution(&execution).await?;
            return Ok(());
        }

        // Acquire a pod: standby first, then a fresh ephemeral one
        let acquired = tokio::select! {
            _ = token.cancelled() => None,
            pod = self.acquire_pod(&env, id) => Some(pod),
        };
        let (namespace, pod, from_standby) = match acquired {
            None => {
                self.cleanup_canceled_acquisition(&env, id).await;
                return self.record_cancellation(execution).await;
            }
            Some(Err(e)) => {
                mark_terminal(
                    &mut execution,
                    ExecutionStatus::Failed,
                    Some(format!("could not acquire a pod: {}", e)),
                );
                self.store.upsert_execution(&execution).await?;
                return Ok(());
            }
            Some(Ok(acquired)) => acquired,
        };

        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        execution.namespace = Some(namespace.clone());
        execution.pod_name = Some(pod.clone());
        execution.from_standby = from_standby;
        if !self.store.upsert_execution(&execution).await? {
            // Canceled between acquisition and start
            self.provisioner.destroy_pod(&namespace, &pod, true).await;
            return Ok(());
        }
        info!(execution_id = %id, pod = %pod, from_standby, "Execution running");

        let started = Instant::now();
        let timeout = Duration::from_secs(execution.timeout_secs);
        let mut exec_env = env.env_vars.clone();
        exec_env.extend(execution.env_vars.clone());

        let (stdout, stdout_task) = capture_pipe(self.settings.max_output_bytes);
        let (stderr, stderr_task) = capture_pipe(self.settings.max_output_bytes);
        let request = ExecRequest {
            command: execution.command.clone(),
            env: exec_env,
        };
        let io = ExecIo {
            stdin: None,
            stdout,
            stderr,
        };

        let gateway = self.provisioner.gateway();
        let outcome = tokio::select! {
            _ = token.cancelled() => RunOutcome::Canceled,
            _ = tokio::time::sleep(timeout) => RunOutcome::TimedOut(timeout),
            result = gateway.exec_in_pod(&namespace, &pod, request, io, token.clone()) => match result {
                Ok(code) => RunOutcome::Exited(code),
                Err(GatewayError::Canceled) => RunOutcome::Canceled,
                Err(e) => RunOutcome::Errored(e),
            },
        };

        // The pod never outlives the run
        let force = !matches!(outcome, RunOutcome::Exited(_));
        self.provisioner.destroy_pod(&namespace, &pod, force).await;

        let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
        let (stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();
        execution.stdout = Some(render_output(&stdout, stdout_truncated));
        execution.stderr = Some(render_output(&stderr, stderr_truncated));
        execution.duration_ms = Some(started.elapsed().as_millis() as u64);

        match outcome {
            RunOutcome::Exited(code) => {
                execution.exit_code = Some(code);
                if code == 0 {
                    mark_terminal(&mut execution, ExecutionStatus::Completed, None);
                } else {
                    mark_terminal(
                        &mut execution,
                        ExecutionStatus::Failed,
                        Some(format!("command exited with code {}", code)),
                    );
                }
            }
            RunOutcome::TimedOut(after) => mark_terminal(
                &mut execution,
                ExecutionStatus::Failed,
                Some(format!("timed out after {}s", after.as_secs())),
            ),
            RunOutcome::Errored(e) => {
                mark_terminal(&mut execution, ExecutionStatus::Failed, Some(e.to_string()))
            }
            RunOutcome::Canceled => return self.record_cancellation(execution).await,
        }

        self.store.upsert_execution(&execution).await?;
        info!(
            execution_id = %id,
            status = %execution.status,
            duration_ms = execution.duration_ms.unwrap_or_default(),
            "Execution finished"
        );
        Ok(())
    }

    async fn acquire_pod(
        &self,
        env: &Environment,
        execution_id: &str,
    ) -> std::result::Result<(String, String, bool), GatewayError> {
        if env.standby_eligible() {
            let key = PoolKey::new(&env.image, &env.resources, env.runtime_class());
            if let Some(standby) = self.pool.claim(&key).await {
                return Ok((standby.namespace, standby.pod_name, true));
            }
            debug!(execution_id = %execution_id, "Standby pool empty, provisioning on demand");
        }
        let (ns, pod) = self
            .provisioner
            .create_ephemeral_pod(env, execution_id)
            .await?;
        Ok((ns, pod, false))
    }

    /// A pod may have been created right before the cancellation won the race
    async fn cleanup_canceled_acquisition(&self, env: &Environment, execution_id: &str) {
        let pod = naming::ephemeral_pod_for(execution_id);
        self.provisioner.destroy_pod(&env.namespace, &pod, true).await;
    }

    async fn record_cancellation(&self, mut execution: Execution) -> Result<()> {
        let reason = if self.shutdown.is_cancelled() {
            "orchestrator shutting down"
        } else {
            "canceled"
        };
        let status = if self.shutdown.is_cancelled() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Canceled
        };
        mark_terminal(&mut execution, status, Some(reason.to_string()));
        self.store.upsert_execution(&execution).await?;
        Ok(())
    }
}

fn mark_terminal(execution: &mut Execution, status: ExecutionStatus, error: Option<String>) {
    let now = Utc::now();
    execution.status = status;
    execution.completed_at = Some(now);
    if execution.duration_ms.is_none() {
        if let Some(started) = execution.started_at {
            execution.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
    }
    if error.is_some() {
        execution.error = error;
    }
}

pub(crate) fn render_output(bytes: &[u8], truncated: bool) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

/// A writer whose bytes are collected, up to `limit`, by a background task.
/// The task finishes once the writer is shut down or dropped.
pub(crate) fn capture_pipe(
    limit: usize,
) -> (
    Box<dyn AsyncWrite + Send + Unpin>,
    JoinHandle<(Vec<u8>, bool)>,
) {
    let (writer, reader) = tokio::io::duplex(CAPTURE_PIPE_SIZE);
    let task = tokio::spawn(read_capped(reader, limit));
    (Box::new(writer), task)
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                // Keep draining past the limit so the writer never blocks
                let room = limit.saturating_sub(out.len());
                if n > room {
                    truncated = true;
                }
                out.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    (out, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_capture_pipe_truncates_but_drains() {
        let (mut writer, task) = capture_pipe(4);
        writer.write_all(b"hello world").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        let (bytes, truncated) = task.await.unwrap();
        assert_eq!(bytes, b"hell");
        assert!(truncated);
        assert_eq!(render_output(&bytes, truncated), "hell\n[output truncated]");
    }

    #[test]
    fn test_mark_terminal_keeps_existing_error() {
        let mut execution = Execution {
            id: "exec-1".into(),
            environment_id: "env-1".into(),
            command: vec!["true".into()],
            env_vars: BTreeMap::new(),
            timeout_secs: 10,
            status: ExecutionStatus::Running,
            owner_id: "u".into(),
            namespace: None,
            pod_name: None,
            from_standby: false,
            created_at: Utc::now(),
            queued_at: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            error: Some("pod vanished".into()),
            duration_ms: None,
        };
        mark_terminal(&mut execution, ExecutionStatus::Failed, None);
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.completed_at.is_some());
        assert!(execution.duration_ms.is_some());
        assert_eq!(execution.error.as_deref(), Some("pod vanished"));
    }
}
