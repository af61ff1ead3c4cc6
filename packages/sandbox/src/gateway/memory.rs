// ABOUTME: In-process Cluster Gateway that simulates namespaces, pods and remote exec
// ABOUTME: Records every call and supports fault injection and scripted exec results for tests and demos

use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    ClusterCapacity, ClusterGateway, ExecIo, ExecRequest, GatewayError, LogOptions, PodCompletion,
    PodInfo, PodPhase, PodSpec, Result, ServerVersion,
};
use crate::types::{NetworkPolicy, ResourceSpec};

/// Scripted behaviour of a remote exec
#[derive(Debug, Clone, Default)]
pub struct ExecScript {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    /// Copy stdin to stdout until stdin closes, then exit
    pub echo_stdin: bool,
    pub delay: Option<Duration>,
}

impl ExecScript {
    pub fn output(exit_code: i64, stdout: &str) -> Self {
        Self {
            exit_code,
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct NamespaceState {
    quota: Option<ResourceSpec>,
    network_policy: Option<NetworkPolicy>,
}

#[derive(Debug)]
struct PodState {
    spec: PodSpec,
    phase: PodPhase,
    logs: Vec<String>,
}

#[derive(Default)]
struct State {
    calls: Vec<String>,
    namespaces: HashMap<String, NamespaceState>,
    pods: BTreeMap<(String, String), PodState>,

    // Fault injection
    pod_create_failures: VecDeque<GatewayError>,
    persistent_pod_create_failure: Option<GatewayError>,
    namespace_create_failure: Option<GatewayError>,
    create_pod_delay: Option<Duration>,
    pods_never_ready: bool,
    healthy: bool,

    // Exec scripting, keyed by the program name (first argv element)
    default_script: ExecScript,
    scripts: HashMap<String, ExecScript>,
    exec_count: usize,
}

/// Fake cluster for tests and the `CORRAL_GATEWAY=memory` backend
#[derive(Clone)]
pub struct InMemoryGateway {
    state: Arc<Mutex<State>>,
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                healthy: true,
                ..Default::default()
            })),
        }
    }

    // ========================================================================
    // FAULT INJECTION AND SCRIPTING
    // ========================================================================

    /// The next `count` pod creations fail with `error`
    pub async fn fail_next_pod_creations(&self, count: usize, error: GatewayError) {
        let mut state = self.state.lock().await;
        for _ in 0..count {
            state.pod_create_failures.push_back(error.clone());
        }
    }

    /// Every pod creation fails until cleared with `None`
    pub async fn fail_all_pod_creations(&self, error: Option<GatewayError>) {
        self.state.lock().await.persistent_pod_create_failure = error;
    }

    pub async fn fail_namespace_creation(&self, error: Option<GatewayError>) {
        self.state.lock().await.namespace_create_failure = error;
    }

    /// Slows every pod creation; combined with a call deadline this simulates a hung cluster
    pub async fn set_create_pod_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.create_pod_delay = delay;
    }

    /// Created pods stay `Pending` forever
    pub async fn set_pods_never_ready(&self, never: bool) {
        self.state.lock().await.pods_never_ready = never;
    }

    pub async fn set_healthy(&self, healthy: bool) {
        self.state.lock().await.healthy = healthy;
    }

    pub async fn set_default_exec_script(&self, script: ExecScript) {
        self.state.lock().await.default_script = script;
    }

    pub async fn script_command(&self, program: &str, script: ExecScript) {
        self.state
            .lock()
            .await
            .scripts
            .insert(program.to_string(), script);
    }

    /// Marks a pod as failed, as a node loss or OOM kill would
    pub async fn kill_pod(&self, namespace: &str, pod: &str) {
        if let Some(p) = self
            .state
            .lock()
            .await
            .pods
            .get_mut(&(namespace.to_string(), pod.to_string()))
        {
            p.phase = PodPhase::Failed;
        }
    }

    pub async fn append_pod_logs(&self, namespace: &str, pod: &str, lines: &[&str]) {
        if let Some(p) = self
            .state
            .lock()
            .await
            .pods
            .get_mut(&(namespace.to_string(), pod.to_string()))
        {
            p.logs.extend(lines.iter().map(|l| l.to_string()));
        }
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn call_count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(operation))
            .count()
    }

    pub async fn exec_count(&self) -> usize {
        self.state.lock().await.exec_count
    }

    pub async fn has_namespace(&self, namespace: &str) -> bool {
        self.state.lock().await.namespaces.contains_key(namespace)
    }

    pub async fn namespace_quota(&self, namespace: &str) -> Option<ResourceSpec> {
        self.state
            .lock()
            .await
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.quota.clone())
    }

    pub async fn namespace_network_policy(&self, namespace: &str) -> Option<NetworkPolicy> {
        self.state
            .lock()
            .await
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.network_policy.clone())
    }

    pub async fn pod_names(&self, namespace: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .pods
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, pod)| pod.clone())
            .collect()
    }

    pub async fn pod_spec(&self, namespace: &str, pod: &str) -> Option<PodSpec> {
        self.state
            .lock()
            .await
            .pods
            .get(&(namespace.to_string(), pod.to_string()))
            .map(|p| p.spec.clone())
    }

    pub async fn total_pods(&self) -> usize {
        self.state.lock().await.pods.len()
    }

    async fn record(&self, call: String) {
        debug!("memory gateway: {}", call);
        self.state.lock().await.calls.push(call);
    }

    fn pod_info(pod: &PodState) -> PodInfo {
        PodInfo {
            namespace: pod.spec.namespace.clone(),
            name: pod.spec.name.clone(),
            phase: pod.phase,
            labels: pod.spec.labels.clone(),
            image: pod.spec.image.clone(),
        }
    }
}

#[async_trait]
impl ClusterGateway for InMemoryGateway {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_namespace(
        &self,
        namespace: &str,
        _labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.record(format!("create_namespace {}", namespace)).await;
        let mut state = self.state.lock().await;
        if let Some(err) = &state.namespace_create_failure {
            return Err(err.clone());
        }
        state.namespaces.entry(namespace.to_string()).or_default();
        Ok(())
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        Ok(self.state.lock().await.namespaces.contains_key(namespace))
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        self.record(format!("delete_namespace {}", namespace)).await;
        let mut state = self.state.lock().await;
        state.namespaces.remove(namespace);
        state.pods.retain(|(ns, _), _| ns != namespace);
        Ok(())
    }

    async fn apply_resource_quota(&self, namespace: &str, resources: &ResourceSpec) -> Result<()> {
        self.record(format!("apply_resource_quota {}", namespace))
            .await;
        let mut state = self.state.lock().await;
        let ns = state
            .namespaces
            .get_mut(namespace)
            .ok_or_else(|| GatewayError::NotFound(format!("namespace {}", namespace)))?;
        ns.quota = Some(resources.clone());
        Ok(())
    }

    async fn delete_resource_quota(&self, namespace: &str) -> Result<()> {
        self.record(format!("delete_resource_quota {}", namespace))
            .await;
        if let Some(ns) = self.state.lock().await.namespaces.get_mut(namespace) {
            ns.quota = None;
        }
        Ok(())
    }

    async fn apply_network_policy(&self, namespace: &str, policy: &NetworkPolicy) -> Result<()> {
        self.record(format!("apply_network_policy {}", namespace))
            .await;
        let mut state = self.state.lock().await;
        let ns = state
            .namespaces
            .get_mut(namespace)
            .ok_or_else(|| GatewayError::NotFound(format!("namespace {}", namespace)))?;
        ns.network_policy = Some(policy.clone());
        Ok(())
    }

    async fn delete_network_policy(&self, namespace: &str) -> Result<()> {
        self.record(format!("delete_network_policy {}", namespace))
            .await;
        if let Some(ns) = self.state.lock().await.namespaces.get_mut(namespace) {
            ns.network_policy = None;
        }
        Ok(())
    }

    async fn create_pod(&self, spec: &PodSpec) -> Result<()> {
        self.record(format!("create_pod {}/{}", spec.namespace, spec.name))
            .await;

        let delay = self.state.lock().await.create_pod_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if let Some(err) = state.pod_create_failures.pop_front() {
            return Err(err);
        }
        if let Some(err) = &state.persistent_pod_create_failure {
            return Err(err.clone());
        }
        if !state.namespaces.contains_key(&spec.namespace) {
            return Err(GatewayError::NotFound(format!(
                "namespace {}",
                spec.namespace
            )));
        }

        let key = (spec.namespace.clone(), spec.name.clone());
        if state.pods.contains_key(&key) {
            return Ok(());
        }
        let phase = if state.pods_never_ready {
            PodPhase::Pending
        } else {
            PodPhase::Running
        };
        state.pods.insert(
            key,
            PodState {
                spec: spec.clone(),
                phase,
                logs: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, pod: &str) -> Result<Option<PodInfo>> {
        Ok(self
            .state
            .lock()
            .await
            .pods
            .get(&(namespace.to_string(), pod.to_string()))
            .map(Self::pod_info))
    }

    async fn delete_pod(&self, namespace: &str, pod: &str, force: bool) -> Result<()> {
        self.record(format!("delete_pod {}/{} force={}", namespace, pod, force))
            .await;
        self.state
            .lock()
            .await
            .pods
            .remove(&(namespace.to_string(), pod.to_string()));
        Ok(())
    }

    async fn wait_for_pod_running(
        &self,
        namespace: &str,
        pod: &str,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.get_pod(namespace, pod).await? {
                Some(info) if info.phase == PodPhase::Running => return Ok(()),
                Some(info) if info.phase == PodPhase::Failed => {
                    return Err(GatewayError::PodFailed {
                        pod: pod.to_string(),
                        reason: "pod entered Failed phase".to_string(),
                    })
                }
                None => return Err(GatewayError::NotFound(format!("pod {}/{}", namespace, pod))),
                Some(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::Timeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn wait_for_pod_completion(
        &self,
        namespace: &str,
        pod: &str,
        timeout: Duration,
    ) -> Result<PodCompletion> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let state = self.state.lock().await;
                let p = state
                    .pods
                    .get(&(namespace.to_string(), pod.to_string()))
                    .ok_or_else(|| GatewayError::NotFound(format!("pod {}/{}", namespace, pod)))?;
                if matches!(p.phase, PodPhase::Succeeded | PodPhase::Failed) {
                    return Ok(PodCompletion {
                        phase: p.phase,
                        exit_code: Some(if p.phase == PodPhase::Succeeded { 0 } else { 1 }),
                        logs: p.logs.join("\n"),
                    });
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::Timeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        request: ExecRequest,
        mut io: ExecIo,
        cancel: CancellationToken,
    ) -> Result<i64> {
        self.record(format!(
            "exec_in_pod {}/{} {}",
            namespace,
            pod,
            request.command.join(" ")
        ))
        .await;

        let script = {
            let mut state = self.state.lock().await;
            match state.pods.get(&(namespace.to_string(), pod.to_string())) {
                Some(p) if p.phase == PodPhase::Running => {}
                Some(_) => return Err(GatewayError::Exec(format!("pod {} is not running", pod))),
                None => return Err(GatewayError::NotFound(format!("pod {}/{}", namespace, pod))),
            }
            state.exec_count += 1;
            request
                .command
                .first()
                .and_then(|program| state.scripts.get(program))
                .cloned()
                .unwrap_or_else(|| state.default_script.clone())
        };

        let write_err = |e: std::io::Error| GatewayError::Exec(e.to_string());

        let run = async {
            if script.echo_stdin {
                if let Some(stdin) = io.stdin.as_mut() {
                    let mut buf = [0u8; 4096];
                    loop {
                        let n = stdin.read(&mut buf).await.map_err(write_err)?;
                        if n == 0 {
                            break;
                        }
                        io.stdout.write_all(&buf[..n]).await.map_err(write_err)?;
                        io.stdout.flush().await.map_err(write_err)?;
                    }
                }
            }
            if let Some(delay) = script.delay {
                tokio::time::sleep(delay).await;
            }
            io.stdout
                .write_all(script.stdout.as_bytes())
                .await
                .map_err(write_err)?;
            io.stderr
                .write_all(script.stderr.as_bytes())
                .await
                .map_err(write_err)?;
            io.stdout.shutdown().await.map_err(write_err)?;
            io.stderr.shutdown().await.map_err(write_err)?;
            Ok(script.exit_code)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(GatewayError::Canceled),
            result = run => result,
        }
    }

    async fn get_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        options: LogOptions,
    ) -> Result<String> {
        let state = self.state.lock().await;
        let p = state
            .pods
            .get(&(namespace.to_string(), pod.to_string()))
            .ok_or_else(|| GatewayError::NotFound(format!("pod {}/{}", namespace, pod)))?;
        let skip = options
            .tail_lines
            .map(|n| p.logs.len().saturating_sub(n as usize))
            .unwrap_or(0);
        Ok(p.logs
            .iter()
            .skip(skip)
            .map(|l| format!("{}\n", l))
            .collect())
    }

    async fn stream_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        options: LogOptions,
        follow: bool,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let key = (namespace.to_string(), pod.to_string());
        let start = {
            let state = self.state.lock().await;
            let p = state
                .pods
                .get(&key)
                .ok_or_else(|| GatewayError::NotFound(format!("pod {}/{}", namespace, pod)))?;
            options
                .tail_lines
                .map(|n| p.logs.len().saturating_sub(n as usize))
                .unwrap_or(0)
        };

        let state = self.state.clone();
        let s = stream! {
            let mut next = start;
            loop {
                let (batch, alive) = {
                    let guard = state.lock().await;
                    match guard.pods.get(&key) {
                        Some(p) => (p.logs.iter().skip(next).cloned().collect::<Vec<_>>(), true),
                        None => (Vec::new(), false),
                    }
                };
                next += batch.len();
                for line in batch {
                    yield Ok::<Bytes, GatewayError>(Bytes::from(format!("{}\n", line)));
                }
                if !follow || !alive {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        Ok(Box::pin(s))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodInfo>> {
        let state = self.state.lock().await;
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, p)| {
                label_selector
                    .iter()
                    .all(|(k, v)| p.spec.labels.get(k) == Some(v))
            })
            .map(|(_, p)| Self::pod_info(p))
            .collect())
    }

    async fn health_check(&self) -> Result<()> {
        if self.state.lock().await.healthy {
            Ok(())
        } else {
            Err(GatewayError::Connection("cluster unreachable".to_string()))
        }
    }

    async fn get_server_version(&self) -> Result<ServerVersion> {
        self.health_check().await?;
        Ok(ServerVersion {
            platform: "memory".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    async fn get_cluster_capacity(&self) -> Result<ClusterCapacity> {
        self.health_check().await?;
        let state = self.state.lock().await;
        Ok(ClusterCapacity {
            nodes: 1,
            cpu_cores: 64.0,
            memory_bytes: 256 << 30,
            running_pods: state
                .pods
                .values()
                .filter(|p| p.phase == PodPhase::Running)
                .count() as u32,
        })
    }
}
