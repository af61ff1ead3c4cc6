// ABOUTME: Cluster Gateway backed by a local Docker daemon through bollard
// ABOUTME: Namespaces map to labelled bridge networks and pods to containers named <namespace>.<pod>

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
        LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::HostConfig,
    network::{CreateNetworkOptions, InspectNetworkOptions},
    Docker,
};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ClusterCapacity, ClusterGateway, ExecIo, ExecRequest, GatewayError, LogOptions, PodCompletion,
    PodInfo, PodPhase, PodSpec, Result, ServerVersion,
};
use crate::types::{NetworkPolicy, ResourceSpec};
use crate::validation::{parse_bytes, parse_cpu_millis};

const NAMESPACE_LABEL: &str = "corral.namespace";
const POD_LABEL: &str = "corral.pod";
const MANAGED_LABEL: &str = "corral.managed";
const DEFAULT_POD_COMMAND: [&str; 2] = ["sleep", "infinity"];
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct DockerGateway {
    client: Docker,
    /// Per-namespace quota, checked against every pod created in it
    quotas: Arc<RwLock<HashMap<String, ResourceSpec>>>,
    /// Per-namespace network policy, applied to containers at creation
    policies: Arc<RwLock<HashMap<String, NetworkPolicy>>>,
    /// Images already present locally
    image_cache: Arc<RwLock<HashSet<String>>>,
    pull_timeout: Duration,
}

impl DockerGateway {
    /// Connect using the default socket / DOCKER_HOST
    pub fn connect() -> Result<Self> {
        let client =
            Docker::connect_with_defaults().map_err(|e| GatewayError::Connection(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            quotas: Arc::new(RwLock::new(HashMap::new())),
            policies: Arc::new(RwLock::new(HashMap::new())),
            image_cache: Arc::new(RwLock::new(HashSet::new())),
            pull_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    fn container_name(namespace: &str, pod: &str) -> String {
        format!("{}.{}", namespace, pod)
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_cache.read().await.contains(image) {
            return Ok(());
        }
        match self.client.inspect_image(image).await {
            Ok(_) => {
                self.image_cache.write().await.insert(image.to_string());
                return Ok(());
            }
            Err(e) if status_code(&e) == Some(404) => {}
            Err(e) => return Err(map_error(e)),
        }

        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let pull = async {
            while let Some(result) = stream.next().await {
                let progress = result.map_err(|e| {
                    GatewayError::PodFailed {
                        pod: image.to_string(),
                        reason: format!("image pull failed: {}", e),
                    }
                })?;
                if let Some(error) = progress.error {
                    return Err(GatewayError::PodFailed {
                        pod: image.to_string(),
                        reason: format!("image pull failed: {}", error),
                    });
                }
                if let Some(status) = progress.status {
                    debug!("Pull status for {}: {}", image, status);
                }
            }
            Ok(())
        };

        tokio::time::timeout(self.pull_timeout, pull)
            .await
            .map_err(|_| GatewayError::Timeout(self.pull_timeout))??;

        self.image_cache.write().await.insert(image.to_string());
        info!("Pulled image: {}", image);
        Ok(())
    }

    async fn check_quota(&self, spec: &PodSpec) -> Result<()> {
        let quotas = self.quotas.read().await;
        let Some(quota) = quotas.get(&spec.namespace) else {
            return Ok(());
        };
        let invalid = GatewayError::InvalidSpec;
        let cpu = parse_cpu_millis(&spec.resources.cpu).map_err(invalid)?;
        let memory = parse_bytes(&spec.resources.memory).map_err(invalid)?;
        if cpu > parse_cpu_millis(&quota.cpu).map_err(invalid)? {
            return Err(GatewayError::QuotaExceeded(format!(
                "cpu {} exceeds namespace quota {}",
                spec.resources.cpu, quota.cpu
            )));
        }
        if memory > parse_bytes(&quota.memory).map_err(invalid)? {
            return Err(GatewayError::QuotaExceeded(format!(
                "memory {} exceeds namespace quota {}",
                spec.resources.memory, quota.memory
            )));
        }
        Ok(())
    }

    async fn to_container_config(&self, spec: &PodSpec) -> Result<Config<String>> {
        let mut labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(NAMESPACE_LABEL.to_string(), spec.namespace.clone());
        labels.insert(POD_LABEL.to_string(), spec.name.clone());

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let cpu_millis = parse_cpu_millis(&spec.resources.cpu).map_err(GatewayError::InvalidSpec)?;
        let memory = parse_bytes(&spec.resources.memory).map_err(GatewayError::InvalidSpec)?;

        let deny_egress = self
            .policies
            .read()
            .await
            .get(&spec.namespace)
            .is_some_and(|p| p.deny_egress && p.allowed_egress_cidrs.is_empty());

        let mut host_config = HostConfig {
            nano_cpus: Some((cpu_millis * 1_000_000) as i64),
            memory: Some(memory as i64),
            runtime: spec.runtime_class.clone(),
            network_mode: Some(if deny_egress {
                "none".to_string()
            } else {
                spec.namespace.clone()
            }),
            ..Default::default()
        };

        let mut user = None;
        if let Some(ctx) = &spec.security_context {
            user = match (ctx.run_as_user, ctx.run_as_group) {
                (Some(u), Some(g)) => Some(format!("{}:{}", u, g)),
                (Some(u), None) => Some(u.to_string()),
                (None, Some(g)) => Some(format!("0:{}", g)),
                (None, None) => None,
            };
            host_config.readonly_rootfs = Some(ctx.read_only_root_filesystem);
            if !ctx.drop_capabilities.is_empty() {
                host_config.cap_drop = Some(ctx.drop_capabilities.clone());
            }
            if !ctx.allow_privilege_escalation {
                host_config.security_opt = Some(vec!["no-new-privileges".to_string()]);
            }
        }

        if let Some(affinity) = &spec.node_affinity {
            if !affinity.node_selector.is_empty() || !affinity.tolerations.is_empty() {
                debug!(
                    "Node affinity ignored for {}/{}: single-node docker backend",
                    spec.namespace, spec.name
                );
            }
        }

        let cmd = spec.command.clone().unwrap_or_else(|| {
            DEFAULT_POD_COMMAND
                .iter()
                .map(|s| s.to_string())
                .collect()
        });

        Ok(Config {
            image: Some(spec.image.clone()),
            cmd: Some(cmd),
            env: Some(env),
            user,
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        })
    }

    async fn inspect_pod(&self, namespace: &str, pod: &str) -> Result<Option<(PodInfo, Option<i64>)>> {
        let name = Self::container_name(namespace, pod);
        let inspect = match self
            .client
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if status_code(&e) == Some(404) => return Ok(None),
            Err(e) => return Err(map_error(e)),
        };

        let state = inspect.state.unwrap_or_default();
        let exit_code = state.exit_code;
        let status = state
            .status
            .as_ref()
            .map(|s| s.as_ref().to_string())
            .unwrap_or_default();
        let config = inspect.config.unwrap_or_default();

        Ok(Some((
            PodInfo {
                namespace: namespace.to_string(),
                name: pod.to_string(),
                phase: convert_phase(&status, exit_code),
                labels: config.labels.unwrap_or_default().into_iter().collect(),
                image: config.image.unwrap_or_default(),
            },
            exit_code,
        )))
    }
}

fn convert_phase(status: &str, exit_code: Option<i64>) -> PodPhase {
    match status.to_lowercase().as_str() {
        "created" => PodPhase::Pending,
        "running" | "restarting" | "paused" => PodPhase::Running,
        "exited" if exit_code == Some(0) => PodPhase::Succeeded,
        "exited" | "dead" => PodPhase::Failed,
        _ => PodPhase::Unknown,
    }
}

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn map_error(err: BollardError) -> GatewayError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => {
            if message.contains("runtime") && (status_code == 400 || status_code == 500) {
                GatewayError::InvalidRuntimeClass(message)
            } else if status_code == 404 {
                GatewayError::NotFound(message)
            } else {
                GatewayError::Internal(format!("docker returned {}: {}", status_code, message))
            }
        }
        BollardError::RequestTimeoutError => GatewayError::Timeout(Duration::from_secs(120)),
        other => GatewayError::Connection(other.to_string()),
    }
}

#[async_trait]
impl ClusterGateway for DockerGateway {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create_namespace(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        if self.namespace_exists(namespace).await? {
            return Ok(());
        }
        let mut network_labels: HashMap<String, String> =
            labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        network_labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        network_labels.insert(NAMESPACE_LABEL.to_string(), namespace.to_string());

        let options = CreateNetworkOptions {
            name: namespace.to_string(),
            driver: "bridge".to_string(),
            labels: network_labels,
            ..Default::default()
        };
        match self.client.create_network(options).await {
            Ok(_) => {
                info!("Created network for namespace {}", namespace);
                Ok(())
            }
            Err(e) if status_code(&e) == Some(409) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        match self
            .client
            .inspect_network(namespace, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if status_code(&e) == Some(404) => Ok(false),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        // Containers still attached would block network removal
        for pod in self.list_pods(namespace, &BTreeMap::new()).await? {
            self.delete_pod(namespace, &pod.name, true).await?;
        }
        self.quotas.write().await.remove(namespace);
        self.policies.write().await.remove(namespace);
        match self.client.remove_network(namespace).await {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn apply_resource_quota(&self, namespace: &str, resources: &ResourceSpec) -> Result<()> {
        self.quotas
            .write()
            .await
            .insert(namespace.to_string(), resources.clone());
        Ok(())
    }

    async fn delete_resource_quota(&self, namespace: &str) -> Result<()> {
        self.quotas.write().await.remove(namespace);
        Ok(())
    }

    async fn apply_network_policy(&self, namespace: &str, policy: &NetworkPolicy) -> Result<()> {
        if policy.deny_egress && !policy.allowed_egress_cidrs.is_empty() {
            warn!(
                "Namespace {}: docker backend cannot restrict egress to CIDRs, egress stays open",
                namespace
            );
        }
        self.policies
            .write()
            .await
            .insert(namespace.to_string(), policy.clone());
        Ok(())
    }

    async fn delete_network_policy(&self, namespace: &str) -> Result<()> {
        self.policies.write().await.remove(namespace);
        Ok(())
    }

    async fn create_pod(&self, spec: &PodSpec) -> Result<()> {
        let name = Self::container_name(&spec.namespace, &spec.name);
        info!("Creating container: {}", name);

        self.check_quota(spec).await?;
        self.ensure_image(&spec.image).await?;

        let config = self.to_container_config(spec).await?;
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        match self.client.create_container(Some(options), config).await {
            Ok(container) => debug!("Created container {} ({})", name, container.id),
            Err(e) if status_code(&e) == Some(409) => debug!("Container {} already exists", name),
            Err(e) => return Err(map_error(e)),
        }

        match self
            .client
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn get_pod(&self, namespace: &str, pod: &str) -> Result<Option<PodInfo>> {
        Ok(self.inspect_pod(namespace, pod).await?.map(|(info, _)| info))
    }

    async fn delete_pod(&self, namespace: &str, pod: &str, force: bool) -> Result<()> {
        let name = Self::container_name(namespace, pod);
        info!("Removing container: {} (force: {})", name, force);

        if !force {
            match self
                .client
                .stop_container(&name, Some(StopContainerOptions { t: 10 }))
                .await
            {
                Ok(()) => {}
                Err(e) if matches!(status_code(&e), Some(304) | Some(404)) => {}
                Err(e) => return Err(map_error(e)),
            }
        }

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.client.remove_container(&name, Some(options)).await {
            Ok(()) => Ok(()),
            // 409: removal already in progress
            Err(e) if matches!(status_code(&e), Some(404) | Some(409)) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
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
                Some(info) if matches!(info.phase, PodPhase::Failed | PodPhase::Succeeded) => {
                    return Err(GatewayError::PodFailed {
                        pod: pod.to_string(),
                        reason: "container exited before becoming ready".to_string(),
                    })
                }
                None => return Err(GatewayError::NotFound(format!("pod {}/{}", namespace, pod))),
                Some(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::Timeout(timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
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
            let (info, exit_code) = self
                .inspect_pod(namespace, pod)
                .await?
                .ok_or_else(|| GatewayError::NotFound(format!("pod {}/{}", namespace, pod)))?;
            if matches!(info.phase, PodPhase::Succeeded | PodPhase::Failed) {
                let logs = self
                    .get_pod_logs(namespace, pod, LogOptions::default())
                    .await?;
                return Ok(PodCompletion {
                    phase: info.phase,
                    exit_code,
                    logs,
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::Timeout(timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        request: ExecRequest,
        io: ExecIo,
        cancel: CancellationToken,
    ) -> Result<i64> {
        let name = Self::container_name(namespace, pod);
        debug!("Executing in container {}: {:?}", name, request.command);

        let env: Vec<String> = request
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let exec_config = CreateExecOptions {
            cmd: Some(request.command),
            env: Some(env),
            attach_stdin: Some(io.stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(&name, exec_config)
            .await
            .map_err(map_error)?;
        let started = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(map_error)?;

        let (mut output, mut input) = match started {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(GatewayError::Exec(
                    "exec was detached unexpectedly".to_string(),
                ))
            }
        };

        let stdin_task = io.stdin.map(|mut stdin| {
            tokio::spawn(async move {
                if let Err(e) = tokio::io::copy(&mut stdin, &mut input).await {
                    debug!("stdin relay ended: {}", e);
                }
                let _ = input.shutdown().await;
            })
        });

        let mut stdout = io.stdout;
        let mut stderr = io.stderr;
        let pump = async {
            while let Some(msg) = output.next().await {
                let write = match msg.map_err(map_error)? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        stdout.write_all(&message).await
                    }
                    LogOutput::StdErr { message } => stderr.write_all(&message).await,
                    LogOutput::StdIn { .. } => Ok(()),
                };
                write.map_err(|e| GatewayError::Exec(e.to_string()))?;
            }
            let _ = stdout.shutdown().await;
            let _ = stderr.shutdown().await;
            Ok::<(), GatewayError>(())
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(GatewayError::Canceled),
            result = pump => result,
        };
        if let Some(task) = stdin_task {
            task.abort();
        }
        outcome?;

        let inspect = self.client.inspect_exec(&exec.id).await.map_err(map_error)?;
        Ok(inspect.exit_code.unwrap_or(-1))
    }

    async fn get_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        options: LogOptions,
    ) -> Result<String> {
        let mut stream = self.stream_pod_logs(namespace, pod, options, false).await?;
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    async fn stream_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        options: LogOptions,
        follow: bool,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let name = Self::container_name(namespace, pod);
        if self.get_pod(namespace, pod).await?.is_none() {
            return Err(GatewayError::NotFound(format!("pod {}/{}", namespace, pod)));
        }

        let logs_options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            timestamps: options.timestamps,
            tail: options
                .tail_lines
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };
        let stream = self
            .client
            .logs(&name, Some(logs_options))
            .map(|item| item.map(LogOutput::into_bytes).map_err(map_error));
        Ok(Box::pin(stream))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodInfo>> {
        let mut label_filters = vec![format!("{}={}", NAMESPACE_LABEL, namespace)];
        label_filters.extend(label_selector.iter().map(|(k, v)| format!("{}={}", k, v)));
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("label".to_string(), label_filters)]),
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(map_error)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let labels = c.labels.unwrap_or_default();
                let pod = labels.get(POD_LABEL)?.clone();
                let state = c.state.map(|s| s.to_string()).unwrap_or_default();
                Some(PodInfo {
                    namespace: namespace.to_string(),
                    name: pod,
                    // Exit codes are not part of the summary; an exited pod is reported as failed
                    phase: convert_phase(&state, None),
                    image: c.image.unwrap_or_default(),
                    labels: labels.into_iter().collect(),
                })
            })
            .collect())
    }

    async fn health_check(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| GatewayError::Connection(e.to_string()))
    }

    async fn get_server_version(&self) -> Result<ServerVersion> {
        let version = self.client.version().await.map_err(map_error)?;
        Ok(ServerVersion {
            platform: version
                .platform
                .map(|p| p.name)
                .unwrap_or_else(|| "Docker".to_string()),
            version: version.version.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn get_cluster_capacity(&self) -> Result<ClusterCapacity> {
        let info = self.client.info().await.map_err(map_error)?;
        Ok(ClusterCapacity {
            nodes: 1,
            cpu_cores: info.ncpu.unwrap_or(0) as f64,
            memory_bytes: info.mem_total.unwrap_or(0).max(0) as u64,
            running_pods: info.containers_running.unwrap_or(0).max(0) as u32,
        })
    }
}
