// ABOUTME: Cluster Gateway capability consumed by the orchestration core
// ABOUTME: Namespace, pod, quota and network policy CRUD plus logs and remote exec with piped stdio

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::types::{NetworkPolicy, NodeAffinity, ResourceSpec, SecurityContext};

pub mod docker;
pub mod memory;

pub use docker::DockerGateway;
pub use memory::InMemoryGateway;

/// Label carried by every pod so gateway listings can be filtered by role
pub const ROLE_LABEL: &str = "corral.io/role";
pub const ENVIRONMENT_LABEL: &str = "corral.io/environment";
pub const EXECUTION_LABEL: &str = "corral.io/execution";
pub const POOL_KEY_LABEL: &str = "corral.io/pool-key";

#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Invalid runtime class: {0}")]
    InvalidRuntimeClass(String),

    #[error("Invalid resource spec: {0}")]
    InvalidSpec(String),

    #[error("Cluster call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Pod {pod} failed: {reason}")]
    PodFailed { pod: String, reason: String },

    #[error("Exec error: {0}")]
    Exec(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Failures that another attempt cannot fix without operator action
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded(_) | Self::InvalidRuntimeClass(_) | Self::InvalidSpec(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Desired pod definition
#[derive(Debug, Clone)]
pub struct PodSpec {
    pub namespace: String,
    pub name: String,
    pub image: String,
    pub resources: ResourceSpec,
    /// Overrides the image entrypoint; pods default to sleeping so they can host execs
    pub command: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub runtime_class: Option<String>,
    pub security_context: Option<SecurityContext>,
    pub node_affinity: Option<NodeAffinity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub phase: PodPhase,
    pub labels: BTreeMap<String, String>,
    pub image: String,
}

#[derive(Debug, Clone)]
pub struct PodCompletion {
    pub phase: PodPhase,
    pub exit_code: Option<i64>,
    pub logs: String,
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Piped stdio for a remote exec. The gateway closes nothing it does not own:
/// stdout/stderr are flushed and shut down when the remote process exits.
pub struct ExecIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    pub tail_lines: Option<u32>,
    pub timestamps: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterCapacity {
    pub nodes: u32,
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub running_pods: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerVersion {
    pub platform: String,
    pub version: String,
}

/// Cluster operations. Creates succeed when the target already exists and
/// deletes succeed when it is already absent.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn create_namespace(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()>;
    async fn namespace_exists(&self, namespace: &str) -> Result<bool>;
    async fn delete_namespace(&self, namespace: &str) -> Result<()>;

    async fn apply_resource_quota(&self, namespace: &str, resources: &ResourceSpec) -> Result<()>;
    async fn delete_resource_quota(&self, namespace: &str) -> Result<()>;

    async fn apply_network_policy(&self, namespace: &str, policy: &NetworkPolicy) -> Result<()>;
    async fn delete_network_policy(&self, namespace: &str) -> Result<()>;

    async fn create_pod(&self, spec: &PodSpec) -> Result<()>;
    async fn get_pod(&self, namespace: &str, pod: &str) -> Result<Option<PodInfo>>;
    async fn delete_pod(&self, namespace: &str, pod: &str, force: bool) -> Result<()>;
    async fn wait_for_pod_running(&self, namespace: &str, pod: &str, timeout: Duration)
        -> Result<()>;
    async fn wait_for_pod_completion(
        &self,
        namespace: &str,
        pod: &str,
        timeout: Duration,
    ) -> Result<PodCompletion>;

    /// Runs a command in the pod, piping stdio, and returns its exit code.
    /// Cancelling the token aborts the remote call and returns `GatewayError::Canceled`.
    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        request: ExecRequest,
        io: ExecIo,
        cancel: CancellationToken,
    ) -> Result<i64>;

    async fn get_pod_logs(&self, namespace: &str, pod: &str, options: LogOptions)
        -> Result<String>;
    async fn stream_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        options: LogOptions,
        follow: bool,
    ) -> Result<BoxStream<'static, Result<bytes::Bytes>>>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodInfo>>;

    async fn health_check(&self) -> Result<()>;
    async fn get_server_version(&self) -> Result<ServerVersion>;
    async fn get_cluster_capacity(&self) -> Result<ClusterCapacity>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_error_classification() {
        assert!(GatewayError::QuotaExceeded("cpu".into()).is_permanent());
        assert!(GatewayError::InvalidRuntimeClass("kata".into()).is_permanent());
        assert!(!GatewayError::Timeout(Duration::from_secs(1)).is_permanent());
        assert!(!GatewayError::Connection("refused".into()).is_permanent());
        assert!(!GatewayError::PodFailed {
            pod: "primary".into(),
            reason: "ImagePullBackOff".into()
        }
        .is_permanent());
    }
}
