// ABOUTME: Domain records for environments, executions and the environment event log
// ABOUTME: Status state machines plus resource, isolation, affinity and standby pool policy shapes

use chrono::{DateTime, Utc};
use corral_storage::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// ENVIRONMENT
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Pending,
    Running,
    Terminating,
    Terminated,
    Failed,
}

impl EnvironmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, StorageError> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "terminating" => Ok(Self::Terminating),
            "terminated" => Ok(Self::Terminated),
            "failed" => Ok(Self::Failed),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }

    /// Transitions only move forward, except `failed -> pending` on an explicit retry.
    /// Re-persisting the current status is always allowed.
    pub fn can_transition_to(&self, next: EnvironmentStatus) -> bool {
        use EnvironmentStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Terminating)
                | (Running, Terminating)
                | (Terminating, Terminated)
                | (Failed, Pending)
                | (Failed, Terminating)
        )
    }
}

impl std::fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared CPU / memory / storage quantities, in cluster quantity notation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceSpec {
    pub cpu: String,
    pub memory: String,
    pub storage: String,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpu: "500m".to_string(),
            memory: "512Mi".to_string(),
            storage: "1Gi".to_string(),
        }
    }
}

/// Optional isolation bundle. Each part validates and applies on its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IsolationPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_policy: Option<NetworkPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkPolicy {
    #[serde(default = "default_true")]
    pub deny_ingress: bool,
    #[serde(default)]
    pub deny_egress: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_egress_cidrs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_egress_ports: Vec<u16>,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            deny_ingress: true,
            deny_egress: false,
            allowed_egress_cidrs: Vec::new(),
            allowed_egress_ports: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<i64>,
    #[serde(default)]
    pub run_as_non_root: bool,
    #[serde(default)]
    pub read_only_root_filesystem: bool,
    #[serde(default)]
    pub allow_privilege_escalation: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drop_capabilities: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeAffinity {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Toleration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StandbyPoolPolicy {
    pub enabled: bool,
    pub size: u32,
    #[serde(default)]
    pub min_ready: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub name: String,
    pub image: String,
    pub resources: ResourceSpec,
    pub status: EnvironmentStatus,
    pub namespace: String,
    pub pod_name: Option<String>,

    // Policies
    pub isolation: Option<IsolationPolicy>,
    pub node_affinity: Option<NodeAffinity>,
    pub standby_pool: Option<StandbyPoolPolicy>,
    pub labels: BTreeMap<String, String>,
    pub env_vars: BTreeMap<String, String>,

    // Ownership and timestamps
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,

    // Reconciliation bookkeeping
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl Environment {
    pub fn is_running(&self) -> bool {
        self.status == EnvironmentStatus::Running
    }

    pub fn runtime_class(&self) -> Option<&str> {
        self.isolation
            .as_ref()
            .and_then(|i| i.runtime_class.as_deref())
    }

    pub fn pool_enabled(&self) -> bool {
        self.standby_pool.as_ref().is_some_and(|p| p.enabled)
    }

    /// Standby pods carry only the runtime class of the isolation policy
    pub fn standby_eligible(&self) -> bool {
        self.pool_enabled()
            && self
                .isolation
                .as_ref()
                .map_or(true, |i| i.network_policy.is_none() && i.security_context.is_none())
    }
}

// ============================================================================
// EXECUTION
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, StorageError> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn is_cancelable(&self) -> bool {
        matches!(self, Self::Pending | Self::Queued | Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub environment_id: String,
    pub command: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub timeout_secs: u64,
    pub status: ExecutionStatus,
    pub owner_id: String,

    // Pod used for the run
    pub namespace: Option<String>,
    pub pod_name: Option<String>,
    pub from_standby: bool,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    // Result
    pub exit_code: Option<i64>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

// ============================================================================
// EVENT LOG
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Provisioned,
    ProvisionFailed,
    RetriesExhausted,
    RetryRequested,
    Updated,
    DeletionRequested,
    IdleTimeout,
    Terminated,
    TeardownFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Provisioned => "provisioned",
            Self::ProvisionFailed => "provision_failed",
            Self::RetriesExhausted => "retries_exhausted",
            Self::RetryRequested => "retry_requested",
            Self::Updated => "updated",
            Self::DeletionRequested => "deletion_requested",
            Self::IdleTimeout => "idle_timeout",
            Self::Terminated => "terminated",
            Self::TeardownFailed => "teardown_failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, StorageError> {
        match s {
            "created" => Ok(Self::Created),
            "provisioned" => Ok(Self::Provisioned),
            "provision_failed" => Ok(Self::ProvisionFailed),
            "retries_exhausted" => Ok(Self::RetriesExhausted),
            "retry_requested" => Ok(Self::RetryRequested),
            "updated" => Ok(Self::Updated),
            "deletion_requested" => Ok(Self::DeletionRequested),
            "idle_timeout" => Ok(Self::IdleTimeout),
            "terminated" => Ok(Self::Terminated),
            "teardown_failed" => Ok(Self::TeardownFailed),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentEvent {
    pub id: Option<i64>,
    pub environment_id: String,
    pub event_type: EventType,
    pub message: String,
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl EnvironmentEvent {
    pub fn new(environment_id: &str, event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            id: None,
            environment_id: environment_id.to_string(),
            event_type,
            message: message.into(),
            detail: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

// ============================================================================
// QUERY FILTERS
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct EnvironmentFilter {
    pub statuses: Vec<EnvironmentStatus>,
    pub owner_id: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl EnvironmentFilter {
    pub fn with_statuses(statuses: &[EnvironmentStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub environment_id: Option<String>,
    pub statuses: Vec<ExecutionStatus>,
    pub owner_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}
