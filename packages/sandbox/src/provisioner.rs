// ABOUTME: Shared provisioning path used by the Reconciler, the Standby Pool Manager and the Execution Engine
// ABOUTME: Wraps every cluster call in a deadline and builds pod specs from environment declarations

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::gateway::{
    ClusterGateway, GatewayError, PodSpec, ENVIRONMENT_LABEL, EXECUTION_LABEL, POOL_KEY_LABEL,
    ROLE_LABEL,
};
use crate::naming::{self, PoolKey, PRIMARY_POD};
use crate::types::Environment;

/// Provisioning steps, in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    CreateNamespace,
    ApplyResourceQuota,
    ApplyNetworkPolicy,
    CreatePod,
    WaitForReady,
}

impl ProvisionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateNamespace => "create_namespace",
            Self::ApplyResourceQuota => "apply_resource_quota",
            Self::ApplyNetworkPolicy => "apply_network_policy",
            Self::CreatePod => "create_pod",
            Self::WaitForReady => "wait_for_ready",
        }
    }
}

#[derive(Debug)]
pub struct ProvisionFailure {
    pub step: ProvisionStep,
    pub error: GatewayError,
}

impl std::fmt::Display for ProvisionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.step.as_str(), self.error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodRole {
    Primary,
    Ephemeral,
    Standby,
}

impl PodRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Ephemeral => "ephemeral",
            Self::Standby => "standby",
        }
    }
}

pub struct Provisioner {
    gateway: Arc<dyn ClusterGateway>,
    call_timeout: Duration,
    startup_timeout: Duration,
}

impl Provisioner {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        call_timeout: Duration,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            call_timeout,
            startup_timeout,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn ClusterGateway> {
        &self.gateway
    }

    /// Run one cluster call under the caller-supplied deadline
    pub async fn call<T, F>(&self, fut: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        bounded(self.call_timeout, fut).await
    }

    // ========================================================================
    // ENVIRONMENTS
    // ========================================================================

    /// Create namespace, quota, network policy and primary pod, then wait for it to run.
    /// Every step is idempotent so a partially provisioned environment can be re-run.
    pub async fn provision_environment(&self, env: &Environment) -> Result<String, ProvisionFailure> {
        let ns = env.namespace.as_str();
        let fail = |step| move |error| ProvisionFailure { step, error };

        let ns_labels = BTreeMap::from([(ENVIRONMENT_LABEL.to_string(), env.id.clone())]);
        self.call(self.gateway.create_namespace(ns, &ns_labels))
            .await
            .map_err(fail(ProvisionStep::CreateNamespace))?;

        self.call(self.gateway.apply_resource_quota(ns, &env.resources))
            .await
            .map_err(fail(ProvisionStep::ApplyResourceQuota))?;

        if let Some(policy) = env.isolation.as_ref().and_then(|i| i.network_policy.as_ref()) {
            self.call(self.gateway.apply_network_policy(ns, policy))
                .await
                .map_err(fail(ProvisionStep::ApplyNetworkPolicy))?;
        }

        let spec = self.environment_pod_spec(env, PRIMARY_POD, PodRole::Primary, None);
        self.call(self.gateway.create_pod(&spec))
            .await
            .map_err(fail(ProvisionStep::CreatePod))?;

        self.wait_ready(ns, PRIMARY_POD)
            .await
            .map_err(fail(ProvisionStep::WaitForReady))?;

        info!(environment_id = %env.id, namespace = %ns, "Environment provisioned");
        Ok(PRIMARY_POD.to_string())
    }

    /// Tear down pod, network policy, quota and namespace in reverse dependency order.
    /// Already-absent resources are not errors.
    pub async fn teardown_environment(&self, env: &Environment, force: bool) -> Result<(), GatewayError> {
        let ns = env.namespace.as_str();
        let pod = env.pod_name.as_deref().unwrap_or(PRIMARY_POD);

        self.call(self.gateway.delete_pod(ns, pod, force)).await?;
        self.call(self.gateway.delete_network_policy(ns)).await?;
        self.call(self.gateway.delete_resource_quota(ns)).await?;
        self.call(self.gateway.delete_namespace(ns)).await?;

        info!(environment_id = %env.id, namespace = %ns, "Environment torn down");
        Ok(())
    }

    // ========================================================================
    // PODS
    // ========================================================================

    /// One-shot pod in the environment's namespace inheriting its image, resources and isolation
    pub async fn create_ephemeral_pod(
        &self,
        env: &Environment,
        execution_id: &str,
    ) -> Result<(String, String), GatewayError> {
        let pod = naming::ephemeral_pod_for(execution_id);
        let spec = self.environment_pod_spec(env, &pod, PodRole::Ephemeral, Some(execution_id));

        self.call(self.gateway.create_pod(&spec)).await?;
        if let Err(e) = self.wait_ready(&env.namespace, &pod).await {
            self.destroy_pod(&env.namespace, &pod, true).await;
            return Err(e);
        }
        debug!(execution_id = %execution_id, pod = %pod, "Ephemeral pod ready");
        Ok((env.namespace.clone(), pod))
    }

    /// Warm pod for a pool key, not bound to any environment
    pub async fn create_standby_pod(
        &self,
        key: &PoolKey,
        namespace: &str,
    ) -> Result<String, GatewayError> {
        let pod = naming::standby_pod_name(key);
        let spec = PodSpec {
            namespace: namespace.to_string(),
            name: pod.clone(),
            image: key.image.clone(),
            resources: key.resources(),
            command: None,
            env: BTreeMap::new(),
            labels: BTreeMap::from([
                (ROLE_LABEL.to_string(), PodRole::Standby.as_str().to_string()),
                (POOL_KEY_LABEL.to_string(), key.label_value()),
            ]),
            runtime_class: key.runtime_class.clone(),
            security_context: None,
            node_affinity: None,
        };

        self.call(self.gateway.create_pod(&spec)).await?;
        if let Err(e) = self.wait_ready(namespace, &pod).await {
            self.destroy_pod(namespace, &pod, true).await;
            return Err(e);
        }
        Ok(pod)
    }

    /// Best-effort removal; failures are logged and left for the owner to retry
    pub async fn destroy_pod(&self, namespace: &str, pod: &str, force: bool) {
        if let Err(e) = self.call(self.gateway.delete_pod(namespace, pod, force)).await {
            warn!(namespace = %namespace, pod = %pod, "Failed to delete pod: {}", e);
        }
    }

    pub async fn ensure_namespace(&self, namespace: &str) -> Result<(), GatewayError> {
        self.call(self.gateway.create_namespace(namespace, &BTreeMap::new()))
            .await
    }

    async fn wait_ready(&self, namespace: &str, pod: &str) -> Result<(), GatewayError> {
        // The gateway honours the startup timeout; the outer bound covers a gateway that does not
        bounded(
            self.startup_timeout + self.call_timeout,
            self.gateway
                .wait_for_pod_running(namespace, pod, self.startup_timeout),
        )
        .await
    }

    pub fn environment_pod_spec(
        &self,
        env: &Environment,
        pod: &str,
        role: PodRole,
        execution_id: Option<&str>,
    ) -> PodSpec {
        let mut labels = env.labels.clone();
        labels.insert(ROLE_LABEL.to_string(), role.as_str().to_string());
        labels.insert(ENVIRONMENT_LABEL.to_string(), env.id.clone());
        if let Some(exec_id) = execution_id {
            labels.insert(EXECUTION_LABEL.to_string(), exec_id.to_string());
        }

        PodSpec {
            namespace: env.namespace.clone(),
            name: pod.to_string(),
            image: env.image.clone(),
            resources: env.resources.clone(),
            command: None,
            env: env.env_vars.clone(),
            labels,
            runtime_class: env.runtime_class().map(str::to_string),
            security_context: env
                .isolation
                .as_ref()
                .and_then(|i| i.security_context.clone()),
            node_affinity: env.node_affinity.clone(),
        }
    }
}

async fn bounded<T, F>(deadline: Duration, fut: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| GatewayError::Timeout(deadline))?
}
