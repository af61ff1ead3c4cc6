// ABOUTME: Standby Pool Manager keeping pre-provisioned idle pods ready per image and resource profile
// ABOUTME: Periodic replenish and prune loop, atomic claim, orphan cleanup on startup and drain on shutdown

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::gateway::{PodPhase, ROLE_LABEL};
use crate::naming::PoolKey;
use crate::provisioner::{PodRole, Provisioner};
use crate::storage::StateStore;
use crate::types::{EnvironmentFilter, EnvironmentStatus};

/// A ready, unassigned pod
#[derive(Debug, Clone)]
pub struct StandbyPod {
    pub namespace: String,
    pub pod_name: String,
    pub image: String,
    pub ready_since: DateTime<Utc>,
}

/// Read-only view of one pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub image: String,
    pub cpu: String,
    pub memory: String,
    pub runtime_class: Option<String>,
    pub configured_size: u32,
    pub min_ready: u32,
    pub ready: u32,
    pub pending: u32,
}

#[derive(Debug, Default)]
struct PoolEntry {
    target: u32,
    min_ready: u32,
    ready: Vec<StandbyPod>,
    in_flight: u32,
}

pub struct StandbyPool {
    store: Arc<dyn StateStore>,
    provisioner: Arc<Provisioner>,
    namespace: String,
    interval: Duration,
    pools: RwLock<HashMap<PoolKey, PoolEntry>>,
}

impl StandbyPool {
    pub fn new(
        store: Arc<dyn StateStore>,
        provisioner: Arc<Provisioner>,
        namespace: String,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            provisioner,
            namespace,
            interval,
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Periodic loop; ticks never overlap and the loop exits when `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Standby pool manager started (interval {:?}, namespace {})",
            self.interval, self.namespace
        );

        if let Err(e) = self.cleanup_orphans().await {
            warn!("Standby orphan cleanup failed: {}", e);
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Standby pool tick failed: {}", e);
                    }
                }
            }
        }

        info!("Standby pool manager stopped");
    }

    /// Recompute targets, prune dead pods, then create pods up to the target
    pub async fn tick(&self) -> Result<()> {
        self.refresh_targets().await?;
        self.prune().await;
        self.replenish().await;
        Ok(())
    }

    /// Aggregate pool policies of running environments per key
    async fn refresh_targets(&self) -> Result<()> {
        let envs = self
            .store
            .list_environments(&EnvironmentFilter::with_statuses(&[
                EnvironmentStatus::Running,
            ]))
            .await?;

        let mut targets: HashMap<PoolKey, (u32, u32)> = HashMap::new();
        for env in envs.iter().filter(|e| e.standby_eligible()) {
            if let Some(policy) = &env.standby_pool {
                let key = PoolKey::new(&env.image, &env.resources, env.runtime_class());
                let entry = targets.entry(key).or_default();
                entry.0 = entry.0.max(policy.size);
                entry.1 = entry.1.max(policy.min_ready);
            }
        }

        let mut retired = Vec::new();
        {
            let mut pools = self.pools.write().await;
            for (key, entry) in pools.iter_mut() {
                let (target, min_ready) = targets.remove(key).unwrap_or((0, 0));
                entry.target = target;
                entry.min_ready = min_ready;
                let surplus = entry.ready.len().saturating_sub(target as usize);
                retired.extend(entry.ready.drain(..surplus));
            }
            for (key, (target, min_ready)) in targets {
                pools.insert(
                    key,
                    PoolEntry {
                        target,
                        min_ready,
                        ..Default::default()
                    },
                );
            }
            pools.retain(|_, e| e.target > 0 || e.in_flight > 0 || !e.ready.is_empty());
        }

        for pod in retired {
            debug!(pod = %pod.pod_name, "Retiring surplus standby pod");
            self.provisioner
                .destroy_pod(&pod.namespace, &pod.pod_name, true)
                .await;
        }
        Ok(())
    }

    /// Drop pods that are no longer running
    async fn prune(&self) {
        let candidates: Vec<StandbyPod> = {
            let pools = self.pools.read().await;
            pools.values().flat_map(|e| e.ready.iter().cloned()).collect()
        };

        for pod in candidates {
            let alive = matches!(
                self.provisioner
                    .call(self.provisioner.gateway().get_pod(&pod.namespace, &pod.pod_name))
                    .await,
                Ok(Some(ref info)) if info.phase == PodPhase::Running
            );
            if alive {
                continue;
            }

            let removed = {
                let mut pools = self.pools.write().await;
                pools.values_mut().any(|e| {
                    let before = e.ready.len();
                    e.ready.retain(|p| p.pod_name != pod.pod_name);
                    e.ready.len() != before
                })
            };
            // A concurrent claim may already own it
            if removed {
                warn!(pod = %pod.pod_name, "Pruning standby pod that failed liveness check");
                self.provisioner
                    .destroy_pod(&pod.namespace, &pod.pod_name, true)
                    .await;
            }
        }
    }

    async fn replenish(&self) {
        let mut work: Vec<(PoolKey, u32)> = Vec::new();
        {
            let mut pools = self.pools.write().await;
            for (key, entry) in pools.iter_mut() {
                let have = entry.ready.len() as u32 + entry.in_flight;
                if have < entry.target {
                    let missing = entry.target - have;
                    entry.in_flight += missing;
                    work.push((key.clone(), missing));
                }
            }
        }
        if work.is_empty() {
            return;
        }

        if let Err(e) = self.provisioner.ensure_namespace(&self.namespace).await {
            warn!("Cannot create standby namespace {}: {}", self.namespace, e);
            let mut pools = self.pools.write().await;
            for (key, missing) in &work {
                if let Some(entry) = pools.get_mut(key) {
                    entry.in_flight = entry.in_flight.saturating_sub(*missing);
                }
            }
            return;
        }

        for (key, missing) in work {
            for _ in 0..missing {
                let created = self
                    .provisioner
                    .create_standby_pod(&key, &self.namespace)
                    .await;

                let mut pools = self.pools.write().await;
                let entry = pools.entry(key.clone()).or_default();
                entry.in_flight = entry.in_flight.saturating_sub(1);
                match created {
                    Ok(pod_name) => {
                        debug!(pod = %pod_name, pool = %key, "Standby pod ready");
                        entry.ready.push(StandbyPod {
                            namespace: self.namespace.clone(),
                            pod_name,
                            image: key.image.clone(),
                            ready_since: Utc::now(),
                        });
                    }
                    Err(e) => warn!(pool = %key, "Standby pod creation failed: {}", e),
                }
            }
        }
    }

    /// Atomically remove and return a ready pod for `key`. Each pod is handed out at most once.
    pub async fn claim(&self, key: &PoolKey) -> Option<StandbyPod> {
        let mut pools = self.pools.write().await;
        let pod = pools.get_mut(key)?.ready.pop();
        if let Some(p) = &pod {
            debug!(pod = %p.pod_name, pool = %key, "Claimed standby pod");
        }
        pod
    }

    pub async fn status(&self) -> Vec<PoolStatus> {
        let pools = self.pools.read().await;
        let mut out: Vec<PoolStatus> = pools
            .iter()
            .map(|(key, e)| PoolStatus {
                image: key.image.clone(),
                cpu: key.cpu.clone(),
                memory: key.memory.clone(),
                runtime_class: key.runtime_class.clone(),
                configured_size: e.target,
                min_ready: e.min_ready,
                ready: e.ready.len() as u32,
                pending: e.in_flight,
            })
            .collect();
        out.sort_by(|a, b| a.image.cmp(&b.image).then(a.cpu.cmp(&b.cpu)));
        out
    }

    /// Remove standby pods a previous process left behind
    pub async fn cleanup_orphans(&self) -> Result<usize> {
        let gateway = self.provisioner.gateway();
        if !self
            .provisioner
            .call(gateway.namespace_exists(&self.namespace))
            .await?
        {
            return Ok(0);
        }

        let selector = BTreeMap::from([(
            ROLE_LABEL.to_string(),
            PodRole::Standby.as_str().to_string(),
        )]);
        let leftover = self
            .provisioner
            .call(gateway.list_pods(&self.namespace, &selector))
            .await?;

        let known: Vec<String> = {
            let pools = self.pools.read().await;
            pools
                .values()
                .flat_map(|e| e.ready.iter().map(|p| p.pod_name.clone()))
                .collect()
        };

        let mut removed = 0;
        for pod in leftover.iter().filter(|p| !known.contains(&p.name)) {
            self.provisioner
                .destroy_pod(&self.namespace, &pod.name, true)
                .await;
            removed += 1;
        }
        if removed > 0 {
            info!("Removed {} orphaned standby pods", removed);
        }
        Ok(removed)
    }

    /// Destroy every ready pod; called on shutdown
    pub async fn drain(&self) {
        let pods: Vec<StandbyPod> = {
            let mut pools = self.pools.write().await;
            pools
                .values_mut()
                .flat_map(|e| e.ready.drain(..).collect::<Vec<_>>())
                .collect()
        };
        let count = pods.len();
        for pod in pods {
            self.provisioner
                .destroy_pod(&pod.namespace, &pod.pod_name, true)
                .await;
        }
        info!("Drained {} standby pods", count);
    }
}
