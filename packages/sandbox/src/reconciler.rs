// ABOUTME: Sandbox Reconciler driving environment records toward their desired cluster state
// ABOUTME: Periodic provisioning with bounded retries, idempotent teardown and idle termination

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SandboxError};
use crate::provisioner::Provisioner;
use crate::settings::OrchestratorSettings;
use crate::storage::StateStore;
use crate::types::{Environment, EnvironmentEvent, EnvironmentFilter, EnvironmentStatus, EventType};

/// Counts of what one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub provisioned: u32,
    pub provision_failures: u32,
    pub exhausted: u32,
    pub terminated: u32,
    pub teardown_failures: u32,
    pub idle_expired: u32,
}

pub struct Reconciler {
    store: Arc<dyn StateStore>,
    provisioner: Arc<Provisioner>,
    settings: Arc<OrchestratorSettings>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn StateStore>,
        provisioner: Arc<Provisioner>,
        settings: Arc<OrchestratorSettings>,
    ) -> Self {
        Self {
            store,
            provisioner,
            settings,
        }
    }

    /// Periodic loop; one tick at a time, exits when `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Reconciler started (interval {:?}, max retries {})",
            self.settings.reconcile_interval, self.settings.max_retries
        );

        let mut ticker = tokio::time::interval(self.settings.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(summary) if summary != TickSummary::default() => {
                            info!(?summary, "Reconciliation tick complete");
                        }
                        Ok(_) => debug!("Reconciliation tick: nothing to do"),
                        Err(e) => error!("Reconciliation tick failed: {}", e),
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// Process every environment that needs action. Bookkeeping is reloaded from the
    /// store each time, so retry state survives restarts.
    pub async fn tick(&self) -> Result<TickSummary> {
        let candidates = self
            .store
            .list_environments(&EnvironmentFilter::with_statuses(&[
                EnvironmentStatus::Pending,
                EnvironmentStatus::Failed,
                EnvironmentStatus::Terminating,
                EnvironmentStatus::Running,
            ]))
            .await?;

        let mut summary = TickSummary::default();
        for env in candidates {
            let id = env.id.clone();
            if let Err(e) = self.reconcile(env, &mut summary).await {
                // One bad record must not stall the rest of the tick
                error!(environment_id = %id, "Reconciliation failed: {}", e);
            }
        }
        Ok(summary)
    }

    /// Reconcile a single environment by ID
    pub async fn reconcile_one(&self, id: &str) -> Result<TickSummary> {
        let env = self
            .store
            .get_environment(id)
            .await
            .map_err(|e| SandboxError::environment_lookup(id, e))?;
        let mut summary = TickSummary::default();
        self.reconcile(env, &mut summary).await?;
        Ok(summary)
    }

    async fn reconcile(&self, env: Environment, summary: &mut TickSummary) -> Result<()> {
        match env.status {
            EnvironmentStatus::Pending => self.provision(env, summary).await,
            EnvironmentStatus::Failed if env.retry_count < self.settings.max_retries => {
                self.provision(env, summary).await
            }
            EnvironmentStatus::Terminating => self.teardown(env, summary).await,
            EnvironmentStatus::Running => self.check_idle(env, summary).await,
            EnvironmentStatus::Failed | EnvironmentStatus::Terminated => Ok(()),
        }
    }

    async fn provision(&self, env: Environment, summary: &mut TickSummary) -> Result<()> {
        let started_from = env.status;
        let attempt = env.retry_count + 1;
        debug!(environment_id = %env.id, attempt, "Provisioning environment");

        let outcome = self.provisioner.provision_environment(&env).await;

        // The record may have changed while cluster calls were in flight (e.g. a delete request)
        let mut current = self.store.get_environment(&env.id).await?;
        if current.status != started_from {
            info!(
                environment_id = %env.id,
                status = %current.status,
                "Environment changed during provisioning, leaving it to the next tick"
            );
            return Ok(());
        }

        // Failed records under the retry limit re-enter through the retry path
        if current.status == EnvironmentStatus::Failed {
            transition(&mut current, EnvironmentStatus::Pending)?;
        }
        let now = Utc::now();
        current.last_attempt_at = Some(now);

        match outcome {
            Ok(pod) => {
                transition(&mut current, EnvironmentStatus::Running)?;
                current.pod_name = Some(pod);
                current.started_at = Some(now);
                current.last_activity_at = Some(now);
                current.retry_count = 0;
                current.last_error = None;
                self.store.upsert_environment(&current).await?;
                self.store
                    .append_event(
                        &EnvironmentEvent::new(&current.id, EventType::Provisioned, "Environment is running")
                            .with_detail(serde_json::json!({ "attempt": attempt })),
                    )
                    .await?;
                summary.provisioned += 1;
                info!(environment_id = %current.id, attempt, "Environment running");
            }
            Err(failure) => {
                let permanent = failure.error.is_permanent();
                let fast_fail = permanent && self.settings.fast_fail_permanent_errors;
                current.retry_count = if fast_fail {
                    self.settings.max_retries
                } else {
                    (current.retry_count + 1).min(self.settings.max_retries)
                };
                current.last_error = Some(failure.to_string());

                let exhausted = current.retry_count >= self.settings.max_retries;
                transition(
                    &mut current,
                    if exhausted {
                        EnvironmentStatus::Failed
                    } else {
                        EnvironmentStatus::Pending
                    },
                )?;
                self.store.upsert_environment(&current).await?;

                self.store
                    .append_event(
                        &EnvironmentEvent::new(
                            &current.id,
                            EventType::ProvisionFailed,
                            failure.to_string(),
                        )
                        .with_detail(serde_json::json!({
                            "attempt": attempt,
                            "step": failure.step.as_str(),
                            "permanent": permanent,
                        })),
                    )
                    .await?;
                summary.provision_failures += 1;
                warn!(
                    environment_id = %current.id,
                    attempt,
                    step = failure.step.as_str(),
                    "Provisioning failed: {}",
                    failure.error
                );

                if exhausted {
                    let message = if fast_fail {
                        "Permanent provisioning error; explicit retry required".to_string()
                    } else {
                        format!(
                            "Gave up after {} attempts; explicit retry required",
                            current.retry_count
                        )
                    };
                    self.store
                        .append_event(&EnvironmentEvent::new(
                            &current.id,
                            EventType::RetriesExhausted,
                            message,
                        ))
                        .await?;
                    summary.exhausted += 1;
                    error!(environment_id = %current.id, "Environment marked failed");
                }
            }
        }
        Ok(())
    }

    async fn teardown(&self, env: Environment, summary: &mut TickSummary) -> Result<()> {
        let outcome = self.provisioner.teardown_environment(&env, false).await;
        let mut current = self.store.get_environment(&env.id).await?;
        current.last_attempt_at = Some(Utc::now());

        match outcome {
            Ok(()) if self.settings.preserve_terminated => {
                transition(&mut current, EnvironmentStatus::Terminated)?;
                current.terminated_at = Some(Utc::now());
                current.pod_name = None;
                current.last_error = None;
                self.store.upsert_environment(&current).await?;
                self.store
                    .append_event(&EnvironmentEvent::new(
                        &current.id,
                        EventType::Terminated,
                        "Cluster resources removed",
                    ))
                    .await?;
                summary.terminated += 1;
            }
            Ok(()) => {
                self.store.delete_environment(&current.id).await?;
                info!(environment_id = %current.id, "Environment record removed");
                summary.terminated += 1;
            }
            Err(e) => {
                current.last_error = Some(e.to_string());
                self.store.upsert_environment(&current).await?;
                self.store
                    .append_event(&EnvironmentEvent::new(
                        &current.id,
                        EventType::TeardownFailed,
                        e.to_string(),
                    ))
                    .await?;
                summary.teardown_failures += 1;
                warn!(environment_id = %current.id, "Teardown failed, will retry: {}", e);
            }
        }
        Ok(())
    }

    async fn check_idle(&self, env: Environment, summary: &mut TickSummary) -> Result<()> {
        let idle = self.settings.idle_timeout;
        if idle.is_zero() {
            return Ok(());
        }
        let Some(last) = env.last_activity_at.or(env.started_at) else {
            return Ok(());
        };
        let idle_for = Utc::now().signed_duration_since(last);
        if idle_for.to_std().map(|d| d < idle).unwrap_or(true) {
            return Ok(());
        }

        let mut current = env;
        transition(&mut current, EnvironmentStatus::Terminating)?;
        self.store.upsert_environment(&current).await?;
        self.store
            .append_event(&EnvironmentEvent::new(
                &current.id,
                EventType::IdleTimeout,
                format!("Idle for {}s, terminating", idle_for.num_seconds()),
            ))
            .await?;
        summary.idle_expired += 1;
        info!(environment_id = %current.id, "Idle timeout reached");
        Ok(())
    }
}

/// Apply a status change if the state machine allows it
pub(crate) fn transition(env: &mut Environment, next: EnvironmentStatus) -> Result<()> {
    if !env.status.can_transition_to(next) {
        return Err(SandboxError::InvalidStateTransition(format!(
            "{}: {} -> {}",
            env.id, env.status, next
        )));
    }
    env.status = next;
    Ok(())
}
