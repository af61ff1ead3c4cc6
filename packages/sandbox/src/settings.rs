// ABOUTME: Orchestrator settings loaded from CORRAL_* environment variables
// ABOUTME: Defaults, parsing and validation for loop intervals, retry budget, queues, sessions and ceilings

use std::str::FromStr;
use std::time::Duration;

use corral_config::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};
use crate::validation;

pub const MIN_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    // Reconciler
    pub reconcile_interval: Duration,
    pub max_retries: u32,
    pub startup_timeout: Duration,
    pub cluster_call_timeout: Duration,
    /// Zero disables idle termination
    pub idle_timeout: Duration,
    pub fast_fail_permanent_errors: bool,
    /// Keep terminated records (soft delete) instead of removing them
    pub preserve_terminated: bool,

    // Standby pool
    pub pool_interval: Duration,
    pub standby_namespace: String,

    // Execution engine
    pub execution_workers: usize,
    pub execution_queue_capacity: usize,
    pub default_execution_timeout: Duration,
    pub max_execution_timeout: Duration,
    pub max_output_bytes: usize,

    // Interactive sessions
    pub max_sessions: usize,
    pub session_shell: Vec<String>,

    // Per-environment ceilings, in quantity notation
    pub max_cpu: Option<String>,
    pub max_memory: Option<String>,
    pub max_storage: Option<String>,
    /// Empty allows any runtime class
    pub allowed_runtime_classes: Vec<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(15),
            max_retries: 5,
            startup_timeout: Duration::from_secs(120),
            cluster_call_timeout: Duration::from_secs(30),
            idle_timeout: Duration::ZERO,
            fast_fail_permanent_errors: true,
            preserve_terminated: true,
            pool_interval: Duration::from_secs(30),
            standby_namespace: "corral-standby".to_string(),
            execution_workers: 4,
            execution_queue_capacity: 256,
            default_execution_timeout: Duration::from_secs(300),
            max_execution_timeout: Duration::from_secs(3600),
            max_output_bytes: 1024 * 1024,
            max_sessions: 100,
            session_shell: vec!["/bin/sh".to_string()],
            max_cpu: None,
            max_memory: None,
            max_storage: None,
            allowed_runtime_classes: Vec::new(),
        }
    }
}

impl OrchestratorSettings {
    /// Read settings from the process environment, falling back to defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let secs = |name: &str, default: Duration| -> Result<Duration> {
            Ok(Duration::from_secs(parse_var(&lookup, name, default.as_secs())?))
        };

        let settings = Self {
            reconcile_interval: secs(CORRAL_RECONCILE_INTERVAL_SECS, defaults.reconcile_interval)?,
            max_retries: parse_var(&lookup, CORRAL_MAX_RETRIES, defaults.max_retries)?,
            startup_timeout: secs(CORRAL_STARTUP_TIMEOUT_SECS, defaults.startup_timeout)?,
            cluster_call_timeout: secs(
                CORRAL_CLUSTER_CALL_TIMEOUT_SECS,
                defaults.cluster_call_timeout,
            )?,
            idle_timeout: Duration::from_secs(
                parse_var(&lookup, CORRAL_IDLE_TIMEOUT_MINUTES, 0u64)? * 60,
            ),
            fast_fail_permanent_errors: parse_var(
                &lookup,
                CORRAL_FAST_FAIL_PERMANENT_ERRORS,
                defaults.fast_fail_permanent_errors,
            )?,
            preserve_terminated: parse_var(
                &lookup,
                CORRAL_PRESERVE_TERMINATED,
                defaults.preserve_terminated,
            )?,
            pool_interval: secs(CORRAL_POOL_INTERVAL_SECS, defaults.pool_interval)?,
            standby_namespace: lookup(CORRAL_STANDBY_NAMESPACE)
                .unwrap_or(defaults.standby_namespace),
            execution_workers: parse_var(
                &lookup,
                CORRAL_EXECUTION_WORKERS,
                defaults.execution_workers,
            )?,
            execution_queue_capacity: parse_var(
                &lookup,
                CORRAL_EXECUTION_QUEUE_CAPACITY,
                defaults.execution_queue_capacity,
            )?,
            default_execution_timeout: secs(
                CORRAL_DEFAULT_EXECUTION_TIMEOUT_SECS,
                defaults.default_execution_timeout,
            )?,
            max_execution_timeout: secs(
                CORRAL_MAX_EXECUTION_TIMEOUT_SECS,
                defaults.max_execution_timeout,
            )?,
            max_output_bytes: parse_var(&lookup, CORRAL_MAX_OUTPUT_BYTES, defaults.max_output_bytes)?,
            max_sessions: parse_var(&lookup, CORRAL_MAX_SESSIONS, defaults.max_sessions)?,
            session_shell: lookup(CORRAL_SESSION_SHELL)
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or(defaults.session_shell),
            max_cpu: lookup(CORRAL_MAX_CPU).filter(|s| !s.trim().is_empty()),
            max_memory: lookup(CORRAL_MAX_MEMORY).filter(|s| !s.trim().is_empty()),
            max_storage: lookup(CORRAL_MAX_STORAGE).filter(|s| !s.trim().is_empty()),
            allowed_runtime_classes: lookup(CORRAL_ALLOWED_RUNTIME_CLASSES)
                .map(|s| {
                    s.split(',')
                        .map(|c| c.trim().to_string())
                        .filter(|c| !c.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconcile_interval < MIN_RECONCILE_INTERVAL {
            return Err(SandboxError::Config(format!(
                "reconcile interval must be at least {}s, got {}s",
                MIN_RECONCILE_INTERVAL.as_secs(),
                self.reconcile_interval.as_secs()
            )));
        }
        if self.max_retries == 0 {
            return Err(SandboxError::Config("max retries must be at least 1".into()));
        }
        if self.execution_workers == 0 {
            return Err(SandboxError::Config(
                "at least one execution worker is required".into(),
            ));
        }
        if self.execution_queue_capacity == 0 {
            return Err(SandboxError::Config(
                "execution queue capacity must be at least 1".into(),
            ));
        }
        if self.max_sessions == 0 {
            return Err(SandboxError::Config("max sessions must be at least 1".into()));
        }
        if self.default_execution_timeout.is_zero()
            || self.default_execution_timeout > self.max_execution_timeout
        {
            return Err(SandboxError::Config(format!(
                "default execution timeout ({}s) must be positive and not exceed the maximum ({}s)",
                self.default_execution_timeout.as_secs(),
                self.max_execution_timeout.as_secs()
            )));
        }
        if self.session_shell.is_empty() {
            return Err(SandboxError::Config("session shell command is empty".into()));
        }
        if let Some(cpu) = &self.max_cpu {
            validation::parse_cpu_millis(cpu).map_err(SandboxError::Config)?;
        }
        for quantity in [&self.max_memory, &self.max_storage].into_iter().flatten() {
            validation::parse_bytes(quantity).map_err(SandboxError::Config)?;
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| SandboxError::Config(format!("invalid value for {}: {:?}", name, raw))),
        _ => Ok(default),
    }
}
