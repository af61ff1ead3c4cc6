// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Corral

// Process Configuration
pub const CORRAL_DATABASE_URL: &str = "CORRAL_DATABASE_URL";
pub const CORRAL_GATEWAY: &str = "CORRAL_GATEWAY";
pub const CORRAL_LOG_FORMAT: &str = "CORRAL_LOG_FORMAT";
pub const RUST_LOG: &str = "RUST_LOG";

// Reconciler
pub const CORRAL_RECONCILE_INTERVAL_SECS: &str = "CORRAL_RECONCILE_INTERVAL_SECS";
pub const CORRAL_MAX_RETRIES: &str = "CORRAL_MAX_RETRIES";
pub const CORRAL_STARTUP_TIMEOUT_SECS: &str = "CORRAL_STARTUP_TIMEOUT_SECS";
pub const CORRAL_CLUSTER_CALL_TIMEOUT_SECS: &str = "CORRAL_CLUSTER_CALL_TIMEOUT_SECS";
pub const CORRAL_IDLE_TIMEOUT_MINUTES: &str = "CORRAL_IDLE_TIMEOUT_MINUTES";
pub const CORRAL_FAST_FAIL_PERMANENT_ERRORS: &str = "CORRAL_FAST_FAIL_PERMANENT_ERRORS";
pub const CORRAL_PRESERVE_TERMINATED: &str = "CORRAL_PRESERVE_TERMINATED";

// Standby Pool
pub const CORRAL_POOL_INTERVAL_SECS: &str = "CORRAL_POOL_INTERVAL_SECS";
pub const CORRAL_STANDBY_NAMESPACE: &str = "CORRAL_STANDBY_NAMESPACE";

// Execution Engine
pub const CORRAL_EXECUTION_WORKERS: &str = "CORRAL_EXECUTION_WORKERS";
pub const CORRAL_EXECUTION_QUEUE_CAPACITY: &str = "CORRAL_EXECUTION_QUEUE_CAPACITY";
pub const CORRAL_DEFAULT_EXECUTION_TIMEOUT_SECS: &str = "CORRAL_DEFAULT_EXECUTION_TIMEOUT_SECS";
pub const CORRAL_MAX_EXECUTION_TIMEOUT_SECS: &str = "CORRAL_MAX_EXECUTION_TIMEOUT_SECS";
pub const CORRAL_MAX_OUTPUT_BYTES: &str = "CORRAL_MAX_OUTPUT_BYTES";

// Interactive Sessions
pub const CORRAL_MAX_SESSIONS: &str = "CORRAL_MAX_SESSIONS";
pub const CORRAL_SESSION_SHELL: &str = "CORRAL_SESSION_SHELL";

// Resource Ceilings
pub const CORRAL_MAX_CPU: &str = "CORRAL_MAX_CPU";
pub const CORRAL_MAX_MEMORY: &str = "CORRAL_MAX_MEMORY";
pub const CORRAL_MAX_STORAGE: &str = "CORRAL_MAX_STORAGE";
pub const CORRAL_ALLOWED_RUNTIME_CLASSES: &str = "CORRAL_ALLOWED_RUNTIME_CLASSES";
