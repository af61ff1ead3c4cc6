// ABOUTME: Sandbox lifecycle orchestration engine for isolated execution environments on a cluster
// ABOUTME: Module tree and public re-exports for the reconciler, pool, executor, session proxy and facade

pub mod error;
pub mod executor;
pub mod gateway;
pub mod manager;
pub mod naming;
pub mod orchestrator;
pub mod pool;
pub mod provisioner;
pub mod reconciler;
pub mod session;
pub mod settings;
pub mod storage;
pub mod types;
pub mod validation;

pub use error::{Result, SandboxError};
pub use executor::{ExecutionEngine, SubmitExecution};
pub use gateway::{ClusterGateway, DockerGateway, GatewayError, InMemoryGateway};
pub use manager::{
    CreateEnvironmentRequest, DeletionOutcome, HealthInfo, SandboxManager, SyncExecResult,
    UpdateEnvironmentRequest,
};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use pool::{PoolStatus, StandbyPool};
pub use reconciler::{Reconciler, TickSummary};
pub use session::{
    CloseReason, FrameType, SessionFrame, SessionHandle, SessionInfo, SessionProxy,
    SessionRegistry, SessionState,
};
pub use settings::OrchestratorSettings;
pub use storage::{SqliteStateStore, StateStore};
pub use types::{
    Environment, EnvironmentEvent, EnvironmentFilter, EnvironmentStatus, EventType, Execution,
    ExecutionFilter, ExecutionStatus, IsolationPolicy, NetworkPolicy, NodeAffinity, ResourceSpec,
    SecurityContext, StandbyPoolPolicy, Toleration, TolerationOperator,
};
