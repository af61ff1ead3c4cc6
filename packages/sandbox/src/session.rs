// ABOUTME: Interactive Session Proxy bridging a framed client connection to a remote exec in a primary pod
// ABOUTME: Injected session registry with a concurrency ceiling, three stdio relays and exactly-once close

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};
use crate::gateway::{ExecIo, ExecRequest, GatewayError};
use crate::naming;
use crate::provisioner::Provisioner;
use crate::settings::OrchestratorSettings;
use crate::storage::StateStore;
use crate::types::EnvironmentStatus;

const MAX_FRAME_BYTES: usize = 256 * 1024;
const PIPE_SIZE: usize = 64 * 1024;
const READ_CHUNK: usize = 8192;
/// How long buffered output may keep flowing after the remote process exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const EXIT_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// WIRE FRAMES
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Stdin,
    Stdout,
    Stderr,
    Exit,
}

/// One newline-delimited JSON message on the session connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default)]
    pub data: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

impl SessionFrame {
    pub fn new(frame_type: FrameType, data: impl Into<String>) -> Self {
        Self {
            frame_type,
            data: data.into(),
            timestamp: Utc::now(),
            exit_code: None,
        }
    }

    pub fn stdin(data: impl Into<String>) -> Self {
        Self::new(FrameType::Stdin, data)
    }

    fn exit(reason: &CloseReason) -> Self {
        let mut frame = Self::new(FrameType::Exit, reason.to_string());
        if let CloseReason::ProcessExited(code) = reason {
            frame.exit_code = Some(*code);
        }
        frame
    }
}

// ============================================================================
// SESSION STATE
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum CloseReason {
    ClientDisconnected,
    ProcessExited(i64),
    ExecFailed(String),
    IoError(String),
    AdminClosed,
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientDisconnected => write!(f, "client disconnected"),
            Self::ProcessExited(code) => write!(f, "process exited with code {}", code),
            Self::ExecFailed(e) => write!(f, "remote exec failed: {}", e),
            Self::IoError(e) => write!(f, "i/o error: {}", e),
            Self::AdminClosed => write!(f, "closed by administrator"),
            Self::Shutdown => write!(f, "orchestrator shutting down"),
        }
    }
}

/// Read-only view of a live session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub environment_id: String,
    pub namespace: String,
    pub pod_name: String,
    pub owner_id: String,
    pub state: SessionState,
    pub opened_at: DateTime<Utc>,
}

struct Session {
    id: String,
    environment_id: String,
    namespace: String,
    pod_name: String,
    owner_id: String,
    opened_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
}

impl Session {
    async fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            environment_id: self.environment_id.clone(),
            namespace: self.namespace.clone(),
            pod_name: self.pod_name.clone(),
            owner_id: self.owner_id.clone(),
            state: *self.state.lock().await,
            opened_at: self.opened_at,
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Live sessions by ID, bounded by a ceiling. Each proxy owns its own registry.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Check and insert under one write lock so the ceiling cannot be overshot
    async fn register(&self, session: Arc<Session>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(SandboxError::Capacity(format!(
                "session limit of {} reached",
                self.max_sessions
            )));
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn deregister(&self, id: &str) {
        self.sessions.write().await.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        infos
    }

    pub async fn get(&self, id: &str) -> Result<SessionInfo> {
        let session = self
            .sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;
        Ok(session.info().await)
    }

    /// Signal a session to close. The session's own task performs the close.
    pub async fn close(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;
        session.cancel.cancel();
        Ok(())
    }
}

// ============================================================================
// PROXY
// ============================================================================

/// A session accepted by the proxy. Awaiting it yields why the session ended.
#[derive(Debug)]
pub struct SessionHandle {
    id: String,
    task: JoinHandle<CloseReason>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> CloseReason {
        self.task
            .await
            .unwrap_or_else(|e| CloseReason::IoError(format!("session task failed: {}", e)))
    }
}

type FrameSink<S> = Arc<Mutex<SplitSink<Framed<S, LinesCodec>, String>>>;

pub struct SessionProxy {
    store: Arc<dyn StateStore>,
    provisioner: Arc<Provisioner>,
    registry: Arc<SessionRegistry>,
    shell: Vec<String>,
    shutdown: CancellationToken,
}

impl SessionProxy {
    pub fn new(
        store: Arc<dyn StateStore>,
        provisioner: Arc<Provisioner>,
        registry: Arc<SessionRegistry>,
        settings: &OrchestratorSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            provisioner,
            registry,
            shell: settings.session_shell.clone(),
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Attach `connection` to a shell in the environment's primary pod.
    ///
    /// The environment must be running and the session ceiling must have room;
    /// both are checked before any cluster call. The relay runs in the background
    /// and the returned handle resolves when the session closes.
    pub async fn attach<S>(
        &self,
        environment_id: &str,
        owner_id: &str,
        connection: S,
    ) -> Result<SessionHandle>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let env = self
            .store
            .get_environment(environment_id)
            .await
            .map_err(|e| SandboxError::environment_lookup(environment_id, e))?;
        if env.status != EnvironmentStatus::Running {
            return Err(SandboxError::Precondition(format!(
                "environment {} is {}, not running",
                env.id, env.status
            )));
        }
        let pod_name = env.pod_name.clone().ok_or_else(|| {
            SandboxError::Precondition(format!("environment {} has no primary pod", env.id))
        })?;

        let session = Arc::new(Session {
            id: naming::new_session_id(),
            environment_id: env.id.clone(),
            namespace: env.namespace.clone(),
            pod_name,
            owner_id: owner_id.to_string(),
            opened_at: Utc::now(),
            cancel: self.shutdown.child_token(),
            state: Mutex::new(SessionState::Connecting),
        });
        self.registry.register(session.clone()).await?;

        match self.store.touch_activity(&env.id, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                self.registry.deregister(&session.id).await;
                return Err(SandboxError::Precondition(format!(
                    "environment {} is no longer running",
                    env.id
                )));
            }
            Err(e) => {
                warn!(environment_id = %env.id, "Could not record session activity: {}", e);
            }
        }

        info!(
            session_id = %session.id,
            environment_id = %session.environment_id,
            "Interactive session attached"
        );

        let driver = SessionDriver {
            provisioner: self.provisioner.clone(),
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
            request: ExecRequest {
                command: self.shell.clone(),
                env: env.env_vars.clone(),
            },
        };
        let id = session.id.clone();
        let task = tokio::spawn(async move { driver.run(session, connection).await });
        Ok(SessionHandle { id, task })
    }

    pub async fn close_session(&self, id: &str) -> Result<()> {
        self.registry.close(id).await
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.list().await
    }
}

struct SessionDriver {
    provisioner: Arc<Provisioner>,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
    request: ExecRequest,
}

impl SessionDriver {
    async fn run<S>(self, session: Arc<Session>, connection: S) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let framed = Framed::new(connection, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
        let (sink, stream) = framed.split();
        let sink: FrameSink<S> = Arc::new(Mutex::new(sink));

        let (stdin_writer, stdin_reader) = tokio::io::duplex(PIPE_SIZE);
        let (stdout_writer, stdout_reader) = tokio::io::duplex(PIPE_SIZE);
        let (stderr_writer, stderr_reader) = tokio::io::duplex(PIPE_SIZE);
        let (closer, mut close_rx) = mpsc::channel::<CloseReason>(4);

        let exec_task = {
            let gateway = self.provisioner.gateway().clone();
            let namespace = session.namespace.clone();
            let pod = session.pod_name.clone();
            let request = self.request.clone();
            let cancel = session.cancel.clone();
            let closer = closer.clone();
            tokio::spawn(async move {
                let io = ExecIo {
                    stdin: Some(Box::new(stdin_reader)),
                    stdout: Box::new(stdout_writer),
                    stderr: Box::new(stderr_writer),
                };
                let reason = match gateway.exec_in_pod(&namespace, &pod, request, io, cancel).await {
                    Ok(code) => CloseReason::ProcessExited(code),
                    Err(GatewayError::Canceled) => return,
                    Err(e) => CloseReason::ExecFailed(e.to_string()),
                };
                let _ = closer.send(reason).await;
            })
        };

        *session.state.lock().await = SessionState::Active;

        let client_task = tokio::spawn(relay_client(stream, stdin_writer, closer.clone()));
        let mut stdout_task = tokio::spawn(relay_output(
            stdout_reader,
            sink.clone(),
            FrameType::Stdout,
            closer.clone(),
        ));
        let mut stderr_task = tokio::spawn(relay_output(
            stderr_reader,
            sink.clone(),
            FrameType::Stderr,
            closer,
        ));

        let reason = tokio::select! {
            _ = session.cancel.cancelled() => {
                if self.shutdown.is_cancelled() {
                    CloseReason::Shutdown
                } else {
                    CloseReason::AdminClosed
                }
            }
            reason = close_rx.recv() => reason.unwrap_or(CloseReason::ClientDisconnected),
        };

        if matches!(reason, CloseReason::ProcessExited(_)) {
            // Let the output relays forward what the process wrote before it exited
            let drain = async {
                let _ = (&mut stdout_task).await;
                let _ = (&mut stderr_task).await;
            };
            if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
                debug!(session_id = %session.id, "Output still flowing after process exit");
            }
        }

        self.close(&session, &sink, &reason).await;
        client_task.abort();
        stdout_task.abort();
        stderr_task.abort();
        exec_task.abort();
        reason
    }

    /// Runs at most once per session, whatever triggered it
    async fn close<S>(&self, session: &Session, sink: &FrameSink<S>, reason: &CloseReason)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut state = session.state.lock().await;
        if *state == SessionState::Closed {
            return;
        }
        *state = SessionState::Closed;

        // Stops the remote exec if it is still running
        session.cancel.cancel();

        let goodbye = async {
            let mut sink = sink.lock().await;
            if let Ok(line) = serde_json::to_string(&SessionFrame::exit(reason)) {
                let _ = sink.send(line).await;
            }
            let _ = sink.close().await;
        };
        if tokio::time::timeout(EXIT_FRAME_TIMEOUT, goodbye).await.is_err() {
            debug!(session_id = %session.id, "Exit frame not delivered before the connection closed");
        }

        drop(state);
        self.registry.deregister(&session.id).await;
        info!(session_id = %session.id, reason = %reason, "Interactive session closed");
    }
}

/// Client frames to the process stdin. Dropping the writer signals EOF.
async fn relay_client<S>(
    mut stream: SplitStream<Framed<S, LinesCodec>>,
    mut stdin: DuplexStream,
    closer: mpsc::Sender<CloseReason>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let reason = loop {
        match stream.next().await {
            None => break CloseReason::ClientDisconnected,
            Some(Err(e)) => break CloseReason::IoError(e.to_string()),
            Some(Ok(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<SessionFrame>(&line) {
                    Ok(frame) if frame.frame_type == FrameType::Stdin => {
                        if let Err(e) = stdin.write_all(frame.data.as_bytes()).await {
                            break CloseReason::IoError(e.to_string());
                        }
                        if let Err(e) = stdin.flush().await {
                            break CloseReason::IoError(e.to_string());
                        }
                    }
                    Ok(frame) => {
                        debug!("Ignoring client frame of type {:?}", frame.frame_type);
                    }
                    Err(e) => warn!("Ignoring malformed session frame: {}", e),
                }
            }
        }
    };
    drop(stdin);
    let _ = closer.send(reason).await;
}

/// Process output to framed messages until EOF
async fn relay_output<S>(
    mut reader: DuplexStream,
    sink: FrameSink<S>,
    frame_type: FrameType,
    closer: mpsc::Sender<CloseReason>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut decoder = Utf8Carry::default();
    loop {
        let text = match reader.read(&mut buf).await {
            Ok(0) => {
                if let Some(rest) = decoder.finish() {
                    if let Err(reason) = send_frame(&sink, frame_type, rest).await {
                        let _ = closer.send(reason).await;
                    }
                }
                return;
            }
            Ok(n) => decoder.push(&buf[..n]),
            Err(e) => {
                let _ = closer.send(CloseReason::IoError(e.to_string())).await;
                return;
            }
        };
        if text.is_empty() {
            continue;
        }
        if let Err(reason) = send_frame(&sink, frame_type, text).await {
            let _ = closer.send(reason).await;
            return;
        }
    }
}

async fn send_frame<S>(
    sink: &FrameSink<S>,
    frame_type: FrameType,
    data: String,
) -> std::result::Result<(), CloseReason>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let line = serde_json::to_string(&SessionFrame::new(frame_type, data))
        .map_err(|e| CloseReason::IoError(e.to_string()))?;
    sink.lock()
        .await
        .send(line)
        .await
        .map_err(|e| CloseReason::IoError(e.to_string()))
}

/// Incremental UTF-8 decoding across reads. A multibyte character split
/// between two reads is held back until its remaining bytes arrive.
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let leftover = rest.to_vec();
        self.pending = leftover;
        out
    }

    /// Whatever is still held back at end of stream, decoded lossily
    fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).into_owned())
        }
    }
}
