//! Session model and lifecycle state machine.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::backend::schema::McpServer;
use crate::backend::AgentClient;
use crate::session::pump::PumpInput;
use crate::session::sink::EventSink;
use crate::translate::SessionEvent;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Id reserved, no backend yet.
    Created,
    /// Backend spawned; handshake and session establishment running.
    Initializing,
    /// Idle; accepts a prompt, a cancel, a model change, or a destroy.
    Ready,
    /// Exactly one prompt in flight.
    Prompting,
    /// Destroy requested.
    Closing,
    /// Destroyed.
    Closed,
    /// Backend crash, protocol violation, or timeout.
    Failed,
}

impl SessionState {
    /// Whether `self -> next` is a permitted transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Initializing)
                | (Self::Initializing | Self::Prompting, Self::Ready)
                | (Self::Ready, Self::Prompting)
                | (
                    Self::Created | Self::Initializing | Self::Ready | Self::Prompting,
                    Self::Closing | Self::Failed
                )
                | (Self::Closing, Self::Closed)
        )
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Immutable attributes fixed at creation.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// Client-visible id.
    pub id: String,
    /// Backend kind.
    pub backend: String,
    /// Working directory.
    pub cwd: PathBuf,
    /// Model requested at creation.
    pub model: Option<String>,
    /// MCP servers passed to the agent.
    pub mcp_servers: Vec<McpServer>,
    /// Whether the client answers permission requests.
    pub request_permission: bool,
}

/// Backend connection and event pump input, attached once initialization
/// has spawned the backend.
#[derive(Debug, Clone)]
pub(crate) struct SessionRuntime {
    pub(crate) client: AgentClient,
    pub(crate) pump: mpsc::Sender<PumpInput>,
}

/// One proxy session.
pub struct Session {
    /// Client-visible id.
    pub id: String,
    /// Backend kind.
    pub backend: String,
    /// Working directory.
    pub cwd: PathBuf,
    /// MCP servers passed to the agent.
    pub mcp_servers: Vec<McpServer>,
    /// Whether the client answers permission requests.
    pub request_permission: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    pub(crate) seq: u64,
    state: watch::Sender<SessionState>,
    cancelling: AtomicBool,
    model: Mutex<Option<String>>,
    modified_at: Mutex<DateTime<Utc>>,
    history: Mutex<Vec<Value>>,
    sink: RwLock<Arc<dyn EventSink>>,
    agent_session_id: OnceLock<String>,
    runtime: OnceLock<SessionRuntime>,
    turn: Mutex<Option<CancellationToken>>,
    pub(crate) permissions: TaskTracker,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session in [`SessionState::Created`].
    #[must_use]
    pub fn new(spec: SessionSpec, seq: u64, sink: Arc<dyn EventSink>) -> Self {
        let now = Utc::now();
        let (state, _) = watch::channel(SessionState::Created);
        Self {
            id: spec.id,
            backend: spec.backend,
            cwd: spec.cwd,
            mcp_servers: spec.mcp_servers,
            request_permission: spec.request_permission,
            created_at: now,
            seq,
            state,
            cancelling: AtomicBool::new(false),
            model: Mutex::new(spec.model),
            modified_at: Mutex::new(now),
            history: Mutex::new(Vec::new()),
            sink: RwLock::new(sink),
            agent_session_id: OnceLock::new(),
            runtime: OnceLock::new(),
            turn: Mutex::new(None),
            permissions: TaskTracker::new(),
        }
    }

    // ── State ────────────────────────────────────────────────────────────────

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `next` if permitted. Returns whether the transition happened.
    pub fn try_transition(&self, next: SessionState) -> bool {
        let mut from = None;
        let moved = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                from = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(session_id = %self.id, ?from, to = ?next, "session state changed");
        }
        moved
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Whether a cancel is pending for the running turn.
    #[must_use]
    pub fn is_cancelling(&self) -> bool {
        self.cancelling.load(Ordering::Acquire)
    }

    pub(crate) fn set_cancelling(&self, value: bool) {
        self.cancelling.store(value, Ordering::Release);
    }

    // ── Attributes ───────────────────────────────────────────────────────────

    /// Selected model.
    pub async fn model(&self) -> Option<String> {
        self.model.lock().await.clone()
    }

    pub(crate) async fn set_model(&self, model: Option<String>) {
        *self.model.lock().await = model;
    }

    /// Last activity time.
    pub async fn modified_at(&self) -> DateTime<Utc> {
        *self.modified_at.lock().await
    }

    pub(crate) async fn touch(&self) {
        *self.modified_at.lock().await = Utc::now();
    }

    /// Events delivered so far, in wire shape.
    pub async fn history(&self) -> Vec<Value> {
        self.history.lock().await.clone()
    }

    pub(crate) async fn record(&self, event: &SessionEvent) {
        self.history.lock().await.push(event.to_value());
    }

    /// Entry for `session.list`.
    pub async fn summary(&self) -> Value {
        json!({
            "sessionId": self.id,
            "startTime": self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "modifiedTime": self.modified_at().await.to_rfc3339_opts(SecondsFormat::Millis, true),
            "summary": format!("Session with {}", self.backend),
            "isRemote": false,
        })
    }

    pub(crate) async fn sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&*self.sink.read().await)
    }

    pub(crate) async fn set_sink(&self, sink: Arc<dyn EventSink>) {
        *self.sink.write().await = sink;
    }

    // ── Backend ──────────────────────────────────────────────────────────────

    /// Agent-assigned session id, once established.
    #[must_use]
    pub fn agent_session_id(&self) -> Option<&str> {
        self.agent_session_id.get().map(String::as_str)
    }

    pub(crate) fn set_agent_session_id(&self, id: String) {
        let _ = self.agent_session_id.set(id);
    }

    pub(crate) fn attach(&self, runtime: SessionRuntime) {
        let _ = self.runtime.set(runtime);
    }

    pub(crate) fn client(&self) -> Option<&AgentClient> {
        self.runtime.get().map(|rt| &rt.client)
    }

    // ── Turns ────────────────────────────────────────────────────────────────

    pub(crate) async fn begin_turn_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.turn.lock().await = Some(token.clone());
        token
    }

    pub(crate) async fn clear_turn_token(&self) {
        self.turn.lock().await.take();
    }

    /// Force the in-flight prompt, if any, to stop waiting for the backend.
    pub(crate) async fn abort_turn(&self) {
        if let Some(token) = self.turn.lock().await.take() {
            token.cancel();
        }
    }

    // ── Event pump ───────────────────────────────────────────────────────────

    /// Queue an input for the event pump without waiting.
    pub(crate) async fn enqueue(&self, input: PumpInput) {
        if let Some(rt) = self.runtime.get() {
            if rt.pump.send(input).await.is_err() {
                debug!(session_id = %self.id, "event pump already stopped");
            }
        }
    }

    /// Queue an input carrying a completion slot and wait until the pump
    /// has delivered everything queued before it.
    pub(crate) async fn enqueue_and_wait<F>(&self, make: F)
    where
        F: FnOnce(oneshot::Sender<()>) -> PumpInput,
    {
        let (done, delivered) = oneshot::channel();
        self.enqueue(make(done)).await;
        let _ = delivered.await;
    }
}
