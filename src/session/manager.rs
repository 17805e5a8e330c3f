//! Session table and lifecycle operations.
//!
//! The manager owns every live session, its backend connection, and its
//! event pump. Per-session operations are serialized by the session state
//! machine: a prompt is admitted only from `Ready`, and `Closing` blocks
//! everything but the destroy already in progress. Operations on different
//! sessions never wait on each other.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backend::schema::{PromptResult, RequestPermissionParams, RequestPermissionResponse};
use crate::backend::{AgentClient, BackendLauncher, LaunchSpec};
use crate::config::{BackendProfile, ProxyConfig, Timeouts};
use crate::permission::{self, PermissionBridge};
use crate::session::model::{Session, SessionRuntime, SessionSpec, SessionState};
use crate::session::pump::{self, PumpInput, PUMP_CAPACITY};
use crate::session::sink::EventSink;
use crate::translate::methods::{self, Attachment, CreateParams};
use crate::translate::{kinds, AgentCall, ClientMethod, EventTable, SessionEvent};
use crate::wire::RequestId;
use crate::{AppError, Result};

/// Result of `session.create` / `session.resume`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    /// Client-visible session id.
    pub session_id: String,
    /// Working directory of the session.
    pub workspace_path: PathBuf,
}

#[derive(Default)]
struct Registry {
    live: HashMap<String, Arc<Session>>,
    used: HashSet<String>,
    next_seq: u64,
}

struct ManagerInner {
    config: Arc<ProxyConfig>,
    timeouts: Timeouts,
    launcher: Arc<dyn BackendLauncher>,
    bridge: Arc<PermissionBridge>,
    table: Arc<EventTable>,
    registry: RwLock<Registry>,
}

/// Owns live sessions; cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("timeouts", &self.inner.timeouts)
            .finish_non_exhaustive()
    }
}

enum TurnOutcome {
    Completed(Result<PromptResult>),
    TimedOut,
    Aborted,
}

impl SessionManager {
    /// Create a manager using the configured timeouts.
    #[must_use]
    pub fn new(config: Arc<ProxyConfig>, launcher: Arc<dyn BackendLauncher>) -> Self {
        let timeouts = config.timeouts();
        Self::with_timeouts(config, launcher, timeouts)
    }

    /// Create a manager with explicit timeouts.
    #[must_use]
    pub fn with_timeouts(
        config: Arc<ProxyConfig>,
        launcher: Arc<dyn BackendLauncher>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                bridge: Arc::new(PermissionBridge::new(timeouts.permission)),
                timeouts,
                launcher,
                table: Arc::new(EventTable::new()),
                registry: RwLock::new(Registry::default()),
            }),
        }
    }

    /// Proxy configuration.
    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    /// Permission bridge shared by all sessions.
    #[must_use]
    pub fn bridge(&self) -> &Arc<PermissionBridge> {
        &self.inner.bridge
    }

    // ── Creation ─────────────────────────────────────────────────────────────

    /// Create a session, spawn its backend, and establish the agent session.
    ///
    /// Returns once `session.start` has been delivered and the session is
    /// `Ready`.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidParams` for an unknown backend, an unoffered
    ///   model, or malformed MCP servers.
    /// - `AppError::SessionIdInUse` if the id is live or was used before.
    /// - `AppError::Spawn`, `AppError::BackendGone`, `AppError::Protocol`,
    ///   `AppError::Agent`, or `AppError::Timeout` if initialization fails.
    pub async fn create(&self, params: CreateParams, sink: Arc<dyn EventSink>) -> Result<CreatedSession> {
        let config = &self.inner.config;
        let kind = params
            .backend
            .clone()
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| config.default_backend.clone());
        let profile = config
            .profile(&kind)
            .cloned()
            .ok_or_else(|| AppError::InvalidParams(format!("unknown backend: {kind}")))?;
        let model = params.model.clone().filter(|m| !m.is_empty());
        if let Some(model) = model.as_deref() {
            if !profile.accepts_model(model) {
                return Err(AppError::InvalidParams(format!(
                    "model {model} is not offered by backend {kind}"
                )));
            }
        }
        let mcp_servers = methods::project_mcp_servers(params.mcp_servers.as_ref())?;
        let cwd = params
            .working_directory
            .as_deref()
            .filter(|d| !d.is_empty())
            .map_or_else(|| config.default_cwd.clone(), PathBuf::from);
        let session_id = params
            .session_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let session = self
            .reserve(
                SessionSpec {
                    id: session_id.clone(),
                    backend: kind.clone(),
                    cwd: cwd.clone(),
                    model: model.clone(),
                    mcp_servers,
                    request_permission: params.request_permission,
                },
                sink,
            )
            .await?;

        let span = info_span!("session", session_id = %session_id, backend = %kind);
        async {
            session.try_transition(SessionState::Initializing);
            let established = tokio::time::timeout(
                self.inner.timeouts.initialize,
                self.establish(&session, &profile, model.as_deref()),
            )
            .await;
            let failure = match established {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err),
                Err(_elapsed) => Some(AppError::Timeout(format!(
                    "backend {kind} did not initialize within {:?}",
                    self.inner.timeouts.initialize
                ))),
            };
            if let Some(err) = failure {
                warn!(%err, "session initialization failed");
                self.abandon(&session).await;
                return Err(err);
            }

            let start = SessionEvent::new(
                kinds::SESSION_START,
                json!({
                    "cwd": cwd.display().to_string(),
                    "model": model.as_deref().unwrap_or("default"),
                    "backend": kind,
                }),
            );
            session
                .enqueue_and_wait(|done| PumpInput::Lifecycle { event: start, done })
                .await;
            if !session.try_transition(SessionState::Ready) {
                self.abandon(&session).await;
                return Err(AppError::SessionClosed(format!(
                    "session {session_id} closed during initialization"
                )));
            }
            info!("session ready");
            Ok(CreatedSession {
                session_id: session_id.clone(),
                workspace_path: cwd.clone(),
            })
        }
        .instrument(span)
        .await
    }

    /// Re-attach to a live session, or create it if the id has never existed.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidParams` if no session id is given.
    /// - Any error of [`Self::create`].
    pub async fn resume(&self, params: CreateParams, sink: Arc<dyn EventSink>) -> Result<CreatedSession> {
        let session_id = params
            .session_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::InvalidParams("session.resume: sessionId is required".into()))?;

        let Some(session) = self.lookup(&session_id).await else {
            return self.create(params, sink).await;
        };
        session.set_sink(sink).await;
        session.touch().await;
        let event = SessionEvent::new(
            kinds::SESSION_RESUME,
            json!({ "cwd": session.cwd.display().to_string() }),
        );
        session
            .enqueue_and_wait(|done| PumpInput::Lifecycle { event, done })
            .await;
        info!(session_id = %session_id, "session resumed");
        Ok(CreatedSession {
            session_id,
            workspace_path: session.cwd.clone(),
        })
    }

    async fn reserve(&self, spec: SessionSpec, sink: Arc<dyn EventSink>) -> Result<Arc<Session>> {
        let mut registry = self.inner.registry.write().await;
        if registry.live.contains_key(&spec.id) || registry.used.contains(&spec.id) {
            return Err(AppError::SessionIdInUse(format!(
                "session id {} is already in use",
                spec.id
            )));
        }
        registry.next_seq += 1;
        let seq = registry.next_seq;
        let session = Arc::new(Session::new(spec, seq, sink));
        registry.used.insert(session.id.clone());
        registry.live.insert(session.id.clone(), Arc::clone(&session));
        Ok(session)
    }

    async fn establish(&self, session: &Arc<Session>, profile: &BackendProfile, model: Option<&str>) -> Result<()> {
        let spec = LaunchSpec {
            kind: session.backend.clone(),
            profile: profile.clone(),
            cwd: session.cwd.clone(),
            args: profile.launch_args(self.inner.config.backend_args_for(&session.backend), model),
        };
        let process = self.inner.launcher.launch(&spec).await?;

        let (tx, rx) = mpsc::channel::<PumpInput>(PUMP_CAPACITY);
        let client = AgentClient::start(process, tx.clone(), session.cwd.clone());
        session.attach(SessionRuntime {
            client: client.clone(),
            pump: tx,
        });
        tokio::spawn(
            pump::run(
                Arc::clone(session),
                rx,
                Arc::clone(&self.inner.table),
                self.clone(),
            )
            .in_current_span(),
        );

        for call in ClientMethod::SessionCreate.agent_calls() {
            match call {
                AgentCall::Initialize => {
                    client.initialize().await?;
                }
                AgentCall::NewSession => {
                    let created = client
                        .new_session(&session.cwd, session.mcp_servers.clone())
                        .await?;
                    debug!(agent_session_id = %created.session_id, "agent session established");
                    session.set_agent_session_id(created.session_id);
                }
                AgentCall::SetModel => {
                    if let (Some(model), true) = (model, profile.supports_set_model) {
                        client.set_model(agent_session_id(session)?, model).await?;
                    }
                }
                AgentCall::Prompt | AgentCall::Cancel | AgentCall::Terminate => {}
            }
        }
        Ok(())
    }

    /// Tear down a session whose creation did not complete.
    async fn abandon(&self, session: &Arc<Session>) {
        self.unregister(&session.id).await;
        session.try_transition(SessionState::Failed);
        if let Some(client) = session.client() {
            client.close(self.inner.timeouts.terminate).await;
        }
        session
            .enqueue_and_wait(|done| PumpInput::Shutdown { event: None, done })
            .await;
    }

    // ── Turns ────────────────────────────────────────────────────────────────

    /// Run one prompt turn and return the user message id.
    ///
    /// Events stream to the session's sink while the turn runs; the call
    /// returns after `session.idle` has been delivered.
    ///
    /// # Errors
    ///
    /// - `AppError::SessionNotFound` for an unknown or finished session.
    /// - `AppError::SessionBusy` while another prompt, a cancel, or
    ///   initialization is in progress.
    /// - `AppError::BackendGone` if the backend died during the turn.
    /// - `AppError::Agent` if the agent rejected the prompt.
    /// - `AppError::Timeout` if the turn exceeded the prompt timeout; the
    ///   session fails.
    /// - `AppError::SessionClosed` if the session was destroyed mid-turn.
    pub async fn prompt(&self, session_id: &str, prompt: &str, attachments: &[Attachment]) -> Result<String> {
        let session = self.live(session_id).await?;
        if !session.try_transition(SessionState::Prompting) {
            return Err(match session.state() {
                SessionState::Prompting if session.is_cancelling() => {
                    AppError::SessionBusy(format!("session {session_id} is cancelling its turn"))
                }
                SessionState::Prompting => {
                    AppError::SessionBusy(format!("session {session_id} already has a prompt in flight"))
                }
                SessionState::Created | SessionState::Initializing => {
                    AppError::SessionBusy(format!("session {session_id} is still initializing"))
                }
                SessionState::Ready => AppError::SessionBusy(format!("session {session_id} changed state")),
                SessionState::Closing | SessionState::Closed | SessionState::Failed => {
                    AppError::SessionNotFound(format!("session {session_id} is closed"))
                }
            });
        }

        let span = info_span!("turn", session_id = %session_id);
        self.run_turn(&session, prompt, attachments).instrument(span).await
    }

    async fn run_turn(&self, session: &Arc<Session>, prompt: &str, attachments: &[Attachment]) -> Result<String> {
        session.set_cancelling(false);
        session.touch().await;
        let turn = session.begin_turn_token().await;
        let (Some(client), Ok(agent_session)) = (session.client(), agent_session_id(session)) else {
            session.clear_turn_token().await;
            session.try_transition(SessionState::Ready);
            return Err(AppError::SessionNotFound(format!("session {} has no backend", session.id)));
        };

        let message_id = Uuid::new_v4().to_string();
        session
            .enqueue(PumpInput::TurnStarted {
                prompt: prompt.to_owned(),
                message_id: message_id.clone(),
            })
            .await;
        let blocks = methods::project_prompt(prompt, attachments);
        debug!(blocks = blocks.len(), "prompt sent");

        let outcome = tokio::select! {
            biased;
            () = turn.cancelled() => TurnOutcome::Aborted,
            result = tokio::time::timeout(self.inner.timeouts.prompt, client.prompt(agent_session, blocks)) => {
                result.map_or(TurnOutcome::TimedOut, TurnOutcome::Completed)
            }
        };
        session.clear_turn_token().await;
        session.touch().await;
        self.settle_turn(session, outcome).await.map(|()| message_id)
    }

    async fn settle_turn(&self, session: &Arc<Session>, outcome: TurnOutcome) -> Result<()> {
        match outcome {
            TurnOutcome::Completed(Ok(result)) => {
                self.finish_turn(session, &result.stop_reason).await;
                info!(stop_reason = %result.stop_reason, "turn finished");
                Ok(())
            }
            TurnOutcome::Completed(Err(err)) if err.is_transport() || matches!(err, AppError::SessionClosed(_)) => {
                warn!(%err, "turn aborted by transport failure");
                Err(err)
            }
            TurnOutcome::Completed(Err(err)) => {
                warn!(%err, "agent rejected the prompt");
                let error = err.to_string();
                session
                    .enqueue_and_wait(|done| PumpInput::TurnFailed { error, done })
                    .await;
                session.set_cancelling(false);
                session.try_transition(SessionState::Ready);
                Err(err)
            }
            TurnOutcome::TimedOut => {
                let err = AppError::Timeout(format!("prompt exceeded {:?}", self.inner.timeouts.prompt));
                let error = err.to_string();
                session
                    .enqueue_and_wait(|done| PumpInput::TurnFailed { error, done })
                    .await;
                self.fail_session(session, &err.to_string()).await;
                session
                    .enqueue_and_wait(|done| PumpInput::Shutdown { event: None, done })
                    .await;
                Err(err)
            }
            TurnOutcome::Aborted if session.state() == SessionState::Prompting => {
                self.finish_turn(session, "cancelled").await;
                info!("turn ended locally after cancel");
                Ok(())
            }
            TurnOutcome::Aborted => Err(AppError::SessionClosed(format!(
                "session {} closed during the turn",
                session.id
            ))),
        }
    }

    async fn finish_turn(&self, session: &Session, stop_reason: &str) {
        let stop_reason = stop_reason.to_owned();
        session
            .enqueue_and_wait(|done| PumpInput::TurnFinished { stop_reason, done })
            .await;
        session.set_cancelling(false);
        session.try_transition(SessionState::Ready);
    }

    /// Cancel the running turn, if any, and emit `abort`.
    ///
    /// The backend gets `session/cancel`; if the turn has not ended within
    /// the cancel grace period it is ended locally with stop reason
    /// `cancelled`. Returns once the session has left `Prompting`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` for an unknown session.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let session = self.live(session_id).await?;
        if session.state() == SessionState::Prompting {
            session.set_cancelling(true);
            let mut state = session.subscribe();
            if let (Some(client), Ok(agent_session)) = (session.client(), agent_session_id(&session)) {
                if let Err(err) = client.cancel(agent_session).await {
                    warn!(session_id, %err, "cancel notification failed");
                }
            }
            let acknowledged = tokio::time::timeout(
                self.inner.timeouts.cancel_grace,
                state.wait_for(|s| *s != SessionState::Prompting),
            )
            .await
            .is_ok();
            if !acknowledged {
                warn!(session_id, "backend ignored cancel; ending turn locally");
                session.abort_turn().await;
                let _ = state.wait_for(|s| *s != SessionState::Prompting).await;
            }
        }
        let event = SessionEvent::new(kinds::ABORT, json!({}));
        session
            .enqueue_and_wait(|done| PumpInput::Lifecycle { event, done })
            .await;
        info!(session_id, "session aborted");
        Ok(())
    }

    /// Switch the model of an idle session.
    ///
    /// # Errors
    ///
    /// - `AppError::SessionNotFound` for an unknown session.
    /// - `AppError::SessionBusy` unless the session is `Ready`.
    /// - `AppError::Unsupported` if the backend selects its model at launch.
    /// - `AppError::InvalidParams` if the backend does not offer the model.
    /// - `AppError::Agent` if the agent rejects the change.
    pub async fn set_model(&self, session_id: &str, model_id: &str) -> Result<()> {
        let session = self.live(session_id).await?;
        match session.state() {
            SessionState::Ready => {}
            SessionState::Prompting => {
                return Err(AppError::SessionBusy(format!(
                    "session {session_id} cannot change model while a prompt is in flight"
                )));
            }
            _ => {
                return Err(AppError::SessionBusy(format!("session {session_id} is not ready")));
            }
        }
        let profile = self
            .inner
            .config
            .profile(&session.backend)
            .ok_or_else(|| AppError::Config(format!("backend {} has no profile", session.backend)))?;
        if !profile.supports_set_model {
            return Err(AppError::Unsupported(format!(
                "backend {} selects its model at launch",
                session.backend
            )));
        }
        if !profile.accepts_model(model_id) {
            return Err(AppError::InvalidParams(format!(
                "model {model_id} is not offered by backend {}",
                session.backend
            )));
        }
        let client = session
            .client()
            .ok_or_else(|| AppError::SessionNotFound(format!("session {session_id} has no backend")))?;
        client.set_model(agent_session_id(&session)?, model_id).await?;
        session.set_model(Some(model_id.to_owned())).await;
        session.touch().await;
        info!(session_id, model_id, "model changed");
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Destroy a session: reject its permission requests, terminate its
    /// backend, and emit `session.shutdown`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` for an unknown session.
    pub async fn destroy(&self, session_id: &str) -> Result<()> {
        let session = self
            .unregister(session_id)
            .await
            .ok_or_else(|| AppError::SessionNotFound(format!("session {session_id} not found")))?;

        let span = info_span!("destroy", session_id = %session_id);
        async {
            session.try_transition(SessionState::Closing);
            session.abort_turn().await;
            self.inner.bridge.reject_session(&session.id).await;
            session.permissions.close();
            session.permissions.wait().await;
            if let Some(client) = session.client() {
                client.close(self.inner.timeouts.terminate).await;
            }
            let event = SessionEvent::new(kinds::SESSION_SHUTDOWN, json!({}));
            session
                .enqueue_and_wait(|done| PumpInput::Shutdown {
                    event: Some(event),
                    done,
                })
                .await;
            session.try_transition(SessionState::Closed);
            info!("session destroyed");
        }
        .instrument(span)
        .await;
        Ok(())
    }

    /// Destroy a session, reporting whether it existed.
    pub async fn delete(&self, session_id: &str) -> bool {
        self.destroy(session_id).await.is_ok()
    }

    /// Destroy every live session.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.inner.registry.read().await.live.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "closing all sessions");
        join_all(ids.iter().map(|id| self.destroy(id))).await;
    }

    /// Move a session to `Failed` after a backend crash or timeout.
    ///
    /// Removes it from the live table, rejects its pending permission
    /// requests, and closes the backend. Returns `false` if the session was
    /// already closing or finished.
    pub(crate) async fn fail_session(&self, session: &Arc<Session>, reason: &str) -> bool {
        if !session.try_transition(SessionState::Failed) {
            return false;
        }
        warn!(session_id = %session.id, %reason, "session failed");
        self.unregister(&session.id).await;
        self.inner.bridge.reject_session(&session.id).await;
        session.permissions.close();
        if let Some(client) = session.client() {
            client.close(self.inner.timeouts.terminate).await;
        }
        true
    }

    async fn unregister(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.registry.write().await.live.remove(session_id)
    }

    // ── Permissions ──────────────────────────────────────────────────────────

    /// Answer an agent permission request on a session-owned task.
    pub(crate) fn spawn_permission(&self, session: &Arc<Session>, id: RequestId, params: RequestPermissionParams) {
        let Some(client) = session.client().cloned() else {
            return;
        };
        let bridge = Arc::clone(&self.inner.bridge);
        let unattended = self.inner.config.permissions.unattended;
        let session = Arc::clone(session);
        let span = info_span!("permission", session_id = %session.id);
        session.permissions.clone().spawn(
            async move {
                let outcome = if matches!(session.state(), SessionState::Closing | SessionState::Closed) {
                    permission::outcome_on_error(&params.options)
                } else if session.request_permission {
                    let sink = session.sink().await;
                    match bridge.forward(&session.id, &params, sink.as_ref()).await {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            info!(%err, "permission request rejected");
                            permission::outcome_on_error(&params.options)
                        }
                    }
                } else {
                    permission::unattended_outcome(unattended, &params.options)
                };
                let reply = json!(RequestPermissionResponse { outcome });
                if let Err(err) = client.respond(id, Ok(reply)).await {
                    warn!(%err, "permission reply not delivered");
                }
            }
            .instrument(span),
        );
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    async fn lookup(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.registry.read().await.live.get(session_id).cloned()
    }

    async fn live(&self, session_id: &str) -> Result<Arc<Session>> {
        self.lookup(session_id)
            .await
            .filter(|s| !s.state().is_terminal())
            .ok_or_else(|| AppError::SessionNotFound(format!("session {session_id} not found")))
    }

    /// Current state of a live session.
    pub async fn state(&self, session_id: &str) -> Option<SessionState> {
        self.lookup(session_id).await.map(|s| s.state())
    }

    /// Summaries of live sessions, oldest first.
    pub async fn list(&self) -> Vec<Value> {
        let mut sessions: Vec<Arc<Session>> = self.inner.registry.read().await.live.values().cloned().collect();
        sessions.sort_by_key(|s| s.seq);
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            summaries.push(session.summary().await);
        }
        summaries
    }

    /// Event history of a live session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` for an unknown session.
    pub async fn history(&self, session_id: &str) -> Result<Vec<Value>> {
        let session = self
            .lookup(session_id)
            .await
            .ok_or_else(|| AppError::SessionNotFound(format!("session {session_id} not found")))?;
        Ok(session.history().await)
    }

    /// Id of the most recently created live session.
    pub async fn last_session_id(&self) -> Option<String> {
        self.inner
            .registry
            .read()
            .await
            .live
            .values()
            .max_by_key(|s| s.seq)
            .map(|s| s.id.clone())
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.inner.registry.read().await.live.len()
    }

    /// Whether no session is live.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn agent_session_id(session: &Session) -> Result<&str> {
    session
        .agent_session_id()
        .ok_or_else(|| AppError::Protocol(format!("session {} has no agent session", session.id)))
}
