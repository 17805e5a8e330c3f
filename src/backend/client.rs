//! Agent-protocol client built on a [`BackendProcess`].
//!
//! A single reader task owns the inbound half of the connection and routes
//! every envelope:
//!
//! - responses complete the matching entry in the pending-call table;
//! - `session/update` notifications and `session/request_permission` calls
//!   are forwarded, in arrival order, to the owning session's event channel;
//! - `fs/*` and `terminal/*` calls are served directly;
//! - any other call is answered with "method not found".
//!
//! When the connection breaks, every pending call fails with
//! `AppError::BackendGone`, the backend's terminals are killed, and
//! [`AgentEvent::Disconnected`] is delivered after all earlier events.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::process::BackendProcess;
use crate::backend::schema::{
    methods, CancelParams, ContentBlock, InitializeParams, InitializeResult, McpServer,
    NewSessionParams, NewSessionResult, PromptParams, PromptResult, ReadTextFileParams,
    RequestPermissionParams, SessionNotification, SessionUpdate, SetModelParams, TerminalRef,
    WriteTextFileParams, PROTOCOL_VERSION,
};
use crate::backend::terminal::TerminalManager;
use crate::errors::codes;
use crate::pending::PendingCalls;
use crate::wire::{Message, RequestId, RpcError};
use crate::{AppError, Result};

/// Event delivered from a backend to its session.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A `session/update` notification.
    Update {
        /// Agent session id the update belongs to.
        session_id: String,
        /// Decoded update.
        update: SessionUpdate,
    },
    /// A `session/request_permission` call awaiting an answer.
    PermissionRequested {
        /// Backend request id to answer with [`AgentClient::respond`].
        id: RequestId,
        /// Request parameters.
        params: RequestPermissionParams,
    },
    /// The connection broke; no further events follow.
    Disconnected {
        /// Human-readable cause.
        reason: String,
    },
}

type CallResult = Result<Value>;

struct ClientInner {
    process: BackendProcess,
    pending: PendingCalls<CallResult, String>,
    next_id: AtomicI64,
    fs_root: PathBuf,
    terminals: TerminalManager,
    cancel: CancellationToken,
}

/// Agent calls the proxy serves itself.
const SERVED: &[&str] = &[
    methods::FS_READ_TEXT_FILE,
    methods::FS_WRITE_TEXT_FILE,
    methods::TERMINAL_CREATE,
    methods::TERMINAL_OUTPUT,
    methods::TERMINAL_WAIT_FOR_EXIT,
    methods::TERMINAL_KILL,
    methods::TERMINAL_RELEASE,
];

/// Handle to one backend connection; cheap to clone.
#[derive(Clone)]
pub struct AgentClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("backend", &self.inner.process.label())
            .finish_non_exhaustive()
    }
}

impl AgentClient {
    /// Start the reader task and return the client.
    ///
    /// Events are sent to `events` in the order the backend emitted them.
    /// Relative `fs/*` paths and terminal directories resolve against
    /// `fs_root`.
    pub fn start<E>(process: BackendProcess, events: mpsc::Sender<E>, fs_root: PathBuf) -> Self
    where
        E: From<AgentEvent> + Send + 'static,
    {
        let inner = Arc::new(ClientInner {
            process,
            pending: PendingCalls::new(),
            next_id: AtomicI64::new(1),
            terminals: TerminalManager::new(fs_root.clone()),
            fs_root,
            cancel: CancellationToken::new(),
        });
        tokio::spawn(run_reader(Arc::clone(&inner), events));
        Self { inner }
    }

    /// Backend label.
    #[must_use]
    pub fn label(&self) -> &str {
        self.inner.process.label()
    }

    /// Perform the handshake.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the agent answers with a different
    /// protocol version, or any error from the call itself.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let result: InitializeResult = self
            .call(methods::INITIALIZE, &InitializeParams::default())
            .await?;
        if result.protocol_version != PROTOCOL_VERSION {
            return Err(AppError::Protocol(format!(
                "agent speaks protocol version {}, expected {PROTOCOL_VERSION}",
                result.protocol_version
            )));
        }
        info!(backend = self.label(), "agent initialized");
        Ok(result)
    }

    /// Establish an agent session.
    ///
    /// # Errors
    ///
    /// Propagates call failures.
    pub async fn new_session(&self, cwd: &Path, mcp_servers: Vec<McpServer>) -> Result<NewSessionResult> {
        let params = NewSessionParams {
            cwd: cwd.to_string_lossy().into_owned(),
            mcp_servers,
        };
        self.call(methods::SESSION_NEW, &params).await
    }

    /// Select a model.
    ///
    /// # Errors
    ///
    /// Propagates call failures.
    pub async fn set_model(&self, session_id: &str, model_id: &str) -> Result<()> {
        let params = SetModelParams {
            session_id: session_id.to_owned(),
            model_id: model_id.to_owned(),
        };
        let _: Value = self.call(methods::SESSION_SET_MODEL, &params).await?;
        Ok(())
    }

    /// Run one prompt turn; resolves when the agent ends the turn.
    ///
    /// # Errors
    ///
    /// Propagates call failures.
    pub async fn prompt(&self, session_id: &str, prompt: Vec<ContentBlock>) -> Result<PromptResult> {
        let params = PromptParams {
            session_id: session_id.to_owned(),
            prompt,
        };
        self.call(methods::SESSION_PROMPT, &params).await
    }

    /// Ask the agent to cancel the running turn.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BackendGone` if the notification cannot be sent.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let params = serde_json::to_value(CancelParams {
            session_id: session_id.to_owned(),
        })?;
        self.inner
            .process
            .send(&Message::notification(methods::SESSION_CANCEL, params))
            .await
    }

    /// Answer a call the agent made.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BackendGone` if the response cannot be sent.
    pub async fn respond(&self, id: RequestId, outcome: std::result::Result<Value, RpcError>) -> Result<()> {
        let message = match outcome {
            Ok(result) => Message::result(id, result),
            Err(error) => Message::error(Some(id), error),
        };
        self.inner.process.send(&message).await
    }

    /// Stop reading, fail pending calls, kill terminals, and terminate the
    /// backend.
    pub async fn close(&self, timeout: Duration) {
        self.inner.cancel.cancel();
        let failed = self
            .inner
            .pending
            .fail_all(|method| Err(AppError::SessionClosed(format!("{method} abandoned"))))
            .await;
        if failed > 0 {
            debug!(backend = self.label(), failed, "failed pending agent calls on close");
        }
        let killed = self.inner.terminals.kill_all().await;
        if killed > 0 {
            debug!(backend = self.label(), killed, "killed backend terminals on close");
        }
        self.inner.process.terminate(timeout).await;
    }

    /// Number of calls awaiting a response.
    pub async fn pending_calls(&self) -> usize {
        self.inner.pending.len().await
    }

    async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let key = id.to_string();
        let rx = self.inner.pending.register(key.clone(), method.to_owned()).await?;
        let mut guard = CallGuard {
            inner: Arc::clone(&self.inner),
            key,
            armed: true,
        };

        let message = Message::request(id, method, serde_json::to_value(params)?);
        if let Err(err) = self.inner.process.send(&message).await {
            guard.armed = false;
            self.inner.pending.remove(&guard.key).await;
            return Err(err);
        }
        debug!(backend = self.label(), method, id, "agent call sent");

        let received = rx.await;
        guard.armed = false;
        let value =
            received.map_err(|_| AppError::BackendGone(format!("{method}: connection dropped")))??;
        serde_json::from_value(value)
            .map_err(|err| AppError::Protocol(format!("invalid {method} result: {err}")))
    }
}

/// Drops the pending entry of a call whose caller stopped waiting (turn
/// cancelled locally or timed out).
struct CallGuard {
    inner: Arc<ClientInner>,
    key: String,
    armed: bool,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let key = std::mem::take(&mut self.key);
        runtime.spawn(async move {
            if let Some(method) = inner.pending.remove(&key).await {
                debug!(backend = inner.process.label(), id = %key, method = %method, "abandoned agent call");
            }
        });
    }
}

// ── Reader task ──────────────────────────────────────────────────────────────

async fn run_reader<E>(inner: Arc<ClientInner>, events: mpsc::Sender<E>)
where
    E: From<AgentEvent> + Send + 'static,
{
    let label = inner.process.label().to_owned();

    let reason = loop {
        let received = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => {
                debug!(backend = %label, "agent reader stopped");
                return;
            }
            received = inner.process.receive() => received,
        };

        let message = match received {
            Ok(message) => message,
            Err(err) => break err.to_string(),
        };

        match message {
            Message::Response { id: Some(id), outcome } => {
                let value = outcome.map_err(|err| AppError::Agent(format!("{} ({})", err.message, err.code)));
                if !inner.pending.complete(&id.key(), value).await {
                    debug!(backend = %label, %id, "response for unknown call");
                }
            }
            Message::Response { id: None, outcome } => {
                warn!(backend = %label, ?outcome, "agent sent a response without id");
            }
            Message::Notification { method, params } if method == methods::SESSION_UPDATE => {
                match serde_json::from_value::<SessionNotification>(params) {
                    Ok(note) => {
                        let event = AgentEvent::Update {
                            session_id: note.session_id,
                            update: SessionUpdate::from_value(note.update),
                        };
                        if events.send(event.into()).await.is_err() {
                            debug!(backend = %label, "session event channel closed");
                        }
                    }
                    Err(err) => warn!(backend = %label, %err, "malformed session/update"),
                }
            }
            Message::Notification { method, .. } => {
                debug!(backend = %label, method, "ignoring agent notification");
            }
            Message::Request { id, method, params } => {
                handle_request(&inner, &events, id, &method, params).await;
            }
        }
    };

    warn!(backend = %label, %reason, "agent connection lost");
    inner
        .pending
        .fail_all(|_| Err(AppError::BackendGone(reason.clone())))
        .await;
    inner.terminals.kill_all().await;
    let _ = events.send(AgentEvent::Disconnected { reason }.into()).await;
}

async fn handle_request<E>(
    inner: &Arc<ClientInner>,
    events: &mpsc::Sender<E>,
    id: RequestId,
    method: &str,
    params: Value,
) where
    E: From<AgentEvent> + Send + 'static,
{
    let label = inner.process.label();
    match method {
        methods::REQUEST_PERMISSION => {
            match serde_json::from_value::<RequestPermissionParams>(params) {
                Ok(params) => {
                    let event = AgentEvent::PermissionRequested { id, params };
                    if events.send(event.into()).await.is_err() {
                        debug!(backend = label, "session event channel closed");
                    }
                }
                Err(err) => {
                    let error = RpcError::new(codes::INVALID_PARAMS, format!("invalid params: {err}"));
                    reply(inner, Message::error(Some(id), error)).await;
                }
            }
        }
        served if SERVED.contains(&served) => {
            let inner = Arc::clone(inner);
            let method = method.to_owned();
            tokio::spawn(async move {
                let outcome = serve(&inner, &method, params)
                    .await
                    .map_err(|err| err.to_rpc_error());
                let message = match outcome {
                    Ok(result) => Message::result(id, result),
                    Err(error) => Message::error(Some(id), error),
                };
                reply(&inner, message).await;
            });
        }
        other => {
            debug!(backend = label, method = other, "unsupported agent call");
            let error = RpcError::new(codes::METHOD_NOT_FOUND, format!("method not found: {other}"));
            reply(inner, Message::error(Some(id), error)).await;
        }
    }
}

async fn reply(inner: &ClientInner, message: Message) {
    if let Err(err) = inner.process.send(&message).await {
        warn!(backend = inner.process.label(), %err, "failed to answer agent call");
    }
}

// ── Served calls ─────────────────────────────────────────────────────────────

async fn serve(inner: &ClientInner, method: &str, params: Value) -> Result<Value> {
    let terminals = &inner.terminals;
    match method {
        methods::FS_READ_TEXT_FILE | methods::FS_WRITE_TEXT_FILE => serve_fs(&inner.fs_root, method, params).await,
        methods::TERMINAL_CREATE => {
            let terminal_id = terminals.create(parse_params(params)?).await?;
            Ok(json!({ "terminalId": terminal_id }))
        }
        methods::TERMINAL_OUTPUT => {
            let target: TerminalRef = parse_params(params)?;
            Ok(serde_json::to_value(terminals.output(&target.terminal_id).await?)?)
        }
        methods::TERMINAL_WAIT_FOR_EXIT => {
            let target: TerminalRef = parse_params(params)?;
            Ok(serde_json::to_value(terminals.wait_for_exit(&target.terminal_id).await?)?)
        }
        methods::TERMINAL_KILL => {
            let target: TerminalRef = parse_params(params)?;
            terminals.kill(&target.terminal_id).await?;
            Ok(json!({}))
        }
        methods::TERMINAL_RELEASE => {
            let target: TerminalRef = parse_params(params)?;
            terminals.release(&target.terminal_id).await?;
            Ok(json!({}))
        }
        other => Err(AppError::MethodNotFound(other.to_owned())),
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| AppError::InvalidParams(e.to_string()))
}

async fn serve_fs(root: &Path, method: &str, params: Value) -> Result<Value> {
    if method == methods::FS_READ_TEXT_FILE {
        let params: ReadTextFileParams = parse_params(params)?;
        let path = resolve_path(root, &params.path);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| AppError::Io(format!("{}: {err}", path.display())))?;
        debug!(path = %path.display(), bytes = content.len(), "served fs read");
        Ok(serde_json::json!({ "content": slice_lines(&content, params.line, params.limit) }))
    } else {
        let params: WriteTextFileParams = parse_params(params)?;
        let path = resolve_path(root, &params.path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, params.content.as_bytes())
            .await
            .map_err(|err| AppError::Io(format!("{}: {err}", path.display())))?;
        debug!(path = %path.display(), "served fs write");
        Ok(Value::Null)
    }
}

fn resolve_path(root: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Lines `line..line+limit` (1-based) of `content`.
fn slice_lines(content: &str, line: Option<usize>, limit: Option<usize>) -> String {
    if line.is_none() && limit.is_none() {
        return content.to_owned();
    }
    let skip = line.unwrap_or(1).saturating_sub(1);
    let take = limit.unwrap_or(usize::MAX);
    content
        .split_inclusive('\n')
        .skip(skip)
        .take(take)
        .collect()
}
