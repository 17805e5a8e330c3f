//! Client channel listener.
//!
//! Reads Content-Length framed JSON-RPC from the client, runs each call on
//! its own task so a long `session.send` never blocks other sessions, and
//! serializes every outbound frame through one shared writer. Responses from
//! the client answer `permission.request` calls and are routed to the
//! permission bridge.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::frontend::handlers::Handlers;
use crate::frontend::protocol;
use crate::session::{EventSink, SessionManager, SinkFuture};
use crate::translate::methods::{parse_permission_reply, PermissionDecision};
use crate::translate::SessionEvent;
use crate::wire::{FrameCodec, Message, RequestId, RpcError};
use crate::Result;

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared, frame-at-a-time writer to the client.
#[derive(Clone)]
pub struct Outbound {
    writer: Arc<Mutex<FramedWrite<BoxWriter, FrameCodec>>>,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound").finish_non_exhaustive()
    }
}

impl Outbound {
    /// Wrap `writer` with Content-Length framing.
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: BoxWriter = Box::new(writer);
        Self {
            writer: Arc::new(Mutex::new(FramedWrite::new(boxed, FrameCodec::content_length()))),
        }
    }

    /// Write one message as a single frame.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the client stream is closed.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.writer.lock().await.send(message.to_json()).await
    }
}

/// [`EventSink`] writing to the client channel.
#[derive(Debug, Clone)]
pub struct FrontendSink {
    out: Outbound,
}

impl FrontendSink {
    /// Create a sink over `out`.
    #[must_use]
    pub fn new(out: Outbound) -> Self {
        Self { out }
    }
}

impl EventSink for FrontendSink {
    fn emit<'a>(&'a self, session_id: &'a str, event: &'a SessionEvent) -> SinkFuture<'a> {
        Box::pin(async move {
            let params = protocol::session_event(session_id, event.to_value());
            self.out
                .send(&Message::notification(protocol::SESSION_EVENT, params))
                .await
        })
    }

    fn request_permission<'a>(
        &'a self,
        correlation_id: &'a str,
        _session_id: &'a str,
        params: Value,
    ) -> SinkFuture<'a> {
        Box::pin(async move {
            let id = RequestId::Text(correlation_id.to_owned());
            self.out
                .send(&Message::request(id, protocol::PERMISSION_REQUEST, params))
                .await
        })
    }
}

/// Serves one client connection.
#[derive(Debug, Clone)]
pub struct FrontendListener {
    handlers: Handlers,
    shutdown: CancellationToken,
}

impl FrontendListener {
    /// Create a listener; cancelling `shutdown` stops it like client EOF.
    #[must_use]
    pub fn new(manager: SessionManager, shutdown: CancellationToken) -> Self {
        Self {
            handlers: Handlers::new(manager),
            shutdown,
        }
    }

    /// Serve the client until EOF, shutdown, or an unreadable stream.
    ///
    /// Every live session is destroyed before returning.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Framing` or `AppError::Io` when the client stream
    /// cannot be decoded.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut frames = FramedRead::new(reader, FrameCodec::content_length());
        let out = Outbound::new(writer);
        let sink: Arc<dyn EventSink> = Arc::new(FrontendSink::new(out.clone()));
        let tasks = TaskTracker::new();
        info!("client channel open");

        let result = loop {
            let frame = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    info!("shutdown requested");
                    break Ok(());
                }
                frame = frames.next() => frame,
            };
            match frame {
                None => {
                    info!("client closed the channel");
                    break Ok(());
                }
                Some(Err(err)) => {
                    warn!(%err, "client channel unreadable");
                    break Err(err);
                }
                Some(Ok(payload)) => self.handle_frame(&payload, &out, &sink, &tasks).await,
            }
        };

        self.handlers.manager().close_all().await;
        tasks.close();
        tasks.wait().await;
        info!("client channel closed");
        result
    }

    async fn handle_frame(&self, payload: &str, out: &Outbound, sink: &Arc<dyn EventSink>, tasks: &TaskTracker) {
        let message = match Message::parse(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "rejecting malformed client message");
                if let Err(err) = out.send(&Message::error(None, err.to_rpc_error())).await {
                    warn!(%err, "failed to write error reply");
                }
                return;
            }
        };

        match message {
            Message::Request { id, method, params } => {
                let span = info_span!("client_call", %method, id = %id.key());
                let handlers = self.handlers.clone();
                let out = out.clone();
                let sink = Arc::clone(sink);
                tasks.spawn(
                    async move {
                        let reply = match handlers.dispatch(&method, params, sink).await {
                            Ok(result) => Message::result(id, result),
                            Err(err) => {
                                debug!(%err, "client call failed");
                                Message::error(Some(id), err.to_rpc_error())
                            }
                        };
                        if let Err(err) = out.send(&reply).await {
                            warn!(%err, "failed to write reply");
                        }
                    }
                    .instrument(span),
                );
            }
            Message::Notification { method, params } => {
                let span = info_span!("client_notification", %method);
                let handlers = self.handlers.clone();
                let sink = Arc::clone(sink);
                tasks.spawn(
                    async move {
                        if let Err(err) = handlers.dispatch(&method, params, sink).await {
                            debug!(%err, "client notification failed");
                        }
                    }
                    .instrument(span),
                );
            }
            Message::Response { id, outcome } => {
                let Some(id) = id else {
                    debug!("ignoring client response without id");
                    return;
                };
                let decision = permission_decision(&outcome);
                self.handlers.manager().bridge().resolve(&id.key(), decision).await;
            }
        }
    }
}

fn permission_decision(outcome: &std::result::Result<Value, RpcError>) -> PermissionDecision {
    match outcome {
        Ok(reply) => parse_permission_reply(reply),
        Err(error) => {
            info!(code = error.code, message = %error.message, "client refused permission request");
            PermissionDecision::Denied
        }
    }
}
