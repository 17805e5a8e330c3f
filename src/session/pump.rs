//! Per-session event pump.
//!
//! One task per session owns the [`TurnAccumulator`] and is the only writer
//! of that session's client-bound events. Agent events and turn milestones
//! from the prompt path arrive on one channel, so client events leave in
//! the order their causes were observed.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::backend::AgentEvent;
use crate::session::manager::SessionManager;
use crate::session::model::{Session, SessionState};
use crate::translate::{EventTable, SessionEvent, Translation, TurnAccumulator};

/// Input queue depth per session.
pub(crate) const PUMP_CAPACITY: usize = 256;

/// Work item for a session's event pump.
#[derive(Debug)]
pub(crate) enum PumpInput {
    /// Traffic from the backend.
    Agent(AgentEvent),
    /// A prompt was accepted.
    TurnStarted { prompt: String, message_id: String },
    /// The prompt completed.
    TurnFinished {
        stop_reason: String,
        done: oneshot::Sender<()>,
    },
    /// The prompt failed without taking the session down.
    TurnFailed {
        error: String,
        done: oneshot::Sender<()>,
    },
    /// A lifecycle event (`session.start`, `session.resume`, `abort`).
    Lifecycle {
        event: SessionEvent,
        done: oneshot::Sender<()>,
    },
    /// Deliver a final event, if any, and stop.
    Shutdown {
        event: Option<SessionEvent>,
        done: oneshot::Sender<()>,
    },
}

impl From<AgentEvent> for PumpInput {
    fn from(event: AgentEvent) -> Self {
        Self::Agent(event)
    }
}

/// Run the pump for `session` until shut down or the backend disconnects.
pub(crate) async fn run(
    session: Arc<Session>,
    mut inputs: mpsc::Receiver<PumpInput>,
    table: Arc<EventTable>,
    manager: SessionManager,
) {
    let mut acc = TurnAccumulator::new();

    while let Some(input) = inputs.recv().await {
        match input {
            PumpInput::Agent(AgentEvent::Update { session_id, update }) => {
                if session
                    .agent_session_id()
                    .is_some_and(|expected| expected != session_id)
                {
                    warn!(session_id = %session.id, agent_session_id = %session_id, "update for foreign agent session dropped");
                    continue;
                }
                match table.translate(&mut acc, update) {
                    Translation::Events(events) => deliver_all(&session, events).await,
                    Translation::Unmapped(kind) => {
                        debug!(session_id = %session.id, %kind, "unmapped update");
                    }
                }
            }
            PumpInput::Agent(AgentEvent::PermissionRequested { id, params }) => {
                manager.spawn_permission(&session, id, params);
            }
            PumpInput::Agent(AgentEvent::Disconnected { reason }) => {
                if matches!(session.state(), SessionState::Closing | SessionState::Closed) {
                    debug!(session_id = %session.id, %reason, "backend closed during shutdown");
                    continue;
                }
                deliver_all(&session, acc.fail_turn(&reason)).await;
                manager.fail_session(&session, &reason).await;
                break;
            }
            PumpInput::TurnStarted { prompt, message_id } => {
                deliver_all(&session, acc.begin_turn(&prompt, &message_id)).await;
            }
            PumpInput::TurnFinished { stop_reason, done } => {
                deliver_all(&session, acc.finish_turn(&stop_reason)).await;
                let _ = done.send(());
            }
            PumpInput::TurnFailed { error, done } => {
                deliver_all(&session, acc.fail_turn(&error)).await;
                let _ = done.send(());
            }
            PumpInput::Lifecycle { event, done } => {
                deliver(&session, &event).await;
                let _ = done.send(());
            }
            PumpInput::Shutdown { event, done } => {
                if let Some(event) = event {
                    deliver(&session, &event).await;
                }
                let _ = done.send(());
                break;
            }
        }
    }
    debug!(session_id = %session.id, "event pump stopped");
}

async fn deliver_all(session: &Session, events: Vec<SessionEvent>) {
    for event in events {
        deliver(session, &event).await;
    }
}

async fn deliver(session: &Session, event: &SessionEvent) {
    session.record(event).await;
    let sink = session.sink().await;
    if let Err(err) = sink.emit(&session.id, event).await {
        warn!(session_id = %session.id, kind = event.kind, %err, "event delivery failed");
    }
}
