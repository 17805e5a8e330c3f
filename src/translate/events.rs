//! Client-protocol session events and the update translation table.
//!
//! | agent update         | client event(s)                                 |
//! |----------------------|-------------------------------------------------|
//! | `agent_message_chunk`| `assistant.message_delta`                       |
//! | `agent_thought_chunk`| `assistant.reasoning_delta`                     |
//! | `tool_call`          | `tool.execution_start`                          |
//! | `tool_call_update`   | `tool.execution_complete` on a terminal status  |
//! | anything else        | none; reported as unmapped                      |
//!
//! Final `assistant.message`, `assistant.reasoning`, `assistant.turn_end` and
//! `session.idle` are produced by the
//! [`TurnAccumulator`](super::accumulator::TurnAccumulator) when the turn ends.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::backend::schema::{SessionUpdate, UpdateKind};
use crate::translate::accumulator::TurnAccumulator;

/// Client-protocol event type names.
pub mod kinds {
    /// Session established.
    pub const SESSION_START: &str = "session.start";
    /// Existing session re-attached.
    pub const SESSION_RESUME: &str = "session.resume";
    /// Session-level failure.
    pub const SESSION_ERROR: &str = "session.error";
    /// Turn finished; the session accepts a new prompt.
    pub const SESSION_IDLE: &str = "session.idle";
    /// Session destroyed.
    pub const SESSION_SHUTDOWN: &str = "session.shutdown";
    /// Prompt echoed back.
    pub const USER_MESSAGE: &str = "user.message";
    /// Turn started.
    pub const TURN_START: &str = "assistant.turn_start";
    /// Turn ended.
    pub const TURN_END: &str = "assistant.turn_end";
    /// Streamed assistant text.
    pub const MESSAGE_DELTA: &str = "assistant.message_delta";
    /// Final assistant text.
    pub const MESSAGE: &str = "assistant.message";
    /// Streamed reasoning.
    pub const REASONING_DELTA: &str = "assistant.reasoning_delta";
    /// Final reasoning.
    pub const REASONING: &str = "assistant.reasoning";
    /// Tool call started.
    pub const TOOL_START: &str = "tool.execution_start";
    /// Tool call finished.
    pub const TOOL_COMPLETE: &str = "tool.execution_complete";
    /// Turn aborted by the client.
    pub const ABORT: &str = "abort";
}

/// One client-protocol session event.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    /// Unique event id.
    pub id: String,
    /// Event type, one of [`kinds`].
    pub kind: &'static str,
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
    /// Event payload.
    pub data: Value,
}

impl SessionEvent {
    /// Create an event stamped now.
    #[must_use]
    pub fn new(kind: &'static str, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data,
        }
    }

    /// Wire shape `{id, type, timestamp, data}`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "id": self.id,
            "type": self.kind,
            "timestamp": self.timestamp,
            "data": self.data,
        })
    }
}

/// Result of translating one agent update.
#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    /// Client events to deliver, in order (possibly none).
    Events(Vec<SessionEvent>),
    /// No mapping exists for the update kind.
    Unmapped(String),
}

type TranslateFn = fn(&mut TurnAccumulator, SessionUpdate) -> Vec<SessionEvent>;

/// Lookup table from update kind to translation function, built once.
#[derive(Debug, Clone)]
pub struct EventTable {
    entries: HashMap<UpdateKind, TranslateFn>,
}

impl Default for EventTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTable {
    /// Build the table.
    #[must_use]
    pub fn new() -> Self {
        let mut entries: HashMap<UpdateKind, TranslateFn> = HashMap::new();
        entries.insert(UpdateKind::MessageChunk, on_message_chunk);
        entries.insert(UpdateKind::ThoughtChunk, on_thought_chunk);
        entries.insert(UpdateKind::ToolCall, on_tool_call);
        entries.insert(UpdateKind::ToolCallUpdate, on_tool_call_update);
        Self { entries }
    }

    /// Whether `kind` has a mapping.
    #[must_use]
    pub fn maps(&self, kind: UpdateKind) -> bool {
        self.entries.contains_key(&kind)
    }

    /// Translate `update`, feeding the accumulator.
    pub fn translate(&self, acc: &mut TurnAccumulator, update: SessionUpdate) -> Translation {
        match self.entries.get(&update.kind()) {
            Some(translate) => Translation::Events(translate(acc, update)),
            None => Translation::Unmapped(match update {
                SessionUpdate::Unmapped { kind, .. } => kind,
                other => format!("{:?}", other.kind()),
            }),
        }
    }
}

fn on_message_chunk(acc: &mut TurnAccumulator, update: SessionUpdate) -> Vec<SessionEvent> {
    match update {
        SessionUpdate::AgentMessageChunk { content } => content
            .as_text()
            .and_then(|text| acc.push_message(text))
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

fn on_thought_chunk(acc: &mut TurnAccumulator, update: SessionUpdate) -> Vec<SessionEvent> {
    match update {
        SessionUpdate::AgentThoughtChunk { content } => content
            .as_text()
            .and_then(|text| acc.push_reasoning(text))
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

fn on_tool_call(acc: &mut TurnAccumulator, update: SessionUpdate) -> Vec<SessionEvent> {
    match update {
        SessionUpdate::ToolCall(call) => acc.tool_started(call),
        _ => Vec::new(),
    }
}

fn on_tool_call_update(acc: &mut TurnAccumulator, update: SessionUpdate) -> Vec<SessionEvent> {
    match update {
        SessionUpdate::ToolCallUpdate(progress) => acc.tool_updated(progress),
        _ => Vec::new(),
    }
}
