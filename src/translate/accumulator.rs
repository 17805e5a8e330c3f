//! Per-turn streaming state.
//!
//! The accumulator keeps the message and reasoning streams apart, appends
//! each delta exactly once in arrival order, and tracks tool calls by id so
//! that only the terminal state of a tool call is reported. `finish_turn`
//! flushes the final events and resets everything for the next turn.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::backend::schema::{ToolCall, ToolCallStatus, ToolCallUpdate};
use crate::translate::events::{kinds, SessionEvent};

/// Delta stream within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Assistant text.
    Message,
    /// Reasoning text.
    Reasoning,
}

#[derive(Debug, Clone)]
struct ToolTracker {
    id: String,
    name: String,
    status: Option<ToolCallStatus>,
    output: Option<Value>,
    finished: bool,
}

impl ToolTracker {
    /// Fold a progress update; the latest non-empty field wins.
    fn absorb(&mut self, update: &ToolCallUpdate) {
        if let Some(title) = update.title.as_ref().filter(|t| !t.is_empty()) {
            self.name.clone_from(title);
        }
        if update.status.is_some() {
            self.status = update.status;
        }
        if let Some(output) = update.raw_output.as_ref().or(update.content.as_ref()) {
            self.output = Some(output.clone());
        }
    }

    fn complete_event(&self) -> SessionEvent {
        SessionEvent::new(
            kinds::TOOL_COMPLETE,
            json!({
                "toolCallId": self.id,
                "success": self.status == Some(ToolCallStatus::Completed),
                "result": self.output.clone().unwrap_or(Value::Null),
            }),
        )
    }
}

/// Streaming state of the current turn.
#[derive(Debug, Clone)]
pub struct TurnAccumulator {
    turn_id: String,
    message_id: String,
    reasoning_id: String,
    message: String,
    reasoning: String,
    tools: Vec<ToolTracker>,
}

impl Default for TurnAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnAccumulator {
    /// Fresh state with new ids.
    #[must_use]
    pub fn new() -> Self {
        Self {
            turn_id: Uuid::new_v4().to_string(),
            message_id: Uuid::new_v4().to_string(),
            reasoning_id: Uuid::new_v4().to_string(),
            message: String::new(),
            reasoning: String::new(),
            tools: Vec::new(),
        }
    }

    /// Reset and emit `user.message` plus `assistant.turn_start`.
    ///
    /// Deltas that arrive between turns (a backend still streaming after its
    /// turn was ended locally) are forwarded as they come but are dropped
    /// here, so they never appear in a later `assistant.message`.
    pub fn begin_turn(&mut self, prompt: &str, user_message_id: &str) -> Vec<SessionEvent> {
        *self = Self::new();
        vec![
            SessionEvent::new(
                kinds::USER_MESSAGE,
                json!({ "content": prompt, "messageId": user_message_id }),
            ),
            SessionEvent::new(kinds::TURN_START, json!({ "turnId": self.turn_id })),
        ]
    }

    /// Whether a delta stream has content in this turn.
    #[must_use]
    pub fn is_open(&self, stream: StreamKind) -> bool {
        match stream {
            StreamKind::Message => !self.message.is_empty(),
            StreamKind::Reasoning => !self.reasoning.is_empty(),
        }
    }

    /// Text accumulated so far on `stream`.
    #[must_use]
    pub fn content(&self, stream: StreamKind) -> &str {
        match stream {
            StreamKind::Message => &self.message,
            StreamKind::Reasoning => &self.reasoning,
        }
    }

    /// Append assistant text; empty chunks produce no event.
    pub fn push_message(&mut self, text: &str) -> Option<SessionEvent> {
        if text.is_empty() {
            return None;
        }
        self.message.push_str(text);
        Some(SessionEvent::new(
            kinds::MESSAGE_DELTA,
            json!({ "messageId": self.message_id, "deltaContent": text }),
        ))
    }

    /// Append reasoning text; empty chunks produce no event.
    pub fn push_reasoning(&mut self, text: &str) -> Option<SessionEvent> {
        if text.is_empty() {
            return None;
        }
        self.reasoning.push_str(text);
        Some(SessionEvent::new(
            kinds::REASONING_DELTA,
            json!({ "reasoningId": self.reasoning_id, "deltaContent": text }),
        ))
    }

    /// Record a new tool call.
    ///
    /// A call announced with a terminal status completes immediately. A
    /// repeated announcement of a known id is folded in as progress.
    pub fn tool_started(&mut self, call: ToolCall) -> Vec<SessionEvent> {
        let progress = ToolCallUpdate {
            tool_call_id: call.tool_call_id.clone(),
            title: Some(call.title.clone()),
            status: call.status,
            raw_input: call.raw_input.clone(),
            raw_output: call.raw_output.clone(),
            content: call.content.clone(),
        };
        if self.tools.iter().any(|t| t.id == call.tool_call_id) {
            return self.tool_updated(progress);
        }

        let mut events = vec![start_event(
            &call.tool_call_id,
            &call.title,
            call.raw_input.as_ref(),
        )];
        self.tools.push(ToolTracker {
            id: call.tool_call_id,
            name: call.title,
            status: None,
            output: None,
            finished: false,
        });
        events.extend(self.finish_if_terminal(&progress));
        events
    }

    /// Fold progress into a tool call; emits only on a terminal status.
    ///
    /// Progress for an id never announced synthesizes the start event first.
    pub fn tool_updated(&mut self, update: ToolCallUpdate) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if !self.tools.iter().any(|t| t.id == update.tool_call_id) {
            let name = update.title.clone().unwrap_or_default();
            events.push(start_event(&update.tool_call_id, &name, update.raw_input.as_ref()));
            self.tools.push(ToolTracker {
                id: update.tool_call_id.clone(),
                name,
                status: None,
                output: None,
                finished: false,
            });
        }
        events.extend(self.finish_if_terminal(&update));
        events
    }

    fn finish_if_terminal(&mut self, update: &ToolCallUpdate) -> Option<SessionEvent> {
        let tracker = self.tools.iter_mut().find(|t| t.id == update.tool_call_id)?;
        if tracker.finished {
            return None;
        }
        tracker.absorb(update);
        if tracker.status.is_some_and(ToolCallStatus::is_terminal) {
            tracker.finished = true;
            Some(tracker.complete_event())
        } else {
            None
        }
    }

    /// Flush the turn and reset.
    ///
    /// Emits, in order: completion for any tool call still running (as a
    /// failure), `assistant.reasoning` if reasoning streamed,
    /// `assistant.message`, `assistant.turn_end`, and `session.idle`.
    pub fn finish_turn(&mut self, stop_reason: &str) -> Vec<SessionEvent> {
        let mut events: Vec<SessionEvent> = self
            .tools
            .iter()
            .filter(|t| !t.finished)
            .map(|t| {
                let mut tracker = t.clone();
                tracker.status = Some(ToolCallStatus::Failed);
                tracker.complete_event()
            })
            .collect();

        if self.is_open(StreamKind::Reasoning) {
            events.push(SessionEvent::new(
                kinds::REASONING,
                json!({ "reasoningId": self.reasoning_id, "content": self.reasoning }),
            ));
        }
        events.push(SessionEvent::new(
            kinds::MESSAGE,
            json!({ "messageId": self.message_id, "content": self.message, "toolRequests": [] }),
        ));
        events.push(SessionEvent::new(
            kinds::TURN_END,
            json!({ "turnId": self.turn_id, "stopReason": stop_reason }),
        ));
        events.push(SessionEvent::new(kinds::SESSION_IDLE, json!({})));

        *self = Self::new();
        events
    }

    /// Drop the turn after a failure, emitting `session.error`.
    pub fn fail_turn(&mut self, error: &str) -> Vec<SessionEvent> {
        *self = Self::new();
        vec![SessionEvent::new(kinds::SESSION_ERROR, json!({ "error": error }))]
    }
}

fn start_event(id: &str, name: &str, input: Option<&Value>) -> SessionEvent {
    SessionEvent::new(
        kinds::TOOL_START,
        json!({
            "toolCallId": id,
            "toolName": name,
            "arguments": input.cloned().unwrap_or_else(|| json!({})),
        }),
    )
}
