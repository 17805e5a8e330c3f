//! Protocol translation between the client and agent dialects.
//!
//! - `methods`: client method table, agent call plans, parameter and
//!   permission projections.
//! - `events`: client event shapes and the update translation table.
//! - `accumulator`: per-turn delta and tool-call state.

pub mod accumulator;
pub mod events;
pub mod methods;

pub use accumulator::{StreamKind, TurnAccumulator};
pub use events::{kinds, EventTable, SessionEvent, Translation};
pub use methods::{AgentCall, ClientMethod, PermissionDecision};
