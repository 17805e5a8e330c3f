//! Session management.
//!
//! - `model`: session state machine and per-session data.
//! - `manager`: live-session table and lifecycle operations.
//! - `pump`: per-session event delivery task.
//! - `sink`: client-bound event capability.

pub mod manager;
pub mod model;
pub(crate) mod pump;
pub mod sink;

pub use manager::{CreatedSession, SessionManager};
pub use model::{Session, SessionSpec, SessionState};
pub use sink::{EventSink, SinkFuture};
