//! Back channel: backend processes and the agent-protocol client.
//!
//! - `process`: [`BackendProcess`](process::BackendProcess), spawn, framed
//!   send/receive, terminate.
//! - `launcher`: [`BackendLauncher`](launcher::BackendLauncher) seam used by
//!   the session manager.
//! - `schema`: typed agent-protocol shapes.
//! - `client`: [`AgentClient`](client::AgentClient) calls and the reader task.
//! - `terminal`: commands run for the backend through `terminal/*` calls.

pub mod client;
pub mod launcher;
pub mod process;
pub mod schema;
pub mod terminal;

pub use client::{AgentClient, AgentEvent};
pub use launcher::{BackendLauncher, LaunchSpec, ProcessLauncher};
pub use process::BackendProcess;
pub use terminal::TerminalManager;
