#![forbid(unsafe_code)]

//! Stdio proxy that lets agent-SDK clients drive Agent Client Protocol
//! backends.

pub mod backend;
pub mod config;
pub mod errors;
pub mod frontend;
pub mod pending;
pub mod permission;
pub mod session;
pub mod translate;
pub mod wire;

pub use config::ProxyConfig;
pub use errors::{AppError, Result};
