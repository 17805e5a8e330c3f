//! Client-facing side of the proxy.
//!
//! - `listener`: framed stdio loop, outbound writer, and event sink.
//! - `handlers`: client method dispatch.
//! - `protocol`: constants and results of stateless methods.

pub mod handlers;
pub mod listener;
pub mod protocol;

pub use handlers::Handlers;
pub use listener::{FrontendListener, FrontendSink, Outbound};
