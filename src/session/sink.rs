//! Event sink capability handed to the session manager per session.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::translate::SessionEvent;
use crate::Result;

/// Boxed future returned by [`EventSink`] methods.
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Destination for one session's client-bound traffic.
///
/// Implementations must write each call as one unit; the session manager
/// calls `emit` from a single task per session, in delivery order.
pub trait EventSink: Send + Sync {
    /// Deliver a session event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be written.
    fn emit<'a>(&'a self, session_id: &'a str, event: &'a SessionEvent) -> SinkFuture<'a>;

    /// Send a `permission.request` call whose id is `correlation_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be written.
    fn request_permission<'a>(
        &'a self,
        correlation_id: &'a str,
        session_id: &'a str,
        params: Value,
    ) -> SinkFuture<'a>;
}
