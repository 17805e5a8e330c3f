//! Permission bridge.
//!
//! Re-issues agent permission requests to the client as `permission.request`
//! calls and correlates the reply. Each request is parked in a
//! [`PendingCalls`] table under a fresh correlation id and resolves exactly
//! once: by the client reply, by the configured timeout, or by the owning
//! session closing. Later resolution attempts are no-ops.

use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::schema::{PermissionOption, RequestPermissionOutcome, RequestPermissionParams};
use crate::config::UnattendedDecision;
use crate::pending::PendingCalls;
use crate::session::sink::EventSink;
use crate::translate::methods::{self, PermissionDecision};
use crate::{AppError, Result};

/// Metadata of a permission request in flight to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPermission {
    /// Owning client session.
    pub session_id: String,
    /// Options the agent offered.
    pub options: Vec<PermissionOption>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    Reply(PermissionDecision),
    SessionClosed,
}

/// Correlates agent permission requests with client replies.
#[derive(Debug)]
pub struct PermissionBridge {
    pending: PendingCalls<Resolution, PendingPermission>,
    timeout: Duration,
}

impl PermissionBridge {
    /// Create a bridge whose round-trips time out after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: PendingCalls::new(),
            timeout,
        }
    }

    /// Forward a request to the client and wait for the decision.
    ///
    /// # Errors
    ///
    /// - `AppError::Timeout` when no reply arrives in time.
    /// - `AppError::SessionClosed` when the session closes first.
    /// - Any error from writing the request to the client.
    pub async fn forward(
        &self,
        session_id: &str,
        request: &RequestPermissionParams,
        sink: &dyn EventSink,
    ) -> Result<RequestPermissionOutcome> {
        let correlation_id = format!("perm-{}", Uuid::new_v4());
        let mut rx = self
            .pending
            .register(
                correlation_id.clone(),
                PendingPermission {
                    session_id: session_id.to_owned(),
                    options: request.options.clone(),
                },
            )
            .await?;

        let params = methods::permission_request(session_id, request);
        if let Err(err) = sink.request_permission(&correlation_id, session_id, params).await {
            self.pending.remove(&correlation_id).await;
            return Err(err);
        }
        debug!(session_id, %correlation_id, "permission request forwarded");

        let resolution = match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(resolution) => resolution,
            Err(_elapsed) => {
                if self.pending.remove(&correlation_id).await.is_some() {
                    warn!(session_id, %correlation_id, "permission request timed out");
                    return Err(AppError::Timeout(format!(
                        "permission request {correlation_id} unanswered after {:?}",
                        self.timeout
                    )));
                }
                // Resolved concurrently with the deadline; the value is in the slot.
                rx.await
            }
        };

        match resolution {
            Ok(Resolution::Reply(decision)) => {
                let outcome = methods::select_outcome(&decision, &request.options);
                info!(session_id, %correlation_id, ?decision, ?outcome, "permission resolved");
                Ok(outcome)
            }
            Ok(Resolution::SessionClosed) | Err(_) => Err(AppError::SessionClosed(format!(
                "permission request {correlation_id} abandoned"
            ))),
        }
    }

    /// Deliver the client's decision. Returns `false` if the id is unknown
    /// or already resolved.
    pub async fn resolve(&self, correlation_id: &str, decision: PermissionDecision) -> bool {
        let resolved = self
            .pending
            .complete(correlation_id, Resolution::Reply(decision))
            .await;
        if !resolved {
            debug!(correlation_id, "permission reply for unknown or resolved request");
        }
        resolved
    }

    /// Resolve every request of `session_id` as rejected. Returns the count.
    pub async fn reject_session(&self, session_id: &str) -> usize {
        let count = self
            .pending
            .complete_where(|p| p.session_id == session_id, |_| Resolution::SessionClosed)
            .await;
        if count > 0 {
            info!(session_id, count, "rejected pending permission requests");
        }
        count
    }

    /// Number of requests awaiting a client reply.
    pub async fn pending_count(&self) -> usize {
        self.pending.len().await
    }
}

/// Outcome applied when the client does not answer permission requests.
#[must_use]
pub fn unattended_outcome(decision: UnattendedDecision, options: &[PermissionOption]) -> RequestPermissionOutcome {
    match decision {
        UnattendedDecision::Allow => methods::select_outcome(&PermissionDecision::Approved, options),
        UnattendedDecision::Reject => methods::reject_outcome(options),
    }
}

/// Outcome for the agent when forwarding failed.
#[must_use]
pub fn outcome_on_error(options: &[PermissionOption]) -> RequestPermissionOutcome {
    methods::reject_outcome(options)
}
