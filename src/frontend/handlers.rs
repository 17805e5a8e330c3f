//! Client method dispatch.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::frontend::protocol;
use crate::session::{EventSink, SessionManager};
use crate::translate::methods::{parse_params, CreateParams, SendParams, SessionRef, SetModelParams};
use crate::translate::ClientMethod;
use crate::{AppError, Result};

/// Routes client calls to the session manager.
#[derive(Debug, Clone)]
pub struct Handlers {
    manager: SessionManager,
}

impl Handlers {
    /// Create handlers over `manager`.
    #[must_use]
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    /// Session manager behind the handlers.
    #[must_use]
    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Execute one client call and produce its result.
    ///
    /// `sink` receives the events of any session the call creates or
    /// resumes.
    ///
    /// # Errors
    ///
    /// - `AppError::MethodNotFound` for a method outside the client table.
    /// - `AppError::InvalidParams` for malformed parameters.
    /// - Any error of the invoked session operation.
    pub async fn dispatch(&self, method: &str, params: Value, sink: Arc<dyn EventSink>) -> Result<Value> {
        let Some(call) = ClientMethod::from_name(method) else {
            return Err(AppError::MethodNotFound(method.to_owned()));
        };
        debug!(method, "dispatching client call");
        let manager = &self.manager;

        match call {
            ClientMethod::Ping => Ok(protocol::ping(params.get("message").and_then(Value::as_str))),
            ClientMethod::StatusGet => Ok(protocol::status()),
            ClientMethod::AuthGetStatus => Ok(protocol::auth_status(manager.config())),
            ClientMethod::ModelsList => Ok(protocol::models(manager.config())),
            ClientMethod::SessionCreate => {
                let params: CreateParams = parse_params(call, params)?;
                let created = manager.create(params, sink).await?;
                Ok(json!({
                    "sessionId": created.session_id,
                    "workspacePath": created.workspace_path.display().to_string(),
                }))
            }
            ClientMethod::SessionResume => {
                let params: CreateParams = parse_params(call, params)?;
                let resumed = manager.resume(params, sink).await?;
                Ok(json!({
                    "sessionId": resumed.session_id,
                    "workspacePath": resumed.workspace_path.display().to_string(),
                }))
            }
            ClientMethod::SessionSend => {
                let params: SendParams = parse_params(call, params)?;
                let message_id = manager
                    .prompt(&params.session_id, &params.prompt, &params.attachments)
                    .await?;
                Ok(json!({ "messageId": message_id }))
            }
            ClientMethod::SessionAbort => {
                let params: SessionRef = parse_params(call, params)?;
                manager.cancel(&params.session_id).await?;
                Ok(json!({}))
            }
            ClientMethod::SessionSetModel => {
                let params: SetModelParams = parse_params(call, params)?;
                manager.set_model(&params.session_id, &params.model_id).await?;
                Ok(json!({}))
            }
            ClientMethod::SessionDestroy => {
                let params: SessionRef = parse_params(call, params)?;
                manager.destroy(&params.session_id).await?;
                Ok(json!({}))
            }
            ClientMethod::SessionDelete => {
                let params: SessionRef = parse_params(call, params)?;
                Ok(json!({ "success": manager.delete(&params.session_id).await }))
            }
            ClientMethod::SessionList => Ok(json!({ "sessions": manager.list().await })),
            ClientMethod::SessionGetMessages => {
                let params: SessionRef = parse_params(call, params)?;
                Ok(json!({ "events": manager.history(&params.session_id).await? }))
            }
            ClientMethod::SessionGetLastId | ClientMethod::SessionGetForeground => {
                Ok(json!({ "sessionId": manager.last_session_id().await }))
            }
            ClientMethod::SessionSetForeground => Ok(json!({ "success": true })),
        }
    }
}
