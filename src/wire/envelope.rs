//! JSON-RPC 2.0 envelopes shared by the client and agent channels.
//!
//! Inbound payloads are classified once into a closed [`Message`] type so
//! that the listener and the agent client never branch on raw JSON keys.
//!
//! | shape                               | variant                   |
//! |-------------------------------------|---------------------------|
//! | `method` + `id`                     | [`Message::Request`]      |
//! | `method`, no `id`                   | [`Message::Notification`] |
//! | `id` + `result` or `error`          | [`Message::Response`]     |
//! | anything else                       | `AppError::Protocol`      |

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{AppError, Result};

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier: JSON-RPC allows numbers and strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id.
    Number(i64),
    /// String id.
    Text(String),
}

impl RequestId {
    /// Stable map key for correlation tables.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Build an error without extra data.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// A classified JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Call expecting a response.
    Request {
        /// Correlation id.
        id: RequestId,
        /// Method name.
        method: String,
        /// Parameters (`Value::Null` when absent).
        params: Value,
    },
    /// Fire-and-forget call.
    Notification {
        /// Method name.
        method: String,
        /// Parameters (`Value::Null` when absent).
        params: Value,
    },
    /// Reply to an earlier request.
    Response {
        /// Id of the request being answered; `None` for parse-error replies.
        id: Option<RequestId>,
        /// Success payload or error object.
        outcome: std::result::Result<Value, RpcError>,
    },
}

impl Message {
    /// Build a request.
    #[must_use]
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Build a notification.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    /// Build a success response.
    #[must_use]
    pub fn result(id: RequestId, result: Value) -> Self {
        Self::Response {
            id: Some(id),
            outcome: Ok(result),
        }
    }

    /// Build an error response.
    #[must_use]
    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        Self::Response {
            id,
            outcome: Err(error),
        }
    }

    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }

    /// Classify a decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] when the value is not an object or has
    /// neither a method nor a result/error member.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            return Err(AppError::Protocol("envelope is not a json object".into()));
        };

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value::<RequestId>(raw)
                    .map_err(|e| AppError::Protocol(format!("invalid id: {e}")))?,
            ),
        };
        let params = obj.remove("params").unwrap_or(Value::Null);

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(AppError::Protocol("method must be a string".into()));
            };
            return Ok(match id {
                Some(id) => Self::Request { id, method, params },
                None => Self::Notification { method, params },
            });
        }

        if let Some(error) = obj.remove("error") {
            let error: RpcError = serde_json::from_value(error)
                .map_err(|e| AppError::Protocol(format!("invalid error object: {e}")))?;
            return Ok(Self::Response {
                id,
                outcome: Err(error),
            });
        }

        if let Some(result) = obj.remove("result") {
            if id.is_none() {
                return Err(AppError::Protocol("response without id".into()));
            }
            return Ok(Self::Response {
                id,
                outcome: Ok(result),
            });
        }

        Err(AppError::Protocol(
            "envelope has neither method nor result/error".into(),
        ))
    }

    /// Parse a frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Framing`] for invalid JSON and
    /// [`AppError::Protocol`] for a non-conforming envelope.
    pub fn parse(payload: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| AppError::Framing(format!("malformed json: {e}")))?;
        Self::from_value(value)
    }

    /// Serialize into a JSON value with the `jsonrpc` member set.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), json!(JSONRPC_VERSION));
        match self {
            Self::Request { id, method, params } => {
                obj.insert("id".into(), json!(id));
                obj.insert("method".into(), json!(method));
                if !params.is_null() {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Notification { method, params } => {
                obj.insert("method".into(), json!(method));
                if !params.is_null() {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response { id, outcome } => {
                obj.insert("id".into(), json!(id));
                match outcome {
                    Ok(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    Err(error) => {
                        obj.insert("error".into(), json!(error));
                    }
                }
            }
        }
        Value::Object(obj)
    }

    /// Serialize into a compact JSON string ready for framing.
    #[must_use]
    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}
