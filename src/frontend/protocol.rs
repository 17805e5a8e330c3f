//! Client protocol constants and result shapes for stateless methods.

use chrono::Utc;
use serde_json::{json, Value};

use crate::config::ProxyConfig;

/// Client protocol version reported by `ping` and `status.get`.
pub const PROTOCOL_VERSION: u32 = 2;

/// Proxy version reported by `status.get`.
pub const PROXY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Notification carrying one session event.
pub const SESSION_EVENT: &str = "session.event";

/// Request asking the client to decide on a tool permission.
pub const PERMISSION_REQUEST: &str = "permission.request";

/// `ping` result; echoes `message` or answers `pong`.
#[must_use]
pub fn ping(message: Option<&str>) -> Value {
    json!({
        "message": message.filter(|m| !m.is_empty()).unwrap_or("pong"),
        "timestamp": Utc::now().timestamp_millis(),
        "protocolVersion": PROTOCOL_VERSION,
    })
}

/// `status.get` result.
#[must_use]
pub fn status() -> Value {
    json!({ "version": PROXY_VERSION, "protocolVersion": PROTOCOL_VERSION })
}

/// `auth.getStatus` result. Authentication is the backend's concern, so the
/// proxy always reports an authenticated environment login.
#[must_use]
pub fn auth_status(config: &ProxyConfig) -> Value {
    json!({
        "isAuthenticated": true,
        "authType": "env",
        "host": "https://github.com",
        "login": "proxy-user",
        "statusMessage": format!("Connected via ACP proxy to {}", config.default_backend),
    })
}

/// `models.list` result for the default backend.
#[must_use]
pub fn models(config: &ProxyConfig) -> Value {
    let models: Vec<Value> = config
        .default_profile()
        .ok()
        .map(|profile| {
            profile
                .models
                .iter()
                .map(|m| {
                    json!({
                        "id": m.id,
                        "name": m.name,
                        "capabilities": m.capabilities.clone().unwrap_or_else(|| json!({})),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    if models.is_empty() {
        return json!({
            "models": [{ "id": "default", "name": "Default Model", "capabilities": {} }]
        });
    }
    json!({ "models": models })
}

/// `session.event` notification parameters.
#[must_use]
pub fn session_event(session_id: &str, event: Value) -> Value {
    json!({ "sessionId": session_id, "event": event })
}
