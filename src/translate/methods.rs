//! Client-protocol method table and parameter projections.
//!
//! Every client method is listed in [`ClientMethod`] together with the
//! agent-protocol calls it issues. Projections rename and reshape fields but
//! never rewrite values: strings pass through byte-for-byte.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::backend::schema::{
    ContentBlock, EnvVariable, McpServer, PermissionOption, RemoteTransport,
    RequestPermissionOutcome, RequestPermissionParams,
};
use crate::{AppError, Result};

/// Agent-protocol step issued on behalf of a client method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentCall {
    /// `initialize`.
    Initialize,
    /// `session/new`.
    NewSession,
    /// `session/set_model`, only when a model is requested and the profile
    /// switches models over the protocol.
    SetModel,
    /// `session/prompt`.
    Prompt,
    /// `session/cancel`.
    Cancel,
    /// Terminate the backend process.
    Terminate,
}

/// Every client-protocol method the proxy answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientMethod {
    /// `ping`.
    Ping,
    /// `status.get`.
    StatusGet,
    /// `auth.getStatus`.
    AuthGetStatus,
    /// `models.list`.
    ModelsList,
    /// `session.create`.
    SessionCreate,
    /// `session.resume`.
    SessionResume,
    /// `session.send`.
    SessionSend,
    /// `session.abort`.
    SessionAbort,
    /// `session.setModel`.
    SessionSetModel,
    /// `session.destroy`.
    SessionDestroy,
    /// `session.delete`.
    SessionDelete,
    /// `session.list`.
    SessionList,
    /// `session.getMessages`.
    SessionGetMessages,
    /// `session.getLastId`.
    SessionGetLastId,
    /// `session.getForeground`.
    SessionGetForeground,
    /// `session.setForeground`.
    SessionSetForeground,
}

impl ClientMethod {
    /// All methods, in table order.
    pub const ALL: [Self; 16] = [
        Self::Ping,
        Self::StatusGet,
        Self::AuthGetStatus,
        Self::ModelsList,
        Self::SessionCreate,
        Self::SessionResume,
        Self::SessionSend,
        Self::SessionAbort,
        Self::SessionSetModel,
        Self::SessionDestroy,
        Self::SessionDelete,
        Self::SessionList,
        Self::SessionGetMessages,
        Self::SessionGetLastId,
        Self::SessionGetForeground,
        Self::SessionSetForeground,
    ];

    /// Wire name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::StatusGet => "status.get",
            Self::AuthGetStatus => "auth.getStatus",
            Self::ModelsList => "models.list",
            Self::SessionCreate => "session.create",
            Self::SessionResume => "session.resume",
            Self::SessionSend => "session.send",
            Self::SessionAbort => "session.abort",
            Self::SessionSetModel => "session.setModel",
            Self::SessionDestroy => "session.destroy",
            Self::SessionDelete => "session.delete",
            Self::SessionList => "session.list",
            Self::SessionGetMessages => "session.getMessages",
            Self::SessionGetLastId => "session.getLastId",
            Self::SessionGetForeground => "session.getForeground",
            Self::SessionSetForeground => "session.setForeground",
        }
    }

    /// Look up a method by wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// Agent-protocol calls issued, in order.
    #[must_use]
    pub fn agent_calls(self) -> &'static [AgentCall] {
        match self {
            Self::SessionCreate | Self::SessionResume => {
                &[AgentCall::Initialize, AgentCall::NewSession, AgentCall::SetModel]
            }
            Self::SessionSend => &[AgentCall::Prompt],
            Self::SessionAbort => &[AgentCall::Cancel],
            Self::SessionSetModel => &[AgentCall::SetModel],
            Self::SessionDestroy | Self::SessionDelete => &[AgentCall::Terminate],
            Self::Ping
            | Self::StatusGet
            | Self::AuthGetStatus
            | Self::ModelsList
            | Self::SessionList
            | Self::SessionGetMessages
            | Self::SessionGetLastId
            | Self::SessionGetForeground
            | Self::SessionSetForeground => &[],
        }
    }
}

// ── Parameters ───────────────────────────────────────────────────────────────

/// MCP server entry as the client describes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMcpServer {
    /// `local`/`stdio` (default), `http`, or `sse`.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Executable for local servers.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments for local servers.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment for local servers.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Endpoint for remote servers.
    #[serde(default)]
    pub url: Option<String>,
    /// Headers for remote servers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Tool allow-list; not forwarded.
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

/// `session.create` / `session.resume` parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateParams {
    /// Requested session id.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Requested model.
    #[serde(default)]
    pub model: Option<String>,
    /// Session working directory.
    #[serde(default)]
    pub working_directory: Option<String>,
    /// MCP servers keyed by name.
    #[serde(default)]
    pub mcp_servers: Option<BTreeMap<String, ClientMcpServer>>,
    /// Whether the client answers `permission.request` calls.
    #[serde(default)]
    pub request_permission: bool,
    /// Streaming preference; deltas are always delivered.
    #[serde(default)]
    pub streaming: bool,
    /// Backend kind for this session.
    #[serde(default)]
    pub backend: Option<String>,
}

/// File or directory attached to a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// `file` or `directory`.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Filesystem path.
    pub path: String,
    /// Display name.
    #[serde(default)]
    pub display_name: Option<String>,
}

/// `session.send` parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendParams {
    /// Target session.
    pub session_id: String,
    /// Prompt text.
    #[serde(default)]
    pub prompt: String,
    /// Attachments.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// `session.setModel` parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModelParams {
    /// Target session.
    pub session_id: String,
    /// Model to select.
    #[serde(alias = "model")]
    pub model_id: String,
}

/// Parameters naming one session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    /// Target session.
    pub session_id: String,
}

/// Decode client parameters; `null` decodes as an empty object.
///
/// # Errors
///
/// Returns `AppError::InvalidParams` naming the method on failure.
pub fn parse_params<T: for<'de> Deserialize<'de>>(method: ClientMethod, params: Value) -> Result<T> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params)
        .map_err(|err| AppError::InvalidParams(format!("{}: {err}", method.name())))
}

// ── Projections ──────────────────────────────────────────────────────────────

/// Client MCP map to the agent list, sorted by name.
///
/// # Errors
///
/// Returns `AppError::InvalidParams` when a local server has no command or a
/// remote server has no url.
pub fn project_mcp_servers(servers: Option<&BTreeMap<String, ClientMcpServer>>) -> Result<Vec<McpServer>> {
    let Some(servers) = servers else {
        return Ok(Vec::new());
    };
    servers
        .iter()
        .map(|(name, server)| project_mcp_server(name, server))
        .collect()
}

fn project_mcp_server(name: &str, server: &ClientMcpServer) -> Result<McpServer> {
    let remote = match server.kind.as_deref() {
        Some("http") => Some(RemoteTransport::Http),
        Some("sse") => Some(RemoteTransport::Sse),
        _ => None,
    };

    if let Some(transport) = remote {
        let url = server
            .url
            .clone()
            .ok_or_else(|| AppError::InvalidParams(format!("mcp server {name} has no url")))?;
        return Ok(McpServer::Remote {
            transport,
            name: name.to_owned(),
            url,
            headers: pairs(&server.headers),
        });
    }

    let command = server
        .command
        .clone()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::InvalidParams(format!("mcp server {name} has no command")))?;
    Ok(McpServer::Stdio {
        name: name.to_owned(),
        command,
        args: server.args.clone(),
        env: pairs(&server.env),
    })
}

fn pairs(map: &BTreeMap<String, String>) -> Vec<EnvVariable> {
    map.iter()
        .map(|(name, value)| EnvVariable {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

/// Prompt text and attachments to agent content blocks.
#[must_use]
pub fn project_prompt(prompt: &str, attachments: &[Attachment]) -> Vec<ContentBlock> {
    let mut blocks = Vec::with_capacity(attachments.len() + 1);
    if !prompt.is_empty() {
        blocks.push(ContentBlock::text(prompt));
    }
    for attachment in attachments {
        let name = attachment.display_name.clone().unwrap_or_else(|| {
            Path::new(&attachment.path)
                .file_name()
                .map_or_else(|| attachment.path.clone(), |n| n.to_string_lossy().into_owned())
        });
        blocks.push(ContentBlock::ResourceLink {
            uri: format!("file://{}", attachment.path),
            name,
        });
    }
    blocks
}

/// Agent permission request to `permission.request` parameters.
#[must_use]
pub fn permission_request(session_id: &str, request: &RequestPermissionParams) -> Value {
    json!({
        "sessionId": session_id,
        "permissionRequest": {
            "kind": "tool",
            "toolCallId": request.tool_call.tool_call_id,
            "title": request.tool_call.title.clone().unwrap_or_default(),
            "arguments": request.tool_call.raw_input.clone().unwrap_or_else(|| json!({})),
            "options": request.options,
        },
    })
}

/// Client answer to a permission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    /// Explicit option chosen by id.
    Option(String),
    /// Approve with the first allow option.
    Approved,
    /// Deny with the first reject option.
    Denied,
}

/// Interpret a `permission.request` reply.
///
/// Accepts `{kind, optionId?}` either directly or wrapped as `{result: ...}`.
/// An unrecognized kind is a denial.
#[must_use]
pub fn parse_permission_reply(reply: &Value) -> PermissionDecision {
    let body = reply.get("result").filter(|v| v.is_object()).unwrap_or(reply);
    if let Some(option_id) = body.get("optionId").and_then(Value::as_str) {
        return PermissionDecision::Option(option_id.to_owned());
    }
    match body.get("kind").and_then(Value::as_str) {
        Some("approved") => PermissionDecision::Approved,
        _ => PermissionDecision::Denied,
    }
}

/// Outcome for the agent from a client decision.
///
/// An explicit option id wins when the agent offered it; otherwise the first
/// option of the matching kind is selected, or the request is cancelled when
/// none exists.
#[must_use]
pub fn select_outcome(decision: &PermissionDecision, options: &[PermissionOption]) -> RequestPermissionOutcome {
    match decision {
        PermissionDecision::Option(id) if options.iter().any(|o| &o.option_id == id) => {
            RequestPermissionOutcome::Selected {
                option_id: id.clone(),
            }
        }
        PermissionDecision::Approved => first_matching(options, true),
        PermissionDecision::Option(_) | PermissionDecision::Denied => first_matching(options, false),
    }
}

/// Outcome used when a request is rejected without a client answer.
#[must_use]
pub fn reject_outcome(options: &[PermissionOption]) -> RequestPermissionOutcome {
    first_matching(options, false)
}

fn first_matching(options: &[PermissionOption], allow: bool) -> RequestPermissionOutcome {
    options
        .iter()
        .find(|o| o.kind.is_allow() == allow)
        .map_or(RequestPermissionOutcome::Cancelled, |o| {
            RequestPermissionOutcome::Selected {
                option_id: o.option_id.clone(),
            }
        })
}
