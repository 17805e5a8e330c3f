//! Agent-protocol message shapes.
//!
//! Only the subset the proxy issues or consumes is modelled. Inbound
//! `session/update` payloads decode into the closed [`SessionUpdate`] type;
//! anything outside the mapped kinds lands in [`SessionUpdate::Unmapped`]
//! with its raw payload kept for logging.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Agent-protocol version spoken on every back channel.
pub const PROTOCOL_VERSION: u16 = 1;

/// Agent-protocol method names.
pub mod methods {
    /// Handshake.
    pub const INITIALIZE: &str = "initialize";
    /// Session establishment.
    pub const SESSION_NEW: &str = "session/new";
    /// Model switch.
    pub const SESSION_SET_MODEL: &str = "session/set_model";
    /// Prompt turn.
    pub const SESSION_PROMPT: &str = "session/prompt";
    /// Cancel notification.
    pub const SESSION_CANCEL: &str = "session/cancel";
    /// Streaming update notification (agent to proxy).
    pub const SESSION_UPDATE: &str = "session/update";
    /// Permission request (agent to proxy).
    pub const REQUEST_PERMISSION: &str = "session/request_permission";
    /// File read (agent to proxy).
    pub const FS_READ_TEXT_FILE: &str = "fs/read_text_file";
    /// File write (agent to proxy).
    pub const FS_WRITE_TEXT_FILE: &str = "fs/write_text_file";
    /// Start a command (agent to proxy).
    pub const TERMINAL_CREATE: &str = "terminal/create";
    /// Read a command's captured output (agent to proxy).
    pub const TERMINAL_OUTPUT: &str = "terminal/output";
    /// Block until a command exits (agent to proxy).
    pub const TERMINAL_WAIT_FOR_EXIT: &str = "terminal/wait_for_exit";
    /// Kill a command, keeping its output (agent to proxy).
    pub const TERMINAL_KILL: &str = "terminal/kill";
    /// Kill a command and forget it (agent to proxy).
    pub const TERMINAL_RELEASE: &str = "terminal/release";
}

// ── Handshake ────────────────────────────────────────────────────────────────

/// `initialize` parameters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol version offered by the proxy.
    pub protocol_version: u16,
    /// Capabilities the proxy serves on behalf of the agent.
    pub client_capabilities: ClientCapabilities,
    /// Proxy identification.
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            client_capabilities: ClientCapabilities {
                fs: FsCapabilities {
                    read_text_file: true,
                    write_text_file: true,
                },
                terminal: true,
            },
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_owned(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
            },
        }
    }
}

/// Client capability advertisement.
#[derive(Debug, Clone, Serialize)]
pub struct ClientCapabilities {
    /// File-system access.
    pub fs: FsCapabilities,
    /// `terminal/*` calls are served.
    pub terminal: bool,
}

/// File-system capability flags.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsCapabilities {
    /// `fs/read_text_file` is served.
    pub read_text_file: bool,
    /// `fs/write_text_file` is served.
    pub write_text_file: bool,
}

/// Name and version of the proxy.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    /// Implementation name.
    pub name: String,
    /// Implementation version.
    pub version: String,
}

/// `initialize` result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Version chosen by the agent.
    pub protocol_version: u16,
    /// Agent capability advertisement, kept opaque.
    #[serde(default)]
    pub agent_capabilities: Value,
}

// ── Sessions ─────────────────────────────────────────────────────────────────

/// Name/value pair used for environment variables and HTTP headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVariable {
    /// Variable or header name.
    pub name: String,
    /// Value, copied verbatim.
    pub value: String,
}

/// Transport of a remote MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteTransport {
    /// Streamable HTTP.
    Http,
    /// Server-sent events.
    Sse,
}

/// MCP server descriptor passed to `session/new`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum McpServer {
    /// Server reached over HTTP or SSE.
    Remote {
        /// Transport.
        #[serde(rename = "type")]
        transport: RemoteTransport,
        /// Server name.
        name: String,
        /// Endpoint URL.
        url: String,
        /// Request headers.
        headers: Vec<EnvVariable>,
    },
    /// Server launched as a subprocess.
    Stdio {
        /// Server name.
        name: String,
        /// Executable.
        command: String,
        /// Arguments.
        args: Vec<String>,
        /// Environment overrides.
        env: Vec<EnvVariable>,
    },
}

impl McpServer {
    /// Server name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Remote { name, .. } | Self::Stdio { name, .. } => name,
        }
    }
}

/// `session/new` parameters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionParams {
    /// Session working directory.
    pub cwd: String,
    /// MCP servers the agent should connect to.
    pub mcp_servers: Vec<McpServer>,
}

/// `session/new` result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResult {
    /// Agent-assigned session id.
    pub session_id: String,
    /// Model state advertised by agents that support model selection.
    #[serde(default)]
    pub models: Option<Value>,
}

/// `session/set_model` parameters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModelParams {
    /// Agent session id.
    pub session_id: String,
    /// Model to select.
    pub model_id: String,
}

/// `session/cancel` parameters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelParams {
    /// Agent session id.
    pub session_id: String,
}

// ── Prompt turns ─────────────────────────────────────────────────────────────

/// Content block exchanged in prompts and streamed chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Reference to a file or directory.
    ResourceLink {
        /// Resource URI.
        uri: String,
        /// Display name.
        name: String,
    },
    /// Base64 image.
    Image {
        /// Encoded bytes.
        data: String,
        /// MIME type.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Any block type the proxy does not interpret.
    #[serde(other)]
    Other,
}

impl ContentBlock {
    /// Text block constructor.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Text carried by this block, if any.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// `session/prompt` parameters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptParams {
    /// Agent session id.
    pub session_id: String,
    /// Prompt content.
    pub prompt: Vec<ContentBlock>,
}

/// `session/prompt` result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResult {
    /// Why the turn ended (`end_turn`, `cancelled`, ...).
    pub stop_reason: String,
}

// ── Streaming updates ────────────────────────────────────────────────────────

/// Tool call lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Not started.
    Pending,
    /// Running.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl ToolCallStatus {
    /// Whether no further progress follows this status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A new tool call announced by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Tool call id, unique within the session.
    pub tool_call_id: String,
    /// Human-readable title (used as the tool name).
    #[serde(default)]
    pub title: String,
    /// Tool category.
    #[serde(default)]
    pub kind: Option<String>,
    /// Initial status.
    #[serde(default)]
    pub status: Option<ToolCallStatus>,
    /// Raw tool input.
    #[serde(default)]
    pub raw_input: Option<Value>,
    /// Raw tool output.
    #[serde(default)]
    pub raw_output: Option<Value>,
    /// Produced content.
    #[serde(default)]
    pub content: Option<Value>,
}

/// Progress on an existing tool call; every field but the id is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallUpdate {
    /// Tool call id.
    pub tool_call_id: String,
    /// Updated title.
    #[serde(default)]
    pub title: Option<String>,
    /// Updated status.
    #[serde(default)]
    pub status: Option<ToolCallStatus>,
    /// Updated raw input.
    #[serde(default)]
    pub raw_input: Option<Value>,
    /// Updated raw output.
    #[serde(default)]
    pub raw_output: Option<Value>,
    /// Updated content.
    #[serde(default)]
    pub content: Option<Value>,
}

/// Discriminant of a [`SessionUpdate`], used as the translation-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    /// `agent_message_chunk`.
    MessageChunk,
    /// `agent_thought_chunk`.
    ThoughtChunk,
    /// `tool_call`.
    ToolCall,
    /// `tool_call_update`.
    ToolCallUpdate,
    /// Anything else.
    Unmapped,
}

/// Payload of a `session/update` notification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    /// Assistant text chunk.
    AgentMessageChunk {
        /// Chunk content.
        content: ContentBlock,
    },
    /// Reasoning chunk.
    AgentThoughtChunk {
        /// Chunk content.
        content: ContentBlock,
    },
    /// Tool call started.
    ToolCall(ToolCall),
    /// Tool call progressed or finished.
    ToolCallUpdate(ToolCallUpdate),
    /// Update kind without a client-protocol mapping.
    #[serde(skip)]
    Unmapped {
        /// Raw `sessionUpdate` discriminator.
        kind: String,
        /// Raw payload.
        raw: Value,
    },
}

impl SessionUpdate {
    /// Decode an update, falling back to [`SessionUpdate::Unmapped`].
    #[must_use]
    pub fn from_value(raw: Value) -> Self {
        let kind = raw
            .get("sessionUpdate")
            .and_then(Value::as_str)
            .unwrap_or("<missing>")
            .to_owned();
        match serde_json::from_value::<Self>(raw.clone()) {
            Ok(update) => update,
            Err(_) => Self::Unmapped { kind, raw },
        }
    }

    /// Translation-table key.
    #[must_use]
    pub fn kind(&self) -> UpdateKind {
        match self {
            Self::AgentMessageChunk { .. } => UpdateKind::MessageChunk,
            Self::AgentThoughtChunk { .. } => UpdateKind::ThoughtChunk,
            Self::ToolCall(_) => UpdateKind::ToolCall,
            Self::ToolCallUpdate(_) => UpdateKind::ToolCallUpdate,
            Self::Unmapped { .. } => UpdateKind::Unmapped,
        }
    }
}

/// `session/update` notification parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    /// Agent session id.
    pub session_id: String,
    /// Raw update; decode with [`SessionUpdate::from_value`].
    pub update: Value,
}

// ── Permissions ──────────────────────────────────────────────────────────────

/// Kind of a permission option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOptionKind {
    /// Allow this call only.
    AllowOnce,
    /// Allow this and future calls.
    AllowAlways,
    /// Reject this call only.
    RejectOnce,
    /// Reject this and future calls.
    RejectAlways,
}

impl PermissionOptionKind {
    /// Whether the option grants permission.
    #[must_use]
    pub fn is_allow(self) -> bool {
        matches!(self, Self::AllowOnce | Self::AllowAlways)
    }
}

/// One choice offered with a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    /// Option id returned in the outcome.
    pub option_id: String,
    /// Display name.
    pub name: String,
    /// Option kind.
    pub kind: PermissionOptionKind,
}

/// `session/request_permission` parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPermissionParams {
    /// Agent session id.
    pub session_id: String,
    /// The tool call needing permission.
    pub tool_call: ToolCallUpdate,
    /// Choices offered.
    pub options: Vec<PermissionOption>,
}

/// Decision returned to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequestPermissionOutcome {
    /// The prompt turn was cancelled or no option applies.
    Cancelled,
    /// An option was chosen.
    Selected {
        /// Chosen option id.
        #[serde(rename = "optionId")]
        option_id: String,
    },
}

/// `session/request_permission` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPermissionResponse {
    /// Decision.
    pub outcome: RequestPermissionOutcome,
}

// ── File system ──────────────────────────────────────────────────────────────

/// `fs/read_text_file` parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadTextFileParams {
    /// File path.
    pub path: String,
    /// 1-based first line to return.
    #[serde(default)]
    pub line: Option<usize>,
    /// Maximum number of lines to return.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `fs/write_text_file` parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteTextFileParams {
    /// File path.
    pub path: String,
    /// Full new content.
    pub content: String,
}

// ── Terminals ────────────────────────────────────────────────────────────────

/// `terminal/create` parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalParams {
    /// Agent session the command belongs to.
    #[serde(default)]
    pub session_id: String,
    /// Command line, run through the shell.
    pub command: String,
    /// Extra arguments appended to the command line.
    #[serde(default)]
    pub args: Vec<String>,
    /// Additional environment variables.
    #[serde(default)]
    pub env: Vec<EnvVariable>,
    /// Working directory; relative paths resolve against the session cwd.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Bytes of output retained; older output is dropped first.
    #[serde(default)]
    pub output_byte_limit: Option<usize>,
}

/// Parameters of the calls that address an existing terminal.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRef {
    /// Agent session the terminal belongs to.
    #[serde(default)]
    pub session_id: String,
    /// Id returned by `terminal/create`.
    pub terminal_id: String,
}

/// How a terminal command ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalExitStatus {
    /// Exit code, when the command exited normally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Signal name, when the command was killed by one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

/// `terminal/output` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutput {
    /// Retained output.
    pub output: String,
    /// Whether older output was dropped to honour the byte limit.
    pub truncated: bool,
    /// Present once the command has exited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<TerminalExitStatus>,
}
