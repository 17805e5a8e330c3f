//! Error types shared across the proxy.

use std::fmt::{Display, Formatter};

use crate::wire::envelope::RpcError;

/// Shared proxy result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Proxy error enumeration covering all failure modes on both channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The backend process could not be started.
    Spawn(String),
    /// The backend process exited or its stream closed.
    BackendGone(String),
    /// A frame header or payload could not be decoded.
    Framing(String),
    /// The peer sent an envelope that violates the protocol.
    Protocol(String),
    /// Parameters of a call were missing or malformed.
    InvalidParams(String),
    /// The requested method is not part of the protocol.
    MethodNotFound(String),
    /// No live session has the given id.
    SessionNotFound(String),
    /// The session already has a prompt in flight.
    SessionBusy(String),
    /// The requested session id is live or was used before.
    SessionIdInUse(String),
    /// The session closed while the operation was waiting.
    SessionClosed(String),
    /// A bounded wait elapsed.
    Timeout(String),
    /// The backend answered a call with a JSON-RPC error.
    Agent(String),
    /// The backend profile does not support the operation.
    Unsupported(String),
    /// File-system or I/O operation failure.
    Io(String),
}

/// JSON-RPC error codes used on the client channel.
pub mod codes {
    /// Payload is not valid JSON or the frame could not be decoded.
    pub const PARSE_ERROR: i64 = -32700;
    /// Envelope is not a valid JSON-RPC message.
    pub const INVALID_REQUEST: i64 = -32600;
    /// Unknown method.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Malformed parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Any other internal failure.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Session id unknown, closed, or failed.
    pub const SESSION_NOT_FOUND: i64 = -32001;
    /// A prompt is already in flight.
    pub const SESSION_BUSY: i64 = -32002;
    /// Initialization, prompt, or permission wait timed out.
    pub const TIMEOUT: i64 = -32003;
    /// Backend process exited or its stream broke.
    pub const BACKEND_GONE: i64 = -32004;
    /// Session closed while the call was pending.
    pub const SESSION_CLOSED: i64 = -32005;
    /// Session id already used in this process.
    pub const SESSION_ID_IN_USE: i64 = -32006;
}

impl AppError {
    /// JSON-RPC error code reported for this error.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::Framing(_) => codes::PARSE_ERROR,
            Self::Protocol(_) => codes::INVALID_REQUEST,
            Self::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::Config(_) | Self::Spawn(_) | Self::Io(_) | Self::Agent(_) | Self::Unsupported(_) => {
                codes::INTERNAL_ERROR
            }
            Self::SessionNotFound(_) => codes::SESSION_NOT_FOUND,
            Self::SessionBusy(_) => codes::SESSION_BUSY,
            Self::Timeout(_) => codes::TIMEOUT,
            Self::BackendGone(_) => codes::BACKEND_GONE,
            Self::SessionClosed(_) => codes::SESSION_CLOSED,
            Self::SessionIdInUse(_) => codes::SESSION_ID_IN_USE,
        }
    }

    /// Convert into the JSON-RPC error object sent to the client.
    #[must_use]
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError::new(self.code(), self.to_string())
    }

    /// Whether the error means the backend transport is unusable.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::BackendGone(_) | Self::Framing(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn failed: {msg}"),
            Self::BackendGone(msg) => write!(f, "backend gone: {msg}"),
            Self::Framing(msg) => write!(f, "framing: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::InvalidParams(msg) => write!(f, "invalid params: {msg}"),
            Self::MethodNotFound(msg) => write!(f, "method not found: {msg}"),
            Self::SessionNotFound(msg) => write!(f, "session not found: {msg}"),
            Self::SessionBusy(msg) => write!(f, "session busy: {msg}"),
            Self::SessionIdInUse(msg) => write!(f, "session id in use: {msg}"),
            Self::SessionClosed(msg) => write!(f, "session closed: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Agent(msg) => write!(f, "agent error: {msg}"),
            Self::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid json: {err}"))
    }
}
