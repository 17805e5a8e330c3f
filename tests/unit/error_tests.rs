//! Unit tests for error codes reported to the client.

use copilot_acp_proxy::errors::codes;
use copilot_acp_proxy::AppError;

#[test]
fn protocol_errors_use_standard_codes() {
    assert_eq!(AppError::Framing("x".into()).code(), -32700);
    assert_eq!(AppError::Protocol("x".into()).code(), -32600);
    assert_eq!(AppError::MethodNotFound("x".into()).code(), -32601);
    assert_eq!(AppError::InvalidParams("x".into()).code(), -32602);
    assert_eq!(AppError::Agent("x".into()).code(), -32603);
}

#[test]
fn session_errors_use_server_range_codes() {
    assert_eq!(AppError::SessionNotFound("s".into()).code(), codes::SESSION_NOT_FOUND);
    assert_eq!(AppError::SessionBusy("s".into()).code(), codes::SESSION_BUSY);
    assert_eq!(AppError::Timeout("s".into()).code(), codes::TIMEOUT);
    assert_eq!(AppError::BackendGone("s".into()).code(), codes::BACKEND_GONE);
    assert_eq!(AppError::SessionClosed("s".into()).code(), codes::SESSION_CLOSED);
    assert_eq!(AppError::SessionIdInUse("s".into()).code(), codes::SESSION_ID_IN_USE);
}

#[test]
fn rpc_error_carries_display_text() {
    let rpc = AppError::SessionNotFound("abc".into()).to_rpc_error();

    assert_eq!(rpc.code, -32001);
    assert_eq!(rpc.message, "session not found: abc");
    assert_eq!(rpc.data, None);
}

#[test]
fn only_stream_failures_are_transport_errors() {
    assert!(AppError::BackendGone("x".into()).is_transport());
    assert!(AppError::Framing("x".into()).is_transport());
    assert!(!AppError::Agent("x".into()).is_transport());
    assert!(!AppError::Timeout("x".into()).is_transport());
}

#[test]
fn io_and_toml_errors_convert() {
    let io: AppError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
    assert!(matches!(io, AppError::Io(_)));

    let toml_err = toml::from_str::<toml::Value>("= broken").expect_err("invalid toml");
    assert!(matches!(AppError::from(toml_err), AppError::Config(_)));
}
