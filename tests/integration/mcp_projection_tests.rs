//! Integration tests for MCP server descriptors passed to `session/new`.

use copilot_acp_proxy::translate::methods::CreateParams;
use copilot_acp_proxy::AppError;
use serde_json::{json, Value};

use super::test_helpers::{test_config, test_manager, RecordingSink, ScriptedLauncher};

fn params(servers: Value) -> CreateParams {
    serde_json::from_value(json!({ "sessionId": "m1", "mcpServers": servers })).expect("create params")
}

#[tokio::test]
async fn servers_are_forwarded_sorted_by_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let launcher = ScriptedLauncher::new();
    let manager = test_manager(test_config(dir.path()), launcher.clone());

    manager
        .create(
            params(json!({
                "b-remote": {
                    "type": "http",
                    "url": "https://mcp.example.test/v1",
                    "headers": { "Authorization": "Bearer ${TOKEN}" },
                    "tools": ["search"],
                },
                "a-local": {
                    "command": "node",
                    "args": ["server.js", "--stdio"],
                    "env": { "LOG": "debug", "API_KEY": "${API_KEY}" },
                },
            })),
            RecordingSink::new(),
        )
        .await
        .expect("create");

    let new_params = launcher.last().params_of("session/new").expect("session/new");
    assert_eq!(
        new_params["mcpServers"],
        json!([
            {
                "name": "a-local",
                "command": "node",
                "args": ["server.js", "--stdio"],
                "env": [
                    { "name": "API_KEY", "value": "${API_KEY}" },
                    { "name": "LOG", "value": "debug" },
                ],
            },
            {
                "type": "http",
                "name": "b-remote",
                "url": "https://mcp.example.test/v1",
                "headers": [{ "name": "Authorization", "value": "Bearer ${TOKEN}" }],
            },
        ])
    );
}

#[tokio::test]
async fn sse_servers_keep_their_transport() {
    let dir = tempfile::tempdir().expect("tempdir");
    let launcher = ScriptedLauncher::new();
    let manager = test_manager(test_config(dir.path()), launcher.clone());

    manager
        .create(
            params(json!({ "events": { "type": "sse", "url": "http://localhost:9000/sse" } })),
            RecordingSink::new(),
        )
        .await
        .expect("create");

    let new_params = launcher.last().params_of("session/new").expect("session/new");
    let server = &new_params["mcpServers"][0];
    assert_eq!(server["type"], "sse");
    assert_eq!(server["headers"], json!([]));
}

#[tokio::test]
async fn remote_server_without_url_is_rejected_before_launch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let launcher = ScriptedLauncher::new();
    let manager = test_manager(test_config(dir.path()), launcher.clone());

    let result = manager
        .create(params(json!({ "broken": { "type": "http" } })), RecordingSink::new())
        .await;

    assert!(matches!(result, Err(AppError::InvalidParams(_))), "got {result:?}");
    assert!(launcher.agents().is_empty());
    assert!(manager.is_empty().await);
}

#[tokio::test]
async fn local_server_without_command_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(test_config(dir.path()), ScriptedLauncher::new());

    let result = manager
        .create(params(json!({ "empty": { "args": ["x"] } })), RecordingSink::new())
        .await;

    assert!(matches!(result, Err(AppError::InvalidParams(_))), "got {result:?}");
}
