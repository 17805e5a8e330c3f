//! Unit tests for the client method table and parameter projections.

use std::collections::BTreeMap;

use copilot_acp_proxy::backend::schema::{
    ContentBlock, McpServer, PermissionOption, PermissionOptionKind, RemoteTransport,
    RequestPermissionOutcome, RequestPermissionParams, ToolCallUpdate,
};
use copilot_acp_proxy::translate::methods::{
    parse_params, parse_permission_reply, permission_request, project_mcp_servers, project_prompt,
    reject_outcome, select_outcome, Attachment, ClientMcpServer, CreateParams, SendParams,
    SetModelParams,
};
use copilot_acp_proxy::translate::{AgentCall, ClientMethod, PermissionDecision};
use copilot_acp_proxy::AppError;
use serde_json::json;

fn option(id: &str, kind: PermissionOptionKind) -> PermissionOption {
    PermissionOption {
        option_id: id.into(),
        name: id.into(),
        kind,
    }
}

fn selected(id: &str) -> RequestPermissionOutcome {
    RequestPermissionOutcome::Selected { option_id: id.into() }
}

// ── Method table ─────────────────────────────────────────────

#[test]
fn every_method_round_trips_through_its_wire_name() {
    for method in ClientMethod::ALL {
        assert_eq!(ClientMethod::from_name(method.name()), Some(method));
    }
    assert_eq!(ClientMethod::from_name("session.teleport"), None);
}

#[test]
fn create_plans_handshake_session_and_model() {
    assert_eq!(
        ClientMethod::SessionCreate.agent_calls(),
        &[AgentCall::Initialize, AgentCall::NewSession, AgentCall::SetModel]
    );
    assert_eq!(ClientMethod::SessionSend.agent_calls(), &[AgentCall::Prompt]);
    assert_eq!(ClientMethod::SessionAbort.agent_calls(), &[AgentCall::Cancel]);
    assert_eq!(ClientMethod::SessionDestroy.agent_calls(), &[AgentCall::Terminate]);
    assert!(ClientMethod::Ping.agent_calls().is_empty());
}

// ── Parameters ───────────────────────────────────────────────

#[test]
fn null_params_decode_as_empty_object() {
    let params: CreateParams = parse_params(ClientMethod::SessionCreate, serde_json::Value::Null)
        .expect("null params");
    assert_eq!(params, CreateParams::default());
}

#[test]
fn create_params_use_camel_case() {
    let params: CreateParams = parse_params(
        ClientMethod::SessionCreate,
        json!({
            "sessionId": "s1",
            "model": "gemini-1.5-pro",
            "workingDirectory": "/tmp/work",
            "requestPermission": true,
            "streaming": true,
            "backend": "gemini"
        }),
    )
    .expect("create params");

    assert_eq!(params.session_id.as_deref(), Some("s1"));
    assert_eq!(params.working_directory.as_deref(), Some("/tmp/work"));
    assert!(params.request_permission);
    assert!(params.streaming);
}

#[test]
fn missing_required_field_names_the_method() {
    let err = parse_params::<SendParams>(ClientMethod::SessionSend, json!({ "prompt": "hi" }))
        .expect_err("sessionId is required");

    match err {
        AppError::InvalidParams(msg) => assert!(msg.starts_with("session.send:"), "{msg}"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn set_model_accepts_model_alias() {
    let params: SetModelParams = parse_params(
        ClientMethod::SessionSetModel,
        json!({ "sessionId": "s", "model": "claude-opus-4-20250514" }),
    )
    .expect("alias");
    assert_eq!(params.model_id, "claude-opus-4-20250514");
}

// ── MCP servers ──────────────────────────────────────────────

#[test]
fn no_servers_projects_to_empty_list() {
    assert_eq!(project_mcp_servers(None).expect("none"), Vec::new());
}

#[test]
fn local_and_remote_servers_are_reshaped() {
    let mut servers = BTreeMap::new();
    servers.insert(
        "zeta".to_owned(),
        ClientMcpServer {
            kind: Some("sse".into()),
            url: Some("http://localhost:9000/sse".into()),
            headers: BTreeMap::from([("X-Key".to_owned(), "${KEY}".to_owned())]),
            ..ClientMcpServer::default()
        },
    );
    servers.insert(
        "alpha".to_owned(),
        ClientMcpServer {
            kind: Some("local".into()),
            command: Some("npx".into()),
            args: vec!["-y".into(), "server".into()],
            ..ClientMcpServer::default()
        },
    );

    let projected = project_mcp_servers(Some(&servers)).expect("projected");

    assert_eq!(projected.len(), 2);
    assert_eq!(projected[0].name(), "alpha");
    assert!(matches!(&projected[0], McpServer::Stdio { command, .. } if command == "npx"));
    match &projected[1] {
        McpServer::Remote { transport, headers, .. } => {
            assert_eq!(*transport, RemoteTransport::Sse);
            assert_eq!(headers[0].name, "X-Key");
            assert_eq!(headers[0].value, "${KEY}");
        }
        other => panic!("expected remote server, got {other:?}"),
    }
}

#[test]
fn local_server_needs_a_command() {
    let servers = BTreeMap::from([("x".to_owned(), ClientMcpServer::default())]);
    assert!(matches!(
        project_mcp_servers(Some(&servers)),
        Err(AppError::InvalidParams(_))
    ));
}

// ── Prompts ──────────────────────────────────────────────────

#[test]
fn attachments_become_resource_links() {
    let attachments = vec![
        Attachment {
            kind: Some("file".into()),
            path: "/repo/src/main.rs".into(),
            display_name: None,
        },
        Attachment {
            kind: Some("directory".into()),
            path: "/repo/docs".into(),
            display_name: Some("Docs".into()),
        },
    ];

    let blocks = project_prompt("explain", &attachments);

    assert_eq!(
        blocks,
        vec![
            ContentBlock::text("explain"),
            ContentBlock::ResourceLink {
                uri: "file:///repo/src/main.rs".into(),
                name: "main.rs".into(),
            },
            ContentBlock::ResourceLink {
                uri: "file:///repo/docs".into(),
                name: "Docs".into(),
            },
        ]
    );
}

#[test]
fn empty_prompt_without_attachments_has_no_blocks() {
    assert!(project_prompt("", &[]).is_empty());
}

// ── Permissions ──────────────────────────────────────────────

#[test]
fn permission_request_carries_tool_details() {
    let request = RequestPermissionParams {
        session_id: "agent-1".into(),
        tool_call: ToolCallUpdate {
            tool_call_id: "call-1".into(),
            title: Some("Write file".into()),
            raw_input: Some(json!({ "path": "x" })),
            ..ToolCallUpdate::default()
        },
        options: vec![option("ok", PermissionOptionKind::AllowOnce)],
    };

    let params = permission_request("client-1", &request);

    assert_eq!(params["sessionId"], "client-1");
    assert_eq!(params["permissionRequest"]["toolCallId"], "call-1");
    assert_eq!(params["permissionRequest"]["title"], "Write file");
    assert_eq!(params["permissionRequest"]["arguments"]["path"], "x");
    assert_eq!(params["permissionRequest"]["options"][0]["optionId"], "ok");
    assert_eq!(params["permissionRequest"]["options"][0]["kind"], "allow_once");
}

#[test]
fn replies_are_parsed_plain_or_wrapped() {
    assert_eq!(
        parse_permission_reply(&json!({ "kind": "approved" })),
        PermissionDecision::Approved
    );
    assert_eq!(
        parse_permission_reply(&json!({ "result": { "kind": "approved" } })),
        PermissionDecision::Approved
    );
    assert_eq!(
        parse_permission_reply(&json!({ "kind": "denied-interactively-by-user" })),
        PermissionDecision::Denied
    );
    assert_eq!(
        parse_permission_reply(&json!({ "optionId": "always" })),
        PermissionDecision::Option("always".into())
    );
    assert_eq!(parse_permission_reply(&json!(null)), PermissionDecision::Denied);
}

#[test]
fn outcome_selection_follows_option_kinds() {
    let options = vec![
        option("no", PermissionOptionKind::RejectOnce),
        option("yes", PermissionOptionKind::AllowOnce),
        option("always", PermissionOptionKind::AllowAlways),
    ];

    assert_eq!(select_outcome(&PermissionDecision::Approved, &options), selected("yes"));
    assert_eq!(select_outcome(&PermissionDecision::Denied, &options), selected("no"));
    assert_eq!(
        select_outcome(&PermissionDecision::Option("always".into()), &options),
        selected("always")
    );
    assert_eq!(
        select_outcome(&PermissionDecision::Option("missing".into()), &options),
        selected("no")
    );
}

#[test]
fn no_matching_option_cancels() {
    let allow_only = vec![option("yes", PermissionOptionKind::AllowAlways)];

    assert_eq!(reject_outcome(&allow_only), RequestPermissionOutcome::Cancelled);
    assert_eq!(
        select_outcome(&PermissionDecision::Approved, &[]),
        RequestPermissionOutcome::Cancelled
    );
}

#[test]
fn outcome_serializes_in_agent_shape() {
    assert_eq!(
        serde_json::to_value(selected("yes")).expect("serialize"),
        json!({ "outcome": "selected", "optionId": "yes" })
    );
    assert_eq!(
        serde_json::to_value(RequestPermissionOutcome::Cancelled).expect("serialize"),
        json!({ "outcome": "cancelled" })
    );
}
