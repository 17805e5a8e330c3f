//! Integration tests for prompt turns: streaming order, tool calls,
//! cancellation, busy rejection, and model switching.

use std::time::Duration;

use copilot_acp_proxy::session::{SessionManager, SessionState};
use copilot_acp_proxy::translate::methods::{Attachment, CreateParams};
use copilot_acp_proxy::AppError;

use super::test_helpers::{
    test_config, test_manager, test_manager_with, test_timeouts, RecordingSink, ScriptedLauncher,
};

async fn create(manager: &SessionManager, sink: &std::sync::Arc<RecordingSink>, id: &str) {
    manager
        .create(
            CreateParams {
                session_id: Some(id.to_owned()),
                ..CreateParams::default()
            },
            sink.clone(),
        )
        .await
        .expect("create");
}

async fn wait_for_state(manager: &SessionManager, id: &str, state: SessionState) {
    for _ in 0..200 {
        if manager.state(id).await == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {id} never reached {state:?}");
}

fn turn_kinds(sink: &RecordingSink, id: &str) -> Vec<&'static str> {
    sink.kinds(id).into_iter().skip(1).collect()
}

// ── Streaming ────────────────────────────────────────────────

#[tokio::test]
async fn send_streams_events_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let launcher = ScriptedLauncher::new();
    let manager = test_manager(test_config(dir.path()), launcher.clone());
    let sink = RecordingSink::new();
    create(&manager, &sink, "s").await;

    let message_id = manager.prompt("s", "hello", &[]).await.expect("prompt");

    assert_eq!(
        turn_kinds(&sink, "s"),
        vec![
            "user.message",
            "assistant.turn_start",
            "assistant.message_delta",
            "assistant.message_delta",
            "assistant.message",
            "assistant.turn_end",
            "session.idle",
        ]
    );
    let user = &sink.of_kind("s", "user.message")[0];
    assert_eq!(user.data["content"], "hello");
    assert_eq!(user.data["messageId"], message_id.as_str());

    let deltas = sink.of_kind("s", "assistant.message_delta");
    assert_eq!(deltas[0].data["deltaContent"], "echo: ");
    assert_eq!(deltas[1].data["deltaContent"], "hello");
    assert_eq!(deltas[0].data["messageId"], deltas[1].data["messageId"]);

    let message = &sink.of_kind("s", "assistant.message")[0];
    assert_eq!(message.data["content"], "echo: hello");
    assert_eq!(message.data["messageId"], deltas[0].data["messageId"]);
    assert_eq!(message.data["toolRequests"], serde_json::json!([]));

    let turn_start = &sink.of_kind("s", "assistant.turn_start")[0];
    let turn_end = &sink.of_kind("s", "assistant.turn_end")[0];
    assert_eq!(turn_end.data["turnId"], turn_start.data["turnId"]);
    assert_eq!(turn_end.data["stopReason"], "end_turn");

    assert_eq!(manager.state("s").await, Some(SessionState::Ready));
    let prompt = launcher.last().params_of("session/prompt").expect("prompt params");
    assert_eq!(prompt["sessionId"], "agent-session-1");
    assert_eq!(prompt["prompt"][0]["type"], "text");
    assert_eq!(prompt["prompt"][0]["text"], "hello");
}

#[tokio::test]
async fn reasoning_is_flushed_before_the_message() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(test_config(dir.path()), ScriptedLauncher::new());
    let sink = RecordingSink::new();
    create(&manager, &sink, "s").await;

    manager.prompt("s", "[think]", &[]).await.expect("prompt");

    assert_eq!(
        turn_kinds(&sink, "s"),
        vec![
            "user.message",
            "assistant.turn_start",
            "assistant.reasoning_delta",
            "assistant.message_delta",
            "assistant.reasoning",
            "assistant.message",
            "assistant.turn_end",
            "session.idle",
        ]
    );
    let reasoning = &sink.of_kind("s", "assistant.reasoning")[0];
    assert_eq!(reasoning.data["content"], "pondering");
    let delta = &sink.of_kind("s", "assistant.reasoning_delta")[0];
    assert_eq!(delta.data["reasoningId"], reasoning.data["reasoningId"]);
}

#[tokio::test]
async fn tool_calls_report_start_and_terminal_completion_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(test_config(dir.path()), ScriptedLauncher::new());
    let sink = RecordingSink::new();
    create(&manager, &sink, "s").await;

    manager.prompt("s", "[tool]", &[]).await.expect("prompt");

    let starts = sink.of_kind("s", "tool.execution_start");
    let completes = sink.of_kind("s", "tool.execution_complete");
    assert_eq!(starts.len(), 1);
    assert_eq!(completes.len(), 1);
    assert_eq!(starts[0].data["toolCallId"], "call-1");
    assert_eq!(starts[0].data["toolName"], "Read file");
    assert_eq!(starts[0].data["arguments"]["path"], "a.txt");
    assert_eq!(completes[0].data["toolCallId"], "call-1");
    assert_eq!(completes[0].data["success"], true);
    assert_eq!(completes[0].data["result"]["content"], "hello");

    let kinds = turn_kinds(&sink, "s");
    let start_at = kinds.iter().position(|k| *k == "tool.execution_start").expect("start");
    let complete_at = kinds.iter().position(|k| *k == "tool.execution_complete").expect("complete");
    let end_at = kinds.iter().position(|k| *k == "assistant.turn_end").expect("turn end");
    assert!(start_at < complete_at && complete_at < end_at);
}

#[tokio::test]
async fn unfinished_tool_calls_fail_at_turn_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(test_config(dir.path()), ScriptedLauncher::new());
    let sink = RecordingSink::new();
    create(&manager, &sink, "s").await;

    manager.prompt("s", "[tool-stuck]", &[]).await.expect("prompt");

    let completes = sink.of_kind("s", "tool.execution_complete");
    assert_eq!(completes.len(), 1);
    assert_eq!(completes[0].data["toolCallId"], "call-9");
    assert_eq!(completes[0].data["success"], false);
}

#[tokio::test]
async fn unmapped_updates_produce_no_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(test_config(dir.path()), ScriptedLauncher::new());
    let sink = RecordingSink::new();
    create(&manager, &sink, "s").await;

    manager.prompt("s", "[plan]", &[]).await.expect("prompt");

    assert_eq!(
        turn_kinds(&sink, "s"),
        vec![
            "user.message",
            "assistant.turn_start",
            "assistant.message_delta",
            "assistant.message",
            "assistant.turn_end",
            "session.idle",
        ]
    );
}

#[tokio::test]
async fn attachments_become_resource_links() {
    let dir = tempfile::tempdir().expect("tempdir");
    let launcher = ScriptedLauncher::new();
    let manager = test_manager(test_config(dir.path()), launcher.clone());
    let sink = RecordingSink::new();
    create(&manager, &sink, "s").await;

    let attachments = vec![
        Attachment {
            kind: Some("file".into()),
            path: "/work/src/main.rs".into(),
            display_name: None,
        },
        Attachment {
            kind: Some("directory".into()),
            path: "/work/docs".into(),
            display_name: Some("Docs".into()),
        },
    ];
    manager.prompt("s", "review", &attachments).await.expect("prompt");

    let prompt = launcher.last().params_of("session/prompt").expect("prompt params");
    let blocks = prompt["prompt"].as_array().expect("blocks");
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[1]["type"], "resource_link");
    assert_eq!(blocks[1]["uri"], "file:///work/src/main.rs");
    assert_eq!(blocks[1]["name"], "main.rs");
    assert_eq!(blocks[2]["uri"], "file:///work/docs");
    assert_eq!(blocks[2]["name"], "Docs");
}

// ── Failures ─────────────────────────────────────────────────

#[tokio::test]
async fn agent_error_fails_the_turn_but_keeps_the_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(test_config(dir.path()), ScriptedLauncher::new());
    let sink = RecordingSink::new();
    create(&manager, &sink, "s").await;

    let result = manager.prompt("s", "[fail]", &[]).await;

    assert!(matches!(result, Err(AppError::Agent(_))), "got {result:?}");
    let errors = sink.of_kind("s", "session.error");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].data["error"].as_str().is_some_and(|e| e.contains("model overloaded")));
    assert_eq!(manager.state("s").await, Some(SessionState::Ready));

    manager.prompt("s", "again", &[]).await.expect("second prompt");
}

#[tokio::test]
async fn prompt_timeout_fails_the_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let launcher = ScriptedLauncher::new();
    let mut timeouts = test_timeouts();
    timeouts.prompt = Duration::from_millis(200);
    let manager = test_manager_with(test_config(dir.path()), launcher.clone(), timeouts);
    let sink = RecordingSink::new();
    create(&manager, &sink, "s").await;

    let result = manager.prompt("s", "[ignore-cancel]", &[]).await;

    assert!(matches!(result, Err(AppError::Timeout(_))), "got {result:?}");
    assert_eq!(manager.state("s").await, None);
    assert_eq!(sink.of_kind("s", "session.error").len(), 1);
    assert!(matches!(
        manager.prompt("s", "hi", &[]).await,
        Err(AppError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn prompt_on_unknown_session_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(test_config(dir.path()), ScriptedLauncher::new());

    assert!(matches!(
        manager.prompt("nobody", "hi", &[]).await,
        Err(AppError::SessionNotFound(_))
    ));
}

// ── Concurrency and cancel ───────────────────────────────────

#[tokio::test]
async fn second_prompt_while_prompting_is_busy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let launcher = ScriptedLauncher::new();
    let manager = test_manager(test_config(dir.path()), launcher.clone());
    let sink = RecordingSink::new();
    create(&manager, &sink, "s").await;

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.prompt("s", "[hang]", &[]).await }
    });
    wait_for_state(&manager, "s", SessionState::Prompting).await;

    let second = manager.prompt("s", "other", &[]).await;
    assert!(matches!(second, Err(AppError::SessionBusy(_))), "got {second:?}");
    let prompts = launcher
        .last()
        .methods()
        .into_iter()
        .filter(|m| m == "session/prompt")
        .count();
    assert_eq!(prompts, 1);

    manager.cancel("s").await.expect("cancel");
    first.await.expect("join").expect("first prompt");
}

#[tokio::test]
async fn cancel_ends_the_turn_with_cancelled_and_emits_abort() {
    let dir = tempfile::tempdir().expect("tempdir");
    let launcher = ScriptedLauncher::new();
    let manager = test_manager(test_config(dir.path()), launcher.clone());
    let sink = RecordingSink::new();
    create(&manager, &sink, "s").await;

    let turn = tokio::spawn({
        let manager = manager.clone();
        async move { manager.prompt("s", "[hang]", &[]).await }
    });
    wait_for_state(&manager, "s", SessionState::Prompting).await;

    manager.cancel("s").await.expect("cancel");
    turn.await.expect("join").expect("prompt");

    let agent = launcher.last();
    assert!(agent.methods().iter().any(|m| m == "session/cancel"));
    assert_eq!(
        agent.params_of("session/cancel").expect("cancel params")["sessionId"],
        "agent-session-1"
    );

    let end = &sink.of_kind("s", "assistant.turn_end")[0];
    assert_eq!(end.data["stopReason"], "cancelled");
    let kinds = sink.kinds("s");
    let idle_at = kinds.iter().position(|k| *k == "session.idle").expect("idle");
    let abort_at = kinds.iter().position(|k| *k == "abort").expect("abort");
    assert!(idle_at < abort_at);
    assert_eq!(manager.state("s").await, Some(SessionState::Ready));
}

#[tokio::test]
async fn cancel_ignored_by_backend_ends_turn_after_grace() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(test_config(dir.path()), ScriptedLauncher::new());
    let sink = RecordingSink::new();
    create(&manager, &sink, "s").await;

    let turn = tokio::spawn({
        let manager = manager.clone();
        async move { manager.prompt("s", "[ignore-cancel]", &[]).await }
    });
    wait_for_state(&manager, "s", SessionState::Prompting).await;

    tokio::time::timeout(Duration::from_secs(3), manager.cancel("s"))
        .await
        .expect("cancel bounded by grace period")
        .expect("cancel");
    turn.await.expect("join").expect("prompt");

    let end = &sink.of_kind("s", "assistant.turn_end")[0];
    assert_eq!(end.data["stopReason"], "cancelled");
    assert_eq!(manager.state("s").await, Some(SessionState::Ready));
}

#[tokio::test]
async fn cancel_while_idle_only_emits_abort() {
    let dir = tempfile::tempdir().expect("tempdir");
    let launcher = ScriptedLauncher::new();
    let manager = test_manager(test_config(dir.path()), launcher.clone());
    let sink = RecordingSink::new();
    create(&manager, &sink, "s").await;

    manager.cancel("s").await.expect("cancel");

    assert_eq!(sink.kinds("s"), vec!["session.start", "abort"]);
    assert!(!launcher.last().methods().iter().any(|m| m == "session/cancel"));
    assert_eq!(manager.state("s").await, Some(SessionState::Ready));
}

#[tokio::test]
async fn destroy_during_prompt_closes_the_turn() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(test_config(dir.path()), ScriptedLauncher::new());
    let sink = RecordingSink::new();
    create(&manager, &sink, "s").await;

    let turn = tokio::spawn({
        let manager = manager.clone();
        async move { manager.prompt("s", "[ignore-cancel]", &[]).await }
    });
    wait_for_state(&manager, "s", SessionState::Prompting).await;

    manager.destroy("s").await.expect("destroy");
    let result = turn.await.expect("join");

    assert!(matches!(result, Err(AppError::SessionClosed(_))), "got {result:?}");
    assert_eq!(sink.kinds("s").last().copied(), Some("session.shutdown"));
}

// ── Model switching ──────────────────────────────────────────

#[tokio::test]
async fn set_model_is_unsupported_for_launch_time_backends() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(test_config(dir.path()), ScriptedLauncher::new());
    let sink = RecordingSink::new();
    create(&manager, &sink, "s").await;

    let result = manager.set_model("s", "gemini-1.5-pro").await;

    assert!(matches!(result, Err(AppError::Unsupported(_))), "got {result:?}");
}

#[tokio::test]
async fn set_model_switches_idle_sessions_and_rejects_during_prompt() {
    let dir = tempfile::tempdir().expect("tempdir");
    let launcher = ScriptedLauncher::new();
    let manager = test_manager(test_config(dir.path()), launcher.clone());
    let sink = RecordingSink::new();
    manager
        .create(
            CreateParams {
                session_id: Some("c".into()),
                backend: Some("claude-code-acp".into()),
                ..CreateParams::default()
            },
            sink.clone(),
        )
        .await
        .expect("create");

    manager
        .set_model("c", "claude-sonnet-4-20250514")
        .await
        .expect("set model");
    let params = launcher.last().params_of("session/set_model").expect("params");
    assert_eq!(params["modelId"], "claude-sonnet-4-20250514");

    assert!(matches!(
        manager.set_model("c", "not-a-model").await,
        Err(AppError::InvalidParams(_))
    ));

    let turn = tokio::spawn({
        let manager = manager.clone();
        async move { manager.prompt("c", "[hang]", &[]).await }
    });
    wait_for_state(&manager, "c", SessionState::Prompting).await;
    let busy = manager.set_model("c", "claude-opus-4-20250514").await;
    assert!(matches!(busy, Err(AppError::SessionBusy(_))), "got {busy:?}");

    manager.cancel("c").await.expect("cancel");
    turn.await.expect("join").expect("prompt");
}
