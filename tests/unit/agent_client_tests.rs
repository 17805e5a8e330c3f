//! Unit tests for the agent client against an in-memory agent end.

use std::path::Path;
use std::time::Duration;

use copilot_acp_proxy::backend::schema::ContentBlock;
use copilot_acp_proxy::backend::{AgentClient, AgentEvent, BackendProcess};
use copilot_acp_proxy::wire::{Framing, Message};
use copilot_acp_proxy::AppError;
use serde_json::json;
use tokio::sync::mpsc;

fn connect(root: &Path) -> (AgentClient, BackendProcess, mpsc::Receiver<AgentEvent>) {
    let (client_end, agent_end) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_end);
    let (agent_read, agent_write) = tokio::io::split(agent_end);
    let process = BackendProcess::from_streams("test", client_read, client_write, Framing::ContentLength);
    let agent = BackendProcess::from_streams("agent", agent_read, agent_write, Framing::ContentLength);
    let (tx, rx) = mpsc::channel(16);
    (AgentClient::start(process, tx, root.to_path_buf()), agent, rx)
}

async fn next_request(agent: &BackendProcess) -> Message {
    tokio::time::timeout(Duration::from_secs(5), agent.receive())
        .await
        .expect("request within 5s")
        .expect("request")
}

async fn settled_pending(client: &AgentClient) -> usize {
    for _ in 0..100 {
        if client.pending_calls().await == 0 {
            return 0;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    client.pending_calls().await
}

#[tokio::test]
async fn abandoned_prompts_leave_no_pending_calls() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (client, agent, _events) = connect(dir.path());

    for _ in 0..2 {
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            client.prompt("s1", vec![ContentBlock::text("hi")]),
        )
        .await;
        assert!(abandoned.is_err(), "agent never answers");
    }

    assert_eq!(next_request(&agent).await.method(), Some("session/prompt"));
    assert_eq!(next_request(&agent).await.method(), Some("session/prompt"));
    assert_eq!(settled_pending(&client).await, 0);
}

#[tokio::test]
async fn late_reply_to_abandoned_call_is_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (client, agent, _events) = connect(dir.path());

    let _ = tokio::time::timeout(
        Duration::from_millis(50),
        client.prompt("s1", vec![ContentBlock::text("hi")]),
    )
    .await;
    let Message::Request { id: stale, .. } = next_request(&agent).await else {
        panic!("expected the prompt request");
    };
    assert_eq!(settled_pending(&client).await, 0);

    let switch = tokio::spawn({
        let client = client.clone();
        async move { client.set_model("s1", "fast").await }
    });
    let Message::Request { id, method, .. } = next_request(&agent).await else {
        panic!("expected the set_model request");
    };
    assert_eq!(method, "session/set_model");

    agent
        .send(&Message::result(stale, json!({ "stopReason": "end_turn" })))
        .await
        .expect("late reply");
    agent.send(&Message::result(id, json!(null))).await.expect("reply");

    switch.await.expect("join").expect("set_model");
    assert_eq!(client.pending_calls().await, 0);
}

#[tokio::test]
async fn answered_calls_are_removed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (client, agent, _events) = connect(dir.path());

    let turn = tokio::spawn({
        let client = client.clone();
        async move { client.prompt("s1", vec![ContentBlock::text("hi")]).await }
    });
    let Message::Request { id, .. } = next_request(&agent).await else {
        panic!("expected the prompt request");
    };
    assert_eq!(client.pending_calls().await, 1);

    agent
        .send(&Message::result(id, json!({ "stopReason": "end_turn" })))
        .await
        .expect("reply");
    let result = turn.await.expect("join").expect("prompt");
    assert_eq!(result.stop_reason, "end_turn");
    assert_eq!(client.pending_calls().await, 0);
}

#[tokio::test]
async fn lost_connection_fails_pending_calls() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (client, agent, mut events) = connect(dir.path());

    let turn = tokio::spawn({
        let client = client.clone();
        async move { client.prompt("s1", vec![ContentBlock::text("hi")]).await }
    });
    next_request(&agent).await;
    agent.terminate(Duration::from_secs(1)).await;
    drop(agent);

    let result = turn.await.expect("join");
    assert!(matches!(result, Err(AppError::BackendGone(_))), "got {result:?}");
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within 5s");
    assert!(matches!(event, Some(AgentEvent::Disconnected { .. })), "got {event:?}");
    assert_eq!(client.pending_calls().await, 0);
}

#[tokio::test]
async fn initialize_advertises_served_capabilities() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (client, agent, _events) = connect(dir.path());

    let handshake = tokio::spawn({
        let client = client.clone();
        async move { client.initialize().await }
    });
    let Message::Request { id, method, params } = next_request(&agent).await else {
        panic!("expected initialize");
    };
    assert_eq!(method, "initialize");
    assert_eq!(params["protocolVersion"], 1);
    assert_eq!(params["clientCapabilities"]["terminal"], true);
    assert_eq!(params["clientCapabilities"]["fs"]["readTextFile"], true);

    agent
        .send(&Message::result(id, json!({ "protocolVersion": 1 })))
        .await
        .expect("reply");
    handshake.await.expect("join").expect("initialize");
}
