//! Unit tests for `terminal/*` calls served to a backend, run against real
//! shell children.
#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use copilot_acp_proxy::backend::{AgentClient, AgentEvent, BackendProcess};
use copilot_acp_proxy::errors::codes;
use copilot_acp_proxy::wire::{Framing, Message, RpcError};
use serde_json::{json, Value};
use tokio::sync::mpsc;

struct Harness {
    client: AgentClient,
    agent: BackendProcess,
    next_id: i64,
    _events: mpsc::Receiver<AgentEvent>,
}

impl Harness {
    fn new(root: &Path) -> Self {
        let (client_end, agent_end) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_end);
        let (agent_read, agent_write) = tokio::io::split(agent_end);
        let process = BackendProcess::from_streams("test", client_read, client_write, Framing::ContentLength);
        let agent = BackendProcess::from_streams("agent", agent_read, agent_write, Framing::ContentLength);
        let (tx, rx) = mpsc::channel(16);
        Self {
            client: AgentClient::start(process, tx, root.to_path_buf()),
            agent,
            next_id: 100,
            _events: rx,
        }
    }

    /// Issue a call as the agent and wait for the proxy's answer.
    async fn call(&mut self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.next_id += 1;
        self.agent
            .send(&Message::request(self.next_id, method, params))
            .await
            .expect("send");
        let reply = tokio::time::timeout(Duration::from_secs(10), self.agent.receive())
            .await
            .expect("reply within 10s")
            .expect("reply");
        match reply {
            Message::Response { outcome, .. } => outcome,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    async fn create(&mut self, params: Value) -> String {
        let result = self.call("terminal/create", params).await.expect("create");
        result["terminalId"].as_str().expect("terminalId").to_owned()
    }

    async fn wait(&mut self, terminal_id: &str) -> Value {
        self.call(
            "terminal/wait_for_exit",
            json!({ "sessionId": "s1", "terminalId": terminal_id }),
        )
        .await
        .expect("wait_for_exit")
    }

    async fn output(&mut self, terminal_id: &str) -> Result<Value, RpcError> {
        self.call(
            "terminal/output",
            json!({ "sessionId": "s1", "terminalId": terminal_id }),
        )
        .await
    }
}

#[tokio::test]
async fn command_output_and_exit_code_are_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut harness = Harness::new(dir.path());

    let id = harness
        .create(json!({ "sessionId": "s1", "command": "echo", "args": ["hello"] }))
        .await;
    assert_eq!(harness.wait(&id).await, json!({ "exitCode": 0 }));

    let output = harness.output(&id).await.expect("output");
    assert_eq!(output["output"], "hello\n");
    assert_eq!(output["truncated"], false);
    assert_eq!(output["exitStatus"]["exitCode"], 0);
}

#[tokio::test]
async fn stderr_and_failure_codes_are_captured() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut harness = Harness::new(dir.path());

    let id = harness
        .create(json!({ "sessionId": "s1", "command": "echo oops >&2; exit 3" }))
        .await;

    assert_eq!(harness.wait(&id).await, json!({ "exitCode": 3 }));
    assert_eq!(harness.output(&id).await.expect("output")["output"], "oops\n");
}

#[tokio::test]
async fn env_and_relative_cwd_are_applied() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(dir.path().join("sub")).expect("sub");
    std::fs::write(dir.path().join("sub").join("marker.txt"), "").expect("marker");
    let mut harness = Harness::new(dir.path());

    let id = harness
        .create(json!({
            "sessionId": "s1",
            "command": "ls; echo \"$GREETING\"",
            "cwd": "sub",
            "env": [{ "name": "GREETING", "value": "hi there" }],
        }))
        .await;
    harness.wait(&id).await;

    assert_eq!(
        harness.output(&id).await.expect("output")["output"],
        "marker.txt\nhi there\n"
    );
}

#[tokio::test]
async fn output_limit_keeps_the_newest_bytes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut harness = Harness::new(dir.path());

    let id = harness
        .create(json!({
            "sessionId": "s1",
            "command": "printf 0123456789",
            "outputByteLimit": 4,
        }))
        .await;
    harness.wait(&id).await;

    let output = harness.output(&id).await.expect("output");
    assert_eq!(output["output"], "6789");
    assert_eq!(output["truncated"], true);
}

#[tokio::test]
async fn running_command_has_no_exit_status_until_killed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut harness = Harness::new(dir.path());

    let id = harness
        .create(json!({ "sessionId": "s1", "command": "sleep 30" }))
        .await;
    let running = harness.output(&id).await.expect("output");
    assert!(running.get("exitStatus").is_none(), "got {running}");

    let killed = harness
        .call("terminal/kill", json!({ "sessionId": "s1", "terminalId": id }))
        .await
        .expect("kill");
    assert_eq!(killed, json!({}));

    let after = harness.output(&id).await.expect("output after kill");
    assert_eq!(after["exitStatus"]["signal"], "SIGKILL");
    assert!(after["exitStatus"].get("exitCode").is_none());
}

#[tokio::test]
async fn released_terminals_are_forgotten() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut harness = Harness::new(dir.path());

    let id = harness
        .create(json!({ "sessionId": "s1", "command": "sleep 30" }))
        .await;
    let released = harness
        .call("terminal/release", json!({ "sessionId": "s1", "terminalId": id }))
        .await
        .expect("release");
    assert_eq!(released, json!({}));

    let error = harness.output(&id).await.expect_err("unknown terminal");
    assert_eq!(error.code, codes::INVALID_PARAMS);
}

#[tokio::test]
async fn closing_the_client_kills_its_terminals() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut harness = Harness::new(dir.path());

    harness
        .create(json!({ "sessionId": "s1", "command": "sleep 1 && touch finished" }))
        .await;
    harness.client.close(Duration::from_secs(1)).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!dir.path().join("finished").exists());
}

#[tokio::test]
async fn unknown_agent_calls_are_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut harness = Harness::new(dir.path());

    let error = harness
        .call("terminal/resize", json!({ "terminalId": "term-1" }))
        .await
        .expect_err("unsupported");
    assert_eq!(error.code, codes::METHOD_NOT_FOUND);
}
