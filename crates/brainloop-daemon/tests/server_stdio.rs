//! End-to-end exercise of the stdio JSON-RPC surface: a wired worker
//! behind an in-memory duplex pipe, driven one line at a time.

use std::sync::Arc;

use async_trait::async_trait;
use brainloop_core::generation::{
    GenerationError, GenerationRequest, GenerationResult, Generator,
};
use brainloop_core::ratelimit::RateLimiter;
use brainloop_daemon::executor::Executor;
use brainloop_daemon::gateway::Gateway;
use brainloop_daemon::governor::Governor;
use brainloop_daemon::mcp::{Dispatcher, Server};
use brainloop_daemon::metrics::Histogram;
use brainloop_daemon::readers::ReaderHub;
use brainloop_daemon::registry::CommandRegistry;
use brainloop_daemon::session::SessionManager;
use brainloop_daemon::storage::{
    Databases, LifecycleStore, MetadataStore, OutputStore, COMMAND_SECURITY_SCHEMA,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Returns a fixed completion for every request.
struct StaticGenerator;

#[async_trait]
impl Generator for StaticGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        Ok(GenerationResult {
            content: "generated output".to_string(),
            model: "static".to_string(),
            temperature: request.temperature,
            prompt_tokens: 1,
            completion_tokens: 2,
            latency_ms: 3,
        })
    }
}

fn write_schema_files(dir: &std::path::Path) {
    for (name, contents) in [
        (
            "brainloop.input_schema.sql",
            include_str!("../../../brainloop.input_schema.sql"),
        ),
        (
            "brainloop.lifecycle_schema.sql",
            include_str!("../../../brainloop.lifecycle_schema.sql"),
        ),
        (
            "brainloop.output_schema.sql",
            include_str!("../../../brainloop.output_schema.sql"),
        ),
        (
            "brainloop.metadata_schema.sql",
            include_str!("../../../brainloop.metadata_schema.sql"),
        ),
        (
            "command_security_schema.sql",
            include_str!("../../../command_security_schema.sql"),
        ),
    ] {
        std::fs::write(dir.join(name), contents).unwrap();
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    requests: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    responses: BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    cancel: CancellationToken,
}

impl Harness {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_schema_files(dir.path());
        let dbs = Databases::open(dir.path()).unwrap();
        let lifecycle = LifecycleStore::new(dbs.lifecycle.clone());
        let output = OutputStore::new(dbs.output.clone());
        let metadata = MetadataStore::new(dbs.metadata.clone());
        let histogram = Histogram::new(dbs.output.clone());
        let registry = Arc::new(
            CommandRegistry::open(
                &dir.path().join("command_security.db"),
                &dir.path().join(COMMAND_SECURITY_SCHEMA),
            )
            .unwrap(),
        );
        let cancel = CancellationToken::new();
        let gateway = Arc::new(Gateway::new(
            Arc::new(StaticGenerator),
            Arc::new(RateLimiter::new(600)),
            lifecycle.clone(),
            output.clone(),
            histogram.clone(),
            cancel.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher {
            governor: Governor::new(
                Arc::clone(&registry),
                Executor::new(dir.path()),
                metadata.clone(),
                histogram.clone(),
            ),
            sessions: SessionManager::new(
                lifecycle.clone(),
                output.clone(),
                metadata,
                Arc::clone(&gateway),
            ),
            readers: ReaderHub::new(lifecycle.clone(), output.clone()),
            gateway,
            lifecycle,
            output,
            histogram,
            registry,
            version: "test",
        });

        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_side);
        let (client_read, client_write) = tokio::io::split(client_side);

        let server = Server::new(dispatcher, cancel.clone(), TaskTracker::new());
        tokio::spawn(async move {
            let _ = server.serve(server_read, server_write).await;
        });

        Self {
            _dir: dir,
            requests: client_write,
            responses: BufReader::new(client_read),
            cancel,
        }
    }

    async fn roundtrip(&mut self, request: &Value) -> Value {
        self.send_raw(&request.to_string()).await
    }

    async fn send_raw(&mut self, line: &str) -> Value {
        self.requests
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        self.responses.read_line(&mut response).await.unwrap();
        serde_json::from_str(&response).unwrap()
    }
}

fn tool_call(id: u64, action: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {
            "name": "brainloop",
            "arguments": { "action": action, "params": params },
        },
    })
}

#[tokio::test]
async fn initialize_and_tools_list() {
    let mut harness = Harness::start();

    let response = harness
        .roundtrip(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}))
        .await;
    assert_eq!(response["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(response["result"]["serverInfo"]["name"], "brainloop");

    let response = harness
        .roundtrip(&json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .await;
    let tools = response["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "brainloop");
}

#[tokio::test]
async fn malformed_json_yields_parse_error() {
    let mut harness = Harness::start();
    let response = harness.send_raw("{not json").await;
    assert_eq!(response["error"]["code"], -32700);
}

#[tokio::test]
async fn unknown_method_yields_method_not_found() {
    let mut harness = Harness::start();
    let response = harness
        .roundtrip(&json!({"jsonrpc": "2.0", "id": 3, "method": "resources/list"}))
        .await;
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn execute_bash_pending_then_forced() {
    let mut harness = Harness::start();

    let response = harness
        .roundtrip(&tool_call(4, "execute_bash", json!({"command": "echo e2e"})))
        .await;
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    let body: Value = serde_json::from_str(text).unwrap();
    assert_eq!(body["status"], "pending_validation");
    assert_eq!(body["policy"], "ask");

    let response = harness
        .roundtrip(&tool_call(
            5,
            "execute_bash",
            json!({"command": "echo e2e", "force_execute": true}),
        ))
        .await;
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    let body: Value = serde_json::from_str(text).unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["stdout"].as_str().unwrap().trim(), "e2e");
}

#[tokio::test]
async fn dangerous_command_is_an_rpc_error_with_no_side_effects() {
    let mut harness = Harness::start();
    let response = harness
        .roundtrip(&tool_call(
            6,
            "execute_bash",
            json!({"command": "rm -rf /", "force_execute": true}),
        ))
        .await;
    assert_eq!(response["error"]["code"], -32000);
    assert!(response["error"]["data"]
        .as_str()
        .unwrap()
        .contains("dangerous pattern"));
}

#[tokio::test]
async fn loop_workflow_over_the_wire() {
    let mut harness = Harness::start();
    let target = harness._dir.path().join("wire.txt");

    let response = harness
        .roundtrip(&tool_call(
            7,
            "loop",
            json!({
                "mode": "propose",
                "blocks": [{
                    "description": "write the file",
                    "type": "code",
                    "target": target.to_str().unwrap(),
                }],
            }),
        ))
        .await;
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    let proposed: Value = serde_json::from_str(text).unwrap();
    let session_id = proposed["session_id"].as_str().unwrap();
    let block_id = proposed["blocks"][0]["block_id"].as_str().unwrap();

    let response = harness
        .roundtrip(&tool_call(
            8,
            "loop",
            json!({"mode": "commit", "session_id": session_id, "block_id": block_id}),
        ))
        .await;
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    let committed: Value = serde_json::from_str(text).unwrap();
    assert_eq!(committed["success"], true);
    assert_eq!(
        std::fs::read_to_string(&target).unwrap(),
        "generated output"
    );
}

#[tokio::test]
async fn twenty_clean_runs_promote_to_auto_approve() {
    let mut harness = Harness::start();

    // 19 forced executions leave the policy at `ask`.
    for i in 0..19 {
        let response = harness
            .roundtrip(&tool_call(
                100 + i,
                "execute_bash",
                json!({"command": "true", "force_execute": true}),
            ))
            .await;
        assert!(response["error"].is_null(), "run {i} failed: {response}");
    }

    // An unforced request is still held for confirmation (or flagged as a
    // duplicate when it lands inside the threshold).
    let response = harness
        .roundtrip(&tool_call(130, "execute_bash", json!({"command": "true"})))
        .await;
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    let body: Value = serde_json::from_str(text).unwrap();
    assert!(
        body["status"] == "pending_validation" || body["status"] == "duplicate_warning",
        "unexpected body before promotion: {body}"
    );

    // The 20th success trips the promotion rule.
    let response = harness
        .roundtrip(&tool_call(
            131,
            "execute_bash",
            json!({"command": "true", "force_execute": true}),
        ))
        .await;
    assert!(response["error"].is_null());

    // Now the command runs without confirmation under auto_approve.
    let response = harness
        .roundtrip(&tool_call(132, "execute_bash", json!({"command": "true"})))
        .await;
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    let body: Value = serde_json::from_str(text).unwrap();
    assert_eq!(body["success"], true, "expected execution, got {body}");
    assert_eq!(body["policy_used"], "auto_approve");
}

#[tokio::test]
async fn cancellation_stops_the_accept_loop() {
    let mut harness = Harness::start();
    // A request before cancellation is served.
    let response = harness
        .roundtrip(&tool_call(9, "list_actions", json!({})))
        .await;
    assert!(response["error"].is_null());

    harness.cancel.cancel();
    // After cancellation the server stops reading; the write may succeed
    // into the pipe buffer, but no response arrives and the stream closes.
    harness
        .requests
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":10,\"method\":\"tools/list\"}\n")
        .await
        .ok();
    let mut line = String::new();
    let read = harness.responses.read_line(&mut line).await.unwrap();
    assert_eq!(read, 0, "expected EOF after cancellation, got {line:?}");
}
