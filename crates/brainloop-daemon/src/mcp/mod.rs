//! Line-delimited JSON-RPC 2.0 over stdio (the MCP transport).
//!
//! One complete JSON object per line in, one per line out, no framing
//! headers. Each request is handled by its own task; responses are
//! funneled through a single writer task so output lines never interleave.
//! Shutdown phase 1 cancels the accept loop; phase 2 waits for in-flight
//! request tasks through the shared [`TaskTracker`].

pub mod dispatch;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{RPC_METHOD_NOT_FOUND, RPC_PARSE_ERROR};

pub use dispatch::Dispatcher;

/// Protocol version reported by `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Server name reported by `initialize`.
pub const SERVER_NAME: &str = "brainloop";

/// One JSON-RPC 2.0 request.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: serde_json::Value,
    pub method: String,
    #[serde(default)]
    pub params: Option<Box<RawValue>>,
}

/// One JSON-RPC 2.0 response.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl JsonRpcResponse {
    #[must_use]
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(id: serde_json::Value, code: i64, message: &str, data: Option<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.to_string(),
                data,
            }),
        }
    }
}

/// The stdio server loop.
pub struct Server {
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, cancel: CancellationToken, tracker: TaskTracker) -> Self {
        Self {
            dispatcher,
            cancel,
            tracker,
        }
    }

    /// Serves until stdin closes or the root context is cancelled.
    ///
    /// # Errors
    ///
    /// I/O failures on the output stream.
    pub async fn serve<R, W>(&self, stdin: R, stdout: W) -> std::io::Result<()>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<String>(64);
        let writer = tokio::spawn(write_lines(stdout, rx));

        let mut lines = BufReader::new(stdin).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                () = self.cancel.cancelled() => {
                    tracing::info!("request accept loop cancelled");
                    break;
                }
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }

            let dispatcher = Arc::clone(&self.dispatcher);
            let tx = tx.clone();
            self.tracker.spawn(async move {
                let response = handle_line(&dispatcher, &line).await;
                match serde_json::to_string(&response) {
                    Ok(rendered) => {
                        let _ = tx.send(rendered).await;
                    },
                    Err(err) => {
                        tracing::error!(error = %err, "failed to serialize response");
                    },
                }
            });
        }

        drop(tx);
        let _ = writer.await;
        Ok(())
    }
}

async fn handle_line(dispatcher: &Dispatcher, line: &str) -> JsonRpcResponse {
    let request: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            return JsonRpcResponse::failure(
                serde_json::Value::Null,
                RPC_PARSE_ERROR,
                "Parse error",
                Some(err.to_string()),
            );
        },
    };

    let id = request.id.clone();
    match request.method.as_str() {
        "initialize" => JsonRpcResponse::success(id, dispatcher.initialize()),
        "tools/list" => JsonRpcResponse::success(id, dispatcher.tools_list()),
        "tools/call" => {
            let params = request.params.as_deref().map(RawValue::get);
            dispatcher.tools_call(id, params).await
        },
        _ => JsonRpcResponse::failure(id, RPC_METHOD_NOT_FOUND, "Method not found", None),
    }
}

async fn write_lines<W>(mut stdout: W, mut rx: mpsc::Receiver<String>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}
