//! The `brainloop` tool and its 13-action dispatch.
//!
//! Progressive disclosure: `tools/list` exposes a single tool whose input
//! schema is `{action, params}`; `list_actions` and `get_schema` describe
//! the catalogue from inside the tool. Write actions (`generate_file`,
//! `generate_sql`, `loop` commit) are ledger-gated; `audit_code` is the
//! read-only twin of `generate_file` and never writes — the distinction is
//! deliberate and visible in both naming and behavior.

use std::sync::Arc;

use brainloop_core::generation::temperature;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::{JsonRpcResponse, PROTOCOL_VERSION, SERVER_NAME};
use crate::error::{Error, Result, RPC_INVALID_PARAMS};
use crate::gateway::Gateway;
use crate::governor::Governor;
use crate::metrics::Histogram;
use crate::readers::{ReaderHub, SourceType};
use crate::registry::CommandRegistry;
use crate::session::{self, BlockInput, SessionManager};
use crate::storage::{LifecycleStore, OutputStore};

/// The action names accepted by the `brainloop` tool.
pub const ACTIONS: &[&str] = &[
    "execute_bash",
    "audit_code",
    "generate_file",
    "generate_sql",
    "explore",
    "loop",
    "read_sqlite",
    "read_markdown",
    "read_code",
    "read_config",
    "list_actions",
    "get_schema",
    "get_stats",
];

pub struct Dispatcher {
    pub governor: Governor,
    pub sessions: SessionManager,
    pub readers: ReaderHub,
    pub gateway: Arc<Gateway>,
    pub lifecycle: LifecycleStore,
    pub output: OutputStore,
    pub histogram: Histogram,
    pub registry: Arc<CommandRegistry>,
    pub version: &'static str,
}

impl Dispatcher {
    /// The `initialize` response body.
    #[must_use]
    pub fn initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": SERVER_NAME, "version": self.version },
        })
    }

    /// The `tools/list` response body: exactly one tool.
    #[must_use]
    pub fn tools_list(&self) -> Value {
        json!({
            "tools": [{
                "name": SERVER_NAME,
                "description": "Delegated code generation, governed shell execution, and \
                                intelligent reading with progressive disclosure",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "action": {
                            "type": "string",
                            "enum": ACTIONS,
                            "description": "Action to perform. Use 'list_actions' to see all \
                                            available actions with descriptions.",
                        },
                        "params": {
                            "type": "object",
                            "description": "Action-specific parameters. Use 'get_schema' to see \
                                            the schema for a specific action.",
                        },
                    },
                    "required": ["action", "params"],
                },
            }],
        })
    }

    /// Handles `tools/call`: unwraps the envelope, dispatches the action,
    /// and wraps the result in the MCP content shape.
    pub async fn tools_call(&self, id: Value, params: Option<&str>) -> JsonRpcResponse {
        let Some(raw) = params else {
            return JsonRpcResponse::failure(id, RPC_INVALID_PARAMS, "Invalid params", None);
        };
        let parsed: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                return JsonRpcResponse::failure(
                    id,
                    RPC_INVALID_PARAMS,
                    "Invalid params",
                    Some(err.to_string()),
                );
            },
        };

        if parsed["name"].as_str() != Some(SERVER_NAME) {
            return JsonRpcResponse::failure(
                id,
                RPC_INVALID_PARAMS,
                "Unknown tool",
                parsed["name"].as_str().map(String::from),
            );
        }
        let Some(action) = parsed["arguments"]["action"].as_str() else {
            return JsonRpcResponse::failure(
                id,
                RPC_INVALID_PARAMS,
                "Missing action parameter",
                None,
            );
        };
        let action_params = parsed["arguments"]["params"].clone();
        let action_params = if action_params.is_object() {
            action_params
        } else {
            json!({})
        };

        match self.dispatch_with_retry(action, &action_params).await {
            Ok(result) => {
                let text = result.to_string();
                JsonRpcResponse::success(
                    id,
                    json!({ "content": [{ "type": "text", "text": text }] }),
                )
            },
            Err(err) => JsonRpcResponse::failure(
                id,
                err.rpc_code(),
                "Action failed",
                Some(err.to_string()),
            ),
        }
    }

    /// Transient failures are retried once; a second transient failure
    /// escalates.
    async fn dispatch_with_retry(&self, action: &str, params: &Value) -> Result<Value> {
        match self.dispatch_action(action, params).await {
            Err(err) if err.is_transient() => {
                tracing::warn!(action, error = %err, "transient failure, retrying once");
                self.dispatch_action(action, params).await.map_err(|err| {
                    if err.is_transient() {
                        Error::ExternalFailure(err.to_string())
                    } else {
                        err
                    }
                })
            },
            other => other,
        }
    }

    async fn dispatch_action(&self, action: &str, params: &Value) -> Result<Value> {
        match action {
            "execute_bash" => self.handle_execute_bash(params).await,
            "audit_code" => self.handle_audit_code(params).await,
            "generate_file" => self.handle_generate_file(params).await,
            "generate_sql" => self.handle_generate_sql(params).await,
            "explore" => self.handle_explore(params).await,
            "loop" => self.handle_loop(params).await,
            "read_sqlite" => self.handle_read(SourceType::Sqlite, params),
            "read_markdown" => self.handle_read(SourceType::Markdown, params),
            "read_code" => self.handle_read(SourceType::Code, params),
            "read_config" => self.handle_read(SourceType::Config, params),
            "list_actions" => Ok(list_actions()),
            "get_schema" => handle_get_schema(params),
            "get_stats" => self.handle_get_stats(),
            other => Err(Error::InvalidInput(format!("unknown action: {other}"))),
        }
    }

    async fn handle_execute_bash(&self, params: &Value) -> Result<Value> {
        let command = required_str(params, "command")?;
        let force_execute = params["force_execute"].as_bool().unwrap_or(false);
        let outcome = self.governor.execute_bash(command, force_execute).await?;
        serde_json::to_value(outcome).map_err(|e| Error::ExternalFailure(e.to_string()))
    }

    /// Non-writing LLM review of a file. Deliberately distinct from
    /// `generate_file`: nothing on disk changes, nothing enters the
    /// ledger.
    async fn handle_audit_code(&self, params: &Value) -> Result<Value> {
        let file_path = required_str(params, "file_path")?;
        let contents = std::fs::read_to_string(file_path)
            .map_err(|e| Error::InvalidInput(format!("cannot read {file_path}: {e}")))?;
        let focus = params["focus"].as_str().unwrap_or("correctness and safety");

        let system = "You are a meticulous code reviewer. Audit the given file and report \
                      concrete findings: bugs, unsafe constructs, and deviations from the \
                      stated focus. Do not rewrite the file; report findings only.";
        let prompt = format!("Focus: {focus}\n\nFile: {file_path}\n\n{contents}");
        let result = self
            .gateway
            .generate("audit_code", system, &prompt, temperature::REFINE)
            .await?;

        Ok(json!({
            "success": true,
            "file_path": file_path,
            "audit": result.content,
            "tokens": result.prompt_tokens + result.completion_tokens,
        }))
    }

    async fn handle_generate_file(&self, params: &Value) -> Result<Value> {
        let verified_prompt = required_str(params, "verified_prompt")?;
        let output_path = required_str(params, "output_path")?;
        let code_type = params["code_type"].as_str().unwrap_or("code");
        let patterns = params.get("patterns").filter(|p| !p.is_null());

        let code = self
            .gateway
            .generate_code(
                "generate_file",
                verified_prompt,
                code_type,
                patterns,
                temperature::COMMIT,
            )
            .await?;

        let hash = ledger_hash(&[verified_prompt, output_path, &code]);
        if let Some(prior) = self.lifecycle.get_processed(&hash)? {
            return serde_json::from_str(&prior.result_json.unwrap_or_default())
                .map_err(|e| Error::ExternalFailure(format!("recorded result unreadable: {e}")));
        }

        // Ledger write comes after the file is durably on disk.
        session::write_file_atomically(output_path, &code)?;

        let result = json!({
            "success": true,
            "output_path": output_path,
            "code_type": code_type,
            "line_count": code.lines().count(),
            "message": format!("file generated: {output_path}"),
        });
        self.lifecycle
            .mark_processed(&hash, "generate_file", &result.to_string())?;
        Ok(result)
    }

    async fn handle_generate_sql(&self, params: &Value) -> Result<Value> {
        let verified_prompt = required_str(params, "verified_prompt")?;
        let db_path = required_str(params, "db_path")?;

        let sql = self
            .gateway
            .generate_code("generate_sql", verified_prompt, "sql", None, temperature::COMMIT)
            .await?;

        let hash = ledger_hash(&[verified_prompt, db_path, &sql]);
        if let Some(prior) = self.lifecycle.get_processed(&hash)? {
            return serde_json::from_str(&prior.result_json.unwrap_or_default())
                .map_err(|e| Error::ExternalFailure(format!("recorded result unreadable: {e}")));
        }

        session::execute_sql(db_path, &sql)?;

        let result = json!({
            "success": true,
            "db_path": db_path,
            "message": "SQL executed successfully",
        });
        self.lifecycle
            .mark_processed(&hash, "generate_sql", &result.to_string())?;
        Ok(result)
    }

    /// Creative generation with no execution and no writes.
    async fn handle_explore(&self, params: &Value) -> Result<Value> {
        let description = required_str(params, "description")?;
        let code_type = params["type"].as_str().unwrap_or("code");

        let system = brainloop_core::generation::code_system_prompt(code_type, None);
        let result = self
            .gateway
            .generate("explore", &system, description, temperature::EXPLORE)
            .await?;
        let code = brainloop_core::generation::strip_code_fences(&result.content);

        Ok(json!({
            "success": true,
            "code": code,
            "tokens": result.prompt_tokens + result.completion_tokens,
            "message": "exploratory code generated (not executed)",
        }))
    }

    async fn handle_loop(&self, params: &Value) -> Result<Value> {
        let mode = required_str(params, "mode")?;
        match mode {
            "propose" => {
                let blocks: Vec<BlockInput> =
                    serde_json::from_value(params["blocks"].clone()).map_err(|e| {
                        Error::InvalidInput(format!("invalid blocks parameter: {e}"))
                    })?;
                let response = self.sessions.propose(blocks).await?;
                serde_json::to_value(response).map_err(|e| Error::ExternalFailure(e.to_string()))
            },
            "audit" => {
                let response = self.sessions.audit(
                    required_str(params, "session_id")?,
                    required_str(params, "block_id")?,
                )?;
                serde_json::to_value(response).map_err(|e| Error::ExternalFailure(e.to_string()))
            },
            "refine" => {
                let response = self
                    .sessions
                    .refine(
                        required_str(params, "session_id")?,
                        required_str(params, "block_id")?,
                        required_str(params, "audit_feedback")?,
                    )
                    .await?;
                serde_json::to_value(response).map_err(|e| Error::ExternalFailure(e.to_string()))
            },
            "commit" => {
                let response = self
                    .sessions
                    .commit(
                        required_str(params, "session_id")?,
                        required_str(params, "block_id")?,
                    )
                    .await?;
                serde_json::to_value(response).map_err(|e| Error::ExternalFailure(e.to_string()))
            },
            other => Err(Error::InvalidInput(format!("unknown loop mode: {other}"))),
        }
    }

    fn handle_read(&self, source_type: SourceType, params: &Value) -> Result<Value> {
        let path_key = if source_type == SourceType::Sqlite {
            "db_path"
        } else {
            "file_path"
        };
        let path = required_str(params, path_key)?;
        let sample_rows = params["max_sample_rows"]
            .as_u64()
            .map(|n| n.min(100) as usize);
        let digest = self.readers.read(source_type, path, sample_rows)?;
        Ok(json!({
            "success": true,
            "digest": digest,
            "format": "json",
        }))
    }

    fn handle_get_stats(&self) -> Result<Value> {
        let since = crate::storage::now_unix() - 3600;
        let metrics = self.output.aggregated_metrics(since)?;
        let latency = self.histogram.all_percentiles(60)?;
        let limiter = self.gateway.limiter_stats();
        Ok(json!({
            "period_hours": 1,
            "metrics": metrics,
            "latency_percentiles": latency,
            "registered_commands": self.registry.command_count()?,
            "rate_limiter": {
                "requests_per_minute": limiter.requests_per_minute,
                "tokens_available": limiter.tokens_available,
                "consecutive_errors": limiter.consecutive_errors,
                "in_backoff": limiter.in_backoff,
            },
            "timestamp": crate::storage::now_unix(),
        }))
    }
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidInput(format!("missing {key} parameter")))
}

/// `SHA-256` over the concatenated parts, hex-encoded.
fn ledger_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn list_actions() -> Value {
    let actions = json!([
        {
            "name": "execute_bash",
            "description": "Execute a shell command under the adaptive governor",
            "parameters": ["command", "force_execute (optional)"],
        },
        {
            "name": "audit_code",
            "description": "LLM audit of a file; reports findings, never writes",
            "parameters": ["file_path", "focus (optional)"],
        },
        {
            "name": "generate_file",
            "description": "Generate a code file from a prompt (writes to output_path)",
            "parameters": ["verified_prompt", "output_path", "code_type (optional)", "patterns (optional)"],
        },
        {
            "name": "generate_sql",
            "description": "Generate and execute SQL against a database (writes)",
            "parameters": ["verified_prompt", "db_path"],
        },
        {
            "name": "explore",
            "description": "Generate exploratory code without execution (creative mode)",
            "parameters": ["description", "type (optional)"],
        },
        {
            "name": "loop",
            "description": "Iterative generation workflow (propose/audit/refine/commit)",
            "parameters": ["mode", "blocks (propose)", "session_id", "block_id", "audit_feedback (refine)"],
        },
        {
            "name": "read_sqlite",
            "description": "Structured digest of a SQLite database",
            "parameters": ["db_path", "max_sample_rows (optional)"],
        },
        {
            "name": "read_markdown",
            "description": "Structured digest of a markdown file",
            "parameters": ["file_path"],
        },
        {
            "name": "read_code",
            "description": "Structured digest of a source code file",
            "parameters": ["file_path"],
        },
        {
            "name": "read_config",
            "description": "Structured digest of a configuration file (JSON/TOML/YAML)",
            "parameters": ["file_path"],
        },
        {
            "name": "list_actions",
            "description": "List all available actions (this action)",
            "parameters": [],
        },
        {
            "name": "get_schema",
            "description": "Get the parameter schema for a specific action",
            "parameters": ["action_name"],
        },
        {
            "name": "get_stats",
            "description": "Usage statistics: metrics, latency percentiles, cache hit rate",
            "parameters": [],
        },
    ]);
    json!({
        "actions": actions,
        "count": ACTIONS.len(),
    })
}

fn handle_get_schema(params: &Value) -> Result<Value> {
    let action = required_str(params, "action_name")?;
    let schema = match action {
        "execute_bash" => json!({
            "command": {"type": "string", "required": true, "description": "Shell command to execute"},
            "force_execute": {"type": "boolean", "required": false, "description": "Run even when the policy would ask for confirmation"},
        }),
        "audit_code" => json!({
            "file_path": {"type": "string", "required": true, "description": "File to audit (read-only)"},
            "focus": {"type": "string", "required": false, "description": "Review focus, default 'correctness and safety'"},
        }),
        "generate_file" => json!({
            "verified_prompt": {"type": "string", "required": true, "description": "What code to generate"},
            "output_path": {"type": "string", "required": true, "description": "Where the generated code is written"},
            "code_type": {"type": "string", "required": false, "description": "go, python, sql, or code (default)"},
            "patterns": {"type": "object", "required": false, "description": "Project patterns injected into the system prompt"},
        }),
        "generate_sql" => json!({
            "verified_prompt": {"type": "string", "required": true, "description": "What SQL to generate"},
            "db_path": {"type": "string", "required": true, "description": "Target database path"},
        }),
        "explore" => json!({
            "description": {"type": "string", "required": true, "description": "What to explore"},
            "type": {"type": "string", "required": false, "description": "Code type hint"},
        }),
        "loop" => json!({
            "mode": {"type": "string", "required": true, "description": "propose | audit | refine | commit"},
            "blocks": {"type": "array", "required": false, "description": "Blocks for propose: {id?, description, type, target}"},
            "session_id": {"type": "string", "required": false, "description": "Session (audit/refine/commit)"},
            "block_id": {"type": "string", "required": false, "description": "Block (audit/refine/commit)"},
            "audit_feedback": {"type": "string", "required": false, "description": "Feedback for refine"},
        }),
        "read_sqlite" => json!({
            "db_path": {"type": "string", "required": true, "description": "Database to digest"},
            "max_sample_rows": {"type": "integer", "required": false, "description": "Sample rows per table, default 5"},
        }),
        "read_markdown" | "read_code" | "read_config" => json!({
            "file_path": {"type": "string", "required": true, "description": "File to digest"},
        }),
        "list_actions" | "get_stats" => json!({}),
        "get_schema" => json!({
            "action_name": {"type": "string", "required": true, "description": "Action to describe"},
        }),
        other => {
            return Ok(json!({ "error": format!("no schema found for action: {other}") }));
        },
    };
    Ok(json!({ "action": action, "schema": schema }))
}

#[cfg(test)]
mod tests {
    use brainloop_core::ratelimit::RateLimiter;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::executor::Executor;
    use crate::gateway::testutil::ScriptedGenerator;
    use crate::storage::testutil::write_schema_files;
    use crate::storage::{Databases, MetadataStore, COMMAND_SECURITY_SCHEMA};

    fn dispatcher(responses: Vec<&str>) -> (tempfile::TempDir, Dispatcher) {
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
        let gateway = Arc::new(Gateway::new(
            Arc::new(ScriptedGenerator::new(responses)),
            Arc::new(RateLimiter::new(600)),
            lifecycle.clone(),
            output.clone(),
            histogram.clone(),
            CancellationToken::new(),
        ));
        let dispatcher = Dispatcher {
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
            version: "0.1.0",
        };
        (dir, dispatcher)
    }

    fn call_params(action: &str, params: Value) -> String {
        json!({
            "name": SERVER_NAME,
            "arguments": { "action": action, "params": params },
        })
        .to_string()
    }

    #[tokio::test]
    async fn initialize_reports_protocol_and_identity() {
        let (_dir, d) = dispatcher(vec![]);
        let init = d.initialize();
        assert_eq!(init["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(init["serverInfo"]["name"], "brainloop");
    }

    #[tokio::test]
    async fn tools_list_exposes_one_tool_with_13_actions() {
        let (_dir, d) = dispatcher(vec![]);
        let list = d.tools_list();
        let tools = list["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        let actions = tools[0]["inputSchema"]["properties"]["action"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(actions.len(), 13);
    }

    #[tokio::test]
    async fn tools_call_wraps_results_in_content_envelope() {
        let (_dir, d) = dispatcher(vec![]);
        let params = call_params("list_actions", json!({}));
        let response = d.tools_call(json!(1), Some(&params)).await;
        assert!(response.error.is_none());
        let result = response.result.unwrap();
        let text = result["content"][0]["text"].as_str().unwrap();
        let parsed: Value = serde_json::from_str(text).unwrap();
        assert_eq!(parsed["count"], 13);
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_params() {
        let (_dir, d) = dispatcher(vec![]);
        let params = json!({"name": "other", "arguments": {"action": "list_actions", "params": {}}})
            .to_string();
        let response = d.tools_call(json!(1), Some(&params)).await;
        assert_eq!(response.error.unwrap().code, RPC_INVALID_PARAMS);
    }

    #[tokio::test]
    async fn execute_bash_action_flows_through_the_governor() {
        let (_dir, d) = dispatcher(vec![]);
        let params = call_params("execute_bash", json!({"command": "echo hi"}));
        let response = d.tools_call(json!(2), Some(&params)).await;
        let result = response.result.unwrap();
        let text = result["content"][0]["text"].as_str().unwrap();
        let parsed: Value = serde_json::from_str(text).unwrap();
        assert_eq!(parsed["status"], "pending_validation");
    }

    #[tokio::test]
    async fn dangerous_execute_bash_surfaces_rpc_error_with_pattern() {
        let (_dir, d) = dispatcher(vec![]);
        let params = call_params(
            "execute_bash",
            json!({"command": "rm -rf /", "force_execute": true}),
        );
        let response = d.tools_call(json!(3), Some(&params)).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, crate::error::RPC_ACTION_FAILED);
        assert!(error.data.unwrap().contains("dangerous pattern"));
    }

    #[tokio::test]
    async fn generate_file_writes_once_and_replays_from_ledger() {
        let (dir, d) = dispatcher(vec!["generated contents"]);
        let target = dir.path().join("out.txt");
        let params = json!({
            "verified_prompt": "write a file",
            "output_path": target.to_str().unwrap(),
        });

        let first = d
            .dispatch_action("generate_file", &params)
            .await
            .unwrap();
        assert_eq!(first["success"], true);
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "generated contents"
        );
        let mtime_first = std::fs::metadata(&target).unwrap().modified().unwrap();

        // Scripted generator repeats its last response, so the ledger hash
        // matches and the file is not rewritten.
        let second = d
            .dispatch_action("generate_file", &params)
            .await
            .unwrap();
        assert_eq!(second["success"], true);
        assert_eq!(
            std::fs::metadata(&target).unwrap().modified().unwrap(),
            mtime_first
        );
    }

    #[tokio::test]
    async fn generate_sql_executes_against_the_target() {
        let (dir, d) = dispatcher(vec!["CREATE TABLE things (id INTEGER PRIMARY KEY);"]);
        let db_path = dir.path().join("made.db");
        let params = json!({
            "verified_prompt": "make the things table",
            "db_path": db_path.to_str().unwrap(),
        });
        let result = d.dispatch_action("generate_sql", &params).await.unwrap();
        assert_eq!(result["success"], true);

        let conn = rusqlite::Connection::open(&db_path).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'things'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn audit_code_never_writes() {
        let (dir, d) = dispatcher(vec!["finding: fine"]);
        let file = dir.path().join("reviewme.py");
        std::fs::write(&file, "print('x')\n").unwrap();
        let before = std::fs::read_to_string(&file).unwrap();

        let params = json!({"file_path": file.to_str().unwrap()});
        let result = d.dispatch_action("audit_code", &params).await.unwrap();
        assert_eq!(result["audit"], "finding: fine");
        assert_eq!(std::fs::read_to_string(&file).unwrap(), before);
        // Nothing entered the ledger.
        assert!(!d.lifecycle.is_processed(&ledger_hash(&["anything"])).unwrap());
    }

    #[tokio::test]
    async fn explore_returns_code_without_side_effects() {
        let (_dir, d) = dispatcher(vec!["```python\nx = 1\n```"]);
        let params = json!({"description": "a variable", "type": "python"});
        let result = d.dispatch_action("explore", &params).await.unwrap();
        assert_eq!(result["code"], "x = 1");
        assert_eq!(result["success"], true);
    }

    #[tokio::test]
    async fn loop_propose_then_commit_round_trip() {
        let (dir, d) = dispatcher(vec!["v1", "final"]);
        let target = dir.path().join("block.txt");
        let propose = json!({
            "mode": "propose",
            "blocks": [{"description": "write block", "type": "code",
                        "target": target.to_str().unwrap()}],
        });
        let proposed = d.dispatch_action("loop", &propose).await.unwrap();
        let session_id = proposed["session_id"].as_str().unwrap().to_string();
        let block_id = proposed["blocks"][0]["block_id"].as_str().unwrap().to_string();

        let commit = json!({"mode": "commit", "session_id": session_id, "block_id": block_id});
        let committed = d.dispatch_action("loop", &commit).await.unwrap();
        assert_eq!(committed["success"], true);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "final");
    }

    #[tokio::test]
    async fn get_schema_describes_every_action() {
        let (_dir, d) = dispatcher(vec![]);
        for action in ACTIONS {
            let params = json!({"action_name": action});
            let result = d.dispatch_action("get_schema", &params).await.unwrap();
            assert_eq!(result["action"], *action, "schema missing for {action}");
        }
    }

    #[tokio::test]
    async fn get_stats_reports_metrics_and_commands() {
        let (_dir, d) = dispatcher(vec![]);
        d.output.record_metric("cerebras_tokens_prompt", 5.0).unwrap();
        d.registry.get_or_create("ls").unwrap();
        let stats = d.handle_get_stats().unwrap();
        assert_eq!(stats["registered_commands"], 1);
        assert_eq!(stats["period_hours"], 1);
        assert!(stats["metrics"]["cerebras_tokens_prompt"]["count"].as_i64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn read_actions_require_their_path_parameter() {
        let (_dir, d) = dispatcher(vec![]);
        let err = d
            .dispatch_action("read_markdown", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
