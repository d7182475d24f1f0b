//! The delegated-generation capability contract and prompt shaping.
//!
//! The worker never talks to a completion API directly; everything goes
//! through the [`Generator`] trait, implemented over HTTP in the daemon and
//! by scripted doubles in tests. This module also owns prompt shaping: the
//! per-code-type system prompts, the optional patterns block, the digest
//! schema prompts, and the markdown-fence cleanup applied to responses that
//! claim to contain code.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The fixed temperature ladder of the session workflow. Not exposed to
/// callers; propose explores, refine narrows, commit is near-deterministic.
pub mod temperature {
    pub const EXPLORE: f64 = 0.6;
    pub const REFINE: f64 = 0.3;
    pub const COMMIT: f64 = 0.1;
}

/// One completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f64,
}

/// One completion result, with usage accounting for telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub content: String,
    pub model: String,
    pub temperature: f64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub latency_ms: i64,
}

/// Failures of the completion capability.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("completion API request failed: {0}")]
    Transport(String),

    #[error("completion API returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("completion API returned no choices")]
    EmptyResponse,

    #[error("generated {code_type} output failed validation: {reason}")]
    InvalidOutput {
        code_type: String,
        reason: String,
    },
}

/// The completion capability. The generation gateway is the only caller.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest)
        -> Result<GenerationResult, GenerationError>;
}

/// Builds the system prompt for a code-emission request, appending a
/// pretty-printed patterns block when the caller supplied one.
#[must_use]
pub fn code_system_prompt(code_type: &str, patterns: Option<&serde_json::Value>) -> String {
    let base = match code_type {
        "go" => {
            "You are an expert Go programmer. Generate clean, idiomatic Go code.\n\
             Rules:\n\
             - Return errors, never panic\n\
             - Comment exported identifiers\n\
             - Prefer the standard library\n\
             - Persist through the processed_log idempotency ledger where side effects occur"
        },
        "sql" => {
            "You are an expert SQLite schema designer. Generate SQLite statements.\n\
             Rules:\n\
             - Always use CREATE TABLE IF NOT EXISTS\n\
             - Declare PRIMARY KEY and FOREIGN KEY constraints\n\
             - Add indexes where queries need them\n\
             - Comment each table's purpose"
        },
        "python" => {
            "You are an expert Python programmer. Generate clean, PEP 8 compliant code.\n\
             Rules:\n\
             - Use type hints\n\
             - Add docstrings to functions and classes\n\
             - Prefer the standard library"
        },
        _ => {
            "You are an expert programmer. Generate clean, well-structured code \
             following the conventions of the target language."
        },
    };

    match patterns.and_then(|p| serde_json::to_string_pretty(p).ok()) {
        Some(rendered) => format!(
            "{base}\n\nDETECTED PROJECT PATTERNS (follow these conventions):\n{rendered}"
        ),
        None => base.to_string(),
    }
}

/// Builds the system prompt for a digest request over one source type. The
/// response must be a single JSON object matching the named shape.
#[must_use]
pub fn digest_system_prompt(source_type: &str) -> String {
    let shape = match source_type {
        "sqlite" => r#"{"tables": [{"name": "", "row_count": 0, "columns": []}], "summary": ""}"#,
        "markdown" => r#"{"outline": [], "link_count": 0, "code_blocks": 0, "summary": ""}"#,
        "code" => r#"{"language": "", "declarations": [], "todo_count": 0, "summary": ""}"#,
        _ => r#"{"format": "", "top_level_keys": [], "summary": ""}"#,
    };
    format!(
        "You are a precise document analyst. Summarize the {source_type} input as a \
         single JSON object with exactly this shape:\n{shape}\n\
         Respond with JSON only, no prose, no code fences."
    )
}

/// Strips markdown code fences from a response that claims to contain code.
///
/// When the content carries fences, only fenced lines are kept; content
/// without fences passes through trimmed.
#[must_use]
pub fn strip_code_fences(content: &str) -> String {
    if !content.contains("```") {
        return content.trim().to_string();
    }

    let mut kept = Vec::new();
    let mut in_block = false;
    for line in content.lines() {
        if line.trim_start().starts_with("```") {
            in_block = !in_block;
            continue;
        }
        if in_block {
            kept.push(line);
        }
    }
    kept.join("\n").trim().to_string()
}

/// Cheap structural check on generated code before it is written anywhere.
///
/// # Errors
///
/// Returns [`GenerationError::InvalidOutput`] for empty output or for
/// output missing the minimal marker of its declared type.
pub fn validate_generated(code: &str, code_type: &str) -> Result<(), GenerationError> {
    if code.trim().is_empty() {
        return Err(GenerationError::InvalidOutput {
            code_type: code_type.to_string(),
            reason: "generated code is empty".to_string(),
        });
    }
    match code_type {
        "go" if !code.contains("package") => Err(GenerationError::InvalidOutput {
            code_type: code_type.to_string(),
            reason: "missing package declaration".to_string(),
        }),
        "sql" if !code.to_uppercase().contains("CREATE TABLE")
            && !code.to_uppercase().contains("INSERT")
            && !code.to_uppercase().contains("UPDATE")
            && !code.to_uppercase().contains("DELETE") =>
        {
            Err(GenerationError::InvalidOutput {
                code_type: code_type.to_string(),
                reason: "no recognizable SQL statement".to_string(),
            })
        },
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_varies_by_code_type() {
        assert!(code_system_prompt("go", None).contains("Go programmer"));
        assert!(code_system_prompt("sql", None).contains("SQLite"));
        assert!(code_system_prompt("python", None).contains("PEP 8"));
        assert!(code_system_prompt("code", None).contains("expert programmer"));
        // Unknown types fall back to the generic prompt.
        assert_eq!(
            code_system_prompt("haskell", None),
            code_system_prompt("code", None)
        );
    }

    #[test]
    fn patterns_are_injected_as_json() {
        let patterns = serde_json::json!({"naming": "snake_case"});
        let prompt = code_system_prompt("go", Some(&patterns));
        assert!(prompt.contains("DETECTED PROJECT PATTERNS"));
        assert!(prompt.contains("snake_case"));
    }

    #[test]
    fn digest_prompt_names_the_source_type() {
        assert!(digest_system_prompt("sqlite").contains("sqlite"));
        assert!(digest_system_prompt("markdown").contains("outline"));
    }

    #[test]
    fn strips_fences_keeping_only_fenced_content() {
        let content = "Here is the code:\n```rust\nfn main() {}\n```\nHope it helps!";
        assert_eq!(strip_code_fences(content), "fn main() {}");
    }

    #[test]
    fn unfenced_content_passes_through() {
        assert_eq!(strip_code_fences("  fn main() {}\n"), "fn main() {}");
    }

    #[test]
    fn multiple_fenced_blocks_are_concatenated() {
        let content = "```sql\nCREATE TABLE a (id);\n```\ntext\n```sql\nCREATE TABLE b (id);\n```";
        let stripped = strip_code_fences(content);
        assert!(stripped.contains("CREATE TABLE a"));
        assert!(stripped.contains("CREATE TABLE b"));
        assert!(!stripped.contains("text"));
    }

    #[test]
    fn validate_generated_rejects_empty_and_typeless() {
        assert!(validate_generated("", "go").is_err());
        assert!(validate_generated("fmt.Println(1)", "go").is_err());
        assert!(validate_generated("package main", "go").is_ok());
        assert!(validate_generated("hello", "sql").is_err());
        assert!(validate_generated("CREATE TABLE t (id);", "sql").is_ok());
        assert!(validate_generated("insert into t values (1)", "sql").is_ok());
        assert!(validate_generated("anything", "python").is_ok());
    }
}
