//! Structured file digests with an mtime-keyed cache.
//!
//! The four readers (sqlite, markdown, code, config) produce structured
//! JSON digests of local sources. Every read goes through the reader
//! cache: the key is `SHA-256(path || mtime)`, so an edited file misses
//! naturally, and entries expire after a TTL. Fresh digests are published
//! to `reader_digests` in the output database.

use std::path::Path;

use rusqlite::Connection;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::storage::{LifecycleStore, OutputStore};

/// Cache TTL for digests, in seconds.
pub const DIGEST_TTL_SECS: i64 = 3600;

/// Default row sample size for sqlite digests.
pub const DEFAULT_SAMPLE_ROWS: usize = 5;

/// The supported source types, dispatched as a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Sqlite,
    Markdown,
    Code,
    Config,
}

impl SourceType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Markdown => "markdown",
            Self::Code => "code",
            Self::Config => "config",
        }
    }
}

pub struct ReaderHub {
    lifecycle: LifecycleStore,
    output: OutputStore,
}

impl ReaderHub {
    #[must_use]
    pub fn new(lifecycle: LifecycleStore, output: OutputStore) -> Self {
        Self { lifecycle, output }
    }

    /// Reads one source, serving from cache when the file is unchanged
    /// and the entry is unexpired.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when the file does not exist or cannot be parsed as
    /// its source type.
    pub fn read(
        &self,
        source_type: SourceType,
        path: &str,
        sample_rows: Option<usize>,
    ) -> Result<serde_json::Value> {
        let hash = source_hash(path)?;

        if let Some(cached) = self.lifecycle.get_cached_digest(&hash)? {
            self.lifecycle.bump_counter("reader_cache_hit", 1)?;
            if let Err(err) = self.output.record_metric("reader_cache_hit", 1.0) {
                tracing::warn!(error = %err, "failed to record cache hit metric");
            }
            return serde_json::from_str(&cached)
                .map_err(|e| Error::ExternalFailure(format!("cached digest unreadable: {e}")));
        }
        self.lifecycle.bump_counter("reader_cache_miss", 1)?;
        if let Err(err) = self.output.record_metric("reader_cache_miss", 1.0) {
            tracing::warn!(error = %err, "failed to record cache miss metric");
        }

        let digest = match source_type {
            SourceType::Sqlite => {
                digest_sqlite(path, sample_rows.unwrap_or(DEFAULT_SAMPLE_ROWS))?
            },
            SourceType::Markdown => digest_markdown(path)?,
            SourceType::Code => digest_code(path)?,
            SourceType::Config => digest_config(path)?,
        };

        let rendered = digest.to_string();
        self.lifecycle.set_cached_digest(
            &hash,
            source_type.as_str(),
            path,
            &rendered,
            DIGEST_TTL_SECS,
        )?;
        self.output
            .publish_digest(&hash, source_type.as_str(), path, &rendered)?;
        Ok(digest)
    }
}

/// `SHA-256(path || mtime)` — the cache key. Changes whenever the file is
/// touched.
fn source_hash(path: &str) -> Result<String> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| Error::InvalidInput(format!("cannot stat {path}: {e}")))?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(mtime.to_string().as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Summarizes a SQLite database: tables, row counts, columns, and a small
/// row sample per table.
fn digest_sqlite(path: &str, sample_rows: usize) -> Result<serde_json::Value> {
    if !Path::new(path).exists() {
        return Err(Error::InvalidInput(format!("no such database: {path}")));
    }
    let conn = Connection::open_with_flags(
        path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )
    .map_err(|e| Error::InvalidInput(format!("cannot open {path}: {e}")))?;

    let table_names: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table'
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        names
    };

    let mut tables = Vec::with_capacity(table_names.len());
    for name in &table_names {
        // Table names come from sqlite_master, not the caller.
        let row_count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM \"{name}\""), [], |r| r.get(0))?;

        let mut columns = Vec::new();
        let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{name}\")"))?;
        let infos = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        for info in infos {
            let (col, col_type) = info?;
            columns.push(json!({"name": col, "type": col_type}));
        }

        let mut sample = Vec::new();
        if sample_rows > 0 && row_count > 0 {
            let mut stmt =
                conn.prepare(&format!("SELECT * FROM \"{name}\" LIMIT {sample_rows}"))?;
            let column_count = stmt.column_count();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    let value: rusqlite::types::Value = row.get(i)?;
                    values.push(render_sql_value(&value));
                }
                sample.push(serde_json::Value::Array(values));
            }
        }

        tables.push(json!({
            "name": name,
            "row_count": row_count,
            "columns": columns,
            "sample": sample,
        }));
    }

    Ok(json!({
        "source_type": "sqlite",
        "path": path,
        "table_count": table_names.len(),
        "tables": tables,
    }))
}

fn render_sql_value(value: &rusqlite::types::Value) -> serde_json::Value {
    use rusqlite::types::Value;
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => json!(i),
        Value::Real(f) => json!(f),
        Value::Text(s) => json!(s),
        Value::Blob(b) => json!(format!("<{} bytes>", b.len())),
    }
}

/// Summarizes a markdown file: heading outline, link and code-block
/// counts.
fn digest_markdown(path: &str) -> Result<serde_json::Value> {
    let contents = read_source(path)?;
    let mut outline = Vec::new();
    let mut code_blocks = 0usize;
    let mut in_fence = false;

    for line in contents.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            if !in_fence {
                code_blocks += 1;
            }
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if trimmed.starts_with('#') {
            let level = trimmed.chars().take_while(|c| *c == '#').count();
            let title = trimmed.trim_start_matches('#').trim();
            if !title.is_empty() && level <= 6 {
                outline.push(json!({"level": level, "title": title}));
            }
        }
    }

    let link_count = contents.matches("](").count();
    Ok(json!({
        "source_type": "markdown",
        "path": path,
        "outline": outline,
        "link_count": link_count,
        "code_blocks": code_blocks,
        "line_count": contents.lines().count(),
    }))
}

/// Summarizes a source file: language, declaration names, TODO count.
fn digest_code(path: &str) -> Result<serde_json::Value> {
    let contents = read_source(path)?;
    let language = match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("rs") => "rust",
        Some("go") => "go",
        Some("py") => "python",
        Some("js" | "mjs") => "javascript",
        Some("ts") => "typescript",
        Some("sql") => "sql",
        Some("sh") => "shell",
        _ => "unknown",
    };

    let mut declarations = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim_start();
        for prefix in ["fn ", "pub fn ", "func ", "def ", "function ", "class "] {
            if let Some(rest) = trimmed.strip_prefix(prefix) {
                let name: String = rest
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '_')
                    .collect();
                if !name.is_empty() {
                    declarations.push(name);
                }
                break;
            }
        }
    }

    let todo_count = contents
        .lines()
        .filter(|l| l.contains("TODO") || l.contains("FIXME"))
        .count();

    Ok(json!({
        "source_type": "code",
        "path": path,
        "language": language,
        "line_count": contents.lines().count(),
        "declarations": declarations,
        "todo_count": todo_count,
    }))
}

/// Summarizes a configuration file: detected format and top-level keys.
fn digest_config(path: &str) -> Result<serde_json::Value> {
    let contents = read_source(path)?;
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    let (format, keys) = if extension == "json" {
        let parsed: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|e| Error::InvalidInput(format!("invalid JSON in {path}: {e}")))?;
        let keys = parsed
            .as_object()
            .map(|o| o.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        ("json", keys)
    } else {
        // TOML / YAML / ini: top-level keys are unindented `key = ...`,
        // `key: ...`, or `[section]` lines outside comments.
        let format = match extension {
            "toml" => "toml",
            "yaml" | "yml" => "yaml",
            _ => "ini",
        };
        let mut keys = Vec::new();
        for line in contents.lines() {
            if line.starts_with([' ', '\t', '#', ';']) || line.trim().is_empty() {
                continue;
            }
            let trimmed = line.trim();
            if let Some(section) = trimmed.strip_prefix('[') {
                if let Some(name) = section.strip_suffix(']') {
                    keys.push(name.trim().to_string());
                    continue;
                }
            }
            if let Some((key, _)) = trimmed.split_once(['=', ':']) {
                let key = key.trim();
                if !key.is_empty() {
                    keys.push(key.to_string());
                }
            }
        }
        (format, keys)
    };

    Ok(json!({
        "source_type": "config",
        "path": path,
        "format": format,
        "top_level_keys": keys,
    }))
}

fn read_source(path: &str) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::InvalidInput(format!("cannot read {path}: {e}")))
}
