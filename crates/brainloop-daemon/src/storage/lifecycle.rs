//! Typed repository over the lifecycle database.
//!
//! Owns sessions, blocks, refinements, the processed-log idempotency
//! ledger, the reader cache, and completion-API usage rows. Every write
//! touching more than one row runs inside an explicit transaction.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::{lock, now_unix, SharedConnection};
use crate::error::{Error, Result};

/// Session statuses as stored.
pub const STATUS_PENDING_AUDIT: &str = "pending_audit";
pub const STATUS_COMMITTED: &str = "committed";
pub const STATUS_ABANDONED: &str = "abandoned";

/// Block statuses as stored.
pub const BLOCK_PENDING: &str = "pending";
pub const BLOCK_COMMITTED: &str = "committed";

/// One `sessions` row.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRow {
    pub session_id: String,
    pub status: String,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

/// One `session_blocks` row.
#[derive(Debug, Clone, Serialize)]
pub struct BlockRow {
    pub block_id: String,
    pub session_id: String,
    pub description: String,
    #[serde(rename = "type")]
    pub block_type: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub iterations: i64,
    pub status: String,
    pub generated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refined_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<i64>,
}

/// One `processed_log` row.
#[derive(Debug, Clone)]
pub struct ProcessedEntry {
    pub hash: String,
    pub operation: String,
    pub timestamp: i64,
    pub result_json: Option<String>,
}

/// Counters the heartbeat reports, computed from this database.
#[derive(Debug, Clone, Copy)]
pub struct SessionCounts {
    pub active: i64,
    pub completed: i64,
    pub cache_hit_rate: f64,
}

#[derive(Clone)]
pub struct LifecycleStore {
    conn: SharedConnection,
}

impl LifecycleStore {
    #[must_use]
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    // -- Sessions -----------------------------------------------------------

    pub fn create_session(&self, session_id: &str) -> Result<()> {
        lock(&self.conn).execute(
            "INSERT INTO sessions (session_id, status, created_at) VALUES (?1, ?2, ?3)",
            params![session_id, STATUS_PENDING_AUDIT, now_unix()],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>> {
        let row = lock(&self.conn)
            .query_row(
                "SELECT session_id, status, created_at, completed_at
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionRow {
                        session_id: row.get(0)?,
                        status: row.get(1)?,
                        created_at: row.get(2)?,
                        completed_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Transitions a session to a terminal status and stamps
    /// `completed_at`.
    pub fn finish_session(&self, session_id: &str, status: &str) -> Result<()> {
        lock(&self.conn).execute(
            "UPDATE sessions SET status = ?1, completed_at = ?2 WHERE session_id = ?3",
            params![status, now_unix(), session_id],
        )?;
        Ok(())
    }

    // -- Blocks -------------------------------------------------------------

    pub fn create_block(
        &self,
        block_id: &str,
        session_id: &str,
        description: &str,
        block_type: &str,
        target: &str,
    ) -> Result<()> {
        lock(&self.conn).execute(
            "INSERT INTO session_blocks
             (block_id, session_id, description, type, target, status, iterations, generated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                block_id,
                session_id,
                description,
                block_type,
                target,
                BLOCK_PENDING,
                now_unix()
            ],
        )?;
        Ok(())
    }

    pub fn get_block(&self, block_id: &str) -> Result<Option<BlockRow>> {
        let row = lock(&self.conn)
            .query_row(
                "SELECT block_id, session_id, description, type, target, code, iterations,
                        status, generated_at, last_refined_at, committed_at
                 FROM session_blocks WHERE block_id = ?1",
                params![block_id],
                Self::map_block,
            )
            .optional()?;
        Ok(row)
    }

    pub fn blocks_for_session(&self, session_id: &str) -> Result<Vec<BlockRow>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT block_id, session_id, description, type, target, code, iterations,
                    status, generated_at, last_refined_at, committed_at
             FROM session_blocks WHERE session_id = ?1 ORDER BY generated_at, block_id",
        )?;
        let rows = stmt
            .query_map(params![session_id], Self::map_block)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn map_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlockRow> {
        Ok(BlockRow {
            block_id: row.get(0)?,
            session_id: row.get(1)?,
            description: row.get(2)?,
            block_type: row.get(3)?,
            target: row.get(4)?,
            code: row.get(5)?,
            iterations: row.get(6)?,
            status: row.get(7)?,
            generated_at: row.get(8)?,
            last_refined_at: row.get(9)?,
            committed_at: row.get(10)?,
        })
    }

    /// Stores newly generated code on a block, bumping `iterations`.
    pub fn update_block_code(&self, block_id: &str, code: &str) -> Result<()> {
        let changed = lock(&self.conn).execute(
            "UPDATE session_blocks
             SET code = ?1, iterations = iterations + 1, last_refined_at = ?2
             WHERE block_id = ?3",
            params![code, now_unix(), block_id],
        )?;
        if changed == 0 {
            return Err(Error::InvalidInput(format!("unknown block {block_id}")));
        }
        Ok(())
    }

    /// Records a refinement row and the refined code on the block, in one
    /// transaction.
    pub fn record_refinement(
        &self,
        refinement_id: &str,
        block_id: &str,
        feedback: &str,
        temperature: f64,
        refined_code: &str,
    ) -> Result<()> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let now = now_unix();
        tx.execute(
            "INSERT INTO block_refinements
             (refinement_id, block_id, feedback, temperature, refined_code, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![refinement_id, block_id, feedback, temperature, refined_code, now],
        )?;
        let changed = tx.execute(
            "UPDATE session_blocks
             SET code = ?1, iterations = iterations + 1, last_refined_at = ?2
             WHERE block_id = ?3",
            params![refined_code, now, block_id],
        )?;
        if changed == 0 {
            return Err(Error::InvalidInput(format!("unknown block {block_id}")));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn refinements_for_block(&self, block_id: &str) -> Result<i64> {
        let count = lock(&self.conn).query_row(
            "SELECT COUNT(*) FROM block_refinements WHERE block_id = ?1",
            params![block_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Marks a block committed, stores its final code, and writes the
    /// ledger row, all in one transaction. The ledger insert uses
    /// `INSERT OR IGNORE`: a concurrent commit that lost the race leaves
    /// the first writer's result in place.
    pub fn commit_block(
        &self,
        block_id: &str,
        final_code: &str,
        ledger_hash: &str,
        operation: &str,
        result_json: &str,
    ) -> Result<()> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let now = now_unix();
        tx.execute(
            "UPDATE session_blocks
             SET code = ?1, status = ?2, committed_at = ?3
             WHERE block_id = ?4",
            params![final_code, BLOCK_COMMITTED, now, block_id],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO processed_log (hash, operation, timestamp, result_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![ledger_hash, operation, now, result_json],
        )?;
        tx.commit()?;
        Ok(())
    }

    // -- Idempotency ledger -------------------------------------------------

    pub fn is_processed(&self, hash: &str) -> Result<bool> {
        Ok(self.get_processed(hash)?.is_some())
    }

    pub fn get_processed(&self, hash: &str) -> Result<Option<ProcessedEntry>> {
        let entry = lock(&self.conn)
            .query_row(
                "SELECT hash, operation, timestamp, result_json FROM processed_log WHERE hash = ?1",
                params![hash],
                |row| {
                    Ok(ProcessedEntry {
                        hash: row.get(0)?,
                        operation: row.get(1)?,
                        timestamp: row.get(2)?,
                        result_json: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    /// Records a completed side-effecting operation. Idempotent: a second
    /// call with the same hash is a no-op and the stored result is kept.
    pub fn mark_processed(&self, hash: &str, operation: &str, result_json: &str) -> Result<()> {
        lock(&self.conn).execute(
            "INSERT OR IGNORE INTO processed_log (hash, operation, timestamp, result_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![hash, operation, now_unix(), result_json],
        )?;
        Ok(())
    }

    // -- Reader cache -------------------------------------------------------

    /// Returns the cached digest if present and unexpired.
    pub fn get_cached_digest(&self, hash: &str) -> Result<Option<String>> {
        let row: Option<(String, i64)> = lock(&self.conn)
            .query_row(
                "SELECT digest_json, expires_at FROM reader_cache WHERE hash = ?1",
                params![hash],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((digest, expires_at)) if expires_at > now_unix() => Ok(Some(digest)),
            _ => Ok(None),
        }
    }

    /// Stores a digest with its TTL; expired rows are lazily evicted on
    /// the same write.
    pub fn set_cached_digest(
        &self,
        hash: &str,
        source_type: &str,
        source_path: &str,
        digest_json: &str,
        ttl_seconds: i64,
    ) -> Result<()> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let now = now_unix();
        tx.execute(
            "DELETE FROM reader_cache WHERE expires_at <= ?1",
            params![now],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO reader_cache
             (hash, source_type, source_path, digest_json, cached_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![hash, source_type, source_path, digest_json, now, now + ttl_seconds],
        )?;
        tx.commit()?;
        Ok(())
    }

    // -- Config counters ----------------------------------------------------

    /// Adds `delta` to an integer-valued config counter.
    pub fn bump_counter(&self, key: &str, delta: i64) -> Result<()> {
        lock(&self.conn).execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = CAST(value AS INTEGER) + ?2",
            params![key, delta],
        )?;
        Ok(())
    }

    pub fn counter(&self, key: &str) -> Result<i64> {
        let value: Option<String> = lock(&self.conn)
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.trim().parse().ok()).unwrap_or(0))
    }

    // -- Completion-API usage -----------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn record_usage(
        &self,
        request_id: &str,
        operation: &str,
        model: &str,
        temperature: f64,
        tokens_prompt: i64,
        tokens_completion: i64,
        latency_ms: i64,
    ) -> Result<()> {
        lock(&self.conn).execute(
            "INSERT INTO cerebras_usage
             (request_id, operation, model, temperature, tokens_prompt, tokens_completion,
              latency_ms, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                request_id,
                operation,
                model,
                temperature,
                tokens_prompt,
                tokens_completion,
                latency_ms,
                now_unix()
            ],
        )?;
        Ok(())
    }

    // -- Heartbeat inputs ---------------------------------------------------

    /// Session counts and cache hit rate for the heartbeat row.
    pub fn session_counts(&self) -> Result<SessionCounts> {
        let conn = lock(&self.conn);
        let active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE status = ?1",
            params![STATUS_PENDING_AUDIT],
            |row| row.get(0),
        )?;
        let completed: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE status = ?1",
            params![STATUS_COMMITTED],
            |row| row.get(0),
        )?;
        drop(conn);

        let hits = self.counter("reader_cache_hit")? as f64;
        let misses = self.counter("reader_cache_miss")? as f64;
        let cache_hit_rate = if hits + misses > 0.0 {
            hits / (hits + misses)
        } else {
            0.0
        };

        Ok(SessionCounts {
            active,
            completed,
            cache_hit_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::write_schema_files;
    use super::super::Databases;
    use super::*;

    fn store() -> (tempfile::TempDir, LifecycleStore) {
        let dir = tempfile::tempdir().unwrap();
        write_schema_files(dir.path());
        let dbs = Databases::open(dir.path()).unwrap();
        (dir, LifecycleStore::new(dbs.lifecycle))
    }

    #[test]
    fn session_round_trip() {
        let (_dir, store) = store();
        store.create_session("s1").unwrap();
        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.status, STATUS_PENDING_AUDIT);
        assert!(session.completed_at.is_none());

        store.finish_session("s1", STATUS_COMMITTED).unwrap();
        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.status, STATUS_COMMITTED);
        assert!(session.completed_at.is_some());
    }

    #[test]
    fn block_lifecycle() {
        let (_dir, store) = store();
        store.create_session("s1").unwrap();
        store
            .create_block("b1", "s1", "make a thing", "code", "/tmp/out.txt")
            .unwrap();

        let block = store.get_block("b1").unwrap().unwrap();
        assert_eq!(block.status, BLOCK_PENDING);
        assert_eq!(block.iterations, 0);
        assert!(block.code.is_none());

        store.update_block_code("b1", "fn main() {}").unwrap();
        let block = store.get_block("b1").unwrap().unwrap();
        assert_eq!(block.iterations, 1);
        assert_eq!(block.code.as_deref(), Some("fn main() {}"));
    }

    #[test]
    fn refinement_writes_both_rows_atomically() {
        let (_dir, store) = store();
        store.create_session("s1").unwrap();
        store
            .create_block("b1", "s1", "desc", "code", "/tmp/x")
            .unwrap();
        store.update_block_code("b1", "v1").unwrap();

        store
            .record_refinement("r1", "b1", "tighten it", 0.3, "v2")
            .unwrap();
        let block = store.get_block("b1").unwrap().unwrap();
        assert_eq!(block.code.as_deref(), Some("v2"));
        assert_eq!(block.iterations, 2);
        assert_eq!(store.refinements_for_block("b1").unwrap(), 1);
    }

    #[test]
    fn refinement_on_unknown_block_rolls_back() {
        let (_dir, store) = store();
        let err = store
            .record_refinement("r1", "missing", "fb", 0.3, "code")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn mark_processed_is_idempotent() {
        let (_dir, store) = store();
        store.mark_processed("h1", "commit", r#"{"v":1}"#).unwrap();
        store.mark_processed("h1", "commit", r#"{"v":2}"#).unwrap();

        let entry = store.get_processed("h1").unwrap().unwrap();
        assert_eq!(entry.result_json.as_deref(), Some(r#"{"v":1}"#));
        assert!(store.is_processed("h1").unwrap());
        assert!(!store.is_processed("h2").unwrap());
    }

    #[test]
    fn cache_respects_ttl_and_evicts_lazily() {
        let (_dir, store) = store();
        store
            .set_cached_digest("h1", "markdown", "/tmp/a.md", r#"{"ok":1}"#, 3600)
            .unwrap();
        assert!(store.get_cached_digest("h1").unwrap().is_some());

        // An entry whose TTL has already elapsed is invisible.
        store
            .set_cached_digest("h2", "markdown", "/tmp/b.md", r#"{"ok":2}"#, -1)
            .unwrap();
        assert!(store.get_cached_digest("h2").unwrap().is_none());

        // The next write sweeps it out of the table entirely.
        store
            .set_cached_digest("h3", "markdown", "/tmp/c.md", r#"{"ok":3}"#, 3600)
            .unwrap();
        assert!(store.get_cached_digest("h2").unwrap().is_none());
    }

    #[test]
    fn counters_accumulate() {
        let (_dir, store) = store();
        assert_eq!(store.counter("reader_cache_hit").unwrap(), 0);
        store.bump_counter("reader_cache_hit", 1).unwrap();
        store.bump_counter("reader_cache_hit", 1).unwrap();
        assert_eq!(store.counter("reader_cache_hit").unwrap(), 2);
    }

    #[test]
    fn session_counts_reflect_statuses() {
        let (_dir, store) = store();
        store.create_session("a").unwrap();
        store.create_session("b").unwrap();
        store.finish_session("b", STATUS_COMMITTED).unwrap();
        store.bump_counter("reader_cache_hit", 3).unwrap();
        store.bump_counter("reader_cache_miss", 1).unwrap();

        let counts = store.session_counts().unwrap();
        assert_eq!(counts.active, 1);
        assert_eq!(counts.completed, 1);
        assert!((counts.cache_hit_rate - 0.75).abs() < 1e-9);
    }
}
