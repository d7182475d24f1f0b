//! Typed repository over the output database: published results,
//! heartbeat, metrics, and reader digests. The latency histogram shares
//! this database but lives in [`crate::metrics`].

use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::{lock, now_unix, SharedConnection};
use crate::error::Result;

/// A heartbeat row older than this many seconds and belonging to a
/// different worker is a zombie.
pub const ZOMBIE_CUTOFF_SECS: i64 = 120;

/// One `heartbeat` row.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatRow {
    pub worker_id: String,
    pub timestamp: i64,
    pub status: String,
    pub sessions_active: i64,
    pub sessions_completed: i64,
    pub cache_hit_rate: f64,
}

#[derive(Clone)]
pub struct OutputStore {
    conn: SharedConnection,
}

impl OutputStore {
    #[must_use]
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    // -- Results ------------------------------------------------------------

    pub fn publish_result(
        &self,
        hash: &str,
        session_id: &str,
        blocks_committed: i64,
        data_json: &str,
    ) -> Result<()> {
        lock(&self.conn).execute(
            "INSERT OR IGNORE INTO results (hash, session_id, blocks_committed, data_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![hash, session_id, blocks_committed, data_json, now_unix()],
        )?;
        Ok(())
    }

    pub fn get_result(&self, hash: &str) -> Result<Option<String>> {
        let data = lock(&self.conn)
            .query_row(
                "SELECT data_json FROM results WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    // -- Heartbeat ----------------------------------------------------------

    /// Reaps zombie rows, then inserts or replaces this worker's heartbeat.
    pub fn write_heartbeat(&self, row: &HeartbeatRow) -> Result<usize> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let reaped = tx.execute(
            "DELETE FROM heartbeat WHERE timestamp < ?1 AND worker_id != ?2",
            params![row.timestamp - ZOMBIE_CUTOFF_SECS, row.worker_id],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO heartbeat
             (worker_id, timestamp, status, sessions_active, sessions_completed, cache_hit_rate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.worker_id,
                row.timestamp,
                row.status,
                row.sessions_active,
                row.sessions_completed,
                row.cache_hit_rate
            ],
        )?;
        tx.commit()?;
        Ok(reaped)
    }

    pub fn get_heartbeat(&self, worker_id: &str) -> Result<Option<HeartbeatRow>> {
        let row = lock(&self.conn)
            .query_row(
                "SELECT worker_id, timestamp, status, sessions_active, sessions_completed,
                        cache_hit_rate
                 FROM heartbeat WHERE worker_id = ?1",
                params![worker_id],
                |row| {
                    Ok(HeartbeatRow {
                        worker_id: row.get(0)?,
                        timestamp: row.get(1)?,
                        status: row.get(2)?,
                        sessions_active: row.get(3)?,
                        sessions_completed: row.get(4)?,
                        cache_hit_rate: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn heartbeat_count(&self) -> Result<i64> {
        let count = lock(&self.conn).query_row("SELECT COUNT(*) FROM heartbeat", [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    /// Seeds an arbitrary heartbeat row; used by tests and tooling.
    pub fn seed_heartbeat(&self, row: &HeartbeatRow) -> Result<()> {
        lock(&self.conn).execute(
            "INSERT OR REPLACE INTO heartbeat
             (worker_id, timestamp, status, sessions_active, sessions_completed, cache_hit_rate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.worker_id,
                row.timestamp,
                row.status,
                row.sessions_active,
                row.sessions_completed,
                row.cache_hit_rate
            ],
        )?;
        Ok(())
    }

    // -- Metrics ------------------------------------------------------------

    pub fn record_metric(&self, metric_name: &str, metric_value: f64) -> Result<()> {
        lock(&self.conn).execute(
            "INSERT INTO metrics (timestamp, metric_name, metric_value) VALUES (?1, ?2, ?3)",
            params![now_unix(), metric_name, metric_value],
        )?;
        Ok(())
    }

    /// Per-metric `count/avg/min/max` over rows at or after `since`.
    pub fn aggregated_metrics(&self, since: i64) -> Result<serde_json::Value> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT metric_name, COUNT(*), AVG(metric_value), MIN(metric_value), MAX(metric_value)
             FROM metrics WHERE timestamp >= ?1 GROUP BY metric_name",
        )?;
        let mut result = serde_json::Map::new();
        let rows = stmt.query_map(params![since], |row| {
            let name: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let avg: f64 = row.get(2)?;
            let min: f64 = row.get(3)?;
            let max: f64 = row.get(4)?;
            Ok((name, count, avg, min, max))
        })?;
        for row in rows {
            let (name, count, avg, min, max) = row?;
            result.insert(
                name,
                serde_json::json!({"count": count, "avg": avg, "min": min, "max": max}),
            );
        }
        Ok(serde_json::Value::Object(result))
    }

    // -- Reader digests -----------------------------------------------------

    pub fn publish_digest(
        &self,
        hash: &str,
        source_type: &str,
        source_path: &str,
        digest_json: &str,
    ) -> Result<()> {
        lock(&self.conn).execute(
            "INSERT OR REPLACE INTO reader_digests
             (hash, source_type, source_path, digest_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![hash, source_type, source_path, digest_json, now_unix()],
        )?;
        Ok(())
    }

    pub fn get_digest(&self, hash: &str) -> Result<Option<String>> {
        let digest = lock(&self.conn)
            .query_row(
                "SELECT digest_json FROM reader_digests WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::write_schema_files;
    use super::super::Databases;
    use super::*;

    fn store() -> (tempfile::TempDir, OutputStore) {
        let dir = tempfile::tempdir().unwrap();
        write_schema_files(dir.path());
        let dbs = Databases::open(dir.path()).unwrap();
        (dir, OutputStore::new(dbs.output))
    }

    fn heartbeat(worker_id: &str, timestamp: i64) -> HeartbeatRow {
        HeartbeatRow {
            worker_id: worker_id.to_string(),
            timestamp,
            status: "running".to_string(),
            sessions_active: 0,
            sessions_completed: 0,
            cache_hit_rate: 0.0,
        }
    }

    #[test]
    fn heartbeat_reaps_zombies_but_not_self_or_fresh() {
        let (_dir, store) = store();
        let now = now_unix();

        store.seed_heartbeat(&heartbeat("zombie", now - 300)).unwrap();
        store.seed_heartbeat(&heartbeat("fresh", now - 30)).unwrap();

        let reaped = store.write_heartbeat(&heartbeat("self", now)).unwrap();
        assert_eq!(reaped, 1);
        assert!(store.get_heartbeat("zombie").unwrap().is_none());
        assert!(store.get_heartbeat("fresh").unwrap().is_some());
        let own = store.get_heartbeat("self").unwrap().unwrap();
        assert_eq!(own.status, "running");
    }

    #[test]
    fn own_stale_row_is_replaced_not_reaped() {
        let (_dir, store) = store();
        let now = now_unix();
        store.seed_heartbeat(&heartbeat("self", now - 500)).unwrap();
        store.write_heartbeat(&heartbeat("self", now)).unwrap();
        assert_eq!(store.heartbeat_count().unwrap(), 1);
        assert_eq!(store.get_heartbeat("self").unwrap().unwrap().timestamp, now);
    }

    #[test]
    fn results_are_write_once() {
        let (_dir, store) = store();
        store.publish_result("h", "s1", 2, r#"{"a":1}"#).unwrap();
        store.publish_result("h", "s1", 9, r#"{"a":2}"#).unwrap();
        assert_eq!(store.get_result("h").unwrap().unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn metrics_aggregate() {
        let (_dir, store) = store();
        store.record_metric("tokens", 10.0).unwrap();
        store.record_metric("tokens", 30.0).unwrap();
        let aggregated = store.aggregated_metrics(0).unwrap();
        let tokens = &aggregated["tokens"];
        assert_eq!(tokens["count"], 2);
        assert_eq!(tokens["avg"], 20.0);
        assert_eq!(tokens["max"], 30.0);
    }

    #[test]
    fn digest_round_trip() {
        let (_dir, store) = store();
        store
            .publish_digest("h", "markdown", "/tmp/a.md", r#"{"ok":true}"#)
            .unwrap();
        assert_eq!(
            store.get_digest("h").unwrap().unwrap(),
            r#"{"ok":true}"#
        );
    }
}
