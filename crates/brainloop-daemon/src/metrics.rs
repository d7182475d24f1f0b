//! Latency histogram persistence.
//!
//! Samples are aggregated as `(operation, bucket_ms, count)` rows per
//! one-minute window in the output database; the bucket set and the
//! percentile math live in `brainloop_core::latency`.

use brainloop_core::latency::{bucket_for, percentile, window_start, LATENCY_BUCKETS_MS};
use rusqlite::params;
use serde::Serialize;

use crate::error::Result;
use crate::storage::{lock, now_unix, SharedConnection};

/// Percentiles for one operation over a trailing window.
#[derive(Debug, Clone, Serialize)]
pub struct Percentiles {
    pub operation: String,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: i64,
    pub window_minutes: i64,
}

/// Approximate summary statistics for one operation.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSummary {
    pub operation: String,
    pub total_samples: i64,
    pub min_bucket_ms: i64,
    pub max_bucket_ms: i64,
    pub avg_latency_ms: f64,
    pub stddev_latency_ms: f64,
}

/// One bucket's share of an operation's samples.
#[derive(Debug, Clone, Serialize)]
pub struct BucketShare {
    pub bucket_ms: i64,
    pub count: i64,
    pub percentage: f64,
    pub cumulative: f64,
}

#[derive(Clone)]
pub struct Histogram {
    conn: SharedConnection,
}

impl Histogram {
    #[must_use]
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Records one latency sample into the current minute window.
    pub fn record(&self, operation: &str, latency_ms: i64) -> Result<()> {
        let bucket = bucket_for(latency_ms);
        let window = window_start(now_unix());
        lock(&self.conn).execute(
            "INSERT INTO latency_histogram (operation, bucket_ms, count, timestamp)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(operation, bucket_ms, timestamp)
             DO UPDATE SET count = count + 1",
            params![operation, bucket, window],
        )?;
        Ok(())
    }

    /// Computes p50/p95/p99 for `operation` over the trailing
    /// `window_minutes`. Returns `None` when the window holds no samples.
    pub fn percentiles(
        &self,
        operation: &str,
        window_minutes: i64,
    ) -> Result<Option<Percentiles>> {
        let rows = self.bucket_rows(operation, window_minutes)?;
        let count: i64 = rows.iter().map(|(_, c)| c).sum();
        let (Some(p50), Some(p95), Some(p99)) = (
            percentile(&rows, 0.50),
            percentile(&rows, 0.95),
            percentile(&rows, 0.99),
        ) else {
            return Ok(None);
        };

        Ok(Some(Percentiles {
            operation: operation.to_string(),
            p50,
            p95,
            p99,
            count,
            window_minutes,
        }))
    }

    /// Percentiles for every operation seen in the window.
    pub fn all_percentiles(&self, window_minutes: i64) -> Result<Vec<Percentiles>> {
        let since = window_start(now_unix()) - window_minutes * 60;
        let operations: Vec<String> = {
            let conn = lock(&self.conn);
            let mut stmt = conn.prepare(
                "SELECT DISTINCT operation FROM latency_histogram WHERE timestamp >= ?1",
            )?;
            let ops = stmt
                .query_map(params![since], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ops
        };

        let mut results = Vec::with_capacity(operations.len());
        for operation in operations {
            if let Some(p) = self.percentiles(&operation, window_minutes)? {
                results.push(p);
            }
        }
        Ok(results)
    }

    /// Summary statistics for one operation, approximated from bucket
    /// upper bounds.
    pub fn summary(
        &self,
        operation: &str,
        window_minutes: i64,
    ) -> Result<Option<HistogramSummary>> {
        let rows = self.bucket_rows(operation, window_minutes)?;
        let total: i64 = rows.iter().map(|(_, c)| c).sum();
        if total == 0 {
            return Ok(None);
        }

        let mut sum = 0.0;
        let mut sum_squares = 0.0;
        for (bucket, count) in &rows {
            let value = *bucket as f64;
            sum += value * *count as f64;
            sum_squares += value * value * *count as f64;
        }
        let avg = sum / total as f64;
        let variance = (sum_squares / total as f64) - avg * avg;

        Ok(Some(HistogramSummary {
            operation: operation.to_string(),
            total_samples: total,
            min_bucket_ms: rows.first().map_or(0, |(b, _)| *b),
            max_bucket_ms: rows.last().map_or(0, |(b, _)| *b),
            avg_latency_ms: avg,
            stddev_latency_ms: variance.max(0.0).sqrt(),
        }))
    }

    /// Per-bucket share and cumulative share for one operation.
    pub fn bucket_distribution(
        &self,
        operation: &str,
        window_minutes: i64,
    ) -> Result<Vec<BucketShare>> {
        let rows = self.bucket_rows(operation, window_minutes)?;
        let total: i64 = rows.iter().map(|(_, c)| c).sum();
        if total == 0 {
            return Ok(Vec::new());
        }

        let mut cumulative = 0i64;
        Ok(rows
            .into_iter()
            .map(|(bucket, count)| {
                cumulative += count;
                BucketShare {
                    bucket_ms: bucket,
                    count,
                    percentage: count as f64 / total as f64 * 100.0,
                    cumulative: cumulative as f64 / total as f64 * 100.0,
                }
            })
            .collect())
    }

    fn bucket_rows(&self, operation: &str, window_minutes: i64) -> Result<Vec<(i64, i64)>> {
        let since = window_start(now_unix()) - window_minutes * 60;
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT bucket_ms, SUM(count) FROM latency_histogram
             WHERE operation = ?1 AND timestamp >= ?2
             GROUP BY bucket_ms ORDER BY bucket_ms ASC",
        )?;
        let rows = stmt
            .query_map(params![operation, since], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Deletes rows older than the retention window; returns the count
    /// removed.
    pub fn cleanup(&self, retention_days: i64) -> Result<usize> {
        let cutoff = now_unix() - retention_days * 24 * 3600;
        let removed = lock(&self.conn).execute(
            "DELETE FROM latency_histogram WHERE timestamp < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    /// Verifies that persisted buckets come from the fixed set; used by
    /// startup validation tooling.
    pub fn buckets_are_valid(&self) -> Result<bool> {
        let placeholders = LATENCY_BUCKETS_MS
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let invalid: i64 = lock(&self.conn).query_row(
            &format!(
                "SELECT COUNT(*) FROM latency_histogram WHERE bucket_ms NOT IN ({placeholders})"
            ),
            [],
            |row| row.get(0),
        )?;
        Ok(invalid == 0)
    }
}
