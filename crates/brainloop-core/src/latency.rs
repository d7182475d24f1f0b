//! Fixed-bucket latency histogram math.
//!
//! Buckets are upper bounds in milliseconds; the largest bucket absorbs
//! overflow. Samples are aggregated per operation per one-minute window;
//! the daemon persists `(operation, bucket_ms, count, window)` rows and
//! calls back into [`percentile`] to answer queries.

/// Histogram bucket upper bounds, in milliseconds.
pub const LATENCY_BUCKETS_MS: [i64; 7] = [10, 50, 100, 500, 1000, 5000, 10000];

/// Maps a latency to the smallest bucket that holds it. Values beyond the
/// largest bucket land in the largest bucket.
#[must_use]
pub fn bucket_for(latency_ms: i64) -> i64 {
    for bucket in LATENCY_BUCKETS_MS {
        if latency_ms <= bucket {
            return bucket;
        }
    }
    LATENCY_BUCKETS_MS[LATENCY_BUCKETS_MS.len() - 1]
}

/// Start of the one-minute aggregation window containing `now` (unix
/// seconds).
#[must_use]
pub const fn window_start(now: i64) -> i64 {
    now / 60 * 60
}

/// Computes the `p`-th percentile (`0 < p <= 1`) from `(bucket_ms, count)`
/// rows sorted ascending by bucket.
///
/// The target sample is `ceil(p * total)`; the value is linearly
/// interpolated inside the bucket that contains it, using the previous
/// bucket's upper bound as the lower edge. Returns `None` when there are
/// no samples.
#[must_use]
pub fn percentile(rows: &[(i64, i64)], p: f64) -> Option<f64> {
    let total: i64 = rows.iter().map(|(_, count)| count).sum();
    if total == 0 {
        return None;
    }

    let target = (p * total as f64).ceil() as i64;
    let mut cumulative = 0i64;

    for (bucket, count) in rows {
        cumulative += count;
        if cumulative >= target && *count > 0 {
            let prev_cumulative = cumulative - count;
            let ratio = (target - prev_cumulative) as f64 / *count as f64;
            let lower = previous_bucket(*bucket);
            return Some(lower as f64 + ratio * (*bucket - lower) as f64);
        }
    }

    rows.last().map(|(bucket, _)| *bucket as f64)
}

fn previous_bucket(bucket: i64) -> i64 {
    let mut prev = 0;
    for b in LATENCY_BUCKETS_MS {
        if b == bucket {
            return prev;
        }
        prev = b;
    }
    0
}
