//! Token-bucket rate limiting with exponential backoff.
//!
//! The bucket holds `requests_per_minute` tokens and refills to capacity
//! once per minute. Consecutive upstream errors open a backoff window of
//! `min(2^n, 300)` seconds during which acquisition fails immediately; a
//! recorded success closes the window and resets the counter.
//!
//! [`retry_with_backoff`] is the companion retry loop used by the
//! generation gateway: each attempt goes through [`RateLimiter::wait`],
//! failures sleep an exponentially growing interval, and the whole loop
//! aborts promptly on cancellation.

use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Ceiling for the error-driven backoff window.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

const REFILL_PERIOD: Duration = Duration::from_secs(60);

/// Rate-limit acquisition failures.
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limited: backoff active for {remaining:?}")]
    BackoffActive { remaining: Duration },

    #[error("rate limited: no token before deadline")]
    DeadlineExceeded,

    #[error("rate limit wait cancelled")]
    Cancelled,
}

#[derive(Debug)]
struct Inner {
    tokens: u32,
    last_refill: Instant,
    consecutive_errors: u32,
    backoff_until: Option<Instant>,
}

/// Token bucket sized to requests-per-minute, with error backoff.
///
/// Thread-safe; the daemon holds one instance shared by every generation
/// path.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    /// Creates a limiter with the given requests-per-minute capacity.
    /// Non-positive capacities fall back to 60.
    #[must_use]
    pub fn new(requests_per_minute: u32) -> Self {
        let capacity = if requests_per_minute == 0 {
            60
        } else {
            requests_per_minute
        };
        Self {
            capacity,
            inner: Mutex::new(Inner {
                tokens: capacity,
                last_refill: Instant::now(),
                consecutive_errors: 0,
                backoff_until: None,
            }),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Attempts to take a token without waiting. Returns `false` while in
    /// backoff or when the bucket is empty.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        let now = Instant::now();
        if Self::in_backoff(&inner, now) {
            return false;
        }
        Self::refill_if_due(&mut inner, self.capacity, now);
        if inner.tokens > 0 {
            inner.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Waits for a token, up to `deadline`.
    ///
    /// # Errors
    ///
    /// - [`RateLimitError::BackoffActive`] immediately while an error
    ///   backoff window is open.
    /// - [`RateLimitError::DeadlineExceeded`] if no token becomes
    ///   available in time.
    /// - [`RateLimitError::Cancelled`] when `cancel` fires first.
    pub async fn wait(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), RateLimitError> {
        loop {
            let next_refill = {
                let mut inner = self.lock();
                let now = Instant::now();
                if let Some(until) = inner.backoff_until {
                    if now < until {
                        return Err(RateLimitError::BackoffActive {
                            remaining: until - now,
                        });
                    }
                }
                Self::refill_if_due(&mut inner, self.capacity, now);
                if inner.tokens > 0 {
                    inner.tokens -= 1;
                    return Ok(());
                }
                inner.last_refill + REFILL_PERIOD
            };

            let wake = next_refill.min(deadline);
            if wake >= deadline && Instant::now() >= deadline {
                return Err(RateLimitError::DeadlineExceeded);
            }

            tokio::select! {
                () = tokio::time::sleep_until(wake) => {
                    if Instant::now() >= deadline {
                        // One last non-blocking attempt at the boundary.
                        if self.try_acquire() {
                            return Ok(());
                        }
                        return Err(RateLimitError::DeadlineExceeded);
                    }
                }
                () = cancel.cancelled() => return Err(RateLimitError::Cancelled),
            }
        }
    }

    /// Records a successful upstream call: clears backoff and the error
    /// counter.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_errors = 0;
        inner.backoff_until = None;
    }

    /// Records a failed upstream call and opens (or widens) the backoff
    /// window to `min(2^n, 300)` seconds.
    pub fn record_error(&self) {
        let mut inner = self.lock();
        inner.consecutive_errors = inner.consecutive_errors.saturating_add(1);
        let exp = inner.consecutive_errors.min(16);
        let backoff = Duration::from_secs(1u64 << exp).min(MAX_BACKOFF);
        inner.backoff_until = Some(Instant::now() + backoff);
    }

    /// Remaining backoff window, if one is open.
    #[must_use]
    pub fn backoff_remaining(&self) -> Option<Duration> {
        let inner = self.lock();
        let now = Instant::now();
        inner
            .backoff_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.lock().consecutive_errors
    }

    /// Point-in-time snapshot for `get_stats` reporting.
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        let mut inner = self.lock();
        let now = Instant::now();
        Self::refill_if_due(&mut inner, self.capacity, now);
        RateLimiterStats {
            requests_per_minute: self.capacity,
            tokens_available: inner.tokens,
            consecutive_errors: inner.consecutive_errors,
            in_backoff: Self::in_backoff(&inner, now),
            backoff_remaining: inner
                .backoff_until
                .filter(|until| *until > now)
                .map(|until| until - now),
        }
    }

    /// Clears the backoff window without recording a success; operator
    /// escape hatch.
    pub fn reset_backoff(&self) {
        let mut inner = self.lock();
        inner.consecutive_errors = 0;
        inner.backoff_until = None;
    }

    fn in_backoff(inner: &Inner, now: Instant) -> bool {
        inner.backoff_until.is_some_and(|until| now < until)
    }

    fn refill_if_due(inner: &mut Inner, capacity: u32, now: Instant) {
        if now.duration_since(inner.last_refill) >= REFILL_PERIOD {
            inner.tokens = capacity;
            inner.last_refill = now;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Snapshot of the limiter's state.
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub requests_per_minute: u32,
    pub tokens_available: u32,
    pub consecutive_errors: u32,
    pub in_backoff: bool,
    pub backoff_remaining: Option<Duration>,
}

/// Retry configuration for [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Additional attempts after the first.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Per-attempt rate-limit wait budget.
    pub acquire_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            acquire_timeout: Duration::from_secs(120),
        }
    }
}

/// Why [`retry_with_backoff`] gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("rate limit wait failed: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("max retries exceeded: {0}")]
    Exhausted(E),

    #[error("retry loop cancelled")]
    Cancelled,
}

/// Runs `op` through the rate limiter with exponential-backoff retries.
///
/// Each attempt acquires a token via [`RateLimiter::wait`]; success and
/// failure are reported back into the limiter so its backoff state tracks
/// upstream health. The loop sleeps `initial_backoff * multiplier^k`
/// between attempts, bounded by `max_backoff`, and aborts as soon as
/// `cancel` fires.
///
/// # Errors
///
/// Returns the rate-limit failure, the last operation error after
/// exhausting retries, or [`RetryError::Cancelled`].
pub async fn retry_with_backoff<T, E, F, Fut>(
    limiter: &RateLimiter,
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut backoff = config.initial_backoff;
    let mut last_err: Option<E> = None;

    for attempt in 0..=config.max_retries {
        limiter
            .wait(Instant::now() + config.acquire_timeout, cancel)
            .await?;

        match op().await {
            Ok(value) => {
                limiter.record_success();
                return Ok(value);
            },
            Err(err) => {
                limiter.record_error();
                last_err = Some(err);
            },
        }

        if attempt == config.max_retries {
            break;
        }

        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
        }

        backoff = Duration::from_secs_f64(
            (backoff.as_secs_f64() * config.backoff_multiplier)
                .min(config.max_backoff.as_secs_f64()),
        );
    }

    Err(RetryError::Exhausted(
        last_err.expect("at least one attempt ran"),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn allows_capacity_then_blocks() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn refills_after_one_minute() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_until_refill() {
        let limiter = RateLimiter::new(1);
        let cancel = CancellationToken::new();
        assert!(limiter.try_acquire());

        let deadline = Instant::now() + Duration::from_secs(120);
        let wait = limiter.wait(deadline, &cancel);
        tokio::pin!(wait);

        // Nothing for the first 59 seconds.
        assert!(
            tokio::time::timeout(Duration::from_secs(59), &mut wait)
                .await
                .is_err()
        );
        // The refill at t=60 releases the waiter.
        let result = tokio::time::timeout(Duration::from_secs(2), &mut wait).await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_respects_deadline() {
        let limiter = RateLimiter::new(1);
        let cancel = CancellationToken::new();
        assert!(limiter.try_acquire());

        let result = limiter
            .wait(Instant::now() + Duration::from_secs(5), &cancel)
            .await;
        assert!(matches!(result, Err(RateLimitError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_caps() {
        let limiter = RateLimiter::new(10);
        let cancel = CancellationToken::new();

        limiter.record_error();
        let first = limiter.backoff_remaining().unwrap();
        assert_eq!(first.as_secs(), 2);

        // wait() fails immediately during backoff.
        let result = limiter
            .wait(Instant::now() + Duration::from_secs(600), &cancel)
            .await;
        assert!(matches!(result, Err(RateLimitError::BackoffActive { .. })));
        assert!(!limiter.try_acquire());

        limiter.record_error();
        assert_eq!(limiter.backoff_remaining().unwrap().as_secs(), 4);

        // Errors keep doubling up to the 300 s ceiling.
        for _ in 0..10 {
            limiter.record_error();
        }
        assert_eq!(limiter.backoff_remaining().unwrap(), MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_window_expires() {
        let limiter = RateLimiter::new(10);
        limiter.record_error();
        assert!(!limiter.try_acquire());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn stats_reflect_tokens_and_backoff() {
        let limiter = RateLimiter::new(5);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());

        let stats = limiter.stats();
        assert_eq!(stats.requests_per_minute, 5);
        assert_eq!(stats.tokens_available, 3);
        assert!(!stats.in_backoff);

        limiter.record_error();
        let stats = limiter.stats();
        assert!(stats.in_backoff);
        assert_eq!(stats.consecutive_errors, 1);
        assert!(stats.backoff_remaining.is_some());

        limiter.reset_backoff();
        let stats = limiter.stats();
        assert!(!stats.in_backoff);
        assert_eq!(stats.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn success_clears_backoff() {
        let limiter = RateLimiter::new(10);
        limiter.record_error();
        limiter.record_error();
        assert_eq!(limiter.consecutive_errors(), 2);
        limiter.record_success();
        assert_eq!(limiter.consecutive_errors(), 0);
        assert!(limiter.backoff_remaining().is_none());
        assert!(limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_transient_failures() {
        let limiter = RateLimiter::new(60);
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<u32, RetryError<&str>> = retry_with_backoff(
            &limiter,
            &RetryConfig::default(),
            &cancel,
            || async {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err("transient") } else { Ok(n) }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // The final success reset the limiter's error counter.
        assert_eq!(limiter.consecutive_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhausts_and_reports_last_error() {
        let limiter = RateLimiter::new(60);
        let cancel = CancellationToken::new();
        let config = RetryConfig {
            max_retries: 2,
            ..RetryConfig::default()
        };

        let result: Result<(), RetryError<String>> =
            retry_with_backoff(&limiter, &config, &cancel, || async {
                Err("still broken".to_string())
            })
            .await;

        match result {
            Err(RetryError::Exhausted(msg)) => assert_eq!(msg, "still broken"),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_aborts_on_cancellation() {
        let limiter = RateLimiter::new(60);
        let cancel = CancellationToken::new();
        cancel.cancel();

        // First attempt runs, fails, then the inter-attempt sleep observes
        // the cancelled token.
        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            &limiter,
            &RetryConfig::default(),
            &cancel,
            || async { Err("nope") },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
