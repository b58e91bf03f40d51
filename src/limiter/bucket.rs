// src/limiter/bucket.rs — Token-bucket rate limiter
//
// Classic token bucket: bursts up to `capacity`, sustained throughput
// capped at `rate` tokens/second. Refill is computed lazily from elapsed
// time on every access. All clock reads go through `tokio::time::Instant`
// so tests can drive the bucket under a paused runtime.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

/// Counters exposed for diagnostics. `throttled_requests` also absorbs
/// HTTP-429 responses reported back by the resilient caller.
#[derive(Debug, Clone, Default)]
pub struct BucketMetrics {
    pub total_requests: u64,
    pub throttled_requests: u64,
    pub last_allowed: Option<Instant>,
    pub last_throttled: Option<Instant>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
    metrics: BucketMetrics,
}

pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: f64) -> Self {
        let now = Instant::now();
        Self {
            rate,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
                last_used: now,
                metrics: BucketMetrics::default(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add `elapsed * rate` tokens, clamped to capacity.
    fn refill(state: &mut BucketState, rate: f64, capacity: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed > Duration::ZERO {
            state.tokens = (state.tokens + elapsed.as_secs_f64() * rate).min(capacity);
            state.last_refill = now;
        }
    }

    /// Non-blocking consume. Refills, then decrements if enough tokens are
    /// available. Records metrics either way.
    pub fn try_consume(&self, tokens: f64) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        Self::refill(&mut state, self.rate, self.capacity, now);
        state.last_used = now;
        state.metrics.total_requests += 1;

        if state.tokens >= tokens {
            state.tokens -= tokens;
            state.metrics.last_allowed = Some(now);
            true
        } else {
            state.metrics.throttled_requests += 1;
            state.metrics.last_throttled = Some(now);
            false
        }
    }

    /// Awaitable consume. On a deficit, sleeps for exactly the time the
    /// deficit needs to refill (clamped to what remains of `max_wait`) and
    /// re-checks; no busy-spinning. Returns `false` once `max_wait` is
    /// exhausted, and with `max_wait == 0` returns immediately.
    pub async fn consume_or_wait(&self, tokens: f64, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;

        loop {
            let wait = {
                let now = Instant::now();
                let mut state = self.lock();
                Self::refill(&mut state, self.rate, self.capacity, now);
                state.last_used = now;

                if state.tokens >= tokens {
                    state.tokens -= tokens;
                    state.metrics.total_requests += 1;
                    state.metrics.last_allowed = Some(now);
                    return true;
                }

                if now >= deadline {
                    state.metrics.total_requests += 1;
                    state.metrics.throttled_requests += 1;
                    state.metrics.last_throttled = Some(now);
                    return false;
                }

                let deficit = tokens - state.tokens;
                let refill_wait = if self.rate > 0.0 {
                    Duration::from_secs_f64(deficit / self.rate)
                } else {
                    deadline - now
                };
                refill_wait.min(deadline - now)
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Record an upstream throttle (HTTP 429) against this bucket without
    /// counting a new request.
    pub fn record_throttled(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        state.metrics.throttled_requests += 1;
        state.metrics.last_throttled = Some(now);
    }

    /// Zero the counters. Token balance is untouched.
    pub fn reset_metrics(&self) {
        let mut state = self.lock();
        state.metrics = BucketMetrics::default();
    }

    pub fn metrics(&self) -> BucketMetrics {
        self.lock().metrics.clone()
    }

    /// Current balance after a refill check.
    pub fn available(&self) -> f64 {
        let now = Instant::now();
        let mut state = self.lock();
        Self::refill(&mut state, self.rate, self.capacity, now);
        state.tokens
    }

    /// Time since the bucket last served a consume call.
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.lock().last_used)
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate", &self.rate)
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_capacity() {
        let bucket = TokenBucket::new(1.0, 5.0);

        for _ in 0..5 {
            assert!(bucket.try_consume(1.0));
        }
        assert!(!bucket.try_consume(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_after_one_second() {
        let bucket = TokenBucket::new(1.0, 5.0);

        for _ in 0..5 {
            assert!(bucket.try_consume(1.0));
        }
        assert!(!bucket.try_consume(1.0));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.try_consume(1.0));
        assert!(!bucket.try_consume(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_never_exceed_capacity() {
        let bucket = TokenBucket::new(100.0, 10.0);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(bucket.available() <= 10.0);

        bucket.try_consume(3.0);
        let avail = bucket.available();
        assert!((0.0..=10.0).contains(&avail));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_never_go_negative() {
        let bucket = TokenBucket::new(1.0, 2.0);

        assert!(bucket.try_consume(2.0));
        assert!(!bucket.try_consume(1.0));
        assert!(bucket.available() >= 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_or_wait_zero_max_wait_fails_immediately() {
        let bucket = TokenBucket::new(1.0, 1.0);
        assert!(bucket.try_consume(1.0));

        let start = Instant::now();
        let ok = bucket.consume_or_wait(1.0, Duration::ZERO).await;
        assert!(!ok);
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_or_wait_sleeps_for_deficit() {
        let bucket = TokenBucket::new(2.0, 1.0);
        assert!(bucket.try_consume(1.0));

        // Deficit of 1 token at 2 tokens/sec -> 500ms wait.
        let start = Instant::now();
        let ok = bucket.consume_or_wait(1.0, Duration::from_secs(5)).await;
        assert!(ok);
        assert_eq!((Instant::now() - start).as_millis(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_or_wait_respects_max_wait() {
        let bucket = TokenBucket::new(0.1, 1.0);
        assert!(bucket.try_consume(1.0));

        // Deficit needs 10s but the budget is 1s; must give up at 1s.
        let start = Instant::now();
        let ok = bucket
            .consume_or_wait(1.0, Duration::from_secs(1))
            .await;
        assert!(!ok);
        assert_eq!((Instant::now() - start).as_secs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_recorded_on_both_outcomes() {
        let bucket = TokenBucket::new(1.0, 1.0);

        assert!(bucket.try_consume(1.0));
        assert!(!bucket.try_consume(1.0));

        let m = bucket.metrics();
        assert_eq!(m.total_requests, 2);
        assert_eq!(m.throttled_requests, 1);
        assert!(m.last_allowed.is_some());
        assert!(m.last_throttled.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_throttled_does_not_count_a_request() {
        let bucket = TokenBucket::new(1.0, 1.0);
        bucket.record_throttled();

        let m = bucket.metrics();
        assert_eq!(m.total_requests, 0);
        assert_eq!(m.throttled_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_metrics_keeps_tokens() {
        let bucket = TokenBucket::new(1.0, 5.0);
        bucket.try_consume(2.0);
        bucket.reset_metrics();

        let m = bucket.metrics();
        assert_eq!(m.total_requests, 0);
        assert_eq!(m.throttled_requests, 0);
        assert!(m.last_allowed.is_none());
        // Balance untouched by the reset
        assert_eq!(bucket.available(), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_for_tracks_last_consume() {
        let bucket = TokenBucket::new(1.0, 5.0);
        bucket.try_consume(1.0);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(bucket.idle_for().as_secs(), 30);

        bucket.try_consume(1.0);
        assert_eq!(bucket.idle_for().as_secs(), 0);
    }
}
